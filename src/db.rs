//! Connections to build and existing stores.
//!
//! A build always runs on one dedicated [`SqliteConnection`] (single
//! writer, one transaction), opened on a temporary path next to the final
//! output. Inputs of [`BUILD_PRAGMA_MIN_BYTES`] or more get bulk-load
//! pragmas (no fsync, in-memory journal and temp store, bigger page
//! cache); [`restore_pragmas`] puts the store back into WAL mode before it
//! is promoted.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use std::path::{Path, PathBuf};

use crate::extension::{AnnStatus, VectorExtension};

/// Inputs at least this large get bulk-load pragmas by default.
pub const BUILD_PRAGMA_MIN_BYTES: u64 = 128 * 1024 * 1024;

/// Whether to use bulk-load pragmas for `input_bytes`, honouring an
/// explicit override.
pub fn use_build_pragmas(input_bytes: Option<u64>, forced: Option<bool>) -> bool {
    forced.unwrap_or_else(|| input_bytes.unwrap_or(0) >= BUILD_PRAGMA_MIN_BYTES)
}

fn base_options(path: &Path, bulk: bool) -> SqliteConnectOptions {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(false);
    if bulk {
        options
            .journal_mode(SqliteJournalMode::Memory)
            .synchronous(SqliteSynchronous::Off)
            .pragma("temp_store", "MEMORY")
            .pragma("cache_size", "-262144")
    } else {
        options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
    }
}

/// Open the connection for a build or update at `path`.
///
/// When `extension` is given it is registered before connecting and probed
/// afterwards. If either step fails the connection is reopened without the
/// extension and the returned status carries the reason; the build goes on
/// without ANN population.
pub async fn open_build_connection(
    path: &Path,
    bulk: bool,
    extension: Option<&dyn VectorExtension>,
) -> Result<(SqliteConnection, AnnStatus)> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let Some(ext) = extension else {
        let conn = base_options(path, bulk).connect().await?;
        return Ok((conn, AnnStatus::Disabled));
    };

    match ext.configure(base_options(path, bulk)).connect().await {
        Ok(mut conn) => match ext.probe(&mut conn).await {
            Ok(()) => Ok((conn, AnnStatus::Available)),
            Err(reason) => Ok((conn, AnnStatus::Unavailable(reason))),
        },
        Err(e) => {
            let conn = base_options(path, bulk).connect().await?;
            Ok((
                conn,
                AnnStatus::Unavailable(format!("failed to load {}: {}", ext.name(), e)),
            ))
        }
    }
}

/// Return a bulk-loaded store to WAL / NORMAL durability.
pub async fn restore_pragmas(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn checkpoint(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Open an existing store read-write without creating it.
pub async fn open_existing(path: &Path) -> Result<SqliteConnection> {
    let conn = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(false)
        .journal_mode(SqliteJournalMode::Wal)
        .connect()
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(conn)
}

/// `<out>.tmp-<uuid>` beside `out`.
pub fn temp_path_for(out: &Path) -> PathBuf {
    let name = out
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "index.db".to_string());
    out.with_file_name(format!("{}.tmp-{}", name, uuid::Uuid::new_v4()))
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Remove `path` and its `-wal` / `-shm` / `-journal` sidecars. Missing files are fine.
pub fn remove_db_files(path: &Path) {
    for p in [
        path.to_path_buf(),
        sidecar(path, "-wal"),
        sidecar(path, "-shm"),
        sidecar(path, "-journal"),
    ] {
        if let Err(e) = std::fs::remove_file(&p) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %p.display(), error = %e, "Failed to remove database file");
            }
        }
    }
}

/// Copy a store (and its WAL, if present) to `dest`.
pub fn copy_db_files(src: &Path, dest: &Path) -> Result<()> {
    std::fs::copy(src, dest)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dest.display()))?;
    let wal = sidecar(src, "-wal");
    if wal.exists() {
        std::fs::copy(&wal, sidecar(dest, "-wal"))?;
    }
    Ok(())
}

/// Atomically move a finished store from `temp` to `out`.
pub fn promote(temp: &Path, out: &Path) -> Result<()> {
    for suffix in ["-wal", "-shm"] {
        let stale = sidecar(out, suffix);
        if stale.exists() {
            std::fs::remove_file(&stale)
                .with_context(|| format!("Failed to remove {}", stale.display()))?;
        }
    }
    std::fs::rename(temp, out)
        .with_context(|| format!("Failed to promote {} to {}", temp.display(), out.display()))?;
    for suffix in ["-wal", "-shm"] {
        let _ = std::fs::remove_file(sidecar(temp, suffix));
    }
    Ok(())
}

/// Close `conn`, logging rather than failing.
pub async fn close_quietly(conn: SqliteConnection) {
    if let Err(e) = conn.close().await {
        tracing::warn!(error = %e, "Failed to close connection cleanly");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_build_pragma_threshold() {
        assert!(!use_build_pragmas(Some(BUILD_PRAGMA_MIN_BYTES - 1), None));
        assert!(use_build_pragmas(Some(BUILD_PRAGMA_MIN_BYTES), None));
        assert!(!use_build_pragmas(Some(u64::MAX), Some(false)));
        assert!(use_build_pragmas(None, Some(true)));
    }

    #[test]
    fn test_temp_path_is_sibling() {
        let out = Path::new("/data/index-code.db");
        let tmp = temp_path_for(out);
        assert_eq!(tmp.parent(), out.parent());
        assert!(tmp
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("index-code.db.tmp-"));
    }

    #[test]
    fn test_promote_replaces_output() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out.db");
        std::fs::write(&out, b"old").unwrap();
        std::fs::write(sidecar(&out, "-wal"), b"stale").unwrap();
        let staged = temp_path_for(&out);
        std::fs::write(&staged, b"new").unwrap();

        promote(&staged, &out).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"new");
        assert!(!staged.exists());
        assert!(!sidecar(&out, "-wal").exists());
    }
}
