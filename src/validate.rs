//! Post-commit validation of a built store.

use anyhow::Result;
use sqlx::SqliteConnection;

use crate::config::ValidateMode;
use crate::error::BuildError;
use crate::migrate::{table_exists, REQUIRED_TABLES};

/// Row counts the build expects to find for one mode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpectedCounts {
    pub chunks: u64,
    pub dense_vectors: Option<u64>,
    pub minhash: Option<u64>,
}

async fn count_rows(conn: &mut SqliteConnection, table: &str, mode: &str) -> Result<u64> {
    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {} WHERE mode = ?", table))
        .bind(mode)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count as u64)
}

async fn pragma_check(conn: &mut SqliteConnection, pragma: &str) -> Result<()> {
    let results: Vec<String> = sqlx::query_scalar(&format!("PRAGMA {}", pragma))
        .fetch_all(&mut *conn)
        .await?;
    if results.len() == 1 && results[0] == "ok" {
        return Ok(());
    }
    Err(BuildError::Validation(format!("{} failed: {}", pragma, results.join("; "))).into())
}

fn mismatch(table: &str, expected: u64, actual: u64) -> anyhow::Error {
    BuildError::Validation(format!(
        "{} row count {} does not match expected {}",
        table, actual, expected
    ))
    .into()
}

/// Check the store for `mode` at the requested depth.
///
/// `smoke` checks required tables, `quick_check` and the chunk count;
/// `full` adds `integrity_check` and the dense/minhash counts.
pub async fn validate_store(
    conn: &mut SqliteConnection,
    mode: &str,
    level: ValidateMode,
    expected: &ExpectedCounts,
) -> Result<()> {
    if level == ValidateMode::Off {
        return Ok(());
    }

    let mut missing = Vec::new();
    for table in REQUIRED_TABLES {
        if !table_exists(conn, table).await? {
            missing.push(*table);
        }
    }
    if !missing.is_empty() {
        return Err(BuildError::Validation(format!("missing tables: {}", missing.join(", "))).into());
    }

    let chunks = count_rows(conn, "chunks", mode).await?;
    if chunks != expected.chunks {
        return Err(mismatch("chunks", expected.chunks, chunks));
    }

    if level == ValidateMode::Smoke {
        return pragma_check(conn, "quick_check").await;
    }

    pragma_check(conn, "integrity_check").await?;
    if let Some(want) = expected.dense_vectors {
        let got = count_rows(conn, "dense_vectors", mode).await?;
        if got != want {
            return Err(mismatch("dense_vectors", want, got));
        }
    }
    if let Some(want) = expected.minhash {
        let got = count_rows(conn, "minhash_signatures", mode).await?;
        if got != want {
            return Err(mismatch("minhash_signatures", want, got));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::create_schema;
    use sqlx::Connection;

    #[tokio::test]
    async fn test_smoke_checks_chunk_count() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        create_schema(&mut conn).await.unwrap();
        sqlx::query("INSERT INTO chunks (id, chunk_id, mode) VALUES (0, 'ck:a', 'code')")
            .execute(&mut conn)
            .await
            .unwrap();

        let ok = ExpectedCounts {
            chunks: 1,
            ..Default::default()
        };
        validate_store(&mut conn, "code", ValidateMode::Smoke, &ok).await.unwrap();
        validate_store(&mut conn, "code", ValidateMode::Full, &ok).await.unwrap();

        let wrong = ExpectedCounts {
            chunks: 2,
            ..Default::default()
        };
        let err = validate_store(&mut conn, "code", ValidateMode::Smoke, &wrong)
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<BuildError>(), Some(BuildError::Validation(_))));
        validate_store(&mut conn, "code", ValidateMode::Off, &wrong).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_tables_fail_validation() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let err = validate_store(&mut conn, "code", ValidateMode::Smoke, &ExpectedCounts::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing tables"));
    }
}
