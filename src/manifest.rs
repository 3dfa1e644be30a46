//! File manifest: the change-detection ledger.
//!
//! The upstream pipeline hands over a map of `file → {hash, mtimeMs, size}`
//! describing the current source tree. Full builds copy it into the
//! `file_manifest` table (with chunk counts); incremental updates diff it
//! against that table to find new, changed and deleted files.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use sqlx::{Row, SqliteConnection};
use std::collections::BTreeMap;
use std::path::Path;

use crate::docids::FileKey;

/// One file as described by the upstream pipeline.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default, alias = "mtime_ms", alias = "mtime")]
    pub mtime_ms: Option<i64>,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default, alias = "chunk_count")]
    pub chunk_count: Option<i64>,
    /// Bundle file name for incremental updates.
    #[serde(default)]
    pub bundle: Option<String>,
}

/// Manifest keyed by normalized path.
#[derive(Debug, Clone, Default)]
pub struct FileManifest {
    entries: BTreeMap<FileKey, ManifestEntry>,
    conflicts: Vec<String>,
}

impl FileManifest {
    /// Build from raw `(path, entry)` pairs. Paths that normalize to the
    /// same key are recorded as conflicts; the last entry wins.
    pub fn from_entries<I>(entries: I, case_insensitive: bool) -> Self
    where
        I: IntoIterator<Item = (String, ManifestEntry)>,
    {
        let mut manifest = FileManifest::default();
        let mut raw_by_key: BTreeMap<FileKey, String> = BTreeMap::new();
        for (raw, entry) in entries {
            let key = FileKey::new(&raw, case_insensitive);
            if key.is_empty() {
                continue;
            }
            if let Some(previous) = raw_by_key.insert(key.clone(), raw.clone()) {
                if previous != raw {
                    manifest
                        .conflicts
                        .push(format!("{} and {} both map to {}", previous, raw, key.lookup()));
                }
            }
            // Re-insert the key so the stored display form follows the winning entry.
            manifest.entries.remove(&key);
            manifest.entries.insert(key, entry);
        }
        manifest
    }

    pub fn get(&self, key: &FileKey) -> Option<&ManifestEntry> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FileKey, &ManifestEntry)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &FileKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn conflicts(&self) -> &[String] {
        &self.conflicts
    }
}

/// Load a manifest file: either `{"files": {...}}` or a bare path map.
pub fn load_manifest(path: &Path, case_insensitive: bool) -> Result<FileManifest> {
    let value = crate::sources::read_json(path)?;
    let files = match value {
        Value::Object(mut obj) => match obj.remove("files") {
            Some(Value::Object(files)) => files,
            Some(_) => anyhow::bail!("{}: 'files' must be an object", path.display()),
            None => obj,
        },
        _ => anyhow::bail!("{}: manifest must be a JSON object", path.display()),
    };
    let mut entries = Vec::with_capacity(files.len());
    for (file, entry) in files {
        let entry: ManifestEntry = serde_json::from_value(entry)
            .with_context(|| format!("Invalid manifest entry for {}", file))?;
        entries.push((file, entry));
    }
    Ok(FileManifest::from_entries(entries, case_insensitive))
}

/// One row of the stored `file_manifest` table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredManifestRow {
    pub file: String,
    pub hash: Option<String>,
    pub mtime_ms: Option<i64>,
    pub size: Option<i64>,
    pub chunk_count: Option<i64>,
}

pub async fn load_stored_manifest(
    conn: &mut SqliteConnection,
    mode: &str,
    case_insensitive: bool,
) -> Result<BTreeMap<FileKey, StoredManifestRow>> {
    let rows = sqlx::query(
        "SELECT file, hash, mtimeMs, size, chunk_count FROM file_manifest WHERE mode = ?",
    )
    .bind(mode)
    .fetch_all(&mut *conn)
    .await?;

    let mut stored = BTreeMap::new();
    for row in rows {
        let file: String = row.get("file");
        let entry = StoredManifestRow {
            file: file.clone(),
            hash: row.get("hash"),
            mtime_ms: row.get("mtimeMs"),
            size: row.get("size"),
            chunk_count: row.get("chunk_count"),
        };
        stored.insert(FileKey::new(&file, case_insensitive), entry);
    }
    Ok(stored)
}

/// Result of comparing the incoming manifest with the stored one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestDiff {
    /// New files, or files whose hash or size differ.
    pub changed: Vec<FileKey>,
    /// Stored files absent from the incoming manifest.
    pub deleted: Vec<FileKey>,
    /// Same content, new mtime: only the manifest row needs rewriting.
    pub manifest_updates: Vec<FileKey>,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty() && self.manifest_updates.is_empty()
    }

    /// `(changed + deleted) / max(stored, incoming)`.
    pub fn change_ratio(&self, stored: usize, incoming: usize) -> f64 {
        let total = stored.max(incoming);
        if total == 0 {
            return 0.0;
        }
        (self.changed.len() + self.deleted.len()) as f64 / total as f64
    }
}

pub fn diff_manifest(
    stored: &BTreeMap<FileKey, StoredManifestRow>,
    incoming: &FileManifest,
) -> ManifestDiff {
    let mut diff = ManifestDiff::default();
    for (key, entry) in incoming.iter() {
        match stored.get(key) {
            None => diff.changed.push(key.clone()),
            Some(prev) => {
                let hash_differs = match (&entry.hash, &prev.hash) {
                    (Some(a), Some(b)) => a != b,
                    (None, None) => entry.size != prev.size || entry.mtime_ms != prev.mtime_ms,
                    _ => true,
                };
                let size_differs = entry.size.is_some() && prev.size.is_some() && entry.size != prev.size;
                if hash_differs || size_differs {
                    diff.changed.push(key.clone());
                } else if entry.mtime_ms != prev.mtime_ms {
                    diff.manifest_updates.push(key.clone());
                }
            }
        }
    }
    for key in stored.keys() {
        if incoming.get(key).is_none() {
            diff.deleted.push(key.clone());
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hash: &str, mtime: i64, size: i64) -> ManifestEntry {
        ManifestEntry {
            hash: Some(hash.to_string()),
            mtime_ms: Some(mtime),
            size: Some(size),
            ..Default::default()
        }
    }

    fn stored(file: &str, hash: &str, mtime: i64, size: i64) -> (FileKey, StoredManifestRow) {
        (
            FileKey::new(file, false),
            StoredManifestRow {
                file: file.to_string(),
                hash: Some(hash.to_string()),
                mtime_ms: Some(mtime),
                size: Some(size),
                chunk_count: Some(1),
            },
        )
    }

    #[test]
    fn test_conflicting_paths_are_reported() {
        let manifest = FileManifest::from_entries(
            vec![
                ("src\\a.rs".to_string(), entry("h1", 1, 1)),
                ("src/a.rs".to_string(), entry("h2", 2, 2)),
            ],
            false,
        );
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.conflicts().len(), 1);
        let key = FileKey::new("src/a.rs", false);
        assert_eq!(manifest.get(&key).unwrap().hash.as_deref(), Some("h2"));
    }

    #[test]
    fn test_diff_classifies_files() {
        let stored: BTreeMap<_, _> = vec![
            stored("same.rs", "h", 1, 10),
            stored("touched.rs", "h", 1, 10),
            stored("edited.rs", "h", 1, 10),
            stored("gone.rs", "h", 1, 10),
        ]
        .into_iter()
        .collect();
        let incoming = FileManifest::from_entries(
            vec![
                ("same.rs".to_string(), entry("h", 1, 10)),
                ("touched.rs".to_string(), entry("h", 5, 10)),
                ("edited.rs".to_string(), entry("h2", 5, 12)),
                ("new.rs".to_string(), entry("n", 1, 3)),
            ],
            false,
        );
        let diff = diff_manifest(&stored, &incoming);
        let names = |keys: &[FileKey]| keys.iter().map(|k| k.as_str().to_string()).collect::<Vec<_>>();
        assert_eq!(names(&diff.changed), vec!["edited.rs", "new.rs"]);
        assert_eq!(names(&diff.deleted), vec!["gone.rs"]);
        assert_eq!(names(&diff.manifest_updates), vec!["touched.rs"]);
        assert_eq!(diff.change_ratio(4, 4), 0.75);
    }

    #[test]
    fn test_load_manifest_accepts_both_shapes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let wrapped = tmp.path().join("wrapped.json");
        std::fs::write(&wrapped, r#"{"files": {"a.rs": {"hash": "x", "mtimeMs": 4, "size": 2}}}"#).unwrap();
        let bare = tmp.path().join("bare.json");
        std::fs::write(&bare, r#"{"a.rs": {"hash": "x", "mtime_ms": 4}}"#).unwrap();

        let a = load_manifest(&wrapped, false).unwrap();
        let b = load_manifest(&bare, false).unwrap();
        let key = FileKey::new("a.rs", false);
        assert_eq!(a.get(&key).unwrap().mtime_ms, Some(4));
        assert_eq!(b.get(&key).unwrap().mtime_ms, Some(4));
    }
}
