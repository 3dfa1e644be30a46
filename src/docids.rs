//! File identity and document-row id reuse.
//!
//! Every path that crosses a table boundary goes through [`FileKey`], the
//! single normalization point: backslashes become `/` and a leading `./`
//! is dropped. On case-insensitive filesystems the lookup form is
//! case-folded, while the display form (what gets stored) keeps its case.
//!
//! [`DocIdResolver`] answers "which chunk rows does this file own?" with
//! one batched `IN (...)` query per group of files, memoized for the
//! lifetime of one update. Case-insensitive lookups fold in Rust, not in
//! SQL: SQLite's `lower()` only folds ASCII, so the mode's paths are
//! scanned once and keyed through [`FileKey`]. [`DocIdAllocator`] hands out ids for reinserted
//! chunks so a file keeps its old ids where it can.

use anyhow::Result;
use sqlx::{Row, SqliteConnection};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::hash::{Hash, Hasher};

/// Max files per `IN (...)` lookup.
const LOOKUP_BATCH: usize = 400;

/// A normalized file path.
#[derive(Debug, Clone)]
pub struct FileKey {
    display: String,
    lookup: String,
}

impl FileKey {
    /// Normalize `raw`. With `case_insensitive`, keys that differ only in
    /// case compare equal.
    pub fn new(raw: &str, case_insensitive: bool) -> Self {
        let mut display = raw.trim().replace('\\', "/");
        while let Some(rest) = display.strip_prefix("./") {
            display = rest.to_string();
        }
        let lookup = if case_insensitive {
            display.to_lowercase()
        } else {
            display.clone()
        };
        Self { display, lookup }
    }

    /// Stored form, original case.
    pub fn as_str(&self) -> &str {
        &self.display
    }

    pub fn lookup(&self) -> &str {
        &self.lookup
    }

    pub fn is_empty(&self) -> bool {
        self.display.is_empty()
    }
}

impl PartialEq for FileKey {
    fn eq(&self, other: &Self) -> bool {
        self.lookup == other.lookup
    }
}

impl Eq for FileKey {}

impl Hash for FileKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.lookup.hash(state);
    }
}

impl PartialOrd for FileKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FileKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lookup.cmp(&other.lookup)
    }
}

impl std::fmt::Display for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display)
    }
}

/// Per-update cache of file → existing chunk row ids.
pub struct DocIdResolver {
    mode: String,
    case_insensitive: bool,
    cache: HashMap<FileKey, Vec<i64>>,
    sql_by_width: HashMap<usize, String>,
    scanned: bool,
}

impl DocIdResolver {
    pub fn new(mode: &str, case_insensitive: bool) -> Self {
        Self {
            mode: mode.to_string(),
            case_insensitive,
            cache: HashMap::new(),
            sql_by_width: HashMap::new(),
            scanned: false,
        }
    }

    fn lookup_sql(&mut self, width: usize) -> String {
        self.sql_by_width
            .entry(width)
            .or_insert_with(|| {
                let placeholders = vec!["?"; width].join(", ");
                format!(
                    "SELECT id, file FROM chunks WHERE mode = ? AND file IN ({}) ORDER BY id",
                    placeholders
                )
            })
            .clone()
    }

    /// Key every stored path of the mode once. Keys absent after the scan
    /// own no rows.
    async fn scan_mode(&mut self, conn: &mut SqliteConnection) -> Result<()> {
        let rows = sqlx::query("SELECT id, file FROM chunks WHERE mode = ? AND file IS NOT NULL ORDER BY id")
            .bind(self.mode.as_str())
            .fetch_all(&mut *conn)
            .await?;
        for row in rows {
            let id: i64 = row.get("id");
            let file: String = row.get("file");
            let key = FileKey::new(&file, true);
            self.cache.entry(key).or_default().push(id);
        }
        self.scanned = true;
        Ok(())
    }

    /// Load existing row ids for every uncached key in `files`.
    pub async fn prefetch(&mut self, conn: &mut SqliteConnection, files: &[FileKey]) -> Result<()> {
        if self.case_insensitive {
            if !self.scanned {
                self.scan_mode(conn).await?;
            }
            for key in files {
                self.cache.entry(key.clone()).or_default();
            }
            return Ok(());
        }

        let pending: Vec<FileKey> = files
            .iter()
            .filter(|k| !self.cache.contains_key(*k))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        for batch in pending.chunks(LOOKUP_BATCH) {
            let sql = self.lookup_sql(batch.len());
            let mut query = sqlx::query(&sql).bind(self.mode.as_str());
            for key in batch {
                query = query.bind(key.as_str());
            }
            let rows = query.fetch_all(&mut *conn).await?;
            for key in batch {
                self.cache.entry(key.clone()).or_default();
            }
            for row in rows {
                let id: i64 = row.get("id");
                let file: String = row.get("file");
                let key = FileKey::new(&file, false);
                self.cache.entry(key).or_default().push(id);
            }
        }
        Ok(())
    }

    /// Row ids currently owned by `file`, ascending. Empty for new files.
    pub async fn resolve_existing_doc_ids(
        &mut self,
        conn: &mut SqliteConnection,
        file: &FileKey,
    ) -> Result<Vec<i64>> {
        if !self.cache.contains_key(file) {
            self.prefetch(conn, std::slice::from_ref(file)).await?;
        }
        Ok(self.cache.get(file).cloned().unwrap_or_default())
    }

    /// Cached ids for `file`; `None` when it was never looked up.
    pub fn cached(&self, file: &FileKey) -> Option<&[i64]> {
        self.cache.get(file).map(Vec::as_slice)
    }

    /// Stable partition: files with no existing rows first, then files that
    /// will be deleted and reinserted. Relative order is kept inside each
    /// group. Call [`prefetch`](Self::prefetch) first; unknown files count
    /// as new.
    pub fn order_changed_records<T>(&self, records: Vec<T>, key: impl Fn(&T) -> &FileKey) -> Vec<T> {
        let (fresh, existing): (Vec<T>, Vec<T>) = records
            .into_iter()
            .partition(|r| self.cache.get(key(r)).map_or(true, |ids| ids.is_empty()));
        fresh.into_iter().chain(existing).collect()
    }
}

/// Hands out doc ids for reinserted chunks.
///
/// Order of preference for each chunk: the file's own previous ids; ids
/// freed by deleted files (new files only); overflow ids left over when a
/// changed file shrank; remaining freed ids; then `next_doc_id`.
#[derive(Debug, Clone)]
pub struct DocIdAllocator {
    deleted: VecDeque<i64>,
    overflow: VecDeque<i64>,
    next_doc_id: i64,
}

impl DocIdAllocator {
    pub fn new(deleted: Vec<i64>, next_doc_id: i64) -> Self {
        let mut deleted = deleted;
        deleted.sort_unstable();
        deleted.dedup();
        Self {
            deleted: deleted.into(),
            overflow: VecDeque::new(),
            next_doc_id,
        }
    }

    pub fn allocate(&mut self, reuse: &mut VecDeque<i64>, is_new_file: bool) -> i64 {
        if let Some(id) = reuse.pop_front() {
            return id;
        }
        if is_new_file {
            if let Some(id) = self.deleted.pop_front() {
                return id;
            }
        }
        if let Some(id) = self.overflow.pop_front() {
            return id;
        }
        if let Some(id) = self.deleted.pop_front() {
            return id;
        }
        let id = self.next_doc_id;
        self.next_doc_id += 1;
        id
    }

    /// Return a file's unused previous ids to the overflow pool.
    pub fn release(&mut self, leftover: VecDeque<i64>) {
        if leftover.is_empty() {
            return;
        }
        let mut merged: Vec<i64> = self.overflow.drain(..).chain(leftover).collect();
        merged.sort_unstable();
        self.overflow = merged.into();
    }

    pub fn next_doc_id(&self) -> i64 {
        self.next_doc_id
    }

    /// Ids freed by deletes but never reassigned.
    pub fn unused(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.deleted.iter().chain(self.overflow.iter()).copied().collect();
        ids.sort_unstable();
        ids
    }
}
