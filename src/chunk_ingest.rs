//! Chunk and file-metadata ingestion.
//!
//! Rows are streamed into two `TEMP` staging tables (`file_meta_stage`,
//! `chunks_stage`) in batches bounded by both a row count and an estimated
//! byte weight. [`merge_staged_chunks`] then folds them into `chunks` and
//! `chunks_fts` with one `INSERT ... SELECT` each: any chunk-level field
//! left NULL (extension, external docs, provenance, churn) is filled from
//! the owning file's staged metadata, with the chunk's own value winning.

use anyhow::Result;
use futures::StreamExt;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqliteConnection};
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

use crate::batch::Batcher;
use crate::docids::FileKey;
use crate::manifest::FileManifest;
use crate::models::{ChunkRecord, FileMetaRecord, RowSource};
use crate::report::{BuildStats, WarningKind, WarningLog};

/// Stable chunk identity: a pure function of file, span and segment.
/// Classification fields (`kind`, `name`) never contribute.
pub fn chunk_fingerprint(file: &str, start: Option<i64>, end: Option<i64>, segment: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file.as_bytes());
    hasher.update(b"\0");
    hasher.update(start.unwrap_or(-1).to_le_bytes());
    hasher.update(end.unwrap_or(-1).to_le_bytes());
    hasher.update(b"\0");
    hasher.update(segment.unwrap_or("").as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("ck:{}", &digest[..32])
}

/// JSON columns are stored as text; plain strings are stored unquoted.
fn json_text(value: &Option<Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

#[derive(Debug, Clone)]
struct FileMetaStageRow {
    id: i64,
    file: String,
    ext: Option<String>,
    size: Option<i64>,
    hash: Option<String>,
    hash_algo: Option<String>,
    encoding: Option<String>,
    encoding_fallback: Option<i64>,
    encoding_confidence: Option<f64>,
    external_docs: Option<String>,
    last_modified: Option<String>,
    last_author: Option<String>,
    churn: Option<f64>,
    churn_added: Option<i64>,
    churn_deleted: Option<i64>,
    churn_commits: Option<i64>,
}

impl FileMetaStageRow {
    fn from_record(record: FileMetaRecord, id: i64) -> Self {
        Self {
            id,
            file: FileKey::new(&record.file, false).as_str().to_string(),
            ext: record.ext,
            size: record.size,
            hash: record.hash,
            hash_algo: record.hash_algo,
            encoding: record.encoding,
            encoding_fallback: record.encoding_fallback.map(i64::from),
            encoding_confidence: record.encoding_confidence,
            external_docs: json_text(&record.external_docs),
            last_modified: record.last_modified,
            last_author: record.last_author,
            churn: record.churn,
            churn_added: record.churn_added,
            churn_deleted: record.churn_deleted,
            churn_commits: record.churn_commits,
        }
    }

    fn estimated_bytes(&self) -> usize {
        128 + self.file.len()
            + self.ext.as_ref().map_or(0, String::len)
            + self.hash.as_ref().map_or(0, String::len)
            + self.hash_algo.as_ref().map_or(0, String::len)
    }
}

/// One row of `chunks_stage`, ready to bind.
#[derive(Debug, Clone)]
pub struct ChunkStageRow {
    pub id: i64,
    pub chunk_id: String,
    pub mode: String,
    pub file_id: Option<i64>,
    pub file: Option<String>,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub start_line: Option<i64>,
    pub end_line: Option<i64>,
    pub ext: Option<String>,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub signature: Option<String>,
    pub doc: Option<String>,
    pub meta_v2: Option<String>,
    pub headline: Option<String>,
    pub pre_context: Option<String>,
    pub post_context: Option<String>,
    pub weight: Option<f64>,
    pub tokens: Option<String>,
    pub tokens_text: Option<String>,
    pub ngrams: Option<String>,
    pub code_relations: Option<String>,
    pub docmeta: Option<String>,
    pub stats: Option<String>,
    pub complexity: Option<String>,
    pub lint: Option<String>,
    pub external_docs: Option<String>,
    pub last_modified: Option<String>,
    pub last_author: Option<String>,
    pub churn: Option<f64>,
    pub churn_added: Option<i64>,
    pub churn_deleted: Option<i64>,
    pub churn_commits: Option<i64>,
    pub chunk_authors: Option<String>,
}

impl ChunkStageRow {
    pub fn from_record(chunk: &ChunkRecord, mode: &str, id: i64) -> Self {
        let file = chunk
            .file
            .as_deref()
            .map(|f| FileKey::new(f, false).as_str().to_string());
        let chunk_id = chunk.chunk_id.clone().unwrap_or_else(|| {
            chunk_fingerprint(
                file.as_deref().unwrap_or(""),
                chunk.start,
                chunk.end,
                chunk.segment.as_deref(),
            )
        });
        let (tokens, tokens_text) = if chunk.tokens.is_empty() {
            (None, None)
        } else {
            (
                serde_json::to_string(&chunk.tokens).ok(),
                Some(chunk.tokens.join(" ")),
            )
        };
        Self {
            id,
            chunk_id,
            mode: mode.to_string(),
            file_id: chunk.file_id,
            file,
            start: chunk.start,
            end: chunk.end,
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            ext: chunk.ext.clone(),
            kind: chunk.kind.clone(),
            name: chunk.name.clone(),
            signature: chunk.signature_text(),
            doc: chunk.doc_text(),
            meta_v2: json_text(&chunk.meta_v2),
            headline: chunk.headline.clone(),
            pre_context: json_text(&chunk.pre_context),
            post_context: json_text(&chunk.post_context),
            weight: chunk.weight,
            tokens,
            tokens_text,
            ngrams: json_text(&chunk.ngrams),
            code_relations: json_text(&chunk.code_relations),
            docmeta: json_text(&chunk.docmeta),
            stats: json_text(&chunk.stats),
            complexity: json_text(&chunk.complexity),
            lint: json_text(&chunk.lint),
            external_docs: json_text(&chunk.external_docs),
            last_modified: chunk.last_modified.clone(),
            last_author: chunk.last_author.clone(),
            churn: chunk.churn,
            churn_added: chunk.churn_added,
            churn_deleted: chunk.churn_deleted,
            churn_commits: chunk.churn_commits,
            chunk_authors: json_text(&chunk.chunk_authors),
        }
    }

    fn estimated_bytes(&self) -> usize {
        128 + self.file.as_ref().map_or(0, String::len)
            + self.ext.as_ref().map_or(0, String::len)
            + self.name.as_ref().map_or(0, String::len)
            + self.tokens_text.as_ref().map_or(0, String::len)
    }
}

async fn insert_file_meta_batch(conn: &mut SqliteConnection, batch: &[FileMetaStageRow]) -> Result<()> {
    for row in batch {
        sqlx::query(
            r#"
            INSERT INTO file_meta_stage (
                id, file, ext, size, hash, hashAlgo, encoding, encodingFallback,
                encodingConfidence, externalDocs, last_modified, last_author,
                churn, churn_added, churn_deleted, churn_commits
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.id)
        .bind(&row.file)
        .bind(&row.ext)
        .bind(row.size)
        .bind(&row.hash)
        .bind(&row.hash_algo)
        .bind(&row.encoding)
        .bind(row.encoding_fallback)
        .bind(row.encoding_confidence)
        .bind(&row.external_docs)
        .bind(&row.last_modified)
        .bind(&row.last_author)
        .bind(row.churn)
        .bind(row.churn_added)
        .bind(row.churn_deleted)
        .bind(row.churn_commits)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Insert rows into `chunks_stage`. Ids are assigned by the caller.
pub async fn insert_chunk_stage_batch(conn: &mut SqliteConnection, batch: &[ChunkStageRow]) -> Result<()> {
    for row in batch {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO chunks_stage (
                id, chunk_id, mode, file_id, file, start, "end", startLine, endLine,
                ext, kind, name, signature, doc, metaV2_json, headline, preContext,
                postContext, weight, tokens, tokensText, ngrams, codeRelations, docmeta,
                stats, complexity, lint, externalDocs, last_modified, last_author,
                churn, churn_added, churn_deleted, churn_commits, chunk_authors
            ) VALUES (
                ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
            )
            "#,
        )
        .bind(row.id)
        .bind(&row.chunk_id)
        .bind(&row.mode)
        .bind(row.file_id)
        .bind(&row.file)
        .bind(row.start)
        .bind(row.end)
        .bind(row.start_line)
        .bind(row.end_line)
        .bind(&row.ext)
        .bind(&row.kind)
        .bind(&row.name)
        .bind(&row.signature)
        .bind(&row.doc)
        .bind(&row.meta_v2)
        .bind(&row.headline)
        .bind(&row.pre_context)
        .bind(&row.post_context)
        .bind(row.weight)
        .bind(&row.tokens)
        .bind(&row.tokens_text)
        .bind(&row.ngrams)
        .bind(&row.code_relations)
        .bind(&row.docmeta)
        .bind(&row.stats)
        .bind(&row.complexity)
        .bind(&row.lint)
        .bind(&row.external_docs)
        .bind(&row.last_modified)
        .bind(&row.last_author)
        .bind(row.churn)
        .bind(row.churn_added)
        .bind(row.churn_deleted)
        .bind(row.churn_commits)
        .bind(&row.chunk_authors)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Stage file metadata rows. Rows without an id cannot be joined to
/// chunks and are skipped.
pub async fn stage_file_meta(
    conn: &mut SqliteConnection,
    source: RowSource<FileMetaRecord>,
    batch_size: usize,
    stats: &mut BuildStats,
) -> Result<usize> {
    let started = Instant::now();
    let mut batcher = Batcher::by_rows_and_bytes(batch_size);
    let mut rows = source.into_stream();
    let mut count = 0usize;
    let mut skipped = 0usize;

    while let Some(record) = rows.next().await {
        let record = record?;
        let Some(id) = record.id else {
            skipped += 1;
            continue;
        };
        let row = FileMetaStageRow::from_record(record, id);
        let weight = row.estimated_bytes();
        if let Some(batch) = batcher.push(row, weight) {
            insert_file_meta_batch(conn, &batch).await?;
            stats.record_batch("file_meta");
        }
        count += 1;
    }
    if let Some(batch) = batcher.finish() {
        insert_file_meta_batch(conn, &batch).await?;
        stats.record_batch("file_meta");
    }
    if skipped > 0 {
        debug!(skipped, "file_meta rows without id skipped");
    }
    stats.record_table("file_meta_stage", count as u64, started.elapsed());
    Ok(count)
}

/// Outcome of [`stage_chunks`].
#[derive(Debug, Default)]
pub struct StagedChunks {
    pub count: usize,
    /// `(doc id, tokens)` per chunk, kept only when the source was already
    /// in memory. Feeds the token-postings rebuild fallback.
    pub retained_tokens: Option<Vec<(i64, Vec<String>)>>,
}

/// Stage chunk rows for `mode`. A chunk without an id takes its position
/// in the source.
pub async fn stage_chunks(
    conn: &mut SqliteConnection,
    mode: &str,
    source: RowSource<ChunkRecord>,
    batch_size: usize,
    stats: &mut BuildStats,
) -> Result<StagedChunks> {
    let started = Instant::now();
    let retain = source.is_in_memory();
    let mut retained = Vec::new();
    let mut batcher = Batcher::by_rows_and_bytes(batch_size);
    let mut rows = source.into_stream();
    let mut count = 0usize;

    while let Some(chunk) = rows.next().await {
        let chunk = chunk?;
        let id = chunk.id.unwrap_or(count as i64);
        let row = ChunkStageRow::from_record(&chunk, mode, id);
        if retain {
            retained.push((id, chunk.tokens));
        }
        let weight = row.estimated_bytes();
        if let Some(batch) = batcher.push(row, weight) {
            insert_chunk_stage_batch(conn, &batch).await?;
            stats.record_batch("chunk_meta");
        }
        count += 1;
    }
    if let Some(batch) = batcher.finish() {
        insert_chunk_stage_batch(conn, &batch).await?;
        stats.record_batch("chunk_meta");
    }
    stats.record_table("chunks_stage", count as u64, started.elapsed());
    Ok(StagedChunks {
        count,
        retained_tokens: retain.then_some(retained),
    })
}

/// Fold staged chunks into `chunks` and `chunks_fts`, then clear
/// `chunks_stage`.
pub async fn merge_staged_chunks(conn: &mut SqliteConnection, stats: &mut BuildStats) -> Result<u64> {
    let started = Instant::now();
    let merged = sqlx::query(
        r#"
        INSERT OR REPLACE INTO chunks (
            id, chunk_id, mode, file, start, "end", startLine, endLine, ext, kind,
            name, signature, doc, metaV2_json, headline, preContext, postContext,
            weight, tokens, ngrams, codeRelations, docmeta, stats, complexity, lint,
            externalDocs, last_modified, last_author, churn, churn_added,
            churn_deleted, churn_commits, chunk_authors
        )
        SELECT
            c.id,
            c.chunk_id,
            c.mode,
            COALESCE(c.file, f.file),
            c.start,
            c."end",
            c.startLine,
            c.endLine,
            COALESCE(c.ext, f.ext),
            c.kind,
            c.name,
            c.signature,
            c.doc,
            c.metaV2_json,
            c.headline,
            c.preContext,
            c.postContext,
            c.weight,
            c.tokens,
            c.ngrams,
            c.codeRelations,
            c.docmeta,
            c.stats,
            c.complexity,
            c.lint,
            COALESCE(c.externalDocs, f.externalDocs),
            COALESCE(c.last_modified, f.last_modified),
            COALESCE(c.last_author, f.last_author),
            COALESCE(c.churn, f.churn),
            COALESCE(c.churn_added, f.churn_added),
            COALESCE(c.churn_deleted, f.churn_deleted),
            COALESCE(c.churn_commits, f.churn_commits),
            c.chunk_authors
        FROM chunks_stage c
        LEFT JOIN file_meta_stage f ON c.file_id = f.id
        "#,
    )
    .execute(&mut *conn)
    .await?
    .rows_affected();

    sqlx::query(
        r#"
        INSERT OR REPLACE INTO chunks_fts (rowid, file, name, signature, kind, headline, doc, tokens)
        SELECT
            c.id,
            COALESCE(c.file, f.file),
            c.name,
            c.signature,
            c.kind,
            c.headline,
            c.doc,
            c.tokensText
        FROM chunks_stage c
        LEFT JOIN file_meta_stage f ON c.file_id = f.id
        "#,
    )
    .execute(&mut *conn)
    .await?;

    let elapsed = started.elapsed();
    stats.record_table("chunks", merged, elapsed);
    stats.record_table("chunks_fts", merged, elapsed);

    sqlx::query("DELETE FROM chunks_stage")
        .execute(&mut *conn)
        .await?;
    Ok(merged)
}

/// Empty both staging tables.
pub async fn clear_staging(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("DELETE FROM chunks_stage")
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM file_meta_stage")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// One `file_manifest` row.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestRow {
    pub file: String,
    pub hash: Option<String>,
    pub mtime_ms: Option<i64>,
    pub size: Option<i64>,
    pub chunk_count: i64,
}

pub async fn insert_manifest_rows(conn: &mut SqliteConnection, mode: &str, rows: &[ManifestRow]) -> Result<()> {
    for row in rows {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO file_manifest (mode, file, hash, mtimeMs, size, chunk_count)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(mode)
        .bind(&row.file)
        .bind(&row.hash)
        .bind(row.mtime_ms)
        .bind(row.size)
        .bind(row.chunk_count)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Write one manifest row per file with chunks in `mode`.
///
/// Hash, mtime and size come from the supplied manifest when it has them,
/// else from staged file metadata.
pub async fn write_file_manifest(
    conn: &mut SqliteConnection,
    mode: &str,
    manifest: Option<&FileManifest>,
    batch_size: usize,
    stats: &mut BuildStats,
    warnings: &mut WarningLog,
) -> Result<usize> {
    let started = Instant::now();
    if let Some(manifest) = manifest {
        if let Some(first) = manifest.conflicts().first() {
            warnings.warn_once(
                WarningKind::ManifestConflict,
                format!(
                    "file manifest has {} conflicting path(s); last entry wins (e.g. {})",
                    manifest.conflicts().len(),
                    first
                ),
            );
        }
    }

    let rows = sqlx::query(
        r#"
        SELECT
            c.file AS file,
            COUNT(*) AS chunk_count,
            MAX(f.hash) AS file_hash,
            MAX(f.size) AS file_size
        FROM chunks c
        LEFT JOIN file_meta_stage f ON f.file = c.file
        WHERE c.mode = ? AND c.file IS NOT NULL
        GROUP BY c.file
        "#,
    )
    .bind(mode)
    .fetch_all(&mut *conn)
    .await?;

    // Several raw spellings can collapse onto one key; their counts add up.
    let mut by_key: HashMap<FileKey, ManifestRow> = HashMap::new();
    for row in rows {
        let file: String = row.get("file");
        let key = FileKey::new(&file, false);
        if key.is_empty() {
            continue;
        }
        let chunk_count: i64 = row.get("chunk_count");
        let fallback_hash: Option<String> = row.get("file_hash");
        let fallback_size: Option<i64> = row.get("file_size");
        let from_manifest = manifest.and_then(|m| m.get(&key));
        let entry = by_key.entry(key.clone()).or_insert_with(|| ManifestRow {
            file: key.as_str().to_string(),
            hash: from_manifest.and_then(|m| m.hash.clone()).or(fallback_hash),
            mtime_ms: from_manifest.and_then(|m| m.mtime_ms),
            size: from_manifest.and_then(|m| m.size).or(fallback_size),
            chunk_count: 0,
        });
        entry.chunk_count += chunk_count;
    }

    let mut ordered: Vec<ManifestRow> = by_key.into_values().collect();
    ordered.sort_by(|a, b| a.file.cmp(&b.file));
    let total = ordered.len();

    let mut batcher = Batcher::by_rows(batch_size);
    for row in ordered {
        if let Some(batch) = batcher.push(row, 0) {
            insert_manifest_rows(conn, mode, &batch).await?;
            stats.record_batch("file_manifest");
        }
    }
    if let Some(batch) = batcher.finish() {
        insert_manifest_rows(conn, mode, &batch).await?;
        stats.record_batch("file_manifest");
    }
    stats.record_table("file_manifest", total as u64, started.elapsed());
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_ignores_classification() {
        let a: ChunkRecord = serde_json::from_value(json!({
            "file": "src/lib.rs", "start": 10, "end": 80, "kind": "function", "name": "parse"
        }))
        .unwrap();
        let b: ChunkRecord = serde_json::from_value(json!({
            "file": "src/lib.rs", "start": 10, "end": 80, "kind": "method", "name": "Parser::parse"
        }))
        .unwrap();
        let row_a = ChunkStageRow::from_record(&a, "code", 0);
        let row_b = ChunkStageRow::from_record(&b, "code", 1);
        assert_eq!(row_a.chunk_id, row_b.chunk_id);
        assert!(row_a.chunk_id.starts_with("ck:"));
    }

    #[test]
    fn test_fingerprint_tracks_position() {
        let base = chunk_fingerprint("a.rs", Some(0), Some(10), None);
        assert_ne!(base, chunk_fingerprint("a.rs", Some(0), Some(11), None));
        assert_ne!(base, chunk_fingerprint("b.rs", Some(0), Some(10), None));
        assert_ne!(base, chunk_fingerprint("a.rs", Some(0), Some(10), Some("md:1")));
        assert_eq!(base, chunk_fingerprint("a.rs", Some(0), Some(10), None));
    }

    #[test]
    fn test_explicit_chunk_id_wins() {
        let chunk: ChunkRecord =
            serde_json::from_value(json!({"chunkId": "abc", "file": "x.rs"})).unwrap();
        assert_eq!(ChunkStageRow::from_record(&chunk, "code", 0).chunk_id, "abc");
    }

    #[test]
    fn test_stage_row_serializes_structures() {
        let chunk: ChunkRecord = serde_json::from_value(json!({
            "file": ".\\src\\a.rs",
            "tokens": ["let", "x"],
            "headline": "let x",
            "codeRelations": {"calls": ["y"]},
            "preContext": ["// lead"]
        }))
        .unwrap();
        let row = ChunkStageRow::from_record(&chunk, "code", 3);
        assert_eq!(row.file.as_deref(), Some("src/a.rs"));
        assert_eq!(row.tokens.as_deref(), Some(r#"["let","x"]"#));
        assert_eq!(row.tokens_text.as_deref(), Some("let x"));
        assert_eq!(row.code_relations.as_deref(), Some(r#"{"calls":["y"]}"#));
        assert_eq!(row.pre_context.as_deref(), Some(r#"["// lead"]"#));
        assert!(row.estimated_bytes() > 128);
    }
}
