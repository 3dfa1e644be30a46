//! Incremental (delta) updates of an existing store.
//!
//! The caller hands over the current file manifest and a directory of
//! per-file bundles. Files whose content changed are deleted and
//! reinserted from their bundle; files missing from the manifest are
//! deleted; files whose only change is mtime get their manifest row
//! rewritten.
//!
//! An update either applies completely or not at all. Every condition
//! that makes a delta unsafe (schema mismatch, too many changes, a
//! missing bundle, vocabulary growth past its limits, ...) comes back as
//! [`UpdateOutcome::Skipped`] with the store untouched, and the caller is
//! expected to run a full build instead.
//!
//! Doc ids stay stable: a changed file gets its previous ids back in
//! order, and new files are placed before existing ones so id reuse does
//! not depend on input order (see [`DocIdAllocator`]).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, SqliteConnection};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::batch::resolve_batch_size;
use crate::chunk_ingest::{insert_chunk_stage_batch, insert_manifest_rows, merge_staged_chunks, ChunkStageRow, ManifestRow};
use crate::config::Config;
use crate::db;
use crate::docids::{DocIdAllocator, DocIdResolver, FileKey};
use crate::extension::{AnnStatus, VectorExtension};
use crate::manifest::{diff_manifest, load_stored_manifest, FileManifest, ManifestEntry, StoredManifestRow};
use crate::migrate::{self, REQUIRED_TABLES, SCHEMA_VERSION};
use crate::models::{ChunkRecord, VectorPayload};
use crate::report::{BuildStats, WarningKind, WarningLog};
use crate::sources::read_json;
use crate::token_ingest::{insert_doc_lengths, insert_doc_postings, insert_token_postings, write_token_stats};
use crate::validate::{validate_store, ExpectedCounts};
use crate::vector::pack_u32;
use crate::vector_ingest::{check_ann_identifiers, delete_doc_ids, read_dense_meta, AnnWriter, DenseWriter};
use crate::vocab::{ensure_vocab_ids, VocabKind};

/// One chunk as carried by a bundle.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleChunk {
    #[serde(flatten)]
    pub chunk: ChunkRecord,
    #[serde(default)]
    pub chargrams: Vec<String>,
    #[serde(default, alias = "minhash")]
    pub minhash_sig: Vec<u32>,
    #[serde(default)]
    pub embedding: Vec<f32>,
}

/// Everything the pipeline produced for one file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileBundle {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub chunks: Vec<BundleChunk>,
}

/// What an update is asked to apply.
pub struct UpdateInputs {
    pub manifest: FileManifest,
    pub bundle_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateReport {
    pub out: PathBuf,
    pub mode: String,
    pub changed_files: usize,
    pub deleted_files: usize,
    pub manifest_updates: usize,
    pub inserted_chunks: u64,
    pub deleted_chunks: u64,
    pub next_doc_id: i64,
    pub stats: BuildStats,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateOutcome {
    Applied(UpdateReport),
    Skipped { reason: String },
}

impl UpdateOutcome {
    fn skipped(reason: impl Into<String>) -> Self {
        UpdateOutcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied(_))
    }
}

/// A changed file with its loaded bundle.
struct ChangedFile {
    key: FileKey,
    /// Stored spelling of the path, when the file was already indexed.
    stored_file: Option<String>,
    entry: ManifestEntry,
    chunks: Vec<BundleChunk>,
}

/// Work decided by the read-only checks.
struct UpdatePlan {
    changed: Vec<ChangedFile>,
    /// Deleted keys with the stored spelling of their path.
    deleted: Vec<(FileKey, String)>,
    /// Same content, new mtime.
    touched: Vec<(FileKey, ManifestEntry, StoredManifestRow)>,
}

enum Precheck {
    Skip(String),
    NoChanges,
    Apply(UpdatePlan),
}

fn load_bundle(path: &Path) -> Result<FileBundle> {
    let value = read_json(path)?;
    serde_json::from_value(value).with_context(|| format!("Invalid bundle {}", path.display()))
}

/// Read-only checks against the live store. Nothing is written here.
async fn precheck(
    conn: &mut SqliteConnection,
    config: &Config,
    inputs: &UpdateInputs,
) -> Result<Precheck> {
    let mode = config.build.mode.as_str();
    let ci = config.incremental.case_insensitive_paths;

    let version = migrate::schema_version(conn).await?;
    if version != SCHEMA_VERSION {
        return Ok(Precheck::Skip(format!(
            "schema mismatch (db={}, expected={})",
            version, SCHEMA_VERSION
        )));
    }
    for table in REQUIRED_TABLES {
        if !migrate::table_exists(conn, table).await? {
            return Ok(Precheck::Skip(format!("schema missing table {}", table)));
        }
    }

    let manifest = &inputs.manifest;
    if manifest.is_empty() {
        return Ok(Precheck::Skip("incremental manifest empty".into()));
    }
    if !manifest.conflicts().is_empty() {
        return Ok(Precheck::Skip(format!(
            "manifest path conflicts: {}",
            manifest.conflicts().join("; ")
        )));
    }

    let stored = load_stored_manifest(conn, mode, ci).await?;
    if stored.is_empty() {
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE mode = ?")
            .bind(mode)
            .fetch_one(&mut *conn)
            .await?;
        if chunks > 0 {
            return Ok(Precheck::Skip("file manifest empty".into()));
        }
    }

    let diff = diff_manifest(&stored, manifest);
    let ratio = diff.change_ratio(stored.len(), manifest.len());
    if ratio > config.incremental.max_change_ratio {
        return Ok(Precheck::Skip(format!(
            "change ratio {:.2} exceeds {}",
            ratio, config.incremental.max_change_ratio
        )));
    }
    if diff.is_empty() {
        return Ok(Precheck::NoChanges);
    }

    let mut changed = Vec::with_capacity(diff.changed.len());
    let mut incoming_dims = BTreeSet::new();
    for key in &diff.changed {
        let Some(entry) = manifest.get(key) else {
            continue;
        };
        let Some(name) = entry.bundle.as_deref() else {
            return Ok(Precheck::Skip(format!("missing bundle for {}", key)));
        };
        let path = inputs.bundle_dir.join(name);
        if !path.is_file() {
            return Ok(Precheck::Skip(format!("bundle missing for {}", key)));
        }
        let bundle = match load_bundle(&path) {
            Ok(bundle) => bundle,
            Err(e) => {
                debug!(file = %key, error = %format!("{:#}", e), "Bundle unreadable");
                return Ok(Precheck::Skip(format!("invalid bundle for {}", key)));
            }
        };
        incoming_dims.extend(
            bundle
                .chunks
                .iter()
                .filter(|c| !c.embedding.is_empty())
                .map(|c| c.embedding.len()),
        );
        changed.push(ChangedFile {
            key: key.clone(),
            stored_file: stored.get(key).map(|row| row.file.clone()),
            entry: entry.clone(),
            chunks: bundle.chunks,
        });
    }

    if incoming_dims.len() > 1 {
        return Ok(Precheck::Skip("embedding dims mismatch across bundles".into()));
    }
    if let Some(&incoming) = incoming_dims.iter().next() {
        let stored_dims = read_dense_meta(conn, mode).await?.map(|(dims, _, _)| dims);
        if let Some(stored_dims) = stored_dims.filter(|d| *d > 0) {
            if stored_dims != incoming {
                return Ok(Precheck::Skip(format!(
                    "embedding dims mismatch (db={}, incoming={})",
                    stored_dims, incoming
                )));
            }
        }
        if let Some(expected) = config.vectors.dims {
            if expected != incoming {
                return Ok(Precheck::Skip(format!(
                    "embedding dims mismatch (expected={}, incoming={})",
                    expected, incoming
                )));
            }
        }
    }

    let deleted = diff
        .deleted
        .iter()
        .filter_map(|key| stored.get(key).map(|row| (key.clone(), row.file.clone())))
        .collect();
    let touched = diff
        .manifest_updates
        .iter()
        .filter_map(|key| {
            let entry = manifest.get(key)?.clone();
            let row = stored.get(key)?.clone();
            Some((key.clone(), entry, row))
        })
        .collect();

    Ok(Precheck::Apply(UpdatePlan {
        changed,
        deleted,
        touched,
    }))
}

/// Recompute `token_stats` for `mode` from `doc_lengths`.
pub async fn update_token_stats(conn: &mut SqliteConnection, mode: &str) -> Result<()> {
    let (total, avg): (i64, Option<f64>) =
        sqlx::query_as("SELECT COUNT(*), AVG(len) FROM doc_lengths WHERE mode = ?")
            .bind(mode)
            .fetch_one(&mut *conn)
            .await?;
    write_token_stats(conn, mode, avg.unwrap_or(0.0), total).await
}

/// Per-update state shared by the apply steps.
struct DeltaContext<'a> {
    config: &'a Config,
    mode: String,
    batch_size: usize,
    ann_status: AnnStatus,
    extension: Option<&'a dyn VectorExtension>,
    stats: BuildStats,
    warnings: WarningLog,
}

/// Counts gathered while applying a delta.
#[derive(Default)]
struct DeltaCounts {
    inserted_chunks: u64,
    deleted_chunks: u64,
    expected_chunks: u64,
    next_doc_id: i64,
}

fn collect_terms(plan: &UpdatePlan) -> [(VocabKind, Vec<String>); 3] {
    let mut tokens = BTreeSet::new();
    let mut phrases = BTreeSet::new();
    let mut grams = BTreeSet::new();
    for file in &plan.changed {
        for chunk in &file.chunks {
            tokens.extend(chunk.chunk.tokens.iter().cloned());
            phrases.extend(chunk.chunk.ngram_terms());
            grams.extend(chunk.chargrams.iter().cloned());
        }
    }
    [
        (VocabKind::Token, tokens.into_iter().collect()),
        (VocabKind::Phrase, phrases.into_iter().collect()),
        (VocabKind::Chargram, grams.into_iter().collect()),
    ]
}

async fn flush_chunks(conn: &mut SqliteConnection, rows: &mut Vec<ChunkStageRow>, stats: &mut BuildStats) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    insert_chunk_stage_batch(conn, rows).await?;
    stats.record_batch("chunk_meta");
    rows.clear();
    Ok(())
}

/// Apply the plan inside the open transaction. A vocabulary growth trip
/// returns `Err(reason)` before anything depends on the new terms; the
/// caller rolls back.
async fn apply_delta(
    conn: &mut SqliteConnection,
    ctx: &mut DeltaContext<'_>,
    plan: UpdatePlan,
) -> Result<std::result::Result<DeltaCounts, String>> {
    let mode = ctx.mode.clone();
    let batch_size = ctx.batch_size;
    let ci = ctx.config.incremental.case_insensitive_paths;

    let mut vocab_maps = BTreeMap::new();
    for (kind, terms) in collect_terms(&plan) {
        let limits = ctx.config.vocab.limits(kind);
        let allocation = ensure_vocab_ids(conn, &mode, kind, &terms, Some(&limits)).await?;
        if let Some(reason) = allocation.skipped {
            ctx.warnings.warn_once(WarningKind::VocabGrowthSkipped, reason.clone());
            return Ok(Err(reason));
        }
        if allocation.inserted > 0 {
            debug!(kind = kind.label(), inserted = allocation.inserted, "Vocabulary grown");
        }
        vocab_maps.insert(kind.label(), allocation.map);
    }
    let token_ids = vocab_maps.remove(VocabKind::Token.label()).unwrap_or_default();
    let phrase_ids = vocab_maps.remove(VocabKind::Phrase.label()).unwrap_or_default();
    let gram_ids = vocab_maps.remove(VocabKind::Chargram.label()).unwrap_or_default();

    let before: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE mode = ?")
        .bind(&mode)
        .fetch_one(&mut *conn)
        .await?;
    let max_id: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM chunks")
        .fetch_one(&mut *conn)
        .await?;

    let mut resolver = DocIdResolver::new(&mode, ci);
    let mut lookup: Vec<FileKey> = plan.changed.iter().map(|f| f.key.clone()).collect();
    lookup.extend(plan.deleted.iter().map(|(k, _)| k.clone()));
    resolver.prefetch(conn, &lookup).await?;

    let ann_table = if ctx.ann_status.is_available() {
        Some(ctx.config.vectors.ann.table.clone())
    } else {
        None
    };

    let mut counts = DeltaCounts::default();
    let mut freed = Vec::new();
    for (key, stored_file) in &plan.deleted {
        let ids = resolver.cached(key).map(<[i64]>::to_vec).unwrap_or_default();
        delete_doc_ids(conn, &mode, &ids, ann_table.as_deref()).await?;
        sqlx::query("DELETE FROM file_manifest WHERE mode = ? AND file = ?")
            .bind(&mode)
            .bind(stored_file)
            .execute(&mut *conn)
            .await?;
        counts.deleted_chunks += ids.len() as u64;
        freed.extend(ids);
    }
    let mut allocator = DocIdAllocator::new(freed, max_id.map_or(0, |m| m + 1));

    let stored_dense = read_dense_meta(conn, &mode).await?;
    let (quant, model, dims) = match stored_dense {
        Some((dims, quant, model)) => (quant, model.or_else(|| ctx.config.vectors.model.clone()), Some(dims).filter(|d| *d > 0)),
        None => (ctx.config.vectors.quantization(), ctx.config.vectors.model.clone(), ctx.config.vectors.dims),
    };
    let ann = AnnWriter::new(&ctx.config.vectors.ann, ctx.ann_status.clone(), ctx.extension)?;
    let mut dense = DenseWriter::new(&mode, quant, model, dims, ann, batch_size);

    let mut chunk_rows = Vec::with_capacity(batch_size);
    let mut lengths = Vec::new();
    let mut token_rows = Vec::new();
    let mut phrase_rows = Vec::new();
    let mut gram_rows = Vec::new();
    let mut minhash_rows = Vec::new();
    let mut manifest_rows = Vec::new();

    let ordered = resolver.order_changed_records(plan.changed, |f| &f.key);
    for file in ordered {
        let previous = resolver.cached(&file.key).map(<[i64]>::to_vec).unwrap_or_default();
        let is_new = previous.is_empty();
        delete_doc_ids(conn, &mode, &previous, ann_table.as_deref()).await?;
        if let Some(stored_file) = file.stored_file.as_deref().filter(|f| *f != file.key.as_str()) {
            sqlx::query("DELETE FROM file_manifest WHERE mode = ? AND file = ?")
                .bind(&mode)
                .bind(stored_file)
                .execute(&mut *conn)
                .await?;
        }
        counts.deleted_chunks += previous.len() as u64;
        let mut reuse: VecDeque<i64> = previous.into();

        let mut chunk_count = 0i64;
        for bundled in file.chunks {
            let doc_id = allocator.allocate(&mut reuse, is_new);
            let mut chunk = bundled.chunk;
            if chunk.file.is_none() {
                chunk.file = Some(file.key.as_str().to_string());
            }
            chunk_rows.push(ChunkStageRow::from_record(&chunk, &mode, doc_id));
            if chunk_rows.len() >= batch_size {
                flush_chunks(conn, &mut chunk_rows, &mut ctx.stats).await?;
            }

            lengths.push((doc_id, chunk.tokens.len() as i64));
            let mut freq: BTreeMap<i64, i64> = BTreeMap::new();
            for token in &chunk.tokens {
                if let Some(id) = token_ids.get(token) {
                    *freq.entry(*id).or_default() += 1;
                }
            }
            token_rows.extend(freq.into_iter().map(|(id, tf)| (id, doc_id, tf)));

            let phrases: BTreeSet<i64> = chunk
                .ngram_terms()
                .iter()
                .filter_map(|t| phrase_ids.get(t).copied())
                .collect();
            phrase_rows.extend(phrases.into_iter().map(|id| (id, doc_id)));
            let grams: BTreeSet<i64> = bundled
                .chargrams
                .iter()
                .filter_map(|t| gram_ids.get(t).copied())
                .collect();
            gram_rows.extend(grams.into_iter().map(|id| (id, doc_id)));

            if !bundled.minhash_sig.is_empty() {
                minhash_rows.push((doc_id, pack_u32(&bundled.minhash_sig)));
            }
            if !bundled.embedding.is_empty() {
                dense
                    .push(conn, doc_id, VectorPayload::Float(bundled.embedding), &mut ctx.stats, &mut ctx.warnings)
                    .await?;
            }
            chunk_count += 1;
            counts.inserted_chunks += 1;
        }
        allocator.release(reuse);

        manifest_rows.push(ManifestRow {
            file: file.key.as_str().to_string(),
            hash: file.entry.hash.clone(),
            mtime_ms: file.entry.mtime_ms,
            size: file.entry.size,
            chunk_count,
        });
    }
    flush_chunks(conn, &mut chunk_rows, &mut ctx.stats).await?;
    merge_staged_chunks(conn, &mut ctx.stats).await?;

    for batch in lengths.chunks(batch_size) {
        insert_doc_lengths(conn, &mode, batch).await?;
    }
    for batch in token_rows.chunks(batch_size) {
        insert_token_postings(conn, &mode, batch, false).await?;
        ctx.stats.record_batch("token_postings");
    }
    for batch in phrase_rows.chunks(batch_size) {
        insert_doc_postings(conn, VocabKind::Phrase, &mode, batch).await?;
        ctx.stats.record_batch("phrase_postings");
    }
    for batch in gram_rows.chunks(batch_size) {
        insert_doc_postings(conn, VocabKind::Chargram, &mode, batch).await?;
        ctx.stats.record_batch("chargram_postings");
    }
    for (doc_id, sig) in &minhash_rows {
        sqlx::query("INSERT OR REPLACE INTO minhash_signatures (mode, doc_id, sig) VALUES (?, ?, ?)")
            .bind(&mode)
            .bind(doc_id)
            .bind(sig.as_slice())
            .execute(&mut *conn)
            .await?;
    }
    let dense_rows = dense.finish(conn, &mut ctx.stats, &mut ctx.warnings).await?;

    for (_, entry, row) in &plan.touched {
        manifest_rows.push(ManifestRow {
            file: row.file.clone(),
            hash: entry.hash.clone().or_else(|| row.hash.clone()),
            mtime_ms: entry.mtime_ms,
            size: entry.size.or(row.size),
            chunk_count: row.chunk_count.unwrap_or(0),
        });
    }
    for batch in manifest_rows.chunks(batch_size) {
        insert_manifest_rows(conn, &mode, batch).await?;
        ctx.stats.record_batch("file_manifest");
    }

    update_token_stats(conn, &mode).await?;
    migrate::write_index_meta(conn, &mode, "incremental").await?;

    let elapsed = std::time::Duration::ZERO;
    ctx.stats.record_table("token_postings", token_rows.len() as u64, elapsed);
    ctx.stats.record_table("phrase_postings", phrase_rows.len() as u64, elapsed);
    ctx.stats.record_table("chargram_postings", gram_rows.len() as u64, elapsed);
    ctx.stats.record_table("minhash_signatures", minhash_rows.len() as u64, elapsed);
    ctx.stats.record_table("dense_vectors", dense_rows, elapsed);
    ctx.stats.record_table("file_manifest", manifest_rows.len() as u64, elapsed);

    counts.expected_chunks = (before as u64 + counts.inserted_chunks).saturating_sub(counts.deleted_chunks);
    counts.next_doc_id = allocator.next_doc_id();
    Ok(Ok(counts))
}

/// Apply a delta to the store at `config.db.path`.
pub async fn update_database(
    config: &Config,
    inputs: UpdateInputs,
    extension: Option<&dyn VectorExtension>,
) -> Result<UpdateOutcome> {
    let out = config.db.path.clone();
    let mode = config.build.mode.clone();
    if !out.is_file() {
        return Ok(UpdateOutcome::skipped("sqlite db missing"));
    }
    if config.vectors.ann.enabled {
        check_ann_identifiers(&config.vectors.ann)?;
    }

    let plan = {
        let mut live = db::open_existing(&out).await?;
        let checked = precheck(&mut live, config, &inputs).await;
        db::close_quietly(live).await;
        match checked? {
            Precheck::Skip(reason) => {
                info!(mode = %mode, reason = %reason, "Incremental update skipped");
                return Ok(UpdateOutcome::skipped(reason));
            }
            Precheck::NoChanges => {
                return Ok(UpdateOutcome::Applied(UpdateReport {
                    out,
                    mode,
                    ..Default::default()
                }));
            }
            Precheck::Apply(plan) => plan,
        }
    };
    let changed_files = plan.changed.len();
    let deleted_files = plan.deleted.len();
    let manifest_updates = plan.touched.len();

    let temp = db::temp_path_for(&out);
    db::copy_db_files(&out, &temp)?;
    let extension = if config.vectors.ann.enabled { extension } else { None };
    let (mut conn, ann_status) = match db::open_build_connection(&temp, false, extension).await {
        Ok(opened) => opened,
        Err(e) => {
            db::remove_db_files(&temp);
            return Err(e);
        }
    };

    let batch_size = resolve_batch_size(config.build.batch_size, None, None);
    let mut ctx = DeltaContext {
        config,
        mode: mode.clone(),
        batch_size,
        ann_status,
        extension,
        stats: BuildStats {
            batch_size,
            ..Default::default()
        },
        warnings: WarningLog::default(),
    };

    let result = run_delta(&mut conn, &mut ctx, plan).await;
    db::close_quietly(conn).await;

    let counts = match result {
        Ok(Ok(counts)) => counts,
        Ok(Err(reason)) => {
            db::remove_db_files(&temp);
            info!(mode = %mode, reason = %reason, "Incremental update skipped");
            return Ok(UpdateOutcome::skipped(reason));
        }
        Err(e) => {
            warn!(mode = %mode, error = %format!("{:#}", e), "Incremental update failed");
            db::remove_db_files(&temp);
            return Err(e);
        }
    };

    if let Err(e) = db::promote(&temp, &out) {
        db::remove_db_files(&temp);
        return Err(e);
    }
    info!(
        mode = %mode,
        changed = changed_files,
        deleted = deleted_files,
        inserted = counts.inserted_chunks,
        "Incremental update promoted"
    );

    Ok(UpdateOutcome::Applied(UpdateReport {
        out,
        mode,
        changed_files,
        deleted_files,
        manifest_updates,
        inserted_chunks: counts.inserted_chunks,
        deleted_chunks: counts.deleted_chunks,
        next_doc_id: counts.next_doc_id,
        stats: ctx.stats,
        warnings: ctx.warnings.messages(),
    }))
}

async fn run_delta(
    conn: &mut SqliteConnection,
    ctx: &mut DeltaContext<'_>,
    plan: UpdatePlan,
) -> Result<std::result::Result<DeltaCounts, String>> {
    migrate::create_staging_tables(conn).await?;

    let mut tx = conn.begin().await?;
    ctx.stats.transactions.begin += 1;
    let counts = match apply_delta(&mut *tx, ctx, plan).await {
        Ok(Ok(counts)) => counts,
        Ok(Err(reason)) => {
            tx.rollback().await?;
            ctx.stats.transactions.rollback += 1;
            return Ok(Err(reason));
        }
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                warn!(error = %rb, "Rollback failed");
            }
            ctx.stats.transactions.rollback += 1;
            return Err(e);
        }
    };
    tx.commit().await?;
    ctx.stats.transactions.commit += 1;

    let expected = ExpectedCounts {
        chunks: counts.expected_chunks,
        ..Default::default()
    };
    validate_store(conn, &ctx.mode, ctx.config.build.validate, &expected).await?;

    if let Err(e) = db::checkpoint(conn).await {
        ctx.warnings
            .warn_once(WarningKind::PostCommit, format!("checkpoint failed: {:#}", e));
    }
    Ok(Ok(counts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bundle_chunk_parses_extras() {
        let bundle: FileBundle = serde_json::from_value(json!({
            "file": "src/a.rs",
            "chunks": [{
                "start": 0,
                "end": 10,
                "kind": "function",
                "tokens": ["fn", "a"],
                "ngrams": ["fn a"],
                "chargrams": ["fn_", "n_a"],
                "minhashSig": [1, 2, 3],
                "embedding": [0.5, -0.5]
            }]
        }))
        .unwrap();
        let chunk = &bundle.chunks[0];
        assert_eq!(chunk.chunk.kind.as_deref(), Some("function"));
        assert_eq!(chunk.chunk.tokens, vec!["fn", "a"]);
        assert_eq!(chunk.chunk.ngram_terms(), vec!["fn a"]);
        assert_eq!(chunk.chargrams.len(), 2);
        assert_eq!(chunk.minhash_sig, vec![1, 2, 3]);
        assert_eq!(chunk.embedding, vec![0.5, -0.5]);
    }

    #[test]
    fn test_outcome_serializes_with_status() {
        let skipped = UpdateOutcome::skipped("change ratio 0.50 exceeds 0.35");
        let value = serde_json::to_value(&skipped).unwrap();
        assert_eq!(value["status"], "skipped");
        assert!(!skipped.is_applied());
    }
}
