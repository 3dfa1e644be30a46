//! Token, phrase and chargram posting ingestion.
//!
//! # Token postings
//!
//! A token index is `{vocab, postings, docLengths?, avgDocLen?, totalDocs?}`
//! where `postings[i]` lists `[docId, tf]` pairs for `vocab[i]`. Before
//! anything is written the vocabulary and posting counts must agree
//! ([`check_cardinality`]); doc lengths and totals must be exact
//! non-negative integers ([`coerce_strict_integer`]). Both failures are
//! [`BuildError`]s and abort the build.
//!
//! When the caller supplies no in-memory index, sources are tried in
//! order until one succeeds:
//!
//! | Step | Source |
//! |------|--------|
//! | 1 | In-memory [`TokenPostings`] |
//! | 2 | Resolved artifact: sharded parts + meta, single JSON, legacy pieces |
//! | 3 | Direct `token_postings.json`, then legacy packed varint postings |
//! | 4 | Re-tokenize the chunk list still held in memory |
//! | 5 | Re-tokenize chunk rows already stored, paged by id |
//!
//! Each attempt runs inside a savepoint, so a source that fails halfway
//! leaves nothing behind for the next one. Fatal errors stop the chain.
//!
//! # Phrase and chargram postings
//!
//! `{vocab, postings}` with plain doc-id lists, ids assigned by position.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{is_fatal, BuildError};
use crate::report::{BuildStats, WarningKind, WarningLog};
use crate::sources::{
    find_artifact, read_bytes, read_json, resolve_source, unwrap_fields, ArtifactSource,
    LegacyFormat,
};
use crate::vocab::VocabKind;

/// Largest integer a JSON double can carry exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

const TOKEN_DATASET: &str = "token_postings";
const DEFAULT_PACKED_OFFSETS: &str = "token_postings.packed.offsets.bin";

/// Parse `value` as an exact non-negative integer. Fractions, negatives,
/// and anything non-numeric are rejected, never truncated.
pub fn coerce_strict_integer(value: &Value, field: &str) -> Result<i64, BuildError> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().filter(|v| *v >= 0).or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= MAX_SAFE_INTEGER)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok().filter(|v| *v >= 0),
        _ => None,
    };
    parsed.ok_or_else(|| BuildError::NonInteger {
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// Vocabulary, posting and (optional) vocab-id counts must all match.
pub fn check_cardinality(
    label: &str,
    vocab: usize,
    postings: usize,
    vocab_ids: usize,
) -> Result<(), BuildError> {
    let mut diagnostics = Vec::new();
    if postings != vocab {
        diagnostics.push(format!("postings={} does not match vocab={}", postings, vocab));
    }
    if vocab_ids > 0 && vocab_ids != vocab {
        diagnostics.push(format!("vocabIds={} does not match vocab={}", vocab_ids, vocab));
    }
    if diagnostics.is_empty() {
        Ok(())
    } else {
        Err(BuildError::cardinality(
            label,
            format!("cardinality invariant failed: {}", diagnostics.join("; ")),
        ))
    }
}

/// Sort a posting list by doc id, summing duplicate doc ids and dropping
/// zero frequencies. A list that is already strictly ascending is
/// returned untouched.
pub fn normalize_postings(entries: Vec<(i64, i64)>) -> Vec<(i64, i64)> {
    if entries.windows(2).all(|w| w[0].0 < w[1].0) {
        return entries;
    }
    let mut merged: BTreeMap<i64, i64> = BTreeMap::new();
    for (doc_id, tf) in entries {
        *merged.entry(doc_id).or_default() += tf;
    }
    merged.into_iter().filter(|(_, tf)| *tf > 0).collect()
}

/// Parse one raw `[[docId, tf], ...]` list strictly, then normalize it.
/// Entries that are not pairs are ignored.
pub fn parse_tf_postings(raw: &Value, label: &str) -> Result<Vec<(i64, i64)>, BuildError> {
    let Value::Array(items) = raw else {
        return Ok(Vec::new());
    };
    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let Some(pair) = item.as_array().filter(|p| p.len() >= 2) else {
            continue;
        };
        let doc_id = coerce_strict_integer(&pair[0], &format!("{} docId", label))?;
        let tf = coerce_strict_integer(&pair[1], &format!("{} tf", label))?;
        entries.push((doc_id, tf));
    }
    Ok(normalize_postings(entries))
}

fn take_array(obj: &mut Map<String, Value>, key: &str) -> Vec<Value> {
    match obj.remove(key) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

fn vocab_strings(items: Vec<Value>) -> Vec<String> {
    items
        .into_iter()
        .map(|v| match v {
            Value::String(s) => s,
            other => other.to_string(),
        })
        .collect()
}

/// A token index in artifact shape. Posting lists stay raw until insert so
/// strict coercion sees the original values.
#[derive(Debug, Clone, Default)]
pub struct TokenPostings {
    pub vocab: Vec<String>,
    pub postings: Vec<Value>,
    pub vocab_ids: Vec<Value>,
    pub doc_lengths: Vec<Value>,
    pub avg_doc_len: Option<f64>,
    pub total_docs: Option<Value>,
}

impl TokenPostings {
    pub fn new(vocab: Vec<String>, postings: Vec<Vec<(i64, i64)>>, doc_lengths: Vec<i64>) -> Self {
        Self {
            vocab,
            postings: postings
                .into_iter()
                .map(|list| {
                    Value::Array(
                        list.into_iter()
                            .map(|(d, tf)| Value::Array(vec![d.into(), tf.into()]))
                            .collect(),
                    )
                })
                .collect(),
            doc_lengths: doc_lengths.into_iter().map(Value::from).collect(),
            ..Default::default()
        }
    }

    /// Parse a flat or `fields`/`arrays`-wrapped payload.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut obj) = unwrap_fields(value) else {
            anyhow::bail!("token postings payload must be an object");
        };
        if !matches!(obj.get("vocab"), Some(Value::Array(_)))
            || !matches!(obj.get("postings"), Some(Value::Array(_)))
        {
            anyhow::bail!("token postings payload has no vocab/postings arrays");
        }
        Ok(Self {
            vocab: vocab_strings(take_array(&mut obj, "vocab")),
            postings: take_array(&mut obj, "postings"),
            vocab_ids: take_array(&mut obj, "vocabIds"),
            doc_lengths: take_array(&mut obj, "docLengths"),
            avg_doc_len: obj.get("avgDocLen").and_then(Value::as_f64).filter(|f| f.is_finite()),
            total_docs: obj.remove("totalDocs").filter(|v| !v.is_null()),
        })
    }
}

/// Aggregate doc statistics for one mode.
#[derive(Debug, Clone, PartialEq)]
pub struct DocStats {
    pub doc_lengths: Vec<i64>,
    pub avg_doc_len: f64,
    pub total_docs: i64,
}

impl DocStats {
    /// Strictly coerce lengths and totals. The average is taken from the
    /// source when present, else the mean of the lengths.
    pub fn parse(
        label: &str,
        doc_lengths: &[Value],
        avg_doc_len: Option<f64>,
        total_docs: Option<&Value>,
    ) -> Result<Self, BuildError> {
        let lengths = doc_lengths
            .iter()
            .enumerate()
            .map(|(i, v)| coerce_strict_integer(v, &format!("{} docLengths[{}]", label, i)))
            .collect::<Result<Vec<_>, _>>()?;
        let total_docs = match total_docs {
            Some(v) => coerce_strict_integer(v, &format!("{} totalDocs", label))?,
            None => lengths.len() as i64,
        };
        let avg_doc_len = avg_doc_len.unwrap_or_else(|| mean(&lengths));
        Ok(Self {
            doc_lengths: lengths,
            avg_doc_len,
            total_docs,
        })
    }
}

fn mean(lengths: &[i64]) -> f64 {
    if lengths.is_empty() {
        0.0
    } else {
        lengths.iter().sum::<i64>() as f64 / lengths.len() as f64
    }
}

// ---------------------------------------------------------------------------
// Row writers
// ---------------------------------------------------------------------------

pub async fn insert_vocab_rows(
    conn: &mut SqliteConnection,
    kind: VocabKind,
    mode: &str,
    rows: &[(i64, String)],
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "INSERT OR REPLACE INTO {} (mode, {}, {}) ",
        kind.table(),
        kind.id_column(),
        kind.term_column()
    ));
    qb.push_values(rows, |mut b, (id, term)| {
        b.push_bind(mode).push_bind(*id).push_bind(term.as_str());
    });
    qb.build().execute(&mut *conn).await?;
    Ok(())
}

/// Insert `(token_id, doc_id, tf)` rows. With `accumulate`, a row that
/// already exists has its frequency increased instead of replaced.
pub async fn insert_token_postings(
    conn: &mut SqliteConnection,
    mode: &str,
    rows: &[(i64, i64, i64)],
    accumulate: bool,
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let verb = if accumulate { "INSERT" } else { "INSERT OR REPLACE" };
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "{} INTO token_postings (mode, token_id, doc_id, tf) ",
        verb
    ));
    qb.push_values(rows, |mut b, (token_id, doc_id, tf)| {
        b.push_bind(mode)
            .push_bind(*token_id)
            .push_bind(*doc_id)
            .push_bind(*tf);
    });
    if accumulate {
        qb.push(" ON CONFLICT(mode, token_id, doc_id) DO UPDATE SET tf = token_postings.tf + excluded.tf");
    }
    qb.build().execute(&mut *conn).await?;
    Ok(())
}

/// Insert `(term_id, doc_id)` rows into a phrase or chargram postings table.
pub async fn insert_doc_postings(
    conn: &mut SqliteConnection,
    kind: VocabKind,
    mode: &str,
    rows: &[(i64, i64)],
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "INSERT OR IGNORE INTO {} (mode, {}, doc_id) ",
        kind.postings_table(),
        kind.id_column()
    ));
    qb.push_values(rows, |mut b, (term_id, doc_id)| {
        b.push_bind(mode).push_bind(*term_id).push_bind(*doc_id);
    });
    qb.build().execute(&mut *conn).await?;
    Ok(())
}

pub async fn insert_doc_lengths(conn: &mut SqliteConnection, mode: &str, rows: &[(i64, i64)]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new("INSERT OR REPLACE INTO doc_lengths (mode, doc_id, len) ");
    qb.push_values(rows, |mut b, (doc_id, len)| {
        b.push_bind(mode).push_bind(*doc_id).push_bind(*len);
    });
    qb.build().execute(&mut *conn).await?;
    Ok(())
}

pub async fn write_token_stats(
    conn: &mut SqliteConnection,
    mode: &str,
    avg_doc_len: f64,
    total_docs: i64,
) -> Result<()> {
    sqlx::query("INSERT OR REPLACE INTO token_stats (mode, avg_doc_len, total_docs) VALUES (?, ?, ?)")
        .bind(mode)
        .bind(avg_doc_len)
        .bind(total_docs)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn write_doc_stats(
    conn: &mut SqliteConnection,
    mode: &str,
    doc_stats: &DocStats,
    batch_size: usize,
    stats: &mut BuildStats,
) -> Result<()> {
    let started = Instant::now();
    let rows: Vec<(i64, i64)> = doc_stats
        .doc_lengths
        .iter()
        .enumerate()
        .map(|(i, len)| (i as i64, *len))
        .collect();
    for chunk in rows.chunks(batch_size.max(1)) {
        insert_doc_lengths(conn, mode, chunk).await?;
        stats.record_batch("doc_lengths");
    }
    stats.record_table("doc_lengths", rows.len() as u64, started.elapsed());
    write_token_stats(conn, mode, doc_stats.avg_doc_len, doc_stats.total_docs).await?;
    stats.record_table("token_stats", 1, std::time::Duration::ZERO);
    Ok(())
}

/// Write vocabulary and postings of one index (or shard), ids starting at
/// `offset`. Returns `(vocab rows, posting rows)`.
async fn write_token_block(
    conn: &mut SqliteConnection,
    mode: &str,
    label: &str,
    index: &TokenPostings,
    offset: i64,
    accumulate: bool,
    batch_size: usize,
    stats: &mut BuildStats,
) -> Result<(u64, u64)> {
    let batch_size = batch_size.max(1);
    let vocab_rows: Vec<(i64, String)> = index
        .vocab
        .iter()
        .enumerate()
        .map(|(i, t)| (offset + i as i64, t.clone()))
        .collect();
    for chunk in vocab_rows.chunks(batch_size) {
        insert_vocab_rows(conn, VocabKind::Token, mode, chunk).await?;
        stats.record_batch("token_vocab");
    }

    let mut pending: Vec<(i64, i64, i64)> = Vec::with_capacity(batch_size);
    let mut posting_rows = 0u64;
    for (i, raw) in index.postings.iter().enumerate() {
        let token_id = offset + i as i64;
        let list = parse_tf_postings(raw, &format!("{} tokenId={}", label, token_id))?;
        for (doc_id, tf) in list {
            pending.push((token_id, doc_id, tf));
            posting_rows += 1;
            if pending.len() >= batch_size {
                insert_token_postings(conn, mode, &pending, accumulate).await?;
                stats.record_batch("token_postings");
                pending.clear();
            }
        }
    }
    if !pending.is_empty() {
        insert_token_postings(conn, mode, &pending, accumulate).await?;
        stats.record_batch("token_postings");
    }
    Ok((vocab_rows.len() as u64, posting_rows))
}

/// Ingest a complete token index for `mode`. Validation happens before any
/// row is written.
pub async fn ingest_token_postings(
    conn: &mut SqliteConnection,
    mode: &str,
    index: &TokenPostings,
    batch_size: usize,
    stats: &mut BuildStats,
) -> Result<()> {
    let label = format!("{} ({})", TOKEN_DATASET, mode);
    check_cardinality(&label, index.vocab.len(), index.postings.len(), index.vocab_ids.len())?;
    let doc_stats = DocStats::parse(
        &label,
        &index.doc_lengths,
        index.avg_doc_len,
        index.total_docs.as_ref(),
    )?;

    let started = Instant::now();
    let (vocab_rows, posting_rows) =
        write_token_block(conn, mode, &label, index, 0, false, batch_size, stats).await?;
    let elapsed = started.elapsed();
    stats.record_table("token_vocab", vocab_rows, elapsed);
    stats.record_table("token_postings", posting_rows, elapsed);
    write_doc_stats(conn, mode, &doc_stats, batch_size, stats).await
}

/// Ingest sharded token postings. Aggregate stats come from the meta file;
/// each shard's ids continue where the previous shard's vocabulary ended.
pub async fn ingest_sharded_token_postings(
    conn: &mut SqliteConnection,
    mode: &str,
    meta: Option<&Path>,
    parts: &[PathBuf],
    batch_size: usize,
    stats: &mut BuildStats,
) -> Result<()> {
    let label = format!("{} shards ({})", TOKEN_DATASET, mode);
    let meta_value = match meta {
        Some(path) => unwrap_fields(read_json(path)?),
        None => Value::Object(Map::new()),
    };
    let doc_lengths = meta_value
        .get("docLengths")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let doc_stats = DocStats::parse(
        &label,
        &doc_lengths,
        meta_value.get("avgDocLen").and_then(Value::as_f64).filter(|f| f.is_finite()),
        meta_value.get("totalDocs").filter(|v| !v.is_null()),
    )?;
    write_doc_stats(conn, mode, &doc_stats, batch_size, stats).await?;

    let started = Instant::now();
    let mut offset = 0i64;
    let mut vocab_total = 0u64;
    let mut posting_total = 0u64;
    for part in parts {
        let shard_label = format!(
            "{} shard {} ({})",
            TOKEN_DATASET,
            part.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
            mode
        );
        let shard = TokenPostings::from_value(read_json(part)?)
            .with_context(|| format!("Invalid token shard {}", part.display()))?;
        check_cardinality(&shard_label, shard.vocab.len(), shard.postings.len(), shard.vocab_ids.len())?;
        let (vocab_rows, posting_rows) =
            write_token_block(conn, mode, &shard_label, &shard, offset, true, batch_size, stats).await?;
        offset += shard.vocab.len() as i64;
        vocab_total += vocab_rows;
        posting_total += posting_rows;
    }
    let elapsed = started.elapsed();
    stats.record_table("token_vocab", vocab_total, elapsed);
    stats.record_table("token_postings", posting_total, elapsed);
    Ok(())
}

// ---------------------------------------------------------------------------
// Legacy packed postings
// ---------------------------------------------------------------------------

fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let Some(&byte) = buf.get(*pos) else {
            anyhow::bail!("truncated varint at byte {}", *pos);
        };
        *pos += 1;
        if shift >= 64 {
            anyhow::bail!("varint overflow at byte {}", *pos);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Little-endian u64 offsets, one per token plus a final end offset.
pub fn decode_offsets(bytes: &[u8]) -> Result<Vec<u64>> {
    if bytes.len() % 8 != 0 {
        anyhow::bail!("offsets table length {} is not a multiple of 8", bytes.len());
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

/// Decode every posting list from `data`. List `i` spans
/// `offsets[i]..offsets[i + 1]` and holds `(docId delta, tf)` varint pairs.
pub fn decode_packed_postings(data: &[u8], offsets: &[u64]) -> Result<Vec<Vec<(i64, i64)>>> {
    let mut lists = Vec::with_capacity(offsets.len().saturating_sub(1));
    for window in offsets.windows(2) {
        let (start, end) = (window[0] as usize, window[1] as usize);
        if end < start || end > data.len() {
            anyhow::bail!("packed postings truncated: slice {}..{} of {}", start, end, data.len());
        }
        let slice = &data[start..end];
        let mut pos = 0usize;
        let mut doc_id = 0i64;
        let mut list = Vec::new();
        while pos < slice.len() {
            let delta = i64::try_from(read_varint(slice, &mut pos)?).ok();
            doc_id = match delta.and_then(|d| doc_id.checked_add(d)) {
                Some(id) => id,
                None => anyhow::bail!("packed postings overflow: doc id delta at byte {} of slice {}..{}", pos, start, end),
            };
            let tf = match i64::try_from(read_varint(slice, &mut pos)?) {
                Ok(tf) => tf,
                Err(_) => anyhow::bail!("packed postings overflow: tf at byte {} of slice {}..{}", pos, start, end),
            };
            list.push((doc_id, tf));
        }
        lists.push(list);
    }
    Ok(lists)
}

/// Load `token_postings.packed.bin` with its meta and offsets files.
pub fn load_packed_token_postings(packed: &Path, meta: &Path) -> Result<TokenPostings> {
    let Value::Object(mut obj) = unwrap_fields(read_json(meta)?) else {
        anyhow::bail!("{}: packed meta must be an object", meta.display());
    };
    let offsets_name = obj
        .get("offsets")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_PACKED_OFFSETS)
        .to_string();
    let dir = packed.parent().unwrap_or_else(|| Path::new("."));
    let offsets = decode_offsets(&read_bytes(&dir.join(&offsets_name))?)?;
    let lists = decode_packed_postings(&read_bytes(packed)?, &offsets)?;

    let vocab = vocab_strings(take_array(&mut obj, "vocab"));
    let mut index = TokenPostings::new(vocab, lists, Vec::new());
    index.vocab_ids = take_array(&mut obj, "vocabIds");
    index.doc_lengths = take_array(&mut obj, "docLengths");
    index.avg_doc_len = obj.get("avgDocLen").and_then(Value::as_f64).filter(|f| f.is_finite());
    index.total_docs = obj.remove("totalDocs").filter(|v| !v.is_null());
    Ok(index)
}

// ---------------------------------------------------------------------------
// Rebuild from chunk tokens
// ---------------------------------------------------------------------------

/// Recomputes a token index from chunk token lists, batch by batch.
#[derive(Debug, Default)]
struct TokenRebuild {
    ids: HashMap<String, i64>,
    next_id: i64,
    total_docs: i64,
    total_len: i64,
    vocab_rows: u64,
    posting_rows: u64,
    doc_rows: u64,
}

impl TokenRebuild {
    async fn add_batch(
        &mut self,
        conn: &mut SqliteConnection,
        mode: &str,
        docs: &[(i64, Vec<String>)],
        batch_size: usize,
        stats: &mut BuildStats,
    ) -> Result<()> {
        let mut lengths = Vec::with_capacity(docs.len());
        let mut new_vocab = Vec::new();
        let mut postings: Vec<(i64, i64, i64)> = Vec::new();

        for (doc_id, tokens) in docs {
            let len = tokens.len() as i64;
            self.total_docs += 1;
            self.total_len += len;
            lengths.push((*doc_id, len));

            let mut freq: BTreeMap<i64, i64> = BTreeMap::new();
            for token in tokens {
                let id = match self.ids.get(token) {
                    Some(id) => *id,
                    None => {
                        let id = self.next_id;
                        self.next_id += 1;
                        self.ids.insert(token.clone(), id);
                        new_vocab.push((id, token.clone()));
                        id
                    }
                };
                *freq.entry(id).or_default() += 1;
            }
            postings.extend(freq.into_iter().map(|(token_id, tf)| (token_id, *doc_id, tf)));
        }

        let batch_size = batch_size.max(1);
        for chunk in lengths.chunks(batch_size) {
            insert_doc_lengths(conn, mode, chunk).await?;
        }
        for chunk in new_vocab.chunks(batch_size) {
            insert_vocab_rows(conn, VocabKind::Token, mode, chunk).await?;
        }
        for chunk in postings.chunks(batch_size) {
            insert_token_postings(conn, mode, chunk, true).await?;
        }
        stats.record_batch("token_postings");
        stats.record_batch("token_vocab");
        stats.record_batch("doc_lengths");

        self.doc_rows += lengths.len() as u64;
        self.vocab_rows += new_vocab.len() as u64;
        self.posting_rows += postings.len() as u64;
        Ok(())
    }

    async fn finish(
        self,
        conn: &mut SqliteConnection,
        mode: &str,
        started: Instant,
        stats: &mut BuildStats,
    ) -> Result<()> {
        let avg = if self.total_docs > 0 {
            self.total_len as f64 / self.total_docs as f64
        } else {
            0.0
        };
        write_token_stats(conn, mode, avg, self.total_docs).await?;
        let elapsed = started.elapsed();
        stats.record_table("doc_lengths", self.doc_rows, elapsed);
        stats.record_table("token_vocab", self.vocab_rows, elapsed);
        stats.record_table("token_postings", self.posting_rows, elapsed);
        stats.record_table("token_stats", 1, std::time::Duration::ZERO);
        Ok(())
    }
}

/// Rebuild postings from `(doc id, tokens)` pairs held in memory.
pub async fn rebuild_from_chunks(
    conn: &mut SqliteConnection,
    mode: &str,
    docs: &[(i64, Vec<String>)],
    batch_size: usize,
    stats: &mut BuildStats,
) -> Result<bool> {
    if docs.is_empty() {
        return Ok(false);
    }
    let started = Instant::now();
    let mut rebuild = TokenRebuild::default();
    for batch in docs.chunks(batch_size.max(1)) {
        rebuild.add_batch(conn, mode, batch, batch_size, stats).await?;
    }
    rebuild.finish(conn, mode, started, stats).await?;
    Ok(true)
}

/// Rebuild postings from the `tokens` column of stored chunk rows.
/// Returns `false` when the mode has no chunk rows.
pub async fn rebuild_from_stored_chunks(
    conn: &mut SqliteConnection,
    mode: &str,
    batch_size: usize,
    stats: &mut BuildStats,
) -> Result<bool> {
    let started = Instant::now();
    let mut rebuild = TokenRebuild::default();
    let mut last_id = -1i64;
    let mut saw_rows = false;
    loop {
        let rows = sqlx::query("SELECT id, tokens FROM chunks WHERE mode = ? AND id > ? ORDER BY id LIMIT ?")
            .bind(mode)
            .bind(last_id)
            .bind(batch_size.max(1) as i64)
            .fetch_all(&mut *conn)
            .await?;
        let Some(tail) = rows.last() else {
            break;
        };
        last_id = tail.get("id");
        saw_rows = true;

        let docs: Vec<(i64, Vec<String>)> = rows
            .iter()
            .map(|row| {
                let raw: Option<String> = row.get("tokens");
                let tokens = raw
                    .and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok())
                    .unwrap_or_default();
                (row.get::<i64, _>("id"), tokens)
            })
            .collect();
        rebuild.add_batch(conn, mode, &docs, batch_size, stats).await?;
    }
    if !saw_rows {
        return Ok(false);
    }
    rebuild.finish(conn, mode, started, stats).await?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Fallback chain
// ---------------------------------------------------------------------------

/// Everything the token ingest may draw on.
#[derive(Default)]
pub struct TokenSources<'a> {
    pub in_memory: Option<TokenPostings>,
    pub index_dir: Option<&'a Path>,
    /// `(doc id, tokens)` of chunks ingested in this build.
    pub retained_chunks: Option<&'a [(i64, Vec<String>)]>,
}

const SAVEPOINT: &str = "token_source";

async fn begin_attempt(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(&format!("SAVEPOINT {}", SAVEPOINT))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Close the savepoint opened by [`begin_attempt`]: keep the rows on
/// success, discard them otherwise. Non-fatal errors become `Ok(false)`.
async fn settle(conn: &mut SqliteConnection, step: &str, outcome: Result<bool>) -> Result<bool> {
    let keep = matches!(outcome, Ok(true));
    if !keep {
        sqlx::query(&format!("ROLLBACK TO {}", SAVEPOINT))
            .execute(&mut *conn)
            .await?;
    }
    sqlx::query(&format!("RELEASE {}", SAVEPOINT))
        .execute(&mut *conn)
        .await?;
    match outcome {
        Ok(done) => Ok(done),
        Err(e) if is_fatal(&e) => Err(e),
        Err(e) => {
            debug!(step, error = %format!("{:#}", e), "Token source failed, trying next");
            Ok(false)
        }
    }
}

async fn ingest_resolved(
    conn: &mut SqliteConnection,
    mode: &str,
    source: ArtifactSource,
    batch_size: usize,
    stats: &mut BuildStats,
) -> Result<bool> {
    match source {
        ArtifactSource::Sharded { meta, parts } => {
            ingest_sharded_token_postings(conn, mode, meta.as_deref(), &parts, batch_size, stats).await?;
        }
        ArtifactSource::Single { path, .. } | ArtifactSource::Columnar { path } => {
            let index = TokenPostings::from_value(read_json(&path)?)?;
            ingest_token_postings(conn, mode, &index, batch_size, stats).await?;
        }
        ArtifactSource::Legacy {
            path,
            format: LegacyFormat::Packed { meta },
        } => {
            let index = load_packed_token_postings(&path, &meta)?;
            ingest_token_postings(conn, mode, &index, batch_size, stats).await?;
        }
        ArtifactSource::Legacy { path, .. } => {
            anyhow::bail!("{} is not a token postings layout", path.display());
        }
    }
    Ok(true)
}

async fn ingest_direct_json(
    conn: &mut SqliteConnection,
    mode: &str,
    dir: &Path,
    batch_size: usize,
    stats: &mut BuildStats,
) -> Result<bool> {
    let Some(path) = find_artifact(dir, &format!("{}.json", TOKEN_DATASET)) else {
        return Ok(false);
    };
    let index = TokenPostings::from_value(read_json(&path)?)?;
    ingest_token_postings(conn, mode, &index, batch_size, stats).await?;
    Ok(true)
}

async fn ingest_packed(
    conn: &mut SqliteConnection,
    mode: &str,
    dir: &Path,
    batch_size: usize,
    stats: &mut BuildStats,
) -> Result<bool> {
    let packed = dir.join(format!("{}.packed.bin", TOKEN_DATASET));
    let meta = dir.join(format!("{}.packed.meta.json", TOKEN_DATASET));
    if !packed.is_file() || !meta.is_file() {
        return Ok(false);
    }
    let index = load_packed_token_postings(&packed, &meta)?;
    ingest_token_postings(conn, mode, &index, batch_size, stats).await?;
    Ok(true)
}

/// Populate token vocab, postings, doc lengths and stats for `mode` from
/// the first source that works. Returns the source used, or `None` (with a
/// warning) when every source failed.
pub async fn ingest_token_index(
    conn: &mut SqliteConnection,
    mode: &str,
    sources: TokenSources<'_>,
    batch_size: usize,
    stats: &mut BuildStats,
    warnings: &mut WarningLog,
) -> Result<Option<&'static str>> {
    let chosen = pick_token_source(conn, mode, sources, batch_size, stats).await?;
    match chosen {
        Some(label) => {
            info!(mode, source = label, "Token postings ingested");
            stats.token_source = Some(label.to_string());
        }
        None => {
            warnings.warn_once(
                WarningKind::TokenRebuild,
                format!(
                    "rebuild from chunks failed; mode {} left without computed term statistics",
                    mode
                ),
            );
        }
    }
    Ok(chosen)
}

async fn pick_token_source(
    conn: &mut SqliteConnection,
    mode: &str,
    sources: TokenSources<'_>,
    batch_size: usize,
    stats: &mut BuildStats,
) -> Result<Option<&'static str>> {
    if let Some(index) = sources.in_memory {
        ingest_token_postings(conn, mode, &index, batch_size, stats).await?;
        return Ok(Some("memory"));
    }

    if let Some(dir) = sources.index_dir {
        // Missing declared shard parts is fatal, so resolution errors propagate.
        if let Some(source) = resolve_source(dir, TOKEN_DATASET)? {
            let label = source.kind();
            begin_attempt(conn).await?;
            let outcome = ingest_resolved(conn, mode, source, batch_size, stats).await;
            if settle(conn, label, outcome).await? {
                return Ok(Some(label));
            }
        }

        begin_attempt(conn).await?;
        let outcome = ingest_direct_json(conn, mode, dir, batch_size, stats).await;
        if settle(conn, "json", outcome).await? {
            return Ok(Some("json"));
        }

        begin_attempt(conn).await?;
        let outcome = ingest_packed(conn, mode, dir, batch_size, stats).await;
        if settle(conn, "packed", outcome).await? {
            return Ok(Some("packed"));
        }
    }

    if let Some(docs) = sources.retained_chunks {
        begin_attempt(conn).await?;
        let outcome = rebuild_from_chunks(conn, mode, docs, batch_size, stats).await;
        if settle(conn, "chunks", outcome).await? {
            return Ok(Some("chunks"));
        }
    }

    begin_attempt(conn).await?;
    let outcome = rebuild_from_stored_chunks(conn, mode, batch_size, stats).await;
    if settle(conn, "stored-chunks", outcome).await? {
        return Ok(Some("stored-chunks"));
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Phrase and chargram postings
// ---------------------------------------------------------------------------

/// `{vocab, postings}` where each posting list holds bare doc ids.
#[derive(Debug, Clone, Default)]
pub struct DocPostings {
    pub vocab: Vec<String>,
    pub postings: Vec<Value>,
}

impl DocPostings {
    pub fn new(vocab: Vec<String>, postings: Vec<Vec<i64>>) -> Self {
        Self {
            vocab,
            postings: postings
                .into_iter()
                .map(|list| Value::Array(list.into_iter().map(Value::from).collect()))
                .collect(),
        }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut obj) = unwrap_fields(value) else {
            anyhow::bail!("posting payload must be an object");
        };
        Ok(Self {
            vocab: vocab_strings(take_array(&mut obj, "vocab")),
            postings: take_array(&mut obj, "postings"),
        })
    }
}

/// Strictly parsed, sorted, de-duplicated doc ids of one list.
fn parse_doc_ids(raw: &Value, label: &str) -> Result<Vec<i64>, BuildError> {
    let Value::Array(items) = raw else {
        return Ok(Vec::new());
    };
    let mut ids = items
        .iter()
        .map(|v| coerce_strict_integer(v, label))
        .collect::<Result<Vec<_>, _>>()?;
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

/// Ingest one phrase or chargram index, ids by position from `offset`.
/// Returns the vocabulary size written.
pub async fn ingest_doc_postings(
    conn: &mut SqliteConnection,
    kind: VocabKind,
    mode: &str,
    index: &DocPostings,
    offset: i64,
    batch_size: usize,
    stats: &mut BuildStats,
) -> Result<usize> {
    let label = format!("{} ({})", kind.postings_table(), mode);
    check_cardinality(&label, index.vocab.len(), index.postings.len(), 0)?;

    let batch_size = batch_size.max(1);
    let started = Instant::now();
    let vocab_rows: Vec<(i64, String)> = index
        .vocab
        .iter()
        .enumerate()
        .map(|(i, t)| (offset + i as i64, t.clone()))
        .collect();
    for chunk in vocab_rows.chunks(batch_size) {
        insert_vocab_rows(conn, kind, mode, chunk).await?;
        stats.record_batch(kind.table());
    }
    stats.record_table(kind.table(), vocab_rows.len() as u64, started.elapsed());

    let started = Instant::now();
    let mut pending = Vec::with_capacity(batch_size);
    let mut posting_rows = 0u64;
    for (i, raw) in index.postings.iter().enumerate() {
        let term_id = offset + i as i64;
        for doc_id in parse_doc_ids(raw, &format!("{} id={}", label, term_id))? {
            pending.push((term_id, doc_id));
            posting_rows += 1;
            if pending.len() >= batch_size {
                insert_doc_postings(conn, kind, mode, &pending).await?;
                stats.record_batch(kind.postings_table());
                pending.clear();
            }
        }
    }
    if !pending.is_empty() {
        insert_doc_postings(conn, kind, mode, &pending).await?;
        stats.record_batch(kind.postings_table());
    }
    stats.record_table(kind.postings_table(), posting_rows, started.elapsed());
    Ok(vocab_rows.len())
}

/// Artifact dataset name for a phrase or chargram index.
pub fn doc_postings_dataset(kind: VocabKind) -> &'static str {
    match kind {
        VocabKind::Phrase => "phrase_ngrams",
        VocabKind::Chargram => "chargram_postings",
        VocabKind::Token => TOKEN_DATASET,
    }
}

/// Load and ingest a phrase or chargram index from `dir`. Returns `false`
/// when the artifact is absent.
pub async fn ingest_doc_postings_from_dir(
    conn: &mut SqliteConnection,
    kind: VocabKind,
    mode: &str,
    dir: &Path,
    batch_size: usize,
    stats: &mut BuildStats,
) -> Result<bool> {
    let dataset = doc_postings_dataset(kind);
    let Some(source) = resolve_source(dir, dataset)? else {
        return Ok(false);
    };
    match source {
        ArtifactSource::Single { path, .. } | ArtifactSource::Columnar { path } => {
            let index = DocPostings::from_value(read_json(&path)?)
                .with_context(|| format!("Invalid {} artifact {}", dataset, path.display()))?;
            ingest_doc_postings(conn, kind, mode, &index, 0, batch_size, stats).await?;
        }
        ArtifactSource::Sharded { parts, .. } => {
            let mut offset = 0i64;
            for part in parts {
                let shard = DocPostings::from_value(read_json(&part)?)
                    .with_context(|| format!("Invalid {} shard {}", dataset, part.display()))?;
                let written = ingest_doc_postings(conn, kind, mode, &shard, offset, batch_size, stats).await?;
                offset += written as i64;
            }
        }
        ArtifactSource::Legacy { path, .. } => {
            debug!(dataset, path = %path.display(), "Legacy layout not supported for doc postings");
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_fast_path_is_identity() {
        let sorted = vec![(0, 1), (3, 2), (9, 1)];
        assert_eq!(normalize_postings(sorted.clone()), sorted);
    }

    #[test]
    fn test_normalize_merges_duplicates() {
        assert_eq!(normalize_postings(vec![(2, 1), (0, 3), (2, 4)]), vec![(0, 3), (2, 5)]);
        assert_eq!(normalize_postings(vec![(5, 0), (1, 2), (1, 0)]), vec![(1, 2)]);
    }

    #[test]
    fn test_strict_integer_rejects_fractions() {
        assert_eq!(coerce_strict_integer(&json!(7), "len").unwrap(), 7);
        assert_eq!(coerce_strict_integer(&json!(7.0), "len").unwrap(), 7);
        assert_eq!(coerce_strict_integer(&json!("12"), "len").unwrap(), 12);
        for bad in [json!(1.5), json!(-1), json!(null), json!("x"), json!(1e300)] {
            let err = coerce_strict_integer(&bad, "len").unwrap_err();
            assert_eq!(err.code(), BuildError::NON_INTEGER_CODE);
        }
    }

    #[test]
    fn test_cardinality_reports_each_mismatch() {
        assert!(check_cardinality("t", 3, 3, 0).is_ok());
        let err = check_cardinality("t", 3, 2, 4).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("ERR_SQLITE_TOKEN_CARDINALITY"));
        assert!(msg.contains("postings=2 does not match vocab=3"));
        assert!(msg.contains("vocabIds=4 does not match vocab=3"));
    }

    #[test]
    fn test_parse_tf_postings_is_strict() {
        let ok = parse_tf_postings(&json!([[2, 1], [0, 3], "junk", [2, 4]]), "p").unwrap();
        assert_eq!(ok, vec![(0, 3), (2, 5)]);
        assert!(parse_tf_postings(&json!([[0.5, 1]]), "p").is_err());
    }

    #[test]
    fn test_doc_stats_average_defaults_to_mean() {
        let stats = DocStats::parse("t", &[json!(2), json!(4)], None, None).unwrap();
        assert_eq!(stats.avg_doc_len, 3.0);
        assert_eq!(stats.total_docs, 2);
        let declared = DocStats::parse("t", &[json!(2)], Some(9.5), Some(&json!(10))).unwrap();
        assert_eq!(declared.avg_doc_len, 9.5);
        assert_eq!(declared.total_docs, 10);
        assert!(DocStats::parse("t", &[json!(2.5)], None, None).is_err());
    }

    #[test]
    fn test_token_postings_from_wrapped_value() {
        let index = TokenPostings::from_value(json!({
            "fields": {"avgDocLen": 2.0, "totalDocs": 2},
            "arrays": {"vocab": ["a", "b"], "postings": [[[0, 1]], [[1, 2]]], "docLengths": [1, 2]}
        }))
        .unwrap();
        assert_eq!(index.vocab, vec!["a", "b"]);
        assert_eq!(index.postings.len(), 2);
        assert_eq!(index.avg_doc_len, Some(2.0));
        assert!(TokenPostings::from_value(json!({"vocab": []})).is_err());
    }

    fn write_varint(out: &mut Vec<u8>, mut v: u64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                return;
            }
            out.push(byte | 0x80);
        }
    }

    #[test]
    fn test_decode_packed_postings() {
        let lists = [vec![(0u64, 1u64), (300, 2)], vec![], vec![(5, 1)]];
        let mut data = Vec::new();
        let mut offsets = vec![0u64];
        for list in &lists {
            let mut prev = 0;
            for (doc, tf) in list {
                write_varint(&mut data, doc - prev);
                write_varint(&mut data, *tf);
                prev = *doc;
            }
            offsets.push(data.len() as u64);
        }
        let offset_bytes: Vec<u8> = offsets.iter().flat_map(|o| o.to_le_bytes()).collect();

        let decoded = decode_packed_postings(&data, &decode_offsets(&offset_bytes).unwrap()).unwrap();
        assert_eq!(decoded, vec![vec![(0, 1), (300, 2)], vec![], vec![(5, 1)]]);
        assert!(decode_packed_postings(&data[..2], &offsets).is_err());
        assert!(decode_offsets(&[0u8; 7]).is_err());
    }

    #[test]
    fn test_decode_packed_postings_rejects_doc_id_overflow() {
        let mut huge = Vec::new();
        write_varint(&mut huge, u64::MAX);
        write_varint(&mut huge, 1);
        let err = decode_packed_postings(&huge, &[0, huge.len() as u64]).unwrap_err();
        assert!(err.to_string().contains("packed postings overflow"), "{}", err);

        let mut summed = Vec::new();
        for _ in 0..2 {
            write_varint(&mut summed, i64::MAX as u64);
            write_varint(&mut summed, 1);
        }
        let err = decode_packed_postings(&summed, &[0, summed.len() as u64]).unwrap_err();
        assert!(err.to_string().contains("packed postings overflow"), "{}", err);
    }
}
