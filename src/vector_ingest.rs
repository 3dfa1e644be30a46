//! Dense vector and MinHash ingestion.
//!
//! Dense vectors land in `dense_vectors` as one byte per dimension (see
//! [`crate::vector`]). The per-mode `dense_meta` row is written lazily when
//! the first vector arrives, so dimensionality can come from the data.
//!
//! When ANN population is live, every stored vector is expanded back to
//! floats (or kept as codes, per the configured encoding) and written to
//! the accelerator table. A vector whose encoded length does not match the
//! declared dimensionality is skipped for ANN only.

use anyhow::{Context, Result};
use futures::StreamExt;
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::path::Path;
use std::time::Instant;
use tracing::debug;

use crate::config::{AnnConfig, VectorsConfig};
use crate::error::BuildError;
use crate::extension::{AnnStatus, VectorExtension};
use crate::models::{DenseInput, DenseRow, DenseVectors, MinhashRow, RowSource, VectorPayload};
use crate::report::{BuildStats, WarningKind, WarningLog};
use crate::sources::{
    read_bytes, read_json, resolve_source, row_stream, unwrap_fields, ArtifactSource,
    LegacyFormat,
};
use crate::vector::{clamp_codes, is_safe_identifier, pack_u32, AnnEncoding, ClampStats, Quantization};

/// Reject ANN table and column names that are not plain identifiers.
pub fn check_ann_identifiers(config: &AnnConfig) -> Result<(), BuildError> {
    for (role, value) in [("table", &config.table), ("column", &config.column)] {
        if !is_safe_identifier(value) {
            return Err(BuildError::UnsafeIdentifier {
                role,
                value: value.clone(),
            });
        }
    }
    Ok(())
}

/// Writes rows into the ANN accelerator table for one build.
pub struct AnnWriter<'a> {
    extension: Option<&'a dyn VectorExtension>,
    status: AnnStatus,
    table: String,
    column: String,
    encoding: AnnEncoding,
    dims: Option<usize>,
    ready: bool,
    inserted: u64,
    skipped: u64,
}

impl<'a> AnnWriter<'a> {
    /// A writer that never writes.
    pub fn disabled() -> Self {
        Self {
            extension: None,
            status: AnnStatus::Disabled,
            table: String::new(),
            column: String::new(),
            encoding: AnnEncoding::default(),
            dims: None,
            ready: false,
            inserted: 0,
            skipped: 0,
        }
    }

    /// Validates identifiers even when the extension turned out to be
    /// unavailable, so a bad config never goes unnoticed.
    pub fn new(
        config: &AnnConfig,
        status: AnnStatus,
        extension: Option<&'a dyn VectorExtension>,
    ) -> Result<Self, BuildError> {
        if !config.enabled {
            return Ok(Self::disabled());
        }
        check_ann_identifiers(config)?;
        Ok(Self {
            extension,
            status,
            table: config.table.clone(),
            column: config.column.clone(),
            encoding: config.encoding,
            dims: None,
            ready: false,
            inserted: 0,
            skipped: 0,
        })
    }

    pub fn table(&self) -> Option<&str> {
        (!self.table.is_empty()).then_some(self.table.as_str())
    }

    pub fn is_live(&self) -> bool {
        self.ready
    }

    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    /// Create the ANN table for `dims`. Unavailability is reported once and
    /// disables population for the rest of the build.
    pub async fn prepare(
        &mut self,
        conn: &mut SqliteConnection,
        dims: usize,
        warnings: &mut WarningLog,
    ) -> Result<()> {
        if self.ready || self.dims.is_some() {
            return Ok(());
        }
        self.dims = Some(dims);
        let ext = match (&self.status, self.extension) {
            (AnnStatus::Disabled, _) => return Ok(()),
            (AnnStatus::Unavailable(reason), _) => {
                warnings.warn_once(
                    WarningKind::AnnUnavailable,
                    format!("ANN extension unavailable; dense vectors stored without ANN index: {}", reason),
                );
                return Ok(());
            }
            (AnnStatus::Available, None) => {
                warnings.warn_once(
                    WarningKind::AnnUnavailable,
                    "ANN extension unavailable; no extension registered for this build",
                );
                return Ok(());
            }
            (AnnStatus::Available, Some(ext)) => ext,
        };
        if crate::migrate::table_exists(conn, &self.table).await? {
            self.ready = true;
            return Ok(());
        }
        let ddl = ext.create_table_sql(&self.table, &self.column, dims, self.encoding);
        match sqlx::query(&ddl).execute(&mut *conn).await {
            Ok(_) => {
                self.ready = true;
                debug!(table = %self.table, dims, "ANN table ready");
            }
            Err(e) => {
                warnings.warn_once(
                    WarningKind::AnnUnavailable,
                    format!("ANN table {} could not be created: {}", self.table, e),
                );
            }
        }
        Ok(())
    }

    /// Insert one stored vector.
    pub async fn insert(
        &mut self,
        conn: &mut SqliteConnection,
        doc_id: i64,
        quant: &Quantization,
        codes: &[u8],
        warnings: &mut WarningLog,
    ) -> Result<()> {
        if !self.ready {
            return Ok(());
        }
        let dims = self.dims.unwrap_or(codes.len());
        let encoded = self.encoding.encode(quant, codes);
        let expected = self.encoding.expected_len(dims);
        if encoded.len() != expected {
            self.skipped += 1;
            warnings.warn_once(
                WarningKind::AnnEncodingMismatch,
                format!(
                    "ANN insert skipped for doc {}: encoded length {} != expected {} ({} dims, {})",
                    doc_id,
                    encoded.len(),
                    expected,
                    dims,
                    self.encoding.as_str()
                ),
            );
            return Ok(());
        }
        let sql = format!(
            "INSERT OR REPLACE INTO {}(rowid, {}) VALUES (?, ?)",
            self.table, self.column
        );
        sqlx::query(&sql)
            .bind(doc_id)
            .bind(encoded)
            .execute(&mut *conn)
            .await?;
        self.inserted += 1;
        Ok(())
    }
}

pub async fn write_dense_meta(
    conn: &mut SqliteConnection,
    mode: &str,
    dims: usize,
    quant: &Quantization,
    model: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO dense_meta (mode, dims, scale, model, min_val, max_val, levels)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(mode)
    .bind(dims as i64)
    .bind(f64::from(quant.scale()))
    .bind(model)
    .bind(f64::from(quant.min_val))
    .bind(f64::from(quant.max_val))
    .bind(i64::from(quant.levels))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Stored dense meta of a mode: `(dims, quantization, model)`.
pub async fn read_dense_meta(
    conn: &mut SqliteConnection,
    mode: &str,
) -> Result<Option<(usize, Quantization, Option<String>)>> {
    let row: Option<(Option<i64>, Option<f64>, Option<f64>, Option<i64>, Option<String>)> = sqlx::query_as(
        "SELECT dims, min_val, max_val, levels, model FROM dense_meta WHERE mode = ?",
    )
    .bind(mode)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(|(dims, min_val, max_val, levels, model)| {
        let defaults = Quantization::default();
        let quant = Quantization::new(
            min_val.map(|v| v as f32).unwrap_or(defaults.min_val),
            max_val.map(|v| v as f32).unwrap_or(defaults.max_val),
            levels.map(|l| l.clamp(2, 256) as u32).unwrap_or(defaults.levels),
        );
        (dims.unwrap_or(0).max(0) as usize, quant, model)
    }))
}

async fn insert_dense_rows(conn: &mut SqliteConnection, mode: &str, rows: &[(i64, Vec<u8>)]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new("INSERT OR REPLACE INTO dense_vectors (mode, doc_id, vector) ");
    qb.push_values(rows, |mut b, (doc_id, codes)| {
        b.push_bind(mode).push_bind(*doc_id).push_bind(codes.as_slice());
    });
    qb.build().execute(&mut *conn).await?;
    Ok(())
}

/// Streams vectors of one mode into `dense_vectors` (+ ANN).
pub struct DenseWriter<'a> {
    mode: String,
    quant: Quantization,
    model: Option<String>,
    dims: Option<usize>,
    meta_written: bool,
    clamps: ClampStats,
    pending: Vec<(i64, Vec<u8>)>,
    batch_size: usize,
    rows: u64,
    ann: AnnWriter<'a>,
}

impl<'a> DenseWriter<'a> {
    pub fn new(
        mode: &str,
        quant: Quantization,
        model: Option<String>,
        dims: Option<usize>,
        ann: AnnWriter<'a>,
        batch_size: usize,
    ) -> Self {
        Self {
            mode: mode.to_string(),
            quant,
            model,
            dims,
            meta_written: false,
            clamps: ClampStats::default(),
            pending: Vec::new(),
            batch_size: batch_size.max(1),
            rows: 0,
            ann,
        }
    }

    pub fn quantization(&self) -> &Quantization {
        &self.quant
    }

    pub fn clamps(&self) -> ClampStats {
        self.clamps
    }

    pub async fn push(
        &mut self,
        conn: &mut SqliteConnection,
        doc_id: i64,
        payload: VectorPayload,
        stats: &mut BuildStats,
        warnings: &mut WarningLog,
    ) -> Result<()> {
        let codes = match payload {
            VectorPayload::Float(values) => self.quant.quantize(&values, &mut self.clamps),
            VectorPayload::Quantized(codes) => codes,
            VectorPayload::Codes(values) => clamp_codes(&values, &mut self.clamps),
        };
        if !self.meta_written {
            let dims = *self.dims.get_or_insert(codes.len());
            write_dense_meta(conn, &self.mode, dims, &self.quant, self.model.as_deref()).await?;
            self.ann.prepare(conn, dims, warnings).await?;
            self.meta_written = true;
        }
        self.ann.insert(conn, doc_id, &self.quant, &codes, warnings).await?;
        self.pending.push((doc_id, codes));
        if self.pending.len() >= self.batch_size {
            insert_dense_rows(conn, &self.mode, &self.pending).await?;
            stats.record_batch("dense_vectors");
            self.rows += self.pending.len() as u64;
            self.pending.clear();
        }
        Ok(())
    }

    /// Flush, surface the clamp summary, and return rows written.
    pub async fn finish(
        mut self,
        conn: &mut SqliteConnection,
        stats: &mut BuildStats,
        warnings: &mut WarningLog,
    ) -> Result<u64> {
        if !self.pending.is_empty() {
            insert_dense_rows(conn, &self.mode, &self.pending).await?;
            stats.record_batch("dense_vectors");
            self.rows += self.pending.len() as u64;
            self.pending.clear();
        }
        if !self.clamps.is_empty() {
            warnings.set(
                WarningKind::VectorClamp,
                format!(
                    "Uint8 vector values clamped while building {}: {} value(s) across {} vector(s).",
                    self.mode, self.clamps.values, self.clamps.vectors
                ),
            );
        }
        if self.ann.is_live() {
            stats.record_table(&self.ann.table, self.ann.inserted(), std::time::Duration::ZERO);
        }
        Ok(self.rows)
    }
}

/// Ingest a dense vector input for `mode`. Quantization parameters and
/// model declared by the input win over config.
pub async fn ingest_dense_vectors(
    conn: &mut SqliteConnection,
    mode: &str,
    input: DenseInput,
    config: &VectorsConfig,
    ann: AnnWriter<'_>,
    batch_size: usize,
    stats: &mut BuildStats,
    warnings: &mut WarningLog,
) -> Result<u64> {
    let started = Instant::now();
    let quant = Quantization::new(
        input.min_val.unwrap_or(config.min_val),
        input.max_val.unwrap_or(config.max_val),
        input.levels.unwrap_or(config.levels),
    );
    if quant.is_degenerate() {
        anyhow::bail!(
            "dense vectors for mode {}: quantization range [{}, {}] is empty",
            mode,
            quant.min_val,
            quant.max_val
        );
    }
    let model = input.model.or_else(|| config.model.clone());
    let dims = input.dims.or(config.dims);
    let mut writer = DenseWriter::new(mode, quant, model, dims, ann, batch_size);

    let mut rows = input.vectors.into_rows();
    let mut index = 0i64;
    while let Some(row) = rows.next().await {
        let DenseRow { doc_id, vector } = row?;
        let doc_id = doc_id.unwrap_or(index);
        index += 1;
        if vector.is_empty() {
            continue;
        }
        writer.push(conn, doc_id, vector, stats, warnings).await?;
    }
    let written = writer.finish(conn, stats, warnings).await?;
    stats.record_table("dense_vectors", written, started.elapsed());
    Ok(written)
}

fn meta_f32(meta: &Value, keys: &[&str]) -> Option<f32> {
    keys.iter()
        .find_map(|k| meta.get(*k).and_then(Value::as_f64))
        .map(|f| f as f32)
}

fn meta_usize(meta: &Value, keys: &[&str]) -> Option<usize> {
    keys.iter()
        .find_map(|k| meta.get(*k).and_then(Value::as_u64))
        .map(|n| n as usize)
}

fn dense_header(meta: &Value, vectors: DenseVectors) -> DenseInput {
    DenseInput {
        model: meta.get("model").and_then(Value::as_str).map(str::to_string),
        dims: meta_usize(meta, &["dims", "dim"]),
        min_val: meta_f32(meta, &["minVal", "min_val"]),
        max_val: meta_f32(meta, &["maxVal", "max_val"]),
        levels: meta_usize(meta, &["levels"]).map(|l| l as u32),
        vectors,
    }
}

fn dense_row_from_value(value: Value, index: usize) -> Result<DenseRow> {
    match value {
        Value::Array(values) => Ok(DenseRow {
            doc_id: Some(index as i64),
            vector: VectorPayload::from_json(&values)?,
        }),
        Value::Object(obj) => {
            let doc_id = obj.get("docId").or_else(|| obj.get("doc_id")).and_then(Value::as_i64);
            let values = obj
                .get("vector")
                .or_else(|| obj.get("embedding"))
                .and_then(Value::as_array)
                .context("dense row has no vector")?;
            Ok(DenseRow {
                doc_id,
                vector: VectorPayload::from_json(values)?,
            })
        }
        _ => anyhow::bail!("dense row must be an array or object"),
    }
}

/// Dataset names probed for dense vectors of `mode`, in order.
pub fn dense_dataset_names(mode: &str) -> [&'static str; 2] {
    let alt = if mode == "code" {
        "dense_vectors_code_uint8"
    } else {
        "dense_vectors_doc_uint8"
    };
    ["dense_vectors_uint8", alt]
}

/// Load dense vectors for `mode` from `dir`.
pub fn load_dense_vectors(dir: &Path, mode: &str) -> Result<Option<DenseInput>> {
    for dataset in dense_dataset_names(mode) {
        let Some(source) = resolve_source(dir, dataset)? else {
            continue;
        };
        let input = match source {
            ArtifactSource::Single { path, format: crate::sources::ArtifactFormat::Json } => {
                let value = unwrap_fields(read_json(&path)?);
                let vectors = match value.get("vectors").or_else(|| value.get("rows")) {
                    Some(Value::Array(items)) => items
                        .iter()
                        .cloned()
                        .enumerate()
                        .map(|(i, v)| dense_row_from_value(v, i))
                        .collect::<Vec<_>>(),
                    _ => match &value {
                        Value::Array(items) => items
                            .iter()
                            .cloned()
                            .enumerate()
                            .map(|(i, v)| dense_row_from_value(v, i))
                            .collect(),
                        _ => anyhow::bail!("{}: no vectors array", path.display()),
                    },
                };
                dense_header(
                    &value,
                    DenseVectors::Stream(futures::stream::iter(vectors).boxed()),
                )
            }
            ArtifactSource::Legacy {
                path,
                format: LegacyFormat::Binary { meta },
            } => {
                let meta = unwrap_fields(read_json(&meta)?);
                let bytes = read_bytes(&path)?;
                let dims = meta_usize(&meta, &["dims", "dim"])
                    .with_context(|| format!("{}: binary dense meta has no dims", path.display()))?;
                let count = meta_usize(&meta, &["count", "length"]).unwrap_or(if dims == 0 {
                    0
                } else {
                    bytes.len() / dims
                });
                dense_header(&meta, DenseVectors::Buffer { bytes, dims, count })
            }
            ArtifactSource::Legacy { path, .. } => {
                debug!(dataset, path = %path.display(), "Unsupported dense layout");
                continue;
            }
            other => {
                let rows = row_stream::<Value>(other)?.into_stream();
                let mut index = 0usize;
                let rows = rows.map(move |r| {
                    let i = index;
                    index += 1;
                    r.and_then(|v| dense_row_from_value(v, i))
                });
                dense_header(&Value::Null, DenseVectors::Stream(rows.boxed()))
            }
        };
        return Ok(Some(input));
    }
    Ok(None)
}

async fn insert_minhash_rows(conn: &mut SqliteConnection, mode: &str, rows: &[(i64, Vec<u8>)]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new("INSERT OR REPLACE INTO minhash_signatures (mode, doc_id, sig) ");
    qb.push_values(rows, |mut b, (doc_id, sig)| {
        b.push_bind(mode).push_bind(*doc_id).push_bind(sig.as_slice());
    });
    qb.build().execute(&mut *conn).await?;
    Ok(())
}

/// Ingest MinHash signatures as packed little-endian `u32` blobs.
pub async fn ingest_minhash(
    conn: &mut SqliteConnection,
    mode: &str,
    source: RowSource<MinhashRow>,
    batch_size: usize,
    stats: &mut BuildStats,
) -> Result<u64> {
    let started = Instant::now();
    let batch_size = batch_size.max(1);
    let mut rows = source.into_stream();
    let mut pending = Vec::with_capacity(batch_size);
    let mut written = 0u64;
    while let Some(row) = rows.next().await {
        let row = row?;
        if row.signature.is_empty() {
            continue;
        }
        pending.push((row.doc_id, pack_u32(&row.signature)));
        if pending.len() >= batch_size {
            insert_minhash_rows(conn, mode, &pending).await?;
            stats.record_batch("minhash_signatures");
            written += pending.len() as u64;
            pending.clear();
        }
    }
    if !pending.is_empty() {
        insert_minhash_rows(conn, mode, &pending).await?;
        stats.record_batch("minhash_signatures");
        written += pending.len() as u64;
    }
    stats.record_table("minhash_signatures", written, started.elapsed());
    Ok(written)
}

fn minhash_from_signature_list(items: Vec<Value>) -> Result<Vec<MinhashRow>> {
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Array(_) => Ok(MinhashRow {
                doc_id: i as i64,
                signature: serde_json::from_value(item).context("Invalid minhash signature")?,
            }),
            other => serde_json::from_value(other).context("Invalid minhash row"),
        })
        .collect()
}

/// Load MinHash signatures from `dir`: a JSON `{signatures: [[..]]}` list
/// indexed by doc id, row objects `{docId, sig}`, or a packed
/// `minhash_signatures.packed.bin` with `{dims}` meta.
pub fn load_minhash(dir: &Path) -> Result<Option<RowSource<MinhashRow>>> {
    let Some(source) = resolve_source(dir, "minhash_signatures")? else {
        return Ok(None);
    };
    let rows = match source {
        ArtifactSource::Single {
            path,
            format: crate::sources::ArtifactFormat::Json,
        } => {
            let value = unwrap_fields(read_json(&path)?);
            let items = match value {
                Value::Array(items) => items,
                Value::Object(mut obj) => match obj.remove("signatures").or_else(|| obj.remove("rows")) {
                    Some(Value::Array(items)) => items,
                    _ => anyhow::bail!("{}: no signatures array", path.display()),
                },
                _ => anyhow::bail!("{}: unexpected minhash payload", path.display()),
            };
            RowSource::Items(minhash_from_signature_list(items)?)
        }
        ArtifactSource::Legacy {
            path,
            format: LegacyFormat::Packed { meta },
        } => {
            let meta = unwrap_fields(read_json(&meta)?);
            let dims = meta_usize(&meta, &["dims", "dim"])
                .filter(|d| *d > 0)
                .with_context(|| format!("{}: packed minhash meta has no dims", path.display()))?;
            let bytes = read_bytes(&path)?;
            let words = crate::vector::unpack_u32(&bytes);
            RowSource::Items(
                words
                    .chunks_exact(dims)
                    .enumerate()
                    .map(|(i, sig)| MinhashRow {
                        doc_id: i as i64,
                        signature: sig.to_vec(),
                    })
                    .collect(),
            )
        }
        ArtifactSource::Legacy { path, .. } => {
            anyhow::bail!("{} is not a minhash layout", path.display())
        }
        other => row_stream(other)?,
    };
    Ok(Some(rows))
}

/// Tables keyed by `(mode, doc_id)` that hold per-document rows.
const DOC_TABLES: &[(&str, &str)] = &[
    ("token_postings", "doc_id"),
    ("phrase_postings", "doc_id"),
    ("chargram_postings", "doc_id"),
    ("minhash_signatures", "doc_id"),
    ("dense_vectors", "doc_id"),
    ("doc_lengths", "doc_id"),
];

/// Delete every row owned by `doc_ids` in `mode`, including the FTS and
/// ANN rows.
pub async fn delete_doc_ids(
    conn: &mut SqliteConnection,
    mode: &str,
    doc_ids: &[i64],
    ann_table: Option<&str>,
) -> Result<()> {
    if let Some(table) = ann_table {
        if !is_safe_identifier(table) {
            return Err(BuildError::UnsafeIdentifier {
                role: "table",
                value: table.to_string(),
            }
            .into());
        }
    }
    for chunk in doc_ids.chunks(400) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM chunks WHERE mode = ");
        qb.push_bind(mode).push(" AND id IN (");
        push_ids(&mut qb, chunk);
        qb.build().execute(&mut *conn).await?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM chunks_fts WHERE rowid IN (");
        push_ids(&mut qb, chunk);
        qb.build().execute(&mut *conn).await?;

        for (table, column) in DOC_TABLES {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("DELETE FROM {} WHERE mode = ", table));
            qb.push_bind(mode).push(format!(" AND {} IN (", column));
            push_ids(&mut qb, chunk);
            qb.build().execute(&mut *conn).await?;
        }

        if let Some(table) = ann_table {
            if crate::migrate::table_exists(conn, table).await? {
                let mut qb: QueryBuilder<Sqlite> =
                    QueryBuilder::new(format!("DELETE FROM {} WHERE rowid IN (", table));
                push_ids(&mut qb, chunk);
                qb.build().execute(&mut *conn).await?;
            }
        }
    }
    Ok(())
}

fn push_ids(qb: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}
