//! Core data models for index artifacts.
//!
//! These types mirror the JSON records written by the upstream analysis
//! pipeline. Field names follow the artifact format (`camelCase`, with a few
//! legacy `snake_case` provenance fields), so every struct here
//! deserializes straight from an artifact row.

use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::Value;

/// One indexed unit of content.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub chunk_id: Option<String>,
    #[serde(default)]
    pub file_id: Option<i64>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub segment: Option<String>,
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
    #[serde(default)]
    pub start_line: Option<i64>,
    #[serde(default)]
    pub end_line: Option<i64>,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub doc: Option<String>,
    #[serde(default)]
    pub headline: Option<String>,
    #[serde(default)]
    pub pre_context: Option<Value>,
    #[serde(default)]
    pub post_context: Option<Value>,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default)]
    pub ngrams: Option<Value>,
    #[serde(default)]
    pub code_relations: Option<Value>,
    #[serde(default)]
    pub docmeta: Option<Value>,
    #[serde(default)]
    pub stats: Option<Value>,
    #[serde(default)]
    pub complexity: Option<Value>,
    #[serde(default)]
    pub lint: Option<Value>,
    #[serde(default)]
    pub external_docs: Option<Value>,
    #[serde(default)]
    pub meta_v2: Option<Value>,
    #[serde(default, rename = "last_modified")]
    pub last_modified: Option<String>,
    #[serde(default, rename = "last_author")]
    pub last_author: Option<String>,
    #[serde(default)]
    pub churn: Option<f64>,
    #[serde(default, rename = "churn_added")]
    pub churn_added: Option<i64>,
    #[serde(default, rename = "churn_deleted")]
    pub churn_deleted: Option<i64>,
    #[serde(default, rename = "churn_commits")]
    pub churn_commits: Option<i64>,
    #[serde(default, rename = "chunk_authors", alias = "chunkAuthors")]
    pub chunk_authors: Option<Value>,
}

impl ChunkRecord {
    /// Doc comment text: the explicit `doc` field, else `docmeta.doc`.
    pub fn doc_text(&self) -> Option<String> {
        if let Some(doc) = &self.doc {
            return Some(doc.clone());
        }
        self.docmeta
            .as_ref()
            .and_then(|m| m.get("doc"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Signature text: the explicit field, else `docmeta.signature`.
    pub fn signature_text(&self) -> Option<String> {
        if let Some(sig) = &self.signature {
            return Some(sig.clone());
        }
        self.docmeta
            .as_ref()
            .and_then(|m| m.get("signature"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Phrase n-grams when `ngrams` is a list of strings.
    pub fn ngram_terms(&self) -> Vec<String> {
        match &self.ngrams {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Per-file attributes, folded into chunk rows at merge time.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetaRecord {
    #[serde(default)]
    pub id: Option<i64>,
    pub file: String,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default, alias = "hash_algo")]
    pub hash_algo: Option<String>,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub encoding_fallback: Option<bool>,
    #[serde(default)]
    pub encoding_confidence: Option<f64>,
    #[serde(default)]
    pub external_docs: Option<Value>,
    #[serde(default, rename = "last_modified")]
    pub last_modified: Option<String>,
    #[serde(default, rename = "last_author")]
    pub last_author: Option<String>,
    #[serde(default)]
    pub churn: Option<f64>,
    #[serde(default, rename = "churn_added")]
    pub churn_added: Option<i64>,
    #[serde(default, rename = "churn_deleted")]
    pub churn_deleted: Option<i64>,
    #[serde(default, rename = "churn_commits")]
    pub churn_commits: Option<i64>,
}

/// A MinHash signature for one document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinhashRow {
    pub doc_id: i64,
    #[serde(alias = "sig")]
    pub signature: Vec<u32>,
}

/// Payload of one dense vector row.
#[derive(Debug, Clone, PartialEq)]
pub enum VectorPayload {
    /// Raw model output, quantized on ingest.
    Float(Vec<f32>),
    /// Already-quantized codes, stored as-is.
    Quantized(Vec<u8>),
    /// Integer codes from a JSON artifact, clamped into `0..=255` on ingest.
    Codes(Vec<i64>),
}

impl VectorPayload {
    /// Parse a JSON number array: all-integer arrays are codes, anything
    /// else must be floats.
    pub fn from_json(values: &[Value]) -> anyhow::Result<Self> {
        if values.iter().all(|v| v.is_i64() || v.is_u64()) {
            return Ok(VectorPayload::Codes(
                values
                    .iter()
                    .map(|v| v.as_i64().unwrap_or(i64::MAX))
                    .collect(),
            ));
        }
        let floats = values
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Option<Vec<f32>>>()
            .ok_or_else(|| anyhow::anyhow!("vector contains a non-numeric value"))?;
        Ok(VectorPayload::Float(floats))
    }

    pub fn len(&self) -> usize {
        match self {
            VectorPayload::Float(v) => v.len(),
            VectorPayload::Quantized(v) => v.len(),
            VectorPayload::Codes(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One dense vector; `doc_id` defaults to the row's position.
#[derive(Debug, Clone)]
pub struct DenseRow {
    pub doc_id: Option<i64>,
    pub vector: VectorPayload,
}

/// Dense vector input in one of the accepted shapes.
pub enum DenseVectors {
    /// Fixed-width float vectors, doc id = index.
    Float(Vec<Vec<f32>>),
    /// Already-quantized code vectors, doc id = index.
    Quantized(Vec<Vec<u8>>),
    /// Flat byte buffer of `count` rows of `dims` codes.
    Buffer {
        bytes: Vec<u8>,
        dims: usize,
        count: usize,
    },
    /// Lazy rows.
    Stream(BoxStream<'static, anyhow::Result<DenseRow>>),
}

impl DenseVectors {
    /// Flatten every shape into one row stream.
    pub fn into_rows(self) -> BoxStream<'static, anyhow::Result<DenseRow>> {
        match self {
            DenseVectors::Float(vectors) => stream::iter(vectors.into_iter().enumerate().map(
                |(i, v)| {
                    Ok(DenseRow {
                        doc_id: Some(i as i64),
                        vector: VectorPayload::Float(v),
                    })
                },
            ))
            .boxed(),
            DenseVectors::Quantized(vectors) => stream::iter(
                vectors.into_iter().enumerate().map(|(i, v)| {
                    Ok(DenseRow {
                        doc_id: Some(i as i64),
                        vector: VectorPayload::Quantized(v),
                    })
                }),
            )
            .boxed(),
            DenseVectors::Buffer { bytes, dims, count } => {
                let rows: Vec<anyhow::Result<DenseRow>> = if dims == 0 {
                    Vec::new()
                } else {
                    bytes
                        .chunks_exact(dims)
                        .take(count)
                        .enumerate()
                        .map(|(i, c)| {
                            Ok(DenseRow {
                                doc_id: Some(i as i64),
                                vector: VectorPayload::Quantized(c.to_vec()),
                            })
                        })
                        .collect()
                };
                stream::iter(rows).boxed()
            }
            DenseVectors::Stream(s) => s,
        }
    }
}

/// Dense vectors plus the metadata needed to store them.
pub struct DenseInput {
    pub model: Option<String>,
    pub dims: Option<usize>,
    /// Quantization range declared by the artifact; falls back to config.
    pub min_val: Option<f32>,
    pub max_val: Option<f32>,
    pub levels: Option<u32>,
    pub vectors: DenseVectors,
}

/// A row source that is either already in memory or produced lazily.
///
/// In-memory rows are drained synchronously; streamed rows suspend only
/// while waiting for the next element.
pub enum RowSource<T> {
    Items(Vec<T>),
    Stream(BoxStream<'static, anyhow::Result<T>>),
}

impl<T: Send + 'static> RowSource<T> {
    pub fn into_stream(self) -> BoxStream<'static, anyhow::Result<T>> {
        match self {
            RowSource::Items(items) => stream::iter(items.into_iter().map(Ok)).boxed(),
            RowSource::Stream(s) => s,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self, RowSource::Items(_))
    }
}

impl<T> From<Vec<T>> for RowSource<T> {
    fn from(items: Vec<T>) -> Self {
        RowSource::Items(items)
    }
}
