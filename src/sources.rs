//! Artifact source resolution.
//!
//! One logical dataset (`chunk_meta`, `file_meta`, `token_postings`, ...)
//! can sit on disk in several physical layouts. [`resolve_source`] probes a
//! directory once and returns an [`ArtifactSource`] naming the readable
//! parts in order; [`row_stream`] turns any row-shaped source into a lazy
//! stream so ingestors never branch on layout.
//!
//! | Layout | Files |
//! |--------|-------|
//! | Sharded (explicit) | `<name>.meta.json` listing parts under `<name>.parts/` or `<name>.shards/` |
//! | Sharded (implicit) | `<name>.parts/` scanned and sorted by file name |
//! | Columnar | `<name>.columnar.json` |
//! | Single | `<name>.jsonl` or `<name>.json` |
//! | Legacy | `<name>.packed.bin` + `<name>.packed.meta.json`, or `<name>.bin` + `<name>.bin.meta.json` |
//! | Legacy manifest | `pieces/manifest.json` entry naming any of the above |
//!
//! Every JSON or JSONL file may also be gzip-compressed (`.gz`).
//!
//! A meta file that names parts which are not on disk is a hard error
//! ([`BuildError::MissingParts`]), never a silent skip.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::BuildError;
use crate::models::RowSource;

/// Physical encoding of a row-bearing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    Json,
    Jsonl,
}

impl ArtifactFormat {
    fn from_path(path: &Path) -> Self {
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        if name.contains(".jsonl") {
            ArtifactFormat::Jsonl
        } else {
            ArtifactFormat::Json
        }
    }
}

/// Pre-columnar binary layouts kept for old index directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyFormat {
    /// Varint-packed posting lists with a meta file and an offsets table.
    Packed { meta: PathBuf },
    /// Flat row-major byte buffer described by a meta file.
    Binary { meta: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    Single {
        path: PathBuf,
        format: ArtifactFormat,
    },
    Sharded {
        meta: Option<PathBuf>,
        parts: Vec<PathBuf>,
    },
    Columnar {
        path: PathBuf,
    },
    Legacy {
        path: PathBuf,
        format: LegacyFormat,
    },
}

impl ArtifactSource {
    /// Short tag for logs and stats.
    pub fn kind(&self) -> &'static str {
        match self {
            ArtifactSource::Single {
                format: ArtifactFormat::Json,
                ..
            } => "json",
            ArtifactSource::Single {
                format: ArtifactFormat::Jsonl,
                ..
            } => "jsonl",
            ArtifactSource::Sharded { .. } => "sharded",
            ArtifactSource::Columnar { .. } => "columnar",
            ArtifactSource::Legacy {
                format: LegacyFormat::Packed { .. },
                ..
            } => "packed",
            ArtifactSource::Legacy {
                format: LegacyFormat::Binary { .. },
                ..
            } => "binary",
        }
    }
}

/// Open `path` for reading, transparently gunzipping `.gz` files.
pub fn open_reader(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let is_gz = path.extension().is_some_and(|e| e == "gz");
    if is_gz {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

pub fn read_json(path: &Path) -> Result<Value> {
    let reader = open_reader(path)?;
    serde_json::from_reader(reader).with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    open_reader(path)?
        .read_to_end(&mut buf)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(buf)
}

/// Merge `fields` and `arrays` sub-objects into the top level, so wrapped
/// and flat artifact payloads look the same.
pub fn unwrap_fields(value: Value) -> Value {
    let Value::Object(mut obj) = value else {
        return value;
    };
    for wrapper in ["fields", "arrays"] {
        if let Some(Value::Object(inner)) = obj.remove(wrapper) {
            for (k, v) in inner {
                obj.entry(k).or_insert(v);
            }
        }
    }
    Value::Object(obj)
}

/// `dir/<base>` or `dir/<base>.gz`, whichever exists first.
pub fn find_artifact(dir: &Path, base: &str) -> Option<PathBuf> {
    let plain = dir.join(base);
    if plain.is_file() {
        return Some(plain);
    }
    let gz = dir.join(format!("{}.gz", base));
    gz.is_file().then_some(gz)
}

const PART_DIR_SUFFIXES: &[&str] = &["parts", "shards"];

fn part_dir(dir: &Path, dataset: &str) -> Option<PathBuf> {
    PART_DIR_SUFFIXES
        .iter()
        .map(|s| dir.join(format!("{}.{}", dataset, s)))
        .find(|p| p.is_dir())
}

/// Sorted files of a shard directory.
fn scan_part_dir(part_dir: &Path) -> Vec<PathBuf> {
    let mut parts: Vec<PathBuf> = WalkDir::new(part_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    parts.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    parts
}

/// Part names listed by a meta file, as strings or `{path}` objects.
pub fn meta_part_names(meta: &Value) -> Vec<String> {
    let Some(Value::Array(parts)) = meta.get("parts") else {
        return Vec::new();
    };
    parts
        .iter()
        .filter_map(|p| match p {
            Value::String(s) => Some(s.clone()),
            Value::Object(o) => o
                .get("path")
                .or_else(|| o.get("file"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        })
        .collect()
}

fn resolve_sharded(dir: &Path, dataset: &str, meta_path: &Path) -> Result<ArtifactSource> {
    let meta = unwrap_fields(read_json(meta_path)?);
    let names = meta_part_names(&meta);
    let shard_dir = part_dir(dir, dataset);

    let parts = if names.is_empty() {
        shard_dir.as_deref().map(scan_part_dir).unwrap_or_default()
    } else {
        let mut parts = Vec::with_capacity(names.len());
        let mut missing = Vec::new();
        for name in names {
            let direct = dir.join(&name);
            let nested = shard_dir.as_ref().map(|d| d.join(&name));
            if direct.is_file() {
                parts.push(direct);
            } else if let Some(nested) = nested.filter(|p| p.is_file()) {
                parts.push(nested);
            } else {
                missing.push(name);
            }
        }
        if !missing.is_empty() {
            return Err(BuildError::MissingParts {
                dataset: dataset.to_string(),
                missing,
            }
            .into());
        }
        parts
    };

    if parts.is_empty() {
        return Err(BuildError::MissingParts {
            dataset: dataset.to_string(),
            missing: vec![format!("{}.parts/*", dataset)],
        }
        .into());
    }

    Ok(ArtifactSource::Sharded {
        meta: Some(meta_path.to_path_buf()),
        parts,
    })
}

/// Entry of a legacy `pieces/manifest.json`.
#[derive(Debug, Deserialize)]
struct PieceEntry {
    name: String,
    path: String,
    #[serde(default)]
    format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PieceManifest {
    #[serde(default)]
    pieces: Vec<PieceEntry>,
}

fn resolve_from_pieces(dir: &Path, dataset: &str) -> Result<Option<ArtifactSource>> {
    let manifest_path = dir.join("pieces").join("manifest.json");
    if !manifest_path.is_file() {
        return Ok(None);
    }
    let manifest: PieceManifest = serde_json::from_value(read_json(&manifest_path)?)
        .with_context(|| format!("Invalid piece manifest {}", manifest_path.display()))?;
    let Some(entry) = manifest.pieces.into_iter().find(|p| p.name == dataset) else {
        return Ok(None);
    };
    let path = dir.join(&entry.path);
    let source = match entry.format.as_deref().unwrap_or("json") {
        "jsonl" => ArtifactSource::Single {
            path,
            format: ArtifactFormat::Jsonl,
        },
        "columnar" => ArtifactSource::Columnar { path },
        "packed" => ArtifactSource::Legacy {
            format: LegacyFormat::Packed {
                meta: sibling_meta(&path),
            },
            path,
        },
        "sharded" => {
            // The piece path names the meta file.
            let meta_dir = path.parent().unwrap_or(dir).to_path_buf();
            resolve_sharded(&meta_dir, dataset, &path)?
        }
        _ => ArtifactSource::Single {
            path,
            format: ArtifactFormat::Json,
        },
    };
    Ok(Some(source))
}

/// `x.bin` → `x.meta.json`, `x.packed.bin` → `x.packed.meta.json`.
fn sibling_meta(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let stem = name.strip_suffix(".bin").unwrap_or(&name);
    path.with_file_name(format!("{}.meta.json", stem))
}

/// Probe `dir` for `dataset`. `Ok(None)` means no layout is present.
pub fn resolve_source(dir: &Path, dataset: &str) -> Result<Option<ArtifactSource>> {
    if let Some(meta) = find_artifact(dir, &format!("{}.meta.json", dataset)) {
        return resolve_sharded(dir, dataset, &meta).map(Some);
    }

    if let Some(shards) = part_dir(dir, dataset) {
        let parts = scan_part_dir(&shards);
        if !parts.is_empty() {
            return Ok(Some(ArtifactSource::Sharded { meta: None, parts }));
        }
    }

    if let Some(path) = find_artifact(dir, &format!("{}.columnar.json", dataset)) {
        return Ok(Some(ArtifactSource::Columnar { path }));
    }

    if let Some(path) = find_artifact(dir, &format!("{}.jsonl", dataset)) {
        return Ok(Some(ArtifactSource::Single {
            path,
            format: ArtifactFormat::Jsonl,
        }));
    }

    if let Some(path) = find_artifact(dir, &format!("{}.json", dataset)) {
        return Ok(Some(ArtifactSource::Single {
            path,
            format: ArtifactFormat::Json,
        }));
    }

    let packed = dir.join(format!("{}.packed.bin", dataset));
    let packed_meta = dir.join(format!("{}.packed.meta.json", dataset));
    if packed.is_file() && packed_meta.is_file() {
        return Ok(Some(ArtifactSource::Legacy {
            path: packed,
            format: LegacyFormat::Packed { meta: packed_meta },
        }));
    }

    let binary = dir.join(format!("{}.bin", dataset));
    let binary_meta = dir.join(format!("{}.bin.meta.json", dataset));
    if binary.is_file() && binary_meta.is_file() {
        return Ok(Some(ArtifactSource::Legacy {
            path: binary,
            format: LegacyFormat::Binary { meta: binary_meta },
        }));
    }

    resolve_from_pieces(dir, dataset)
}

/// Row-count hint for batch sizing, when the layout records one cheaply.
pub fn row_count_hint(source: &ArtifactSource) -> Option<u64> {
    let meta_path = match source {
        ArtifactSource::Sharded { meta: Some(meta), .. } => meta,
        _ => return None,
    };
    let meta = unwrap_fields(read_json(meta_path).ok()?);
    ["totalRecords", "totalRows", "count", "length"]
        .iter()
        .find_map(|k| meta.get(*k).and_then(Value::as_u64))
}

/// Total size of every file under `dir`.
pub fn directory_bytes(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

type RowIter = Box<dyn Iterator<Item = Result<Value>> + Send>;

/// Lazily reads one JSON value per non-blank line.
struct JsonLines {
    reader: Box<dyn BufRead + Send>,
    path: PathBuf,
    line_no: usize,
    buf: String,
}

impl Iterator for JsonLines {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            self.line_no += 1;
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {
                    let line = self.buf.trim();
                    if line.is_empty() {
                        continue;
                    }
                    return Some(serde_json::from_str(line).with_context(|| {
                        format!("{}:{}: invalid JSON line", self.path.display(), self.line_no)
                    }));
                }
                Err(e) => {
                    return Some(Err(anyhow::Error::new(e)
                        .context(format!("Failed to read {}", self.path.display()))))
                }
            }
        }
    }
}

/// Expands a columnar payload into row objects one index at a time.
///
/// ```json
/// {"columns": ["id", "file"],
///  "arrays": {"id": [0, 1], "file": [0, 0]},
///  "tables": {"file": ["src/a.rs"]},
///  "length": 2}
/// ```
///
/// A column with a dictionary table stores integer codes; each code is
/// resolved through the table as the row is built.
pub struct ColumnarRows {
    columns: Vec<String>,
    arrays: Map<String, Value>,
    tables: Map<String, Value>,
    index: usize,
    length: usize,
}

impl ColumnarRows {
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut obj) = value else {
            anyhow::bail!("columnar payload must be an object");
        };
        let arrays = match obj.remove("arrays") {
            Some(Value::Object(a)) => a,
            _ => anyhow::bail!("columnar payload has no arrays"),
        };
        let tables = match obj.remove("tables") {
            Some(Value::Object(t)) => t,
            _ => Map::new(),
        };
        let columns: Vec<String> = match obj.get("columns") {
            Some(Value::Array(cols)) => cols
                .iter()
                .filter_map(|c| c.as_str().map(str::to_string))
                .collect(),
            _ => arrays.keys().cloned().collect(),
        };
        let length = obj
            .get("length")
            .and_then(Value::as_u64)
            .map(|l| l as usize)
            .unwrap_or_else(|| {
                columns
                    .iter()
                    .filter_map(|c| arrays.get(c).and_then(Value::as_array))
                    .map(Vec::len)
                    .max()
                    .unwrap_or(0)
            });
        Ok(Self {
            columns,
            arrays,
            tables,
            index: 0,
            length,
        })
    }

    pub fn is_columnar(value: &Value) -> bool {
        value.get("arrays").is_some_and(Value::is_object)
            && (value.get("columns").is_some() || value.get("format").and_then(Value::as_str) == Some("columnar"))
    }

    fn cell(&self, column: &str, index: usize) -> Value {
        let raw = self
            .arrays
            .get(column)
            .and_then(|a| a.get(index))
            .cloned()
            .unwrap_or(Value::Null);
        match (self.tables.get(column), raw.as_u64()) {
            (Some(Value::Array(table)), Some(code)) => {
                table.get(code as usize).cloned().unwrap_or(Value::Null)
            }
            _ => raw,
        }
    }
}

impl Iterator for ColumnarRows {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.length {
            return None;
        }
        let i = self.index;
        self.index += 1;
        let mut row = Map::with_capacity(self.columns.len());
        for column in &self.columns {
            let cell = self.cell(column, i);
            if !cell.is_null() {
                row.insert(column.clone(), cell);
            }
        }
        Some(Ok(Value::Object(row)))
    }
}

/// Rows of a parsed JSON document: an array, a columnar object, or an
/// object wrapping a `rows` / `chunks` / `entries` array.
fn rows_of_json(value: Value, path: &Path) -> Result<RowIter> {
    if ColumnarRows::is_columnar(&value) {
        return Ok(Box::new(ColumnarRows::from_value(value)?));
    }
    let value = unwrap_fields(value);
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => ["rows", "chunks", "entries", "files"]
            .iter()
            .find_map(|k| match obj.remove(*k) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .with_context(|| format!("{}: no row array found", path.display()))?,
        _ => anyhow::bail!("{}: expected a JSON array of rows", path.display()),
    };
    Ok(Box::new(items.into_iter().map(Ok)))
}

fn rows_of_file(path: &Path, format: ArtifactFormat) -> Result<RowIter> {
    match format {
        ArtifactFormat::Jsonl => Ok(Box::new(JsonLines {
            reader: open_reader(path)?,
            path: path.to_path_buf(),
            line_no: 0,
            buf: String::new(),
        })),
        ArtifactFormat::Json => rows_of_json(read_json(path)?, path),
    }
}

/// Lazy row stream over any row-shaped source.
///
/// Files are opened one at a time as the stream advances; a shard that
/// fails to open yields an error in its place.
pub fn row_stream<T>(source: ArtifactSource) -> Result<RowSource<T>>
where
    T: DeserializeOwned + Send + 'static,
{
    let values: RowIter = match source {
        ArtifactSource::Single { path, format } => rows_of_file(&path, format)?,
        ArtifactSource::Columnar { path } => Box::new(ColumnarRows::from_value(read_json(&path)?)?),
        ArtifactSource::Sharded { parts, .. } => Box::new(parts.into_iter().flat_map(|part| {
            let format = ArtifactFormat::from_path(&part);
            match rows_of_file(&part, format) {
                Ok(rows) => rows,
                Err(e) => Box::new(std::iter::once(Err(e))) as RowIter,
            }
        })),
        ArtifactSource::Legacy { path, .. } => {
            anyhow::bail!("{} is not a row-shaped artifact", path.display())
        }
    };
    let rows = values.map(|v| {
        v.and_then(|value| serde_json::from_value::<T>(value).context("Invalid artifact row"))
    });
    Ok(RowSource::Stream(stream::iter(rows).boxed()))
}

/// Resolve and stream `dataset` from `dir`, if present.
pub fn load_rows<T>(dir: &Path, dataset: &str) -> Result<Option<RowSource<T>>>
where
    T: DeserializeOwned + Send + 'static,
{
    match resolve_source(dir, dataset)? {
        Some(source) => row_stream(source).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkRecord;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use futures::TryStreamExt;
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;

    async fn collect(source: RowSource<ChunkRecord>) -> Vec<ChunkRecord> {
        source.into_stream().try_collect().await.unwrap()
    }

    #[tokio::test]
    async fn test_single_json_array() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("chunk_meta.json"),
            json!([{"id": 0, "file": "a.rs"}, {"id": 1, "file": "b.rs"}]).to_string(),
        )
        .unwrap();
        let source = resolve_source(tmp.path(), "chunk_meta").unwrap().unwrap();
        assert_eq!(source.kind(), "json");
        let rows = collect(row_stream(source).unwrap()).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].file.as_deref(), Some("b.rs"));
    }

    #[tokio::test]
    async fn test_gzipped_jsonl() {
        let tmp = TempDir::new().unwrap();
        let file = File::create(tmp.path().join("chunk_meta.jsonl.gz")).unwrap();
        let mut gz = GzEncoder::new(file, Compression::default());
        writeln!(gz, "{}", json!({"id": 0, "file": "a.rs"})).unwrap();
        writeln!(gz).unwrap();
        writeln!(gz, "{}", json!({"id": 1, "file": "b.rs"})).unwrap();
        gz.finish().unwrap();

        let source = resolve_source(tmp.path(), "chunk_meta").unwrap().unwrap();
        assert_eq!(source.kind(), "jsonl");
        let rows = collect(row_stream(source).unwrap()).await;
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_meta_parts_in_declared_order() {
        let tmp = TempDir::new().unwrap();
        let parts = tmp.path().join("chunk_meta.parts");
        std::fs::create_dir_all(&parts).unwrap();
        std::fs::write(parts.join("b.jsonl"), "{\"id\": 0, \"file\": \"first.rs\"}\n").unwrap();
        std::fs::write(parts.join("a.jsonl"), "{\"id\": 1, \"file\": \"second.rs\"}\n").unwrap();
        std::fs::write(
            tmp.path().join("chunk_meta.meta.json"),
            json!({"fields": {"parts": ["chunk_meta.parts/b.jsonl", "chunk_meta.parts/a.jsonl"]}})
                .to_string(),
        )
        .unwrap();

        let source = resolve_source(tmp.path(), "chunk_meta").unwrap().unwrap();
        let rows = collect(row_stream(source).unwrap()).await;
        let files: Vec<_> = rows.iter().map(|r| r.file.clone().unwrap()).collect();
        assert_eq!(files, vec!["first.rs", "second.rs"]);
    }

    #[test]
    fn test_missing_declared_part_is_an_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("chunk_meta.parts")).unwrap();
        std::fs::write(
            tmp.path().join("chunk_meta.meta.json"),
            json!({"parts": ["chunk_meta.parts/gone.jsonl"]}).to_string(),
        )
        .unwrap();
        let err = resolve_source(tmp.path(), "chunk_meta").unwrap_err();
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::MissingParts { missing, .. }) => {
                assert_eq!(missing, &vec!["chunk_meta.parts/gone.jsonl".to_string()])
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_implicit_shards_sorted_by_name() {
        let tmp = TempDir::new().unwrap();
        let parts = tmp.path().join("chunk_meta.parts");
        std::fs::create_dir_all(&parts).unwrap();
        std::fs::write(parts.join("part-00001.jsonl"), "{\"id\": 1}\n").unwrap();
        std::fs::write(parts.join("part-00000.jsonl"), "{\"id\": 0}\n").unwrap();
        let source = resolve_source(tmp.path(), "chunk_meta").unwrap().unwrap();
        let rows = collect(row_stream(source).unwrap()).await;
        assert_eq!(rows.iter().map(|r| r.id.unwrap()).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_columnar_resolves_dictionary_codes() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("chunk_meta.columnar.json"),
            json!({
                "columns": ["id", "file", "kind"],
                "arrays": {"id": [0, 1, 2], "file": [1, 0, 1], "kind": ["fn", null, "struct"]},
                "tables": {"file": ["src/a.rs", "src/b.rs"]},
                "length": 3
            })
            .to_string(),
        )
        .unwrap();
        let source = resolve_source(tmp.path(), "chunk_meta").unwrap().unwrap();
        assert_eq!(source.kind(), "columnar");
        let rows = collect(row_stream(source).unwrap()).await;
        assert_eq!(rows[0].file.as_deref(), Some("src/b.rs"));
        assert_eq!(rows[1].file.as_deref(), Some("src/a.rs"));
        assert_eq!(rows[1].kind, None);
        assert_eq!(rows[2].kind.as_deref(), Some("struct"));
    }

    #[test]
    fn test_legacy_piece_manifest() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("pieces")).unwrap();
        std::fs::write(
            tmp.path().join("pieces/manifest.json"),
            json!({"pieces": [{"name": "token_postings", "path": "legacy/postings.json", "format": "json"}]})
                .to_string(),
        )
        .unwrap();
        let source = resolve_source(tmp.path(), "token_postings").unwrap().unwrap();
        assert_eq!(
            source,
            ArtifactSource::Single {
                path: tmp.path().join("legacy/postings.json"),
                format: ArtifactFormat::Json
            }
        );
        assert!(resolve_source(tmp.path(), "phrase_ngrams").unwrap().is_none());
    }

    #[test]
    fn test_unwrap_fields_keeps_top_level_precedence() {
        let v = unwrap_fields(json!({"vocab": ["a"], "fields": {"vocab": ["b"], "avgDocLen": 2.0}}));
        assert_eq!(v["vocab"], json!(["a"]));
        assert_eq!(v["avgDocLen"], json!(2.0));
    }
}
