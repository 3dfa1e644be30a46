use serde_json::{json, Value};
use sqlx::{Connection, SqliteConnection};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use index_sqlite::build::{build_database, build_from_index_dir, BuildInputs, BuildOptions, BuildState};
use index_sqlite::config::{Config, ValidateMode};
use index_sqlite::db;
use index_sqlite::error::BuildError;
use index_sqlite::extension::VectorExtension;
use index_sqlite::migrate;
use index_sqlite::models::{ChunkRecord, DenseInput, DenseVectors};
use index_sqlite::vector::AnnEncoding;
use index_sqlite::vocab::{ensure_vocab_ids, GrowthLimits, VocabKind};

fn write_json(dir: &Path, name: &str, value: Value) {
    fs::write(dir.join(name), serde_json::to_vec_pretty(&value).unwrap()).unwrap();
}

fn test_config(out: &Path) -> Config {
    let mut config = Config::minimal(out);
    config.build.validate = ValidateMode::Full;
    config
}

/// An artifact directory with every dataset present.
fn setup_index_dir(root: &Path) -> PathBuf {
    let dir = root.join("index-code");
    fs::create_dir_all(&dir).unwrap();

    write_json(
        &dir,
        "chunk_meta.json",
        json!([
            {"id": 0, "fileId": 0, "start": 0, "end": 40, "name": "main", "kind": "function", "tokens": ["fn", "main"]},
            {"id": 1, "fileId": 0, "start": 41, "end": 90, "name": "helper", "tokens": ["fn", "helper"]},
            {"id": 2, "fileId": 1, "start": 0, "end": 12, "tokens": ["util"]}
        ]),
    );
    write_json(
        &dir,
        "file_meta.json",
        json!([
            {"id": 0, "file": "src/main.rs", "ext": ".rs", "hash": "h-main", "size": 90, "last_author": "ann"},
            {"id": 1, "file": "src/util.rs", "ext": ".rs", "hash": "h-util", "size": 12}
        ]),
    );
    write_json(
        &dir,
        "token_postings.json",
        json!({
            "vocab": ["fn", "main", "helper", "util"],
            "postings": [[[0, 1], [1, 1]], [[0, 1]], [[1, 1]], [[2, 1]]],
            "docLengths": [2, 2, 1]
        }),
    );
    write_json(
        &dir,
        "phrase_ngrams.json",
        json!({"vocab": ["fn main", "fn helper"], "postings": [[0], [1]]}),
    );
    write_json(
        &dir,
        "chargram_postings.json",
        json!({"vocab": ["fn_", "mai"], "postings": [[0, 1], [0]]}),
    );
    write_json(
        &dir,
        "minhash_signatures.json",
        json!({"signatures": [[1, 2, 3], [4, 5, 6], [7, 8, 9]]}),
    );
    write_json(
        &dir,
        "dense_vectors_uint8.json",
        json!({"dims": 2, "model": "test-model", "vectors": [[0, 255], [128, 128], [10, 20]]}),
    );
    dir
}

async fn scalar_i64(conn: &mut SqliteConnection, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(&mut *conn).await.unwrap()
}

fn tmp_leftovers(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
        .count()
}

#[tokio::test]
async fn test_full_build_from_index_dir() {
    let tmp = TempDir::new().unwrap();
    let dir = setup_index_dir(tmp.path());
    let out = tmp.path().join("index-code.db");

    let report = build_from_index_dir(&test_config(&out), &dir, None, None).await.unwrap();
    assert_eq!(report.state, BuildState::Promoted);
    assert_eq!(report.chunks, 3);
    assert_eq!(report.minhash, 3);
    assert_eq!(report.dense_vectors, 3);
    assert_eq!(report.stats.token_source.as_deref(), Some("json"));
    assert_eq!(report.stats.transactions.commit, 1);
    assert_eq!(report.stats.transactions.rollback, 0);
    assert!(out.is_file());
    assert_eq!(tmp_leftovers(tmp.path()), 0);

    let mut conn = db::open_existing(&out).await.unwrap();

    // File attributes are folded into chunk rows through fileId.
    let (file, ext, author): (String, String, Option<String>) =
        sqlx::query_as("SELECT file, ext, last_author FROM chunks WHERE id = 0")
            .fetch_one(&mut conn)
            .await
            .unwrap();
    assert_eq!(file, "src/main.rs");
    assert_eq!(ext, ".rs");
    assert_eq!(author.as_deref(), Some("ann"));

    assert_eq!(scalar_i64(&mut conn, "SELECT COUNT(*) FROM token_vocab WHERE mode = 'code'").await, 4);
    assert_eq!(scalar_i64(&mut conn, "SELECT COUNT(*) FROM token_postings WHERE mode = 'code'").await, 5);
    assert_eq!(scalar_i64(&mut conn, "SELECT COUNT(*) FROM phrase_postings WHERE mode = 'code'").await, 2);
    assert_eq!(scalar_i64(&mut conn, "SELECT COUNT(*) FROM chargram_postings WHERE mode = 'code'").await, 3);
    assert_eq!(
        scalar_i64(&mut conn, "SELECT length(sig) FROM minhash_signatures WHERE doc_id = 1").await,
        12
    );
    assert_eq!(
        scalar_i64(&mut conn, "SELECT length(vector) FROM dense_vectors WHERE doc_id = 2").await,
        2
    );

    let (dims, model): (i64, Option<String>) = sqlx::query_as("SELECT dims, model FROM dense_meta WHERE mode = 'code'")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(dims, 2);
    assert_eq!(model.as_deref(), Some("test-model"));

    let (avg, total): (f64, i64) = sqlx::query_as("SELECT avg_doc_len, total_docs FROM token_stats WHERE mode = 'code'")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(total, 3);
    assert!((avg - 5.0 / 3.0).abs() < 1e-9);

    // Without a manifest the file manifest falls back to file_meta hashes.
    let (hash, count): (Option<String>, i64) =
        sqlx::query_as("SELECT hash, chunk_count FROM file_manifest WHERE mode = 'code' AND file = 'src/main.rs'")
            .fetch_one(&mut conn)
            .await
            .unwrap();
    assert_eq!(hash.as_deref(), Some("h-main"));
    assert_eq!(count, 2);

    let kind: String = sqlx::query_scalar("SELECT build_kind FROM index_meta WHERE mode = 'code'")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(kind, "full");
    assert_eq!(migrate::schema_version(&mut conn).await.unwrap(), migrate::SCHEMA_VERSION);
    db::close_quietly(conn).await;
}

#[tokio::test]
async fn test_missing_token_artifacts_rebuild_from_stored_chunks() {
    let tmp = TempDir::new().unwrap();
    let dir = setup_index_dir(tmp.path());
    fs::remove_file(dir.join("token_postings.json")).unwrap();
    let out = tmp.path().join("index-code.db");

    let report = build_from_index_dir(&test_config(&out), &dir, None, None).await.unwrap();
    assert_eq!(report.stats.token_source.as_deref(), Some("stored-chunks"));

    let mut conn = db::open_existing(&out).await.unwrap();
    assert_eq!(scalar_i64(&mut conn, "SELECT COUNT(*) FROM token_vocab WHERE mode = 'code'").await, 4);
    assert_eq!(scalar_i64(&mut conn, "SELECT COUNT(*) FROM doc_lengths WHERE mode = 'code'").await, 3);
    db::close_quietly(conn).await;
}

#[tokio::test]
async fn test_cardinality_mismatch_keeps_previous_store() {
    let tmp = TempDir::new().unwrap();
    let dir = setup_index_dir(tmp.path());
    let out = tmp.path().join("index-code.db");
    build_from_index_dir(&test_config(&out), &dir, None, None).await.unwrap();
    let before = fs::read(&out).unwrap();

    write_json(
        &dir,
        "token_postings.json",
        json!({"vocab": ["fn", "main", "helper"], "postings": [[[0, 1]], [[0, 1]]], "docLengths": [1]}),
    );
    let err = build_from_index_dir(&test_config(&out), &dir, None, None)
        .await
        .unwrap_err();
    let tagged = err.downcast_ref::<BuildError>().expect("tagged error");
    assert_eq!(tagged.code(), BuildError::CARDINALITY_CODE);

    assert_eq!(fs::read(&out).unwrap(), before);
    assert_eq!(tmp_leftovers(tmp.path()), 0);
}

#[tokio::test]
async fn test_non_integer_posting_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let dir = setup_index_dir(tmp.path());
    write_json(
        &dir,
        "token_postings.json",
        json!({
            "vocab": ["fn", "main", "helper", "util"],
            "postings": [[[0, 1.5]], [[0, 1]], [[1, 1]], [[2, 1]]],
            "docLengths": [2, 2, 1]
        }),
    );
    let out = tmp.path().join("index-code.db");
    let err = build_from_index_dir(&test_config(&out), &dir, None, None)
        .await
        .unwrap_err();
    let tagged = err.downcast_ref::<BuildError>().expect("tagged error");
    assert_eq!(tagged.code(), BuildError::NON_INTEGER_CODE);
    assert!(!out.exists());
}

#[tokio::test]
async fn test_missing_shard_parts_are_reported() {
    let tmp = TempDir::new().unwrap();
    let dir = setup_index_dir(tmp.path());
    fs::remove_file(dir.join("chunk_meta.json")).unwrap();
    write_json(
        &dir,
        "chunk_meta.meta.json",
        json!({"parts": ["chunk_meta.part-0000.jsonl", "chunk_meta.part-0001.jsonl"]}),
    );
    fs::write(
        dir.join("chunk_meta.part-0000.jsonl"),
        "{\"id\": 0, \"file\": \"src/main.rs\", \"tokens\": [\"fn\"]}\n",
    )
    .unwrap();

    let out = tmp.path().join("index-code.db");
    let err = build_from_index_dir(&test_config(&out), &dir, None, None)
        .await
        .unwrap_err();
    let tagged = err.downcast_ref::<BuildError>().expect("tagged error");
    assert_eq!(tagged.code(), BuildError::MISSING_PARTS_CODE);
    assert!(err.to_string().contains("chunk_meta.part-0001.jsonl"));
}

#[tokio::test]
async fn test_sharded_jsonl_chunks() {
    let tmp = TempDir::new().unwrap();
    let dir = setup_index_dir(tmp.path());
    fs::remove_file(dir.join("chunk_meta.json")).unwrap();
    let parts = dir.join("chunk_meta.parts");
    fs::create_dir_all(&parts).unwrap();
    fs::write(
        parts.join("part-0000.jsonl"),
        "{\"id\": 0, \"fileId\": 0, \"tokens\": [\"fn\", \"main\"]}\n{\"id\": 1, \"fileId\": 0, \"tokens\": [\"fn\", \"helper\"]}\n",
    )
    .unwrap();
    fs::write(parts.join("part-0001.jsonl"), "{\"id\": 2, \"fileId\": 1, \"tokens\": [\"util\"]}\n").unwrap();

    let out = tmp.path().join("index-code.db");
    let report = build_from_index_dir(&test_config(&out), &dir, None, None).await.unwrap();
    assert_eq!(report.chunks, 3);
}

fn chunk(id: i64, file: &str, tokens: &[&str]) -> ChunkRecord {
    serde_json::from_value(json!({"id": id, "file": file, "tokens": tokens})).unwrap()
}

/// Declares the ANN table as a plain table so builds can exercise ANN
/// population without a native module.
struct PlainTableExtension;

#[async_trait::async_trait]
impl VectorExtension for PlainTableExtension {
    fn name(&self) -> &str {
        "plain"
    }

    async fn probe(&self, _conn: &mut SqliteConnection) -> Result<(), String> {
        Ok(())
    }

    fn create_table_sql(&self, table: &str, column: &str, _dims: usize, _encoding: AnnEncoding) -> String {
        format!("CREATE TABLE {} (rowid INTEGER PRIMARY KEY, {} BLOB)", table, column)
    }
}

fn dense_inputs() -> BuildInputs {
    BuildInputs {
        chunks: Some(vec![chunk(0, "a.rs", &["x"]), chunk(1, "b.rs", &["y"])].into()),
        dense: Some(DenseInput {
            model: None,
            dims: Some(3),
            min_val: None,
            max_val: None,
            levels: None,
            vectors: DenseVectors::Float(vec![vec![0.0, 0.5, -0.5], vec![1.0, -1.0, 0.25]]),
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_ann_rows_written_through_extension() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("index.db");
    let mut config = test_config(&out);
    config.vectors.ann.enabled = true;
    let extension = PlainTableExtension;

    let report = build_database(dense_inputs(), BuildOptions::from_config(&config, Some(&extension)))
        .await
        .unwrap();
    assert_eq!(report.dense_vectors, 2);
    assert!(report.warnings.is_empty(), "unexpected warnings: {:?}", report.warnings);

    let mut conn = db::open_existing(&out).await.unwrap();
    assert_eq!(scalar_i64(&mut conn, "SELECT COUNT(*) FROM dense_vectors_ann").await, 2);
    assert_eq!(
        scalar_i64(&mut conn, "SELECT length(embedding) FROM dense_vectors_ann WHERE rowid = 1").await,
        12
    );
    db::close_quietly(conn).await;
}

#[tokio::test]
async fn test_ann_without_extension_warns_and_keeps_vectors() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("index.db");
    let mut config = test_config(&out);
    config.vectors.ann.enabled = true;

    let report = build_database(dense_inputs(), BuildOptions::from_config(&config, None))
        .await
        .unwrap();
    assert_eq!(report.dense_vectors, 2);
    assert!(report.warnings.iter().any(|w| w.contains("ANN extension unavailable")));

    let mut conn = db::open_existing(&out).await.unwrap();
    assert!(!migrate::table_exists(&mut conn, "dense_vectors_ann").await.unwrap());
    db::close_quietly(conn).await;
}

#[tokio::test]
async fn test_unsafe_ann_identifier_fails_build() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("index.db");
    let mut config = test_config(&out);
    config.vectors.ann.enabled = true;
    config.vectors.ann.table = "ann; DROP TABLE chunks".to_string();
    let extension = PlainTableExtension;

    let err = build_database(dense_inputs(), BuildOptions::from_config(&config, Some(&extension)))
        .await
        .unwrap_err();
    let tagged = err.downcast_ref::<BuildError>().expect("tagged error");
    assert_eq!(tagged.code(), BuildError::UNSAFE_IDENTIFIER_CODE);
    assert!(!out.exists());
}

#[tokio::test]
async fn test_unsafe_ann_identifier_fails_before_any_write() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("index.db");
    let mut config = test_config(&out);
    config.vectors.ann.enabled = true;
    config.vectors.ann.column = "embedding) --".to_string();

    // No dense input at all: the bad column is still refused up front.
    let inputs = BuildInputs {
        chunks: Some(vec![chunk(0, "src/lib.rs", &["fn"])].into()),
        ..Default::default()
    };
    let err = build_database(inputs, BuildOptions::from_config(&config, None))
        .await
        .unwrap_err();
    let tagged = err.downcast_ref::<BuildError>().expect("tagged error");
    assert_eq!(tagged.code(), BuildError::UNSAFE_IDENTIFIER_CODE);
    assert!(!out.exists());
    assert_eq!(tmp_leftovers(tmp.path()), 0);
}

#[tokio::test]
async fn test_vocab_growth_guard() {
    let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
    migrate::create_schema(&mut conn).await.unwrap();

    let seeded = ensure_vocab_ids(
        &mut conn,
        "code",
        VocabKind::Token,
        &["beta".to_string(), "alpha".to_string()],
        None,
    )
    .await
    .unwrap();
    assert_eq!(seeded.inserted, 2);
    assert_eq!(seeded.map["alpha"], 0);
    assert_eq!(seeded.map["beta"], 1);

    let limits = GrowthLimits {
        ratio: Some(0.4),
        absolute: Some(1),
    };
    let refused = ensure_vocab_ids(
        &mut conn,
        "code",
        VocabKind::Token,
        &["gamma".to_string(), "delta".to_string()],
        Some(&limits),
    )
    .await
    .unwrap();
    assert!(refused.is_skipped());
    assert_eq!(refused.inserted, 0);
    assert_eq!(scalar_i64(&mut conn, "SELECT COUNT(*) FROM token_vocab").await, 2);

    let grown = ensure_vocab_ids(
        &mut conn,
        "code",
        VocabKind::Token,
        &["alpha".to_string(), "gamma".to_string()],
        None,
    )
    .await
    .unwrap();
    assert_eq!(grown.inserted, 1);
    assert_eq!(grown.map["alpha"], 0);
    assert_eq!(grown.map["gamma"], 2);
}

#[tokio::test]
async fn test_vocab_ids_do_not_depend_on_input_order() {
    let mut first = SqliteConnection::connect("sqlite::memory:").await.unwrap();
    let mut second = SqliteConnection::connect("sqlite::memory:").await.unwrap();
    migrate::create_schema(&mut first).await.unwrap();
    migrate::create_schema(&mut second).await.unwrap();

    let forward: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    let reversed: Vec<String> = forward.iter().rev().cloned().collect();
    let a = ensure_vocab_ids(&mut first, "code", VocabKind::Chargram, &forward, None)
        .await
        .unwrap();
    let b = ensure_vocab_ids(&mut second, "code", VocabKind::Chargram, &reversed, None)
        .await
        .unwrap();
    assert_eq!(a.map, b.map);
}
