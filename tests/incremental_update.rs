use serde_json::{json, Value};
use sqlx::SqliteConnection;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use index_sqlite::build::build_from_index_dir;
use index_sqlite::config::{Config, ValidateMode};
use index_sqlite::db;
use index_sqlite::incremental::{update_database, UpdateInputs, UpdateOutcome};
use index_sqlite::manifest::load_manifest;

const FILES: &[(&str, &[&str])] = &[
    ("src/a.rs", &["alpha", "beta"]),
    ("src/b.rs", &["gamma"]),
    ("src/c.rs", &["delta"]),
    ("src/d.rs", &["alpha"]),
    ("src/e.rs", &["alpha"]),
    ("src/f.rs", &["beta"]),
];

fn write_json(path: &Path, value: Value) {
    fs::write(path, serde_json::to_vec_pretty(&value).unwrap()).unwrap();
}

fn manifest_entry(hash: &str, bundle: Option<&str>) -> Value {
    let mut entry = json!({"hash": hash, "mtimeMs": 1_700_000_000_000i64, "size": 64});
    if let Some(bundle) = bundle {
        entry["bundle"] = json!(bundle);
    }
    entry
}

struct Fixture {
    _tmp: TempDir,
    root: PathBuf,
    config: Config,
}

/// Full build of six files: `src/a.rs` has two chunks (doc ids 0 and 1),
/// every other file one chunk, in listing order.
async fn setup_store() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let index_dir = root.join("index-code");
    fs::create_dir_all(&index_dir).unwrap();

    let mut chunks = vec![json!({"id": 0, "file": "src/a.rs", "start": 0, "end": 10, "tokens": ["alpha", "beta"]})];
    chunks.push(json!({"id": 1, "file": "src/a.rs", "start": 11, "end": 20, "tokens": ["beta"]}));
    for (i, (file, tokens)) in FILES.iter().enumerate().skip(1) {
        chunks.push(json!({"id": i + 1, "file": file, "start": 0, "end": 10, "tokens": tokens}));
    }
    write_json(&index_dir.join("chunk_meta.json"), Value::Array(chunks));

    let files: serde_json::Map<String, Value> = FILES
        .iter()
        .map(|(file, _)| (file.to_string(), manifest_entry("h1", None)))
        .collect();
    let manifest_path = root.join("manifest-full.json");
    write_json(&manifest_path, json!({ "files": files }));

    let mut config = Config::minimal(root.join("index-code.db"));
    config.build.validate = ValidateMode::Full;
    let report = build_from_index_dir(&config, &index_dir, Some(&manifest_path), None)
        .await
        .unwrap();
    assert_eq!(report.chunks, 7);

    Fixture {
        _tmp: tmp,
        root,
        config,
    }
}

/// `src/a.rs` changed to one chunk, `src/b.rs` deleted, `src/g.rs` added.
fn write_delta(root: &Path) -> PathBuf {
    let bundles = root.join("bundles");
    fs::create_dir_all(&bundles).unwrap();
    write_json(
        &bundles.join("a.json"),
        json!({
            "file": "src/a.rs",
            "chunks": [{
                "start": 0,
                "end": 14,
                "tokens": ["alpha", "epsilon"],
                "chargrams": ["alp"],
                "minhash": [9, 9, 9]
            }]
        }),
    );
    write_json(
        &bundles.join("g.json"),
        json!({"file": "src/g.rs", "chunks": [{"start": 0, "end": 5, "tokens": ["gamma"]}]}),
    );

    let mut files = serde_json::Map::new();
    files.insert("src/a.rs".into(), manifest_entry("h2", Some("a.json")));
    for (file, _) in FILES.iter().skip(2) {
        files.insert(file.to_string(), manifest_entry("h1", None));
    }
    files.insert("src/g.rs".into(), manifest_entry("h1", Some("g.json")));
    let path = root.join("manifest-delta.json");
    write_json(&path, json!({ "files": files }));
    path
}

fn inputs(root: &Path, manifest: &Path) -> UpdateInputs {
    UpdateInputs {
        manifest: load_manifest(manifest, false).unwrap(),
        bundle_dir: root.join("bundles"),
    }
}

async fn chunk_ids(conn: &mut SqliteConnection, file: &str) -> Vec<i64> {
    sqlx::query_scalar("SELECT id FROM chunks WHERE mode = 'code' AND file = ? ORDER BY id")
        .bind(file)
        .fetch_all(&mut *conn)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_delta_applies_with_stable_doc_ids() {
    let mut fixture = setup_store().await;
    fixture.config.incremental.max_change_ratio = 0.6;
    let manifest = write_delta(&fixture.root);

    let outcome = update_database(&fixture.config, inputs(&fixture.root, &manifest), None)
        .await
        .unwrap();
    let report = match outcome {
        UpdateOutcome::Applied(report) => report,
        other => panic!("expected the delta to apply, got {:?}", other),
    };
    assert_eq!(report.changed_files, 2);
    assert_eq!(report.deleted_files, 1);
    assert_eq!(report.inserted_chunks, 2);
    assert_eq!(report.deleted_chunks, 3);
    assert_eq!(report.next_doc_id, 7);

    let mut conn = db::open_existing(&fixture.config.db.path).await.unwrap();
    // The new file takes the id freed by the deleted one; the changed file
    // keeps its first id.
    assert_eq!(chunk_ids(&mut conn, "src/g.rs").await, vec![2]);
    assert_eq!(chunk_ids(&mut conn, "src/a.rs").await, vec![0]);
    assert!(chunk_ids(&mut conn, "src/b.rs").await.is_empty());
    assert_eq!(chunk_ids(&mut conn, "src/c.rs").await, vec![3]);

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE mode = 'code'")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(total, 6);

    let epsilon_docs: Vec<i64> = sqlx::query_scalar(
        "SELECT p.doc_id FROM token_postings p JOIN token_vocab v ON v.mode = p.mode AND v.token_id = p.token_id \
         WHERE v.token = 'epsilon'",
    )
    .fetch_all(&mut conn)
    .await
    .unwrap();
    assert_eq!(epsilon_docs, vec![0]);
    let stale: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM token_postings WHERE mode = 'code' AND doc_id = 1")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(stale, 0);

    let (avg, docs): (f64, i64) = sqlx::query_as("SELECT avg_doc_len, total_docs FROM token_stats WHERE mode = 'code'")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(docs, 6);
    assert!((avg - 7.0 / 6.0).abs() < 1e-9);

    let minhash: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM minhash_signatures WHERE mode = 'code' AND doc_id = 0")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(minhash, 1);

    let manifest_rows: Vec<(String, Option<String>, i64)> =
        sqlx::query_as("SELECT file, hash, chunk_count FROM file_manifest WHERE mode = 'code' ORDER BY file")
            .fetch_all(&mut conn)
            .await
            .unwrap();
    assert_eq!(manifest_rows.len(), 6);
    assert_eq!(manifest_rows[0], ("src/a.rs".to_string(), Some("h2".to_string()), 1));
    assert!(manifest_rows.iter().all(|(file, _, _)| file != "src/b.rs"));
    assert!(manifest_rows.iter().any(|(file, _, count)| file == "src/g.rs" && *count == 1));

    let kind: String = sqlx::query_scalar("SELECT build_kind FROM index_meta WHERE mode = 'code'")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(kind, "incremental");
    db::close_quietly(conn).await;
}

#[tokio::test]
async fn test_high_change_ratio_skips_without_writing() {
    let fixture = setup_store().await;
    let manifest = write_delta(&fixture.root);
    let before = fs::read(&fixture.config.db.path).unwrap();

    let outcome = update_database(&fixture.config, inputs(&fixture.root, &manifest), None)
        .await
        .unwrap();
    match outcome {
        UpdateOutcome::Skipped { reason } => assert!(reason.contains("change ratio"), "reason: {}", reason),
        other => panic!("expected a skip, got {:?}", other),
    }
    assert_eq!(fs::read(&fixture.config.db.path).unwrap(), before);
}

#[tokio::test]
async fn test_missing_bundle_skips() {
    let mut fixture = setup_store().await;
    fixture.config.incremental.max_change_ratio = 0.6;
    let manifest = write_delta(&fixture.root);
    fs::remove_file(fixture.root.join("bundles").join("g.json")).unwrap();

    let outcome = update_database(&fixture.config, inputs(&fixture.root, &manifest), None)
        .await
        .unwrap();
    match outcome {
        UpdateOutcome::Skipped { reason } => assert!(reason.contains("src/g.rs"), "reason: {}", reason),
        other => panic!("expected a skip, got {:?}", other),
    }
}

#[tokio::test]
async fn test_vocab_growth_trip_rolls_back_delta() {
    let mut fixture = setup_store().await;
    fixture.config.incremental.max_change_ratio = 0.6;
    fixture.config.vocab.token = Some(index_sqlite::vocab::GrowthLimits {
        ratio: Some(0.1),
        absolute: None,
    });
    let manifest = write_delta(&fixture.root);
    let before = fs::read(&fixture.config.db.path).unwrap();

    let outcome = update_database(&fixture.config, inputs(&fixture.root, &manifest), None)
        .await
        .unwrap();
    match outcome {
        UpdateOutcome::Skipped { reason } => assert!(reason.contains("token vocab"), "reason: {}", reason),
        other => panic!("expected a skip, got {:?}", other),
    }
    assert_eq!(fs::read(&fixture.config.db.path).unwrap(), before);

    let mut conn = db::open_existing(&fixture.config.db.path).await.unwrap();
    assert_eq!(chunk_ids(&mut conn, "src/b.rs").await, vec![2]);
    db::close_quietly(conn).await;
}

#[tokio::test]
async fn test_unchanged_manifest_is_a_no_op() {
    let fixture = setup_store().await;
    let files: serde_json::Map<String, Value> = FILES
        .iter()
        .map(|(file, _)| (file.to_string(), manifest_entry("h1", None)))
        .collect();
    let path = fixture.root.join("manifest-same.json");
    write_json(&path, json!({ "files": files }));

    let outcome = update_database(&fixture.config, inputs(&fixture.root, &path), None)
        .await
        .unwrap();
    let report = match outcome {
        UpdateOutcome::Applied(report) => report,
        other => panic!("expected a no-op update, got {:?}", other),
    };
    assert_eq!(report.changed_files, 0);
    assert_eq!(report.inserted_chunks, 0);
}

#[tokio::test]
async fn test_missing_store_skips() {
    let tmp = TempDir::new().unwrap();
    let config = Config::minimal(tmp.path().join("absent.db"));
    let manifest = tmp.path().join("manifest.json");
    write_json(&manifest, json!({"files": {"src/a.rs": {"hash": "h"}}}));
    let outcome = update_database(
        &config,
        UpdateInputs {
            manifest: load_manifest(&manifest, false).unwrap(),
            bundle_dir: tmp.path().to_path_buf(),
        },
        None,
    )
    .await
    .unwrap();
    assert!(!outcome.is_applied());
}

#[tokio::test]
async fn test_case_insensitive_update_handles_non_ascii_paths() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let index_dir = root.join("index-code");
    fs::create_dir_all(&index_dir).unwrap();

    let stored = ["src/Ärger.rs", "src/Öl.rs", "src/c.rs", "src/d.rs", "src/e.rs", "src/f.rs"];
    let chunks: Vec<Value> = stored
        .iter()
        .enumerate()
        .map(|(i, file)| json!({"id": i, "file": file, "start": 0, "end": 10, "tokens": ["alpha"]}))
        .collect();
    write_json(&index_dir.join("chunk_meta.json"), Value::Array(chunks));
    let files: serde_json::Map<String, Value> = stored
        .iter()
        .map(|file| (file.to_string(), manifest_entry("h1", None)))
        .collect();
    let full_manifest = root.join("manifest-full.json");
    write_json(&full_manifest, json!({ "files": files }));

    let mut config = Config::minimal(root.join("index-code.db"));
    config.incremental.case_insensitive_paths = true;
    config.incremental.max_change_ratio = 0.6;
    build_from_index_dir(&config, &index_dir, Some(&full_manifest), None)
        .await
        .unwrap();

    // Same files under different case: "ärger" changed, "öl" gone.
    let bundles = root.join("bundles");
    fs::create_dir_all(&bundles).unwrap();
    write_json(
        &bundles.join("aerger.json"),
        json!({"chunks": [{"start": 0, "end": 12, "tokens": ["beta"]}]}),
    );
    let mut files = serde_json::Map::new();
    files.insert("src/ärger.rs".into(), manifest_entry("h2", Some("aerger.json")));
    for file in &stored[2..] {
        files.insert(file.to_string(), manifest_entry("h1", None));
    }
    let delta = root.join("manifest-delta.json");
    write_json(&delta, json!({ "files": files }));

    let outcome = update_database(
        &config,
        UpdateInputs {
            manifest: load_manifest(&delta, true).unwrap(),
            bundle_dir: bundles,
        },
        None,
    )
    .await
    .unwrap();
    let report = match outcome {
        UpdateOutcome::Applied(report) => report,
        other => panic!("expected the delta to apply, got {:?}", other),
    };
    assert_eq!(report.deleted_chunks, 2);
    assert_eq!(report.inserted_chunks, 1);

    let mut conn = db::open_existing(&config.db.path).await.unwrap();
    assert!(chunk_ids(&mut conn, "src/Ärger.rs").await.is_empty());
    assert!(chunk_ids(&mut conn, "src/Öl.rs").await.is_empty());
    assert_eq!(chunk_ids(&mut conn, "src/ärger.rs").await, vec![0]);
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE mode = 'code'")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(total, 5);

    let manifest_files: Vec<String> =
        sqlx::query_scalar("SELECT file FROM file_manifest WHERE mode = 'code' ORDER BY file")
            .fetch_all(&mut conn)
            .await
            .unwrap();
    assert_eq!(manifest_files.len(), 5);
    assert!(manifest_files.contains(&"src/ärger.rs".to_string()));
    assert!(!manifest_files.contains(&"src/Ärger.rs".to_string()));
    assert!(!manifest_files.contains(&"src/Öl.rs".to_string()));
    db::close_quietly(conn).await;
}
