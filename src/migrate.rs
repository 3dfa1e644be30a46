//! Store schema.
//!
//! Permanent tables are created without their secondary indexes; those are
//! added by [`create_secondary_indexes`] once bulk loading is done. Staging
//! tables are `TEMP`, so they never reach the output file.

use anyhow::Result;
use sqlx::SqliteConnection;

/// Written to `PRAGMA user_version`; incremental updates refuse any other.
pub const SCHEMA_VERSION: i64 = 4;

/// Tables every built store must contain.
pub const REQUIRED_TABLES: &[&str] = &[
    "chunks",
    "chunks_fts",
    "token_vocab",
    "token_postings",
    "doc_lengths",
    "token_stats",
    "phrase_vocab",
    "phrase_postings",
    "chargram_vocab",
    "chargram_postings",
    "minhash_signatures",
    "dense_vectors",
    "dense_meta",
    "file_manifest",
    "index_meta",
];

const PERMANENT_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id INTEGER PRIMARY KEY,
        chunk_id TEXT NOT NULL,
        mode TEXT NOT NULL,
        file TEXT,
        start INTEGER,
        "end" INTEGER,
        startLine INTEGER,
        endLine INTEGER,
        ext TEXT,
        kind TEXT,
        name TEXT,
        signature TEXT,
        doc TEXT,
        metaV2_json TEXT,
        headline TEXT,
        preContext TEXT,
        postContext TEXT,
        weight REAL,
        tokens TEXT,
        ngrams TEXT,
        codeRelations TEXT,
        docmeta TEXT,
        stats TEXT,
        complexity TEXT,
        lint TEXT,
        externalDocs TEXT,
        last_modified TEXT,
        last_author TEXT,
        churn REAL,
        churn_added INTEGER,
        churn_deleted INTEGER,
        churn_commits INTEGER,
        chunk_authors TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS token_vocab (
        mode TEXT NOT NULL,
        token_id INTEGER NOT NULL,
        token TEXT NOT NULL,
        PRIMARY KEY (mode, token_id),
        UNIQUE (mode, token)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS token_postings (
        mode TEXT NOT NULL,
        token_id INTEGER NOT NULL,
        doc_id INTEGER NOT NULL,
        tf INTEGER NOT NULL,
        PRIMARY KEY (mode, token_id, doc_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS doc_lengths (
        mode TEXT NOT NULL,
        doc_id INTEGER NOT NULL,
        len INTEGER NOT NULL,
        PRIMARY KEY (mode, doc_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS token_stats (
        mode TEXT PRIMARY KEY,
        avg_doc_len REAL,
        total_docs INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS phrase_vocab (
        mode TEXT NOT NULL,
        phrase_id INTEGER NOT NULL,
        ngram TEXT NOT NULL,
        PRIMARY KEY (mode, phrase_id),
        UNIQUE (mode, ngram)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS phrase_postings (
        mode TEXT NOT NULL,
        phrase_id INTEGER NOT NULL,
        doc_id INTEGER NOT NULL,
        PRIMARY KEY (mode, phrase_id, doc_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chargram_vocab (
        mode TEXT NOT NULL,
        gram_id INTEGER NOT NULL,
        gram TEXT NOT NULL,
        PRIMARY KEY (mode, gram_id),
        UNIQUE (mode, gram)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chargram_postings (
        mode TEXT NOT NULL,
        gram_id INTEGER NOT NULL,
        doc_id INTEGER NOT NULL,
        PRIMARY KEY (mode, gram_id, doc_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS minhash_signatures (
        mode TEXT NOT NULL,
        doc_id INTEGER NOT NULL,
        sig BLOB NOT NULL,
        PRIMARY KEY (mode, doc_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dense_vectors (
        mode TEXT NOT NULL,
        doc_id INTEGER NOT NULL,
        vector BLOB NOT NULL,
        PRIMARY KEY (mode, doc_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dense_meta (
        mode TEXT PRIMARY KEY,
        dims INTEGER,
        scale REAL,
        model TEXT,
        min_val REAL,
        max_val REAL,
        levels INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS file_manifest (
        mode TEXT NOT NULL,
        file TEXT NOT NULL,
        hash TEXT,
        mtimeMs INTEGER,
        size INTEGER,
        chunk_count INTEGER,
        PRIMARY KEY (mode, file)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS index_meta (
        mode TEXT PRIMARY KEY,
        schema_version INTEGER NOT NULL,
        build_kind TEXT NOT NULL,
        built_at INTEGER NOT NULL
    )
    "#,
];

const SECONDARY_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks (mode, file)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_chunk_id ON chunks (chunk_id)",
    "CREATE INDEX IF NOT EXISTS idx_token_postings_token ON token_postings (mode, token_id)",
    "CREATE INDEX IF NOT EXISTS idx_token_postings_doc ON token_postings (mode, doc_id)",
    "CREATE INDEX IF NOT EXISTS idx_phrase_postings_phrase ON phrase_postings (mode, phrase_id)",
    "CREATE INDEX IF NOT EXISTS idx_phrase_postings_doc ON phrase_postings (mode, doc_id)",
    "CREATE INDEX IF NOT EXISTS idx_chargram_postings_gram ON chargram_postings (mode, gram_id)",
    "CREATE INDEX IF NOT EXISTS idx_chargram_postings_doc ON chargram_postings (mode, doc_id)",
];

/// Create all permanent tables and the FTS shadow table.
pub async fn create_schema(conn: &mut SqliteConnection) -> Result<()> {
    for ddl in PERMANENT_TABLES {
        sqlx::query(ddl).execute(&mut *conn).await?;
    }

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(&mut *conn)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                file,
                name,
                signature,
                kind,
                headline,
                doc,
                tokens,
                tokenize = 'unicode61'
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;
    }

    sqlx::query(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Fresh per-build staging tables.
pub async fn create_staging_tables(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("DROP TABLE IF EXISTS temp.file_meta_stage")
        .execute(&mut *conn)
        .await?;
    sqlx::query("DROP TABLE IF EXISTS temp.chunks_stage")
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        r#"
        CREATE TEMP TABLE file_meta_stage (
            id INTEGER,
            file TEXT,
            ext TEXT,
            size INTEGER,
            hash TEXT,
            hashAlgo TEXT,
            encoding TEXT,
            encodingFallback INTEGER,
            encodingConfidence REAL,
            externalDocs TEXT,
            last_modified TEXT,
            last_author TEXT,
            churn REAL,
            churn_added INTEGER,
            churn_deleted INTEGER,
            churn_commits INTEGER
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TEMP TABLE chunks_stage (
            id INTEGER PRIMARY KEY,
            chunk_id TEXT NOT NULL,
            mode TEXT NOT NULL,
            file_id INTEGER,
            file TEXT,
            start INTEGER,
            "end" INTEGER,
            startLine INTEGER,
            endLine INTEGER,
            ext TEXT,
            kind TEXT,
            name TEXT,
            signature TEXT,
            doc TEXT,
            metaV2_json TEXT,
            headline TEXT,
            preContext TEXT,
            postContext TEXT,
            weight REAL,
            tokens TEXT,
            tokensText TEXT,
            ngrams TEXT,
            codeRelations TEXT,
            docmeta TEXT,
            stats TEXT,
            complexity TEXT,
            lint TEXT,
            externalDocs TEXT,
            last_modified TEXT,
            last_author TEXT,
            churn REAL,
            churn_added INTEGER,
            churn_deleted INTEGER,
            churn_commits INTEGER,
            chunk_authors TEXT
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query("CREATE INDEX temp.idx_file_meta_stage_id ON file_meta_stage (id)")
        .execute(&mut *conn)
        .await?;
    sqlx::query("CREATE INDEX temp.idx_file_meta_stage_file ON file_meta_stage (file)")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Secondary indexes, created after bulk inserts.
pub async fn create_secondary_indexes(conn: &mut SqliteConnection) -> Result<()> {
    for ddl in SECONDARY_INDEXES {
        sqlx::query(ddl).execute(&mut *conn).await?;
    }
    Ok(())
}

pub async fn schema_version(conn: &mut SqliteConnection) -> Result<i64> {
    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(&mut *conn)
        .await?;
    Ok(version)
}

pub async fn table_exists(conn: &mut SqliteConnection, name: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name = ?",
    )
    .bind(name)
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists)
}

/// Record what produced the store.
pub async fn write_index_meta(conn: &mut SqliteConnection, mode: &str, build_kind: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO index_meta (mode, schema_version, build_kind, built_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(mode)
    .bind(SCHEMA_VERSION)
    .bind(build_kind)
    .bind(chrono::Utc::now().timestamp())
    .execute(&mut *conn)
    .await?;
    Ok(())
}
