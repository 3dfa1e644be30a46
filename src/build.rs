//! Full build orchestration.
//!
//! One build writes one mode into a fresh store:
//!
//! ```text
//! Opened → Staged → TransactionOpen → Merged → IndexesBuilt → Committed
//!        → PostValidated → Promoted
//! ```
//!
//! Any error after `TransactionOpen` rolls the transaction back
//! (`Failed { rolled_back: true }`). The store is always built at a
//! temporary sibling path and only renamed over the output once the
//! post-commit validation passes, so a failed build never touches the
//! previous output.
//!
//! Ingestion order inside the transaction: file metadata, chunks (then
//! merge and file manifest), token postings, phrase postings, chargram
//! postings, MinHash, dense vectors. Secondary indexes come last.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{Connection, SqliteConnection};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use crate::batch::resolve_batch_size;
use crate::chunk_ingest::{
    clear_staging, merge_staged_chunks, stage_chunks, stage_file_meta, write_file_manifest,
};
use crate::config::{Config, ValidateMode, VectorsConfig};
use crate::db;
use crate::extension::{AnnStatus, LoadableExtension, VectorExtension};
use crate::manifest::{load_manifest, FileManifest};
use crate::migrate;
use crate::models::{ChunkRecord, DenseInput, FileMetaRecord, MinhashRow, RowSource};
use crate::report::{BuildStats, WarningKind, WarningLog};
use crate::sources::{directory_bytes, load_rows, resolve_source, row_count_hint, row_stream};
use crate::token_ingest::{
    ingest_doc_postings, ingest_doc_postings_from_dir, ingest_token_index, DocPostings,
    TokenPostings, TokenSources,
};
use crate::validate::{validate_store, ExpectedCounts};
use crate::vector_ingest::{
    check_ann_identifiers, ingest_dense_vectors, ingest_minhash, load_dense_vectors, load_minhash,
    AnnWriter,
};
use crate::vocab::VocabKind;

/// Where a build currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Opened,
    Staged,
    TransactionOpen,
    Merged,
    IndexesBuilt,
    Committed,
    PostValidated,
    Promoted,
    Failed { rolled_back: bool },
}

/// Everything one build ingests. Only chunks are required.
#[derive(Default)]
pub struct BuildInputs {
    pub chunks: Option<RowSource<ChunkRecord>>,
    pub file_meta: Option<RowSource<FileMetaRecord>>,
    pub token_postings: Option<TokenPostings>,
    pub phrase_postings: Option<DocPostings>,
    pub chargram_postings: Option<DocPostings>,
    pub minhash: Option<RowSource<MinhashRow>>,
    pub dense: Option<DenseInput>,
    /// Artifact directory, consulted for token postings fallbacks and for
    /// phrase/chargram postings not supplied above.
    pub index_dir: Option<PathBuf>,
    pub manifest: Option<FileManifest>,
}

/// Knobs for one build.
pub struct BuildOptions<'a> {
    pub out: PathBuf,
    pub mode: String,
    pub batch_size: Option<usize>,
    pub input_bytes: Option<u64>,
    pub row_count: Option<u64>,
    pub validate: ValidateMode,
    pub optimize: bool,
    pub build_pragmas: Option<bool>,
    pub vectors: VectorsConfig,
    pub extension: Option<&'a dyn VectorExtension>,
}

impl<'a> BuildOptions<'a> {
    pub fn from_config(config: &Config, extension: Option<&'a dyn VectorExtension>) -> Self {
        Self {
            out: config.db.path.clone(),
            mode: config.build.mode.clone(),
            batch_size: config.build.batch_size,
            input_bytes: None,
            row_count: None,
            validate: config.build.validate,
            optimize: config.build.optimize,
            build_pragmas: config.build.build_pragmas,
            vectors: config.vectors.clone(),
            extension,
        }
    }
}

/// Outcome of a successful build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub out: PathBuf,
    pub mode: String,
    pub state: BuildState,
    pub chunks: u64,
    pub dense_vectors: u64,
    pub minhash: u64,
    pub stats: BuildStats,
    pub warnings: Vec<String>,
}

/// Per-build state shared by the ingest steps.
struct BuildContext<'a> {
    mode: String,
    batch_size: usize,
    stats: BuildStats,
    warnings: WarningLog,
    vectors: &'a VectorsConfig,
    ann_status: AnnStatus,
    extension: Option<&'a dyn VectorExtension>,
    state: BuildState,
}

impl BuildContext<'_> {
    fn enter(&mut self, state: BuildState) {
        tracing::debug!(mode = %self.mode, state = ?state, "Build state");
        self.state = state;
    }
}

/// Ingest everything inside the open transaction.
async fn ingest_all(
    conn: &mut SqliteConnection,
    ctx: &mut BuildContext<'_>,
    inputs: BuildInputs,
) -> Result<ExpectedCounts> {
    let mode = ctx.mode.clone();
    let batch_size = ctx.batch_size;

    if let Some(file_meta) = inputs.file_meta {
        stage_file_meta(conn, file_meta, batch_size, &mut ctx.stats).await?;
    }
    let chunks = inputs
        .chunks
        .context("No chunk rows supplied for the build")?;
    let staged = stage_chunks(conn, &mode, chunks, batch_size, &mut ctx.stats).await?;
    let merged = merge_staged_chunks(conn, &mut ctx.stats).await?;
    write_file_manifest(
        conn,
        &mode,
        inputs.manifest.as_ref(),
        batch_size,
        &mut ctx.stats,
        &mut ctx.warnings,
    )
    .await?;
    clear_staging(conn).await?;
    ctx.enter(BuildState::Merged);
    info!(mode = %mode, chunks = merged, "Chunks merged");

    let token_sources = TokenSources {
        in_memory: inputs.token_postings,
        index_dir: inputs.index_dir.as_deref(),
        retained_chunks: staged.retained_tokens.as_deref(),
    };
    ingest_token_index(
        conn,
        &mode,
        token_sources,
        batch_size,
        &mut ctx.stats,
        &mut ctx.warnings,
    )
    .await?;

    for (kind, supplied) in [
        (VocabKind::Phrase, inputs.phrase_postings),
        (VocabKind::Chargram, inputs.chargram_postings),
    ] {
        match (supplied, inputs.index_dir.as_deref()) {
            (Some(index), _) => {
                ingest_doc_postings(conn, kind, &mode, &index, 0, batch_size, &mut ctx.stats).await?;
            }
            (None, Some(dir)) => {
                ingest_doc_postings_from_dir(conn, kind, &mode, dir, batch_size, &mut ctx.stats).await?;
            }
            (None, None) => {}
        }
    }

    let minhash = match inputs.minhash {
        Some(source) => Some(ingest_minhash(conn, &mode, source, batch_size, &mut ctx.stats).await?),
        None => None,
    };

    let dense = match inputs.dense {
        Some(input) => {
            let ann = AnnWriter::new(&ctx.vectors.ann, ctx.ann_status.clone(), ctx.extension)?;
            Some(
                ingest_dense_vectors(
                    conn,
                    &mode,
                    input,
                    ctx.vectors,
                    ann,
                    batch_size,
                    &mut ctx.stats,
                    &mut ctx.warnings,
                )
                .await?,
            )
        }
        None => None,
    };

    migrate::write_index_meta(conn, &mode, "full").await?;
    migrate::create_secondary_indexes(conn).await?;
    ctx.enter(BuildState::IndexesBuilt);

    Ok(ExpectedCounts {
        chunks: merged,
        dense_vectors: dense,
        minhash,
    })
}

/// Optimize, restore durability and checkpoint. Failures are warnings.
async fn finalize_store(conn: &mut SqliteConnection, optimize: bool, bulk: bool, warnings: &mut WarningLog) {
    if optimize {
        let fts = sqlx::query("INSERT INTO chunks_fts(chunks_fts) VALUES('optimize')")
            .execute(&mut *conn)
            .await;
        let pragma = sqlx::query("PRAGMA optimize").execute(&mut *conn).await;
        if let Err(e) = fts.and(pragma) {
            warnings.warn_once(WarningKind::PostCommit, format!("optimize failed: {}", e));
        }
    }
    if bulk {
        if let Err(e) = db::restore_pragmas(conn).await {
            warnings.warn_once(WarningKind::PostCommit, format!("restoring pragmas failed: {:#}", e));
        }
    }
    if let Err(e) = db::checkpoint(conn).await {
        warnings.warn_once(WarningKind::PostCommit, format!("checkpoint failed: {:#}", e));
    }
}

async fn run_build(
    conn: &mut SqliteConnection,
    ctx: &mut BuildContext<'_>,
    inputs: BuildInputs,
    options: &BuildOptions<'_>,
    bulk: bool,
) -> Result<ExpectedCounts> {
    migrate::create_schema(conn).await?;
    migrate::create_staging_tables(conn).await?;
    ctx.enter(BuildState::Staged);

    let mut tx = conn.begin().await?;
    ctx.stats.transactions.begin += 1;
    ctx.enter(BuildState::TransactionOpen);

    let expected = match ingest_all(&mut *tx, ctx, inputs).await {
        Ok(expected) => expected,
        Err(e) => {
            let rolled_back = match tx.rollback().await {
                Ok(()) => true,
                Err(rb) => {
                    warn!(error = %rb, "Rollback failed");
                    false
                }
            };
            ctx.stats.transactions.rollback += 1;
            ctx.enter(BuildState::Failed { rolled_back });
            return Err(e);
        }
    };
    tx.commit().await?;
    ctx.stats.transactions.commit += 1;
    ctx.enter(BuildState::Committed);

    validate_store(conn, &ctx.mode, options.validate, &expected).await?;
    ctx.enter(BuildState::PostValidated);

    finalize_store(conn, options.optimize, bulk, &mut ctx.warnings).await;
    Ok(expected)
}

/// Build `options.mode` from `inputs` into `options.out`.
pub async fn build_database(inputs: BuildInputs, options: BuildOptions<'_>) -> Result<BuildReport> {
    let started = Instant::now();
    if options.vectors.ann.enabled {
        check_ann_identifiers(&options.vectors.ann)?;
    }
    let batch_size = resolve_batch_size(options.batch_size, options.input_bytes, options.row_count);
    let bulk = db::use_build_pragmas(options.input_bytes, options.build_pragmas);
    let temp = db::temp_path_for(&options.out);

    let extension = if options.vectors.ann.enabled {
        options.extension
    } else {
        None
    };
    let (mut conn, ann_status) = match db::open_build_connection(&temp, bulk, extension).await {
        Ok(opened) => opened,
        Err(e) => {
            db::remove_db_files(&temp);
            return Err(e);
        }
    };
    let mut ctx = BuildContext {
        mode: options.mode.clone(),
        batch_size,
        stats: BuildStats {
            batch_size,
            ..Default::default()
        },
        warnings: WarningLog::default(),
        vectors: &options.vectors,
        ann_status: if options.vectors.ann.enabled && ann_status == AnnStatus::Disabled {
            AnnStatus::Unavailable("no extension configured".to_string())
        } else {
            ann_status
        },
        extension,
        state: BuildState::Opened,
    };
    info!(mode = %ctx.mode, batch_size, bulk, temp = %temp.display(), "Build started");

    let outcome = run_build(&mut conn, &mut ctx, inputs, &options, bulk).await;
    db::close_quietly(conn).await;

    let expected = match outcome {
        Ok(expected) => expected,
        Err(e) => {
            warn!(mode = %ctx.mode, state = ?ctx.state, error = %format!("{:#}", e), "Build failed");
            db::remove_db_files(&temp);
            return Err(e);
        }
    };

    if let Err(e) = db::promote(&temp, &options.out) {
        db::remove_db_files(&temp);
        return Err(e);
    }
    ctx.enter(BuildState::Promoted);
    info!(
        mode = %ctx.mode,
        out = %options.out.display(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Build promoted"
    );

    Ok(BuildReport {
        out: options.out.clone(),
        mode: ctx.mode,
        state: ctx.state,
        chunks: expected.chunks,
        dense_vectors: expected.dense_vectors.unwrap_or(0),
        minhash: expected.minhash.unwrap_or(0),
        stats: ctx.stats,
        warnings: ctx.warnings.messages(),
    })
}

/// Build from an artifact directory using `config` (with CLI overrides
/// already applied).
pub async fn build_from_index_dir(
    config: &Config,
    index_dir: &Path,
    manifest: Option<&Path>,
    input_bytes: Option<u64>,
) -> Result<BuildReport> {
    if !index_dir.is_dir() {
        anyhow::bail!("Index directory not found: {}", index_dir.display());
    }
    let mode = config.build.mode.as_str();

    let chunk_source = resolve_source(index_dir, "chunk_meta")?
        .with_context(|| format!("No chunk_meta artifact in {}", index_dir.display()))?;
    let row_count = row_count_hint(&chunk_source);
    let chunks = row_stream::<ChunkRecord>(chunk_source)?;

    let manifest = match manifest {
        Some(path) => Some(load_manifest(path, config.incremental.case_insensitive_paths)?),
        None => None,
    };

    let inputs = BuildInputs {
        chunks: Some(chunks),
        file_meta: load_rows::<FileMetaRecord>(index_dir, "file_meta")?,
        minhash: load_minhash(index_dir)?,
        dense: load_dense_vectors(index_dir, mode)?,
        index_dir: Some(index_dir.to_path_buf()),
        manifest,
        ..Default::default()
    };

    let loadable = LoadableExtension::from_config(&config.vectors.ann);
    let mut options = BuildOptions::from_config(
        config,
        loadable.as_ref().map(|ext| ext as &dyn VectorExtension),
    );
    options.input_bytes = Some(input_bytes.unwrap_or_else(|| directory_bytes(index_dir)));
    options.row_count = row_count;
    build_database(inputs, options).await
}
