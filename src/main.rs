//! # index-sqlite CLI (`idx-sqlite`)
//!
//! Builds and updates SQLite stores from index artifact directories.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `idx-sqlite build` | Full rebuild of one mode from an artifact directory |
//! | `idx-sqlite update` | Apply a manifest delta, falling back to a full build |
//! | `idx-sqlite inspect` | Row counts and build info for one mode |
//!
//! ## Examples
//!
//! ```bash
//! idx-sqlite build --index-dir ./index-code --mode code --out ./index-code.db
//! idx-sqlite update --manifest ./manifest.json --bundle-dir ./bundles \
//!     --index-dir ./index-code --out ./index-code.db
//! idx-sqlite inspect --out ./index-code.db
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use index_sqlite::build::{build_from_index_dir, BuildReport};
use index_sqlite::config::{self, Config, ValidateMode};
use index_sqlite::extension::{LoadableExtension, VectorExtension};
use index_sqlite::incremental::{update_database, UpdateInputs, UpdateOutcome};
use index_sqlite::inspect::{inspect_store, print_summary};
use index_sqlite::manifest::load_manifest;

/// Materialize index artifacts into a SQLite store.
///
/// Settings come from an optional TOML file; flags override it.
#[derive(Parser)]
#[command(name = "idx-sqlite", version, about = "Build SQLite stores from index artifacts")]
struct Cli {
    /// Path to configuration file (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Mode to build (e.g. `code`, `prose`).
    #[arg(long, global = true)]
    mode: Option<String>,

    /// Output database path.
    #[arg(long, global = true)]
    out: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild one mode from an artifact directory.
    ///
    /// The store is written at a temporary path and only replaces the
    /// output once it has been committed and validated.
    Build {
        /// Directory holding chunk_meta, token_postings, ... artifacts.
        #[arg(long)]
        index_dir: PathBuf,

        /// Rows per insert batch, clamped to [50, 2000].
        #[arg(long)]
        batch_size: Option<usize>,

        /// Input size hint used for batch and pragma tiers. Defaults to
        /// the size of the artifact directory.
        #[arg(long)]
        input_bytes: Option<u64>,

        /// File manifest JSON to record hash/mtime/size from.
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Post-commit validation: off, smoke or full.
        #[arg(long)]
        validate: Option<ValidateMode>,
    },

    /// Apply an incremental update from per-file bundles.
    ///
    /// Falls back to a full build from `--index-dir` when the delta is
    /// refused.
    Update {
        #[arg(long)]
        manifest: PathBuf,

        #[arg(long)]
        bundle_dir: PathBuf,

        #[arg(long)]
        index_dir: Option<PathBuf>,
    },

    /// Show row counts and build info for one mode.
    Inspect,
}

fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(cli: &Cli) -> anyhow::Result<Config> {
    let mut cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::minimal("./index.db"),
    };
    if let Some(mode) = &cli.mode {
        cfg.build.mode = mode.clone();
    }
    if let Some(out) = &cli.out {
        cfg.db.path = out.clone();
    }
    Ok(cfg)
}

fn print_build(report: &BuildReport, index_dir: &std::path::Path) {
    println!("build {}", report.mode);
    println!("  index dir: {}", index_dir.display());
    println!("  batch size: {}", report.stats.batch_size);
    println!("  chunks: {}", report.chunks);
    println!(
        "  token source: {}",
        report.stats.token_source.as_deref().unwrap_or("none")
    );
    println!("  dense vectors: {}", report.dense_vectors);
    println!("  minhash: {}", report.minhash);
    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }
    println!("  out: {}", report.out.display());
    println!("ok");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let mut cfg = load_settings(&cli)?;

    match cli.command {
        Commands::Build {
            index_dir,
            batch_size,
            input_bytes,
            manifest,
            validate,
        } => {
            if batch_size.is_some() {
                cfg.build.batch_size = batch_size;
            }
            if let Some(validate) = validate {
                cfg.build.validate = validate;
            }
            config::validate_config(&cfg)?;
            let report = build_from_index_dir(&cfg, &index_dir, manifest.as_deref(), input_bytes).await?;
            print_build(&report, &index_dir);
        }
        Commands::Update {
            manifest,
            bundle_dir,
            index_dir,
        } => {
            config::validate_config(&cfg)?;
            let manifest_path = manifest;
            let manifest = load_manifest(&manifest_path, cfg.incremental.case_insensitive_paths)
                .with_context(|| format!("Failed to load manifest {}", manifest_path.display()))?;
            let loadable = LoadableExtension::from_config(&cfg.vectors.ann);
            let extension = loadable.as_ref().map(|ext| ext as &dyn VectorExtension);
            let outcome = update_database(
                &cfg,
                UpdateInputs {
                    manifest,
                    bundle_dir,
                },
                extension,
            )
            .await?;

            match outcome {
                UpdateOutcome::Applied(report) => {
                    println!("update {}", report.mode);
                    println!("  changed files: {}", report.changed_files);
                    println!("  deleted files: {}", report.deleted_files);
                    println!("  manifest updates: {}", report.manifest_updates);
                    println!("  inserted chunks: {}", report.inserted_chunks);
                    for warning in &report.warnings {
                        println!("  warning: {}", warning);
                    }
                    println!("ok");
                }
                UpdateOutcome::Skipped { reason } => {
                    println!("update {}", cfg.build.mode);
                    println!("  skipped: {}", reason);
                    let Some(index_dir) = index_dir else {
                        anyhow::bail!("Incremental update skipped ({}) and no --index-dir given for a full build", reason);
                    };
                    let report =
                        build_from_index_dir(&cfg, &index_dir, Some(&manifest_path), None).await?;
                    print_build(&report, &index_dir);
                }
            }
        }
        Commands::Inspect => {
            let summary = inspect_store(&cfg.db.path, &cfg.build.mode).await?;
            print_summary(&cfg.db.path, &cfg.build.mode, &summary);
        }
    }

    Ok(())
}
