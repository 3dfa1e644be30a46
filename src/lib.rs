//! # index-sqlite
//!
//! Materializes file-backed search index artifacts into one SQLite store
//! per mode, with full rebuilds and incremental updates that keep doc ids
//! stable across runs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌─────────────────┐
//! │  Artifacts   │──▶│    build     │──▶│  temp store     │
//! │ json/jsonl/  │   │ chunks→tokens│   │ one transaction │
//! │ columnar/bin │   │ →vectors     │   └───────┬─────────┘
//! └──────────────┘   └──────────────┘           │ validate
//!                                               ▼
//! ┌──────────────┐   ┌──────────────┐   ┌─────────────────┐
//! │ manifest +   │──▶│ incremental  │──▶│ promoted output │
//! │ bundles      │   │ delta apply  │   └─────────────────┘
//! └──────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! idx-sqlite build --index-dir ./index-code --mode code --out ./index-code.db
//! idx-sqlite update --manifest ./manifest.json --bundle-dir ./bundles --index-dir ./index-code
//! idx-sqlite inspect --config ./config/idx.toml
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Tagged fatal errors |
//! | [`report`] | Warnings and build statistics |
//! | [`models`] | Artifact record types |
//! | [`sources`] | Artifact discovery and row streams |
//! | [`batch`] | Adaptive batch sizing |
//! | [`db`] | Connections, pragmas, promotion |
//! | [`migrate`] | Store schema |
//! | [`extension`] | ANN extension seam |
//! | [`vocab`] | Vocabulary id allocation |
//! | [`docids`] | Doc id reuse for deltas |
//! | [`manifest`] | File manifest and diffing |
//! | [`chunk_ingest`] | Chunk staging and merge |
//! | [`token_ingest`] | Token, phrase and chargram postings |
//! | [`vector`] | Quantization and packing |
//! | [`vector_ingest`] | Dense vectors, MinHash, ANN rows |
//! | [`validate`] | Post-commit checks |
//! | [`build`] | Full build orchestration |
//! | [`incremental`] | Delta updates |
//! | [`inspect`] | Store summary |

pub mod batch;
pub mod build;
pub mod chunk_ingest;
pub mod config;
pub mod db;
pub mod docids;
pub mod error;
pub mod extension;
pub mod incremental;
pub mod inspect;
pub mod manifest;
pub mod migrate;
pub mod models;
pub mod report;
pub mod sources;
pub mod token_ingest;
pub mod validate;
pub mod vector;
pub mod vector_ingest;
pub mod vocab;
