//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/index-code.db"
//!
//! [build]
//! mode = "code"
//! batch_size = 500        # optional, clamped to [50, 2000]
//! validate = "smoke"      # off | smoke | full
//!
//! [vectors]
//! model = "bge-small"
//! min_val = -1.0
//! max_val = 1.0
//! levels = 256
//!
//! [vectors.ann]
//! enabled = true
//! extension = "./ext/vec0"
//!
//! [vocab.token]
//! ratio = 0.4
//! absolute = 200000
//!
//! [incremental]
//! max_change_ratio = 0.35
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::vector::{is_safe_identifier, AnnEncoding, Quantization};
use crate::vocab::{GrowthLimits, VocabKind};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub vectors: VectorsConfig,
    #[serde(default)]
    pub vocab: VocabConfig,
    #[serde(default)]
    pub incremental: IncrementalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Post-commit validation depth.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValidateMode {
    Off,
    #[default]
    Smoke,
    Full,
}

impl std::str::FromStr for ValidateMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(ValidateMode::Off),
            "smoke" => Ok(ValidateMode::Smoke),
            "full" => Ok(ValidateMode::Full),
            other => anyhow::bail!("Unknown validate mode: '{}'. Must be off, smoke, or full.", other),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BuildConfig {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub validate: ValidateMode,
    #[serde(default = "default_true")]
    pub optimize: bool,
    /// Force size-scaled build pragmas on or off. Unset means "on for
    /// inputs of 128MB or more".
    #[serde(default)]
    pub build_pragmas: Option<bool>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            batch_size: None,
            validate: ValidateMode::default(),
            optimize: true,
            build_pragmas: None,
        }
    }
}

fn default_mode() -> String {
    "code".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorsConfig {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_min_val")]
    pub min_val: f32,
    #[serde(default = "default_max_val")]
    pub max_val: f32,
    #[serde(default = "default_levels")]
    pub levels: u32,
    #[serde(default)]
    pub ann: AnnConfig,
}

impl Default for VectorsConfig {
    fn default() -> Self {
        Self {
            model: None,
            dims: None,
            min_val: default_min_val(),
            max_val: default_max_val(),
            levels: default_levels(),
            ann: AnnConfig::default(),
        }
    }
}

impl VectorsConfig {
    pub fn quantization(&self) -> Quantization {
        Quantization::new(self.min_val, self.max_val, self.levels)
    }
}

fn default_min_val() -> f32 {
    -1.0
}
fn default_max_val() -> f32 {
    1.0
}
fn default_levels() -> u32 {
    256
}

/// Optional approximate-nearest-neighbor accelerator table.
#[derive(Debug, Deserialize, Clone)]
pub struct AnnConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Path or name of the loadable extension.
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default = "default_ann_module")]
    pub module: String,
    #[serde(default = "default_ann_table")]
    pub table: String,
    #[serde(default = "default_ann_column")]
    pub column: String,
    #[serde(default)]
    pub encoding: AnnEncoding,
}

impl Default for AnnConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            extension: None,
            entry_point: None,
            module: default_ann_module(),
            table: default_ann_table(),
            column: default_ann_column(),
            encoding: AnnEncoding::default(),
        }
    }
}

fn default_ann_module() -> String {
    "vec0".to_string()
}
fn default_ann_table() -> String {
    "dense_vectors_ann".to_string()
}
fn default_ann_column() -> String {
    "embedding".to_string()
}

/// Growth limits per vocabulary table. A missing section falls back to the
/// built-in defaults of [`VocabKind::default_limits`].
#[derive(Debug, Deserialize, Clone, Default)]
pub struct VocabConfig {
    #[serde(default)]
    pub token: Option<GrowthLimits>,
    #[serde(default)]
    pub phrase: Option<GrowthLimits>,
    #[serde(default)]
    pub chargram: Option<GrowthLimits>,
}

impl VocabConfig {
    pub fn limits(&self, kind: VocabKind) -> GrowthLimits {
        let configured = match kind {
            VocabKind::Token => self.token,
            VocabKind::Phrase => self.phrase,
            VocabKind::Chargram => self.chargram,
        };
        configured.unwrap_or_else(|| kind.default_limits())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IncrementalConfig {
    #[serde(default = "default_max_change_ratio")]
    pub max_change_ratio: f64,
    #[serde(default)]
    pub case_insensitive_paths: bool,
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            max_change_ratio: default_max_change_ratio(),
            case_insensitive_paths: false,
        }
    }
}

fn default_max_change_ratio() -> f64 {
    0.35
}

impl Config {
    /// A config with every section at its default, writing to `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            build: BuildConfig::default(),
            vectors: VectorsConfig::default(),
            vocab: VocabConfig::default(),
            incremental: IncrementalConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.build.mode.trim().is_empty() {
        anyhow::bail!("build.mode must not be empty");
    }

    if config.build.batch_size == Some(0) {
        anyhow::bail!("build.batch_size must be > 0 when set");
    }

    // Validate quantization
    let vectors = &config.vectors;
    if !(vectors.min_val < vectors.max_val) {
        anyhow::bail!(
            "vectors.min_val ({}) must be < vectors.max_val ({})",
            vectors.min_val,
            vectors.max_val
        );
    }
    if !(2..=256).contains(&vectors.levels) {
        anyhow::bail!("vectors.levels must be in [2, 256], got {}", vectors.levels);
    }
    if vectors.dims == Some(0) {
        anyhow::bail!("vectors.dims must be > 0 when set");
    }

    // Builds re-check these before opening the store.
    let ann = &vectors.ann;
    if ann.enabled {
        for (role, value) in [
            ("table", &ann.table),
            ("column", &ann.column),
            ("module", &ann.module),
        ] {
            if !is_safe_identifier(value) {
                anyhow::bail!("vectors.ann.{} is not a plain identifier: {:?}", role, value);
            }
        }
    }

    for (name, limits) in [
        ("token", &config.vocab.token),
        ("phrase", &config.vocab.phrase),
        ("chargram", &config.vocab.chargram),
    ] {
        if let Some(GrowthLimits {
            ratio: Some(ratio), ..
        }) = limits
        {
            if *ratio < 0.0 {
                anyhow::bail!("vocab.{}.ratio must be >= 0", name);
            }
        }
    }

    if !(0.0..=1.0).contains(&config.incremental.max_change_ratio) {
        anyhow::bail!("incremental.max_change_ratio must be in [0.0, 1.0]");
    }

    Ok(())
}
