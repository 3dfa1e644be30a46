//! Native ANN extension boundary.
//!
//! The ANN accelerator table lives in a virtual-table module provided by a
//! loadable SQLite extension (`vec0` from sqlite-vec by default). Loading
//! can fail for ordinary reasons (missing file, wrong platform), so the
//! contract is pass/fail plus a reason, never an error.
//!
//! | Step | Method |
//! |------|--------|
//! | Before connect | [`VectorExtension::configure`] adds the library to the connect options |
//! | After connect | [`VectorExtension::probe`] confirms the module is usable |
//! | First vector | [`VectorExtension::create_table_sql`] declares the table |

use async_trait::async_trait;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::SqliteConnection;

use crate::config::AnnConfig;
use crate::vector::AnnEncoding;

/// Whether ANN population is live for the current build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnStatus {
    Disabled,
    Available,
    Unavailable(String),
}

impl AnnStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, AnnStatus::Available)
    }
}

#[async_trait]
pub trait VectorExtension: Send + Sync {
    /// Short name for log lines.
    fn name(&self) -> &str;

    /// Register the extension on the options used to open the build
    /// connection. The default registers nothing.
    fn configure(&self, options: SqliteConnectOptions) -> SqliteConnectOptions {
        options
    }

    /// Confirm the module works on `conn`. `Err` carries the reason.
    async fn probe(&self, conn: &mut SqliteConnection) -> Result<(), String>;

    /// DDL for the ANN table. Identifiers are validated by the caller.
    fn create_table_sql(&self, table: &str, column: &str, dims: usize, encoding: AnnEncoding) -> String;
}

/// A shared-library extension loaded by path, e.g. sqlite-vec's `vec0`.
#[derive(Debug, Clone)]
pub struct LoadableExtension {
    pub path: String,
    pub entry_point: Option<String>,
    pub module: String,
}

impl LoadableExtension {
    pub fn from_config(config: &AnnConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let path = config.extension.clone()?;
        Some(Self {
            path,
            entry_point: config.entry_point.clone(),
            module: config.module.clone(),
        })
    }
}

#[async_trait]
impl VectorExtension for LoadableExtension {
    fn name(&self) -> &str {
        &self.module
    }

    fn configure(&self, options: SqliteConnectOptions) -> SqliteConnectOptions {
        match &self.entry_point {
            Some(entry) => options.extension_with_entrypoint(self.path.clone(), entry.clone()),
            None => options.extension(self.path.clone()),
        }
    }

    async fn probe(&self, conn: &mut SqliteConnection) -> Result<(), String> {
        let create = format!(
            "CREATE VIRTUAL TABLE temp.ann_probe USING {}(v float[1])",
            self.module
        );
        sqlx::query(&create)
            .execute(&mut *conn)
            .await
            .map_err(|e| format!("module {} unusable: {}", self.module, e))?;
        sqlx::query("DROP TABLE temp.ann_probe")
            .execute(&mut *conn)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn create_table_sql(&self, table: &str, column: &str, dims: usize, encoding: AnnEncoding) -> String {
        format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING {}({} {}[{}])",
            table,
            self.module,
            column,
            encoding.column_type(),
            dims
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_requires_enabled_and_path() {
        let mut config = AnnConfig::default();
        assert!(LoadableExtension::from_config(&config).is_none());
        config.enabled = true;
        assert!(LoadableExtension::from_config(&config).is_none());
        config.extension = Some("/opt/vec0".into());
        let ext = LoadableExtension::from_config(&config).unwrap();
        assert_eq!(ext.name(), "vec0");
    }

    #[test]
    fn test_vec0_table_sql() {
        let ext = LoadableExtension {
            path: "vec0".into(),
            entry_point: None,
            module: "vec0".into(),
        };
        assert_eq!(
            ext.create_table_sql("dense_vectors_ann", "embedding", 384, AnnEncoding::Float32),
            "CREATE VIRTUAL TABLE IF NOT EXISTS dense_vectors_ann USING vec0(embedding float[384])"
        );
    }
}
