//! Build statistics and aggregated warnings.
//!
//! Warnings are keyed by category and surfaced once per category, no matter
//! how many rows trigger them. Every warning is also emitted through
//! `tracing::warn!` the first time its category is seen.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Category of a non-fatal condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    VectorClamp,
    VocabGrowthSkipped,
    AnnUnavailable,
    AnnEncodingMismatch,
    ManifestConflict,
    TokenRebuild,
    PostCommit,
}

/// Collects soft warnings, at most one message per [`WarningKind`].
#[derive(Debug, Default, Clone)]
pub struct WarningLog {
    entries: BTreeMap<WarningKind, String>,
}

impl WarningLog {
    /// Record a warning. Returns `false` (and logs nothing) if a warning of
    /// the same kind was already recorded.
    pub fn warn_once(&mut self, kind: WarningKind, message: impl Into<String>) -> bool {
        if self.entries.contains_key(&kind) {
            return false;
        }
        let message = message.into();
        tracing::warn!(kind = ?kind, "{}", message);
        self.entries.insert(kind, message);
        true
    }

    /// Record a warning, replacing any earlier message of the same kind.
    /// Used for summary warnings computed at the end of a phase.
    pub fn set(&mut self, kind: WarningKind, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(kind = ?kind, "{}", message);
        self.entries.insert(kind, message);
    }

    pub fn contains(&self, kind: WarningKind) -> bool {
        self.entries.contains_key(&kind)
    }

    pub fn get(&self, kind: WarningKind) -> Option<&str> {
        self.entries.get(&kind).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.entries.values().cloned().collect()
    }

    pub fn extend(&mut self, other: WarningLog) {
        for (kind, message) in other.entries {
            self.entries.entry(kind).or_insert(message);
        }
    }
}

/// Rows written and time spent for one table.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TableStats {
    pub rows: u64,
    pub elapsed_ms: u64,
}

/// Counters gathered over a single build or update.
#[derive(Debug, Default, Clone, Serialize)]
pub struct BuildStats {
    pub batch_size: usize,
    pub tables: BTreeMap<String, TableStats>,
    pub batches: BTreeMap<String, u64>,
    pub transactions: TransactionStats,
    pub token_source: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct TransactionStats {
    pub begin: u64,
    pub commit: u64,
    pub rollback: u64,
}

impl BuildStats {
    pub fn record_table(&mut self, table: &str, rows: u64, elapsed: Duration) {
        let entry = self.tables.entry(table.to_string()).or_default();
        entry.rows += rows;
        entry.elapsed_ms += elapsed.as_millis() as u64;
    }

    pub fn record_batch(&mut self, name: &str) {
        *self.batches.entry(name.to_string()).or_default() += 1;
    }

    pub fn rows(&self, table: &str) -> u64 {
        self.tables.get(table).map(|t| t.rows).unwrap_or(0)
    }
}
