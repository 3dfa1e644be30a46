//! Store summary for `idx-sqlite inspect`.
//!
//! Row counts per table for one mode, plus what `index_meta` says about
//! the last build. Read-only.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use crate::db;
use crate::migrate;

/// Tables reported by `inspect`, in display order.
const INSPECTED_TABLES: &[&str] = &[
    "chunks",
    "token_vocab",
    "token_postings",
    "doc_lengths",
    "phrase_vocab",
    "phrase_postings",
    "chargram_vocab",
    "chargram_postings",
    "minhash_signatures",
    "dense_vectors",
    "file_manifest",
];

#[derive(Debug, Clone, Serialize)]
pub struct StoreSummary {
    pub size_bytes: u64,
    pub schema_version: i64,
    pub build_kind: Option<String>,
    pub built_at: Option<i64>,
    pub dense_dims: Option<i64>,
    pub avg_doc_len: Option<f64>,
    pub total_docs: Option<i64>,
    /// `(table, rows)`; tables absent from the store are left out.
    pub tables: Vec<(String, i64)>,
}

pub async fn inspect_store(path: &Path, mode: &str) -> Result<StoreSummary> {
    let mut conn = db::open_existing(path).await?;

    let schema_version = migrate::schema_version(&mut conn).await?;
    let mut tables = Vec::new();
    for table in INSPECTED_TABLES {
        if !migrate::table_exists(&mut conn, table).await? {
            continue;
        }
        let rows: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {} WHERE mode = ?", table))
            .bind(mode)
            .fetch_one(&mut conn)
            .await?;
        tables.push((table.to_string(), rows));
    }

    let meta: Option<(String, i64)> = if migrate::table_exists(&mut conn, "index_meta").await? {
        sqlx::query_as("SELECT build_kind, built_at FROM index_meta WHERE mode = ?")
            .bind(mode)
            .fetch_optional(&mut conn)
            .await?
    } else {
        None
    };
    let dense_dims: Option<i64> = if migrate::table_exists(&mut conn, "dense_meta").await? {
        sqlx::query_scalar("SELECT dims FROM dense_meta WHERE mode = ?")
            .bind(mode)
            .fetch_optional(&mut conn)
            .await?
            .flatten()
    } else {
        None
    };
    let token_stats: Option<(Option<f64>, Option<i64>)> = if migrate::table_exists(&mut conn, "token_stats").await? {
        sqlx::query_as("SELECT avg_doc_len, total_docs FROM token_stats WHERE mode = ?")
            .bind(mode)
            .fetch_optional(&mut conn)
            .await?
    } else {
        None
    };
    db::close_quietly(conn).await;

    let (build_kind, built_at) = match meta {
        Some((kind, at)) => (Some(kind), Some(at)),
        None => (None, None),
    };
    let (avg_doc_len, total_docs) = token_stats.unwrap_or((None, None));

    Ok(StoreSummary {
        size_bytes: std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
        schema_version,
        build_kind,
        built_at,
        dense_dims,
        avg_doc_len,
        total_docs,
        tables,
    })
}

/// Print the summary in the CLI's `key: value` layout.
pub fn print_summary(path: &Path, mode: &str, summary: &StoreSummary) {
    println!("inspect {}", mode);
    println!("  database: {}", path.display());
    println!("  size: {}", format_bytes(summary.size_bytes));
    println!("  schema version: {}", summary.schema_version);
    match (&summary.build_kind, summary.built_at) {
        (Some(kind), Some(at)) => println!("  last build: {} ({})", kind, format_ts_relative(at)),
        _ => println!("  last build: never"),
    }
    if let Some(dims) = summary.dense_dims {
        println!("  dense dims: {}", dims);
    }
    if let (Some(avg), Some(total)) = (summary.avg_doc_len, summary.total_docs) {
        println!("  docs: {} (avg length {:.1})", total, avg);
    }
    println!();
    println!("  {:<22} {:>10}", "TABLE", "ROWS");
    println!("  {}", "-".repeat(33));
    for (table, rows) in &summary.tables {
        println!("  {:<22} {:>10}", table, rows);
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    match delta {
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => format!("{} min ago", d / 60),
        d if d < 86400 => format!("{} h ago", d / 3600),
        d if d < 86400 * 30 => format!("{} d ago", d / 86400),
        _ => format_ts_iso(ts),
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_relative_time() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 h ago");
    }
}
