//! Vocabulary id allocation for token, phrase and chargram tables.
//!
//! [`ensure_vocab_ids`] maps terms to stable, mode-scoped integer ids. Known
//! terms keep their ids; unknown terms get fresh ids starting at
//! `max(id) + 1`, assigned in sorted term order so the result does not
//! depend on input order.
//!
//! When the table already holds entries, an optional [`GrowthLimits`] guard
//! refuses allocations that would grow the vocabulary too fast. A refused
//! allocation is an ordinary outcome, reported through
//! [`VocabAllocation::skipped`], and writes nothing.

use anyhow::Result;
use serde::Deserialize;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use std::collections::{BTreeSet, HashMap};

/// Max bound parameters per lookup or insert statement.
const LOOKUP_CHUNK: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VocabKind {
    Token,
    Phrase,
    Chargram,
}

impl VocabKind {
    pub fn table(&self) -> &'static str {
        match self {
            VocabKind::Token => "token_vocab",
            VocabKind::Phrase => "phrase_vocab",
            VocabKind::Chargram => "chargram_vocab",
        }
    }

    pub fn postings_table(&self) -> &'static str {
        match self {
            VocabKind::Token => "token_postings",
            VocabKind::Phrase => "phrase_postings",
            VocabKind::Chargram => "chargram_postings",
        }
    }

    pub fn id_column(&self) -> &'static str {
        match self {
            VocabKind::Token => "token_id",
            VocabKind::Phrase => "phrase_id",
            VocabKind::Chargram => "gram_id",
        }
    }

    pub fn term_column(&self) -> &'static str {
        match self {
            VocabKind::Token => "token",
            VocabKind::Phrase => "ngram",
            VocabKind::Chargram => "gram",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            VocabKind::Token => "token",
            VocabKind::Phrase => "phrase",
            VocabKind::Chargram => "chargram",
        }
    }

    pub fn default_limits(&self) -> GrowthLimits {
        match self {
            VocabKind::Token => GrowthLimits::new(0.4, 200_000),
            VocabKind::Phrase => GrowthLimits::new(0.5, 150_000),
            VocabKind::Chargram => GrowthLimits::new(1.0, 250_000),
        }
    }
}

/// Caps on how many new terms one allocation may add to a non-empty table.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Default)]
pub struct GrowthLimits {
    /// Max `missing / existing` ratio.
    #[serde(default)]
    pub ratio: Option<f64>,
    /// Max count of missing terms.
    #[serde(default)]
    pub absolute: Option<usize>,
}

impl GrowthLimits {
    pub fn new(ratio: f64, absolute: usize) -> Self {
        Self {
            ratio: Some(ratio),
            absolute: Some(absolute),
        }
    }

    /// Reason to refuse adding `missing` terms to a table of `existing`
    /// entries, if any.
    pub fn check(&self, missing: usize, existing: usize) -> Option<String> {
        if existing == 0 || missing == 0 {
            return None;
        }
        let ratio = missing as f64 / existing as f64;
        if let Some(limit) = self.ratio {
            if ratio > limit {
                return Some(format!(
                    "growth ratio {:.3} exceeds limit {} ({} new vs {} existing)",
                    ratio, limit, missing, existing
                ));
            }
        }
        if let Some(limit) = self.absolute {
            if missing > limit {
                return Some(format!(
                    "{} new terms exceeds absolute limit {}",
                    missing, limit
                ));
            }
        }
        None
    }
}

/// Outcome of [`ensure_vocab_ids`].
#[derive(Debug, Default, Clone)]
pub struct VocabAllocation {
    /// Term to id, for every term that has an id after the call.
    pub map: HashMap<String, i64>,
    pub inserted: usize,
    pub skipped: Option<String>,
}

impl VocabAllocation {
    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }
}

/// Look up or allocate ids for `terms` in the `kind` vocabulary of `mode`.
pub async fn ensure_vocab_ids(
    conn: &mut SqliteConnection,
    mode: &str,
    kind: VocabKind,
    terms: &[String],
    limits: Option<&GrowthLimits>,
) -> Result<VocabAllocation> {
    let unique: BTreeSet<&str> = terms.iter().map(String::as_str).collect();
    let mut allocation = VocabAllocation::default();
    if unique.is_empty() {
        return Ok(allocation);
    }

    let requested: Vec<&str> = unique.iter().copied().collect();
    for chunk in requested.chunks(LOOKUP_CHUNK) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {term}, {id} FROM {table} WHERE mode = ",
            term = kind.term_column(),
            id = kind.id_column(),
            table = kind.table()
        ));
        qb.push_bind(mode);
        qb.push(format!(" AND {} IN (", kind.term_column()));
        let mut separated = qb.separated(", ");
        for term in chunk {
            separated.push_bind(*term);
        }
        separated.push_unseparated(")");
        for row in qb.build().fetch_all(&mut *conn).await? {
            let term: String = row.get(0);
            let id: i64 = row.get(1);
            allocation.map.insert(term, id);
        }
    }

    // BTreeSet iteration keeps the missing terms sorted.
    let missing: Vec<&str> = requested
        .iter()
        .copied()
        .filter(|t| !allocation.map.contains_key(*t))
        .collect();
    if missing.is_empty() {
        return Ok(allocation);
    }

    let (existing, max_id): (i64, Option<i64>) = sqlx::query_as(&format!(
        "SELECT COUNT(*), MAX({id}) FROM {table} WHERE mode = ?",
        id = kind.id_column(),
        table = kind.table()
    ))
    .bind(mode)
    .fetch_one(&mut *conn)
    .await?;

    if let Some(limits) = limits {
        if let Some(reason) = limits.check(missing.len(), existing as usize) {
            allocation.skipped = Some(format!("{} vocab for {}: {}", kind.label(), mode, reason));
            return Ok(allocation);
        }
    }

    let mut next_id = max_id.map(|m| m + 1).unwrap_or(0);
    let mut assigned = Vec::with_capacity(missing.len());
    for term in &missing {
        assigned.push((*term, next_id));
        next_id += 1;
    }

    for chunk in assigned.chunks(LOOKUP_CHUNK / 3) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "INSERT INTO {table} (mode, {id}, {term}) ",
            table = kind.table(),
            id = kind.id_column(),
            term = kind.term_column()
        ));
        qb.push_values(chunk, |mut b, (term, id)| {
            b.push_bind(mode).push_bind(*id).push_bind(*term);
        });
        qb.build().execute(&mut *conn).await?;
    }

    allocation.inserted = assigned.len();
    for (term, id) in assigned {
        allocation.map.insert(term.to_string(), id);
    }
    Ok(allocation)
}
