//! Adaptive batch sizing and row batching.
//!
//! | Input size      | Batch | Row-count hint | Batch |
//! |-----------------|-------|----------------|-------|
//! | < 100MB         | 1000  | < 50k          | 1000  |
//! | 100MB – 500MB   | 700   | 50k – 200k     | 700   |
//! | 500MB – 2000MB  | 400   | 200k – 1M      | 400   |
//! | ≥ 2000MB        | 200   | ≥ 1M           | 200   |
//!
//! The smaller of the two tiers wins, so a row-count hint can only shrink a
//! batch. An explicit override skips the tiers and is clamped to
//! `[MIN_BATCH_SIZE, MAX_BATCH_SIZE]`.

pub const MIN_BATCH_SIZE: usize = 50;
pub const MAX_BATCH_SIZE: usize = 2000;
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Per-row byte budget used to derive the batch byte ceiling.
pub const BYTES_PER_ROW_BUDGET: usize = 4096;

const MB: u64 = 1024 * 1024;

pub fn resolve_batch_size(
    batch_size: Option<usize>,
    input_bytes: Option<u64>,
    row_count: Option<u64>,
) -> usize {
    if let Some(explicit) = batch_size {
        return explicit.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE);
    }

    let by_bytes = match input_bytes {
        Some(b) if b >= 2000 * MB => 200,
        Some(b) if b >= 500 * MB => 400,
        Some(b) if b >= 100 * MB => 700,
        _ => DEFAULT_BATCH_SIZE,
    };
    let by_rows = match row_count {
        Some(r) if r >= 1_000_000 => 200,
        Some(r) if r >= 200_000 => 400,
        Some(r) if r >= 50_000 => 700,
        _ => DEFAULT_BATCH_SIZE,
    };
    by_bytes.min(by_rows).clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE)
}

/// Byte ceiling for one batch at `batch_size` rows.
pub fn max_batch_bytes(batch_size: usize) -> usize {
    batch_size * BYTES_PER_ROW_BUDGET
}

/// Accumulates rows until either the row count or the estimated byte weight
/// reaches its threshold, then hands the full batch back to the caller.
///
/// ```ignore
/// if let Some(batch) = batcher.push(row, weight) {
///     insert_batch(&mut conn, &batch).await?;
/// }
/// ```
#[derive(Debug)]
pub struct Batcher<T> {
    rows: Vec<T>,
    bytes: usize,
    batch_size: usize,
    max_bytes: Option<usize>,
    flushes: u64,
}

impl<T> Batcher<T> {
    /// Flush by row count only.
    pub fn by_rows(batch_size: usize) -> Self {
        Self {
            rows: Vec::with_capacity(batch_size.min(MAX_BATCH_SIZE)),
            bytes: 0,
            batch_size: batch_size.max(1),
            max_bytes: None,
            flushes: 0,
        }
    }

    /// Flush by row count or by `batch_size * 4096` estimated bytes.
    pub fn by_rows_and_bytes(batch_size: usize) -> Self {
        let mut batcher = Self::by_rows(batch_size);
        batcher.max_bytes = Some(max_batch_bytes(batch_size.max(1)));
        batcher
    }

    pub fn push(&mut self, row: T, weight: usize) -> Option<Vec<T>> {
        self.rows.push(row);
        self.bytes += weight;
        let full_rows = self.rows.len() >= self.batch_size;
        let full_bytes = self.max_bytes.is_some_and(|max| self.bytes >= max);
        if full_rows || full_bytes {
            self.take()
        } else {
            None
        }
    }

    /// Remaining rows, if any.
    pub fn finish(&mut self) -> Option<Vec<T>> {
        self.take()
    }

    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    fn take(&mut self) -> Option<Vec<T>> {
        if self.rows.is_empty() {
            return None;
        }
        self.bytes = 0;
        self.flushes += 1;
        Some(std::mem::take(&mut self.rows))
    }
}
