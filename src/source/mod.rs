//! Row-batch sources over the transaction table.
//!
//! A source is opened once per run and hands back a [`ChunkReader`]: a lazy,
//! finite sequence of batches of at most `chunk_size` rows. Batches arrive
//! with raw column names and text values; the reader normalizes both before
//! anything downstream sees them.

mod memory;
pub mod normalize;
mod postgres;

pub use memory::MemorySource;
pub use normalize::{coerce_amount, coerce_timestamp, normalize_column_name};
pub use postgres::PostgresSource;

use crate::error::Result;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::sync::mpsc;

/// Month key used when a record has no usable payment timestamp.
pub const UNKNOWN_MONTH: &str = "unknown";

/// One normalized transaction row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record {
    /// Customer email, trimmed and lowercased
    pub email: Option<String>,
    pub product: Option<String>,
    pub category: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    /// Amount, 0.0 when missing or unparsable
    pub amount: f64,
    pub payment_date: Option<NaiveDateTime>,
}

impl Record {
    /// Year-month key ("YYYY-MM"), or "unknown" without a timestamp.
    pub fn month_key(&self) -> String {
        match self.payment_date {
            Some(ts) => ts.format("%Y-%m").to_string(),
            None => UNKNOWN_MONTH.to_string(),
        }
    }
}

/// Which normalized columns a batch carried.
///
/// Aggregates that need a column skip batches without it, independently of
/// the other aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColumnSet {
    pub email: bool,
    pub product: bool,
    pub category: bool,
    pub name: bool,
    pub phone: bool,
    pub amount: bool,
    pub payment_date: bool,
}

impl ColumnSet {
    /// Every known column present.
    pub const fn all() -> Self {
        Self {
            email: true,
            product: true,
            category: true,
            name: true,
            phone: true,
            amount: true,
            payment_date: true,
        }
    }
}

/// A batch as delivered by the store: raw column names and text cells.
#[derive(Debug, Clone, Default)]
pub struct RawChunk {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl RawChunk {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A normalized batch.
#[derive(Debug, Clone, Default)]
pub struct RecordChunk {
    pub columns: ColumnSet,
    pub records: Vec<Record>,
}

impl RecordChunk {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Receiving end of an opened source.
pub struct ChunkReader {
    rx: mpsc::Receiver<Result<RawChunk>>,
}

impl ChunkReader {
    pub fn new(rx: mpsc::Receiver<Result<RawChunk>>) -> Self {
        Self { rx }
    }

    /// Next normalized batch, `None` once the source is exhausted.
    pub async fn next_chunk(&mut self) -> Option<Result<RecordChunk>> {
        let raw = self.rx.recv().await?;
        Some(raw.map(|raw| normalize::normalize_chunk(&raw)))
    }
}

/// Relational store viewed as a sequence of row batches.
pub trait ChunkSource: Send + Sync + 'static {
    /// Resolve the configured table and start streaming it, ordered by
    /// payment timestamp when that column exists.
    ///
    /// Fails before any batch is produced if the table cannot be resolved.
    fn open(&self, chunk_size: usize) -> impl Future<Output = Result<ChunkReader>> + Send;

    /// One page of rows, newest payment first (rows without a timestamp last).
    fn fetch_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Record>>> + Send;
}
