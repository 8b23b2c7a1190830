//! In-memory table, used by tests and local demos.

use super::normalize::{coerce_timestamp, normalize_chunk, payment_date_column};
use super::{ChunkReader, ChunkSource, RawChunk, Record};
use crate::error::{ConfigError, PipelineError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A table held in memory. Rows are streamed in stored order.
#[derive(Debug, Clone)]
pub struct MemorySource {
    table: String,
    columns: Vec<String>,
    rows: Arc<Vec<Vec<Option<String>>>>,
    exists: bool,
    fail_after_chunks: Option<usize>,
    opens: Arc<AtomicUsize>,
}

impl MemorySource {
    /// Create a table from raw column names and text cells.
    pub fn new<C, R>(columns: C, rows: R) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
        R: IntoIterator<Item = Vec<Option<String>>>,
    {
        Self {
            table: "memory".to_string(),
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Arc::new(rows.into_iter().collect()),
            exists: true,
            fail_after_chunks: None,
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A table name that cannot be resolved.
    pub fn missing(table: &str) -> Self {
        let mut source = Self::new(Vec::<String>::new(), Vec::new());
        source.table = table.to_string();
        source.exists = false;
        source
    }

    /// Emit a read error after this many chunks have been delivered.
    pub fn failing_after(mut self, chunks: usize) -> Self {
        self.fail_after_chunks = Some(chunks);
        self
    }

    /// Number of times the source was opened.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn resolve(&self) -> Result<()> {
        if self.exists {
            Ok(())
        } else {
            Err(ConfigError::TableNotFound(self.table.clone()).into())
        }
    }
}

impl ChunkSource for MemorySource {
    async fn open(&self, chunk_size: usize) -> Result<ChunkReader> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.resolve()?;

        let chunk_size = chunk_size.max(1);
        let mut batches: Vec<Result<RawChunk>> = self
            .rows
            .chunks(chunk_size)
            .map(|rows| {
                Ok(RawChunk {
                    columns: self.columns.clone(),
                    rows: rows.to_vec(),
                })
            })
            .collect();

        if let Some(limit) = self.fail_after_chunks {
            batches.truncate(limit);
            batches.push(Err(PipelineError::SourceRead(format!(
                "injected failure after {} chunks",
                limit
            ))));
        }

        let (tx, rx) = mpsc::channel(batches.len().max(1));
        for batch in batches {
            // Capacity covers every batch, so this never blocks
            let _ = tx.try_send(batch);
        }

        Ok(ChunkReader::new(rx))
    }

    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<Record>> {
        self.resolve()?;

        let mut rows: Vec<&Vec<Option<String>>> = self.rows.iter().collect();
        if let Some(column) = payment_date_column(&self.columns) {
            let idx = self.columns.iter().position(|c| c == column);
            let key = |row: &Vec<Option<String>>| {
                coerce_timestamp(idx.and_then(|i| row.get(i)).and_then(|v| v.as_deref()))
            };
            // Newest first, missing timestamps last
            rows.sort_by(|a, b| match (key(*a), key(*b)) {
                (Some(x), Some(y)) => y.cmp(&x),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            });
        }

        let page = RawChunk {
            columns: self.columns.clone(),
            rows: rows.into_iter().skip(offset).take(limit).cloned().collect(),
        };
        Ok(normalize_chunk(&page).records)
    }
}
