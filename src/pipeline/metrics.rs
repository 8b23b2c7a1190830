//! Per-run counters.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Counters for one refresh run.
#[derive(Debug, Default)]
pub struct RunMetrics {
    /// Chunks read from the source
    pub chunks_processed: AtomicU64,

    /// Rows read from the source
    pub rows_processed: AtomicU64,

    /// Part files written
    pub parts_written: AtomicU64,

    /// Bytes written to part files
    pub bytes_written: AtomicU64,

    /// Time spent in part writes and the merge (microseconds)
    pub snapshot_io_us: AtomicU64,

    start_time: Option<Instant>,
}

impl RunMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    /// Record a chunk of `rows` rows.
    pub fn add_chunk(&self, rows: u64) {
        self.chunks_processed.fetch_add(1, Ordering::Relaxed);
        self.rows_processed.fetch_add(rows, Ordering::Relaxed);
    }

    /// Record a part file of `bytes` bytes.
    pub fn add_part(&self, bytes: u64) {
        self.parts_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_snapshot_io_time(&self, duration: Duration) {
        self.snapshot_io_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    pub fn rows_per_second(&self) -> f64 {
        let rows = self.rows_processed.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            rows as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> RunMetricsSnapshot {
        RunMetricsSnapshot {
            chunks_processed: self.chunks_processed.load(Ordering::Relaxed),
            rows_processed: self.rows_processed.load(Ordering::Relaxed),
            parts_written: self.parts_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            snapshot_io_secs: self.snapshot_io_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            elapsed: self.elapsed(),
            rows_per_second: self.rows_per_second(),
        }
    }
}

/// Point-in-time copy of [`RunMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct RunMetricsSnapshot {
    pub chunks_processed: u64,
    pub rows_processed: u64,
    pub parts_written: u64,
    pub bytes_written: u64,
    pub snapshot_io_secs: f64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub rows_per_second: f64,
}

impl std::fmt::Display for RunMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Chunks: {} | Rows: {} @ {:.0} rows/s | Parts: {} ({:.2} MB) | \
             Snapshot I/O: {:.2}s | Elapsed: {:.1}s",
            self.chunks_processed,
            self.rows_processed,
            self.rows_per_second,
            self.parts_written,
            self.bytes_written as f64 / (1024.0 * 1024.0),
            self.snapshot_io_secs,
            self.elapsed.as_secs_f64(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = RunMetrics::new();

        metrics.add_chunk(100);
        metrics.add_chunk(50);
        metrics.add_part(2048);
        metrics.add_snapshot_io_time(Duration::from_millis(250));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.chunks_processed, 2);
        assert_eq!(snapshot.rows_processed, 150);
        assert_eq!(snapshot.parts_written, 1);
        assert_eq!(snapshot.bytes_written, 2048);
        assert!((snapshot.snapshot_io_secs - 0.25).abs() < 0.001);
    }

    #[test]
    fn test_zero_elapsed_no_panic() {
        let metrics = RunMetrics::default();
        metrics.add_chunk(10);
        assert_eq!(metrics.rows_per_second(), 0.0);
    }

    #[test]
    fn test_display_and_json() {
        let snapshot = RunMetricsSnapshot {
            chunks_processed: 3,
            rows_processed: 60_000,
            parts_written: 3,
            bytes_written: 3 * 1024 * 1024,
            snapshot_io_secs: 1.5,
            elapsed: Duration::from_secs(4),
            rows_per_second: 15_000.0,
        };

        let display = snapshot.to_string();
        assert!(display.contains("Chunks: 3"));
        assert!(display.contains("Rows: 60000 @ 15000 rows/s"));
        assert!(display.contains("3.00 MB"));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["elapsed"], 4.0);
    }
}
