//! End-to-end runs of the orchestrator against in-memory sources.
//!
//! Tests cover:
//! 1. Full run: aggregates, snapshot contents and status
//! 2. Journey stitching across chunk boundaries and chunk sizes
//! 3. Failure handling: restored status, untouched snapshot, cleaned parts
//! 4. Run guard against overlapping runs
//! 5. Cross-run carry-over of the last product index
//! 6. Snapshot publication failures and panicking runs

use crate::cache::AnalyticsCache;
use crate::config::Config;
use crate::error::{ConfigError, PipelineError, Result};
use crate::model::{JourneyEdge, RunStatus};
use crate::pipeline::Orchestrator;
use crate::snapshot;
use crate::source::{ChunkReader, ChunkSource, MemorySource, Record};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Notify;

const COLUMNS: [&str; 5] = ["Email", "Product", "Category", "Amount", "Payment Date"];

fn row(email: &str, product: &str, category: &str, amount: &str, date: &str) -> Vec<Option<String>> {
    [email, product, category, amount, date]
        .iter()
        .map(|v| (!v.is_empty()).then(|| v.to_string()))
        .collect()
}

fn sales() -> Vec<Vec<Option<String>>> {
    vec![
        row("A@x.com", "P1", "Books", "10", "2024-01-03 09:00:00"),
        row("b@x.com", "P2", "Games", "bad", "2024-01-05"),
        row("a@x.com", "P2", "Games", "4.5", "2024-02-01"),
        row("c@x.com", "P3", "", "", ""),
        row("b@x.com", "P1", "Books", "2.5", "2024-02-10"),
    ]
}

fn test_dir(name: &str) -> PathBuf {
    let dir = PathBuf::from(format!("target/test-orchestrator-{}", name));
    if dir.exists() {
        std::fs::remove_dir_all(&dir).unwrap();
    }
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn config(dir: &Path, chunk_size: usize) -> Arc<Config> {
    let mut config = Config::default();
    config.snapshot.path = dir.join("customer_journey.parquet");
    config.source.chunk_size = chunk_size;
    Arc::new(config)
}

fn orchestrator<S: ChunkSource>(source: S, cache: &AnalyticsCache, config: Arc<Config>) -> Orchestrator<S> {
    Orchestrator::new(Arc::new(source), cache.clone(), config)
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn edge(source: &str, target: &str, value: u64) -> (String, String, u64) {
    (source.to_string(), target.to_string(), value)
}

fn sorted_edges(edges: &[JourneyEdge]) -> Vec<(String, String, u64)> {
    let mut edges: Vec<_> = edges
        .iter()
        .map(|e| (e.source.clone(), e.target.clone(), e.value))
        .collect();
    edges.sort();
    edges
}

/// Test 1: A full run publishes every aggregate and a complete snapshot
#[tokio::test]
async fn test_full_run_publishes_everything() {
    let dir = test_dir("full");
    let cache = AnalyticsCache::new();
    let orchestrator = orchestrator(MemorySource::new(COLUMNS, sales()), &cache, config(&dir, 2));

    let summary = orchestrator.load_and_snapshot().await.unwrap();

    assert_eq!(summary.rows, 5);
    assert_eq!(summary.total_revenue, 17.0);
    assert_eq!(summary.metrics.chunks_processed, 3);
    assert_eq!(summary.metrics.parts_written, 3);
    assert_eq!(summary.snapshot, Some(dir.join("customer_journey.parquet")));

    assert_eq!(cache.status(), RunStatus::ready());
    assert_eq!(cache.snapshot_path(), summary.snapshot);

    let overview = cache.overview().unwrap();
    assert_eq!(overview.total_orders, 5);
    assert_eq!(overview.total_revenue, 17.0);

    let categories = cache.revenue_by_category().unwrap();
    let categories: Vec<_> = categories.iter().map(|t| (t.key.as_str(), t.value)).collect();
    assert_eq!(categories, vec![("Books", 12.5), ("Games", 4.5)]);

    let months = cache.monthly_revenue().unwrap();
    let months: Vec<_> = months.iter().map(|t| (t.key.as_str(), t.value)).collect();
    assert_eq!(months, vec![("2024-01", 10.0), ("2024-02", 7.0), ("unknown", 0.0)]);

    // Emails are lowercased before grouping
    let edges = cache.journey_edges().unwrap();
    assert_eq!(
        sorted_edges(&edges),
        vec![edge("P1", "P2", 1), edge("P2", "P1", 1)]
    );
    assert_eq!(cache.last_products().unwrap().get("a@x.com"), Some("P2"));

    // Snapshot holds every row in source order; part files are gone
    let records: Vec<Record> = snapshot::read_all(&dir.join("customer_journey.parquet")).unwrap();
    assert_eq!(records.len(), 5);
    assert_eq!(records[0].email.as_deref(), Some("a@x.com"));
    assert_eq!(records[1].amount, 0.0);
    assert_eq!(records[3].payment_date, None);
    assert_eq!(files_in(&dir), vec!["customer_journey.parquet".to_string()]);
}

/// Test 2: The three-chunk journey scenario through the whole pipeline
#[tokio::test]
async fn test_journey_stitched_across_chunks() {
    let dir = test_dir("stitch");
    let cache = AnalyticsCache::new();
    let rows = (1..=5)
        .map(|i| row("a@x.com", &format!("P{}", i), "Books", "1", &format!("2024-03-0{}", i)))
        .collect::<Vec<_>>();
    let orchestrator = orchestrator(MemorySource::new(COLUMNS, rows), &cache, config(&dir, 2));

    orchestrator.load_and_snapshot().await.unwrap();

    let edges = cache.journey_edges().unwrap();
    let pairs: Vec<_> = edges
        .iter()
        .map(|e| (e.source.as_str(), e.target.as_str(), e.value))
        .collect();
    assert_eq!(
        pairs,
        vec![("P1", "P2", 1), ("P2", "P3", 1), ("P3", "P4", 1), ("P4", "P5", 1)]
    );
    assert_eq!(cache.last_products().unwrap().get("a@x.com"), Some("P5"));
}

/// Test 3: Aggregates do not depend on the chunk size
#[tokio::test]
async fn test_chunk_size_invariance() {
    let mut results = Vec::new();
    for size in [1, 2, 3, 100] {
        let dir = test_dir(&format!("rechunk-{}", size));
        let cache = AnalyticsCache::new();
        let orchestrator = orchestrator(MemorySource::new(COLUMNS, sales()), &cache, config(&dir, size));

        orchestrator.load_and_snapshot().await.unwrap();

        let mut categories: Vec<_> = cache
            .revenue_by_category()
            .unwrap()
            .iter()
            .map(|t| (t.key.clone(), t.value.to_bits()))
            .collect();
        categories.sort();
        results.push((
            cache.overview().unwrap(),
            categories,
            sorted_edges(&cache.journey_edges().unwrap()),
            snapshot::read_all(&dir.join("customer_journey.parquet")).unwrap(),
        ));
    }

    assert!(results.windows(2).all(|w| w[0] == w[1]));
}

/// Test 4: A mid-stream failure keeps the previous dataset authoritative
#[tokio::test]
async fn test_failed_run_restores_previous_state() {
    let dir = test_dir("failure");
    let cache = AnalyticsCache::new();
    let config = config(&dir, 2);

    let good = orchestrator(MemorySource::new(COLUMNS, sales()), &cache, config.clone());
    good.load_and_snapshot().await.unwrap();

    let failing = orchestrator(
        MemorySource::new(COLUMNS, sales()).failing_after(1),
        &cache,
        config.clone(),
    );
    let result = failing.load_and_snapshot().await;

    assert!(matches!(result, Err(PipelineError::SourceRead(_))));
    assert_eq!(cache.status(), RunStatus::ready());
    assert_eq!(cache.overview().unwrap().total_orders, 5);
    assert_eq!(files_in(&dir), vec!["customer_journey.parquet".to_string()]);
    assert_eq!(
        snapshot::read_all(&config.snapshot.path).unwrap().len(),
        5
    );
}

/// Test 5: A missing table fails before any status change sticks
#[tokio::test]
async fn test_missing_table_is_configuration_error() {
    let dir = test_dir("missing");
    let cache = AnalyticsCache::new();
    let orchestrator = orchestrator(MemorySource::missing("nope"), &cache, config(&dir, 2));

    let result = orchestrator.load_and_snapshot().await;

    assert!(matches!(
        result,
        Err(PipelineError::Configuration(ConfigError::TableNotFound(_)))
    ));
    assert_eq!(cache.status(), RunStatus::default());
    assert!(cache.overview().is_none());
    assert!(files_in(&dir).is_empty());
}

/// Test 6: An empty table publishes zero totals and no snapshot
#[tokio::test]
async fn test_empty_source() {
    let dir = test_dir("empty");
    let cache = AnalyticsCache::new();
    let orchestrator = orchestrator(MemorySource::new(COLUMNS, Vec::new()), &cache, config(&dir, 2));

    let summary = orchestrator.load_and_snapshot().await.unwrap();

    assert_eq!(summary.rows, 0);
    assert_eq!(summary.snapshot, None);
    assert!(cache.status().ready);
    assert!(cache.snapshot_path().is_none());
    assert!(cache.journey_edges().unwrap().is_empty());
}

/// Source whose `open` waits for a signal.
struct GatedSource {
    inner: MemorySource,
    gate: Arc<Notify>,
}

impl ChunkSource for GatedSource {
    async fn open(&self, chunk_size: usize) -> Result<ChunkReader> {
        self.gate.notified().await;
        self.inner.open(chunk_size).await
    }

    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<Record>> {
        self.inner.fetch_page(offset, limit).await
    }
}

/// Test 7: A second run is rejected while the first holds the guard
#[tokio::test]
async fn test_overlapping_run_rejected() {
    let dir = test_dir("overlap");
    let cache = AnalyticsCache::new();
    let gate = Arc::new(Notify::new());
    let source = GatedSource {
        inner: MemorySource::new(COLUMNS, sales()),
        gate: gate.clone(),
    };
    let orchestrator = orchestrator(source, &cache, config(&dir, 2));

    let first = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.load_and_snapshot().await })
    };
    while !orchestrator.is_running() {
        tokio::task::yield_now().await;
    }

    let second = orchestrator.load_and_snapshot().await;
    assert!(matches!(second, Err(PipelineError::RunInProgress)));
    assert_eq!(cache.status(), RunStatus::running(0));

    gate.notify_one();
    let summary = first.await.unwrap().unwrap();
    assert_eq!(summary.rows, 5);
    assert!(!orchestrator.is_running());
    assert_eq!(orchestrator.source().inner.opens(), 1);
}

/// Test 8: The last product index links runs only when carry-over is on
#[tokio::test]
async fn test_cross_run_carry_over() {
    let rows = vec![
        row("a@x.com", "P1", "Books", "1", "2024-01-01"),
        row("a@x.com", "P2", "Books", "1", "2024-01-02"),
    ];

    for carry in [true, false] {
        let dir = test_dir(&format!("carry-{}", carry));
        let mut config = Config::default();
        config.snapshot.path = dir.join("customer_journey.parquet");
        config.journey.carry_last_product_across_runs = carry;

        let cache = AnalyticsCache::new();
        let orchestrator = orchestrator(MemorySource::new(COLUMNS, rows.clone()), &cache, Arc::new(config));

        orchestrator.load_and_snapshot().await.unwrap();
        orchestrator.load_and_snapshot().await.unwrap();

        let edges = sorted_edges(&cache.journey_edges().unwrap());
        if carry {
            assert_eq!(
                edges,
                vec![edge("P1", "P2", 1), edge("P2", "P1", 1)]
            );
        } else {
            assert_eq!(edges, vec![edge("P1", "P2", 1)]);
        }
    }
}

/// Test 9: A snapshot that cannot be published keeps the previous run authoritative
#[tokio::test]
async fn test_unpublishable_snapshot_keeps_previous_run() {
    let dir = test_dir("unpublishable");
    let cache = AnalyticsCache::new();
    let good_config = config(&dir, 2);

    let good = orchestrator(MemorySource::new(COLUMNS, sales()), &cache, good_config.clone());
    good.load_and_snapshot().await.unwrap();

    // The second run's target is a non-empty directory: parts can be written
    // but the merged file cannot be renamed over it
    let blocked = dir.join("blocked.parquet");
    std::fs::create_dir_all(&blocked).unwrap();
    std::fs::write(blocked.join("keep"), b"x").unwrap();
    let mut blocked_config = Config::default();
    blocked_config.snapshot.path = blocked.clone();
    blocked_config.source.chunk_size = 2;

    let rows = vec![row("z@x.com", "P9", "Toys", "100", "2024-05-01")];
    let failing = orchestrator(MemorySource::new(COLUMNS, rows), &cache, Arc::new(blocked_config));
    let result = failing.load_and_snapshot().await;

    match result {
        Err(PipelineError::SnapshotIo { path, .. }) => assert_eq!(path, blocked),
        other => panic!("expected a snapshot error, got {:?}", other.map(|s| s.rows)),
    }
    assert_eq!(cache.status(), RunStatus::ready());
    assert_eq!(cache.overview().unwrap().total_orders, 5);
    assert_eq!(cache.overview().unwrap().total_revenue, 17.0);
    assert_eq!(cache.snapshot_path(), Some(good_config.snapshot.path.clone()));
    assert!(!failing.is_running());

    // No part or temp file of the failed run is left behind
    assert_eq!(
        files_in(&dir),
        vec!["blocked.parquet".to_string(), "customer_journey.parquet".to_string()]
    );
    assert_eq!(files_in(&blocked), vec!["keep".to_string()]);
    assert_eq!(snapshot::read_all(&good_config.snapshot.path).unwrap().len(), 5);
}

/// Source that panics when opened.
struct PanickingSource;

impl ChunkSource for PanickingSource {
    async fn open(&self, _chunk_size: usize) -> Result<ChunkReader> {
        panic!("source driver crashed")
    }

    async fn fetch_page(&self, _offset: usize, _limit: usize) -> Result<Vec<Record>> {
        Ok(Vec::new())
    }
}

/// Test 10: A panicking run restores the previous status and releases the guard
#[tokio::test]
async fn test_panicking_run_restores_previous_state() {
    let dir = test_dir("panic");
    let cache = AnalyticsCache::new();
    let config = config(&dir, 2);

    let good = orchestrator(MemorySource::new(COLUMNS, sales()), &cache, config.clone());
    good.load_and_snapshot().await.unwrap();

    let crashing = orchestrator(PanickingSource, &cache, config);
    let handle = {
        let crashing = crashing.clone();
        tokio::spawn(async move { crashing.load_and_snapshot().await })
    };

    let joined = handle.await;
    assert!(joined.unwrap_err().is_panic());
    assert_eq!(cache.status(), RunStatus::ready());
    assert_eq!(cache.overview().unwrap().total_orders, 5);
    assert!(!crashing.is_running());
}

/// Test 11: A permit only runs the orchestrator family that issued it
#[tokio::test]
async fn test_foreign_permit_rejected() {
    let dir = test_dir("permit");
    let cache = AnalyticsCache::new();
    let first = orchestrator(MemorySource::new(COLUMNS, sales()), &cache, config(&dir, 2));
    let second = orchestrator(MemorySource::new(COLUMNS, sales()), &cache, config(&dir, 2));

    let permit = first.try_begin().unwrap();
    assert!(matches!(
        second.run_with(permit).await,
        Err(PipelineError::Worker(_))
    ));
    assert!(!first.is_running());
    assert_eq!(cache.status(), RunStatus::default());
}
