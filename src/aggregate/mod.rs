//! Incremental accumulators.
//!
//! Each accumulator folds one normalized chunk into running state. All state
//! is created fresh per run; only the [`LastProductIndex`] may be seeded from
//! a previous run.

mod journey;

pub use journey::{JourneyGraph, LastProductIndex};

use crate::model::{JourneyEdge, KeyTotal, Overview};
use crate::source::RecordChunk;
use indexmap::IndexMap;

/// Row count and revenue sum.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Totals {
    pub rows: u64,
    pub revenue: f64,
}

impl Totals {
    pub fn absorb(&mut self, chunk: &RecordChunk) {
        self.rows += chunk.len() as u64;
        if chunk.columns.amount {
            self.revenue += chunk.records.iter().map(|r| r.amount).sum::<f64>();
        }
    }

    pub fn overview(&self) -> Overview {
        Overview {
            total_revenue: self.revenue,
            total_orders: self.rows,
        }
    }
}

/// Key-wise sums in order of first appearance.
#[derive(Debug, Clone, Default)]
pub struct GroupSums {
    sums: IndexMap<String, f64>,
}

impl GroupSums {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a chunk's partial sums (`acc[k] += v`).
    pub fn merge<'a>(&mut self, partial: impl IntoIterator<Item = (&'a str, f64)>) {
        for (key, value) in partial {
            match self.sums.get_mut(key) {
                Some(sum) => *sum += value,
                None => {
                    self.sums.insert(key.to_string(), value);
                }
            }
        }
    }

    /// Revenue per category. Needs the amount and category columns; rows
    /// without a category are skipped.
    pub fn absorb_categories(&mut self, chunk: &RecordChunk) {
        if !(chunk.columns.amount && chunk.columns.category) {
            return;
        }
        let partial = chunk
            .records
            .iter()
            .filter_map(|r| r.category.as_deref().map(|c| (c, r.amount)));
        self.merge(partial);
    }

    /// Revenue per year-month. Needs the amount and payment date columns;
    /// rows without a timestamp land under "unknown".
    pub fn absorb_months(&mut self, chunk: &RecordChunk) {
        if !(chunk.columns.amount && chunk.columns.payment_date) {
            return;
        }
        let keys: Vec<(String, f64)> = chunk.records.iter().map(|r| (r.month_key(), r.amount)).collect();
        self.merge(keys.iter().map(|(k, v)| (k.as_str(), *v)));
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.sums.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.sums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }

    pub fn into_totals(self) -> Vec<KeyTotal> {
        self.sums
            .into_iter()
            .map(|(key, value)| KeyTotal { key, value })
            .collect()
    }
}

/// Everything a completed run publishes.
#[derive(Debug, Clone, Default)]
pub struct AnalyticsResults {
    pub overview: Overview,
    pub by_category: Vec<KeyTotal>,
    pub monthly: Vec<KeyTotal>,
    pub edges: Vec<JourneyEdge>,
    pub last_products: LastProductIndex,
}

/// All accumulators of one run.
#[derive(Debug, Default)]
pub struct RunAccumulator {
    totals: Totals,
    categories: GroupSums,
    months: GroupSums,
    journeys: JourneyGraph,
    last_products: LastProductIndex,
}

impl RunAccumulator {
    /// Start a run, optionally continuing journeys from a previous index.
    pub fn new(seed: LastProductIndex) -> Self {
        Self {
            last_products: seed,
            ..Default::default()
        }
    }

    pub fn absorb(&mut self, chunk: &RecordChunk) {
        self.totals.absorb(chunk);
        self.categories.absorb_categories(chunk);
        self.months.absorb_months(chunk);
        self.journeys.absorb(chunk, &mut self.last_products);
    }

    pub fn totals(&self) -> Totals {
        self.totals
    }

    pub fn finish(self) -> AnalyticsResults {
        AnalyticsResults {
            overview: self.totals.overview(),
            by_category: self.categories.into_totals(),
            monthly: self.months.into_totals(),
            edges: self.journeys.into_edges(),
            last_products: self.last_products,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ColumnSet, Record};
    use chrono::NaiveDate;

    fn record(email: &str, product: &str, category: Option<&str>, amount: f64, day: Option<u32>) -> Record {
        Record {
            email: Some(email.into()),
            product: Some(product.into()),
            category: category.map(Into::into),
            amount,
            payment_date: day
                .and_then(|d| NaiveDate::from_ymd_opt(2024, 1 + (d - 1) / 28, 1 + (d - 1) % 28))
                .and_then(|d| d.and_hms_opt(12, 0, 0)),
            ..Default::default()
        }
    }

    fn dataset() -> Vec<Record> {
        vec![
            record("a@x.com", "P1", Some("Books"), 10.0, Some(1)),
            record("b@x.com", "P2", Some("Games"), 5.5, Some(3)),
            record("a@x.com", "P2", None, 4.0, Some(10)),
            record("c@x.com", "P1", Some("Books"), 7.25, None),
            record("b@x.com", "P3", Some("Games"), 1.0, Some(31)),
            record("a@x.com", "P3", Some("Toys"), 2.0, Some(40)),
            record("b@x.com", "P1", Some("Books"), 0.0, Some(45)),
        ]
    }

    fn run(chunks: &[&[Record]]) -> AnalyticsResults {
        let mut acc = RunAccumulator::new(LastProductIndex::default());
        for records in chunks {
            acc.absorb(&RecordChunk {
                columns: ColumnSet::all(),
                records: records.to_vec(),
            });
        }
        acc.finish()
    }

    fn sorted(mut totals: Vec<KeyTotal>) -> Vec<KeyTotal> {
        totals.sort_by(|a, b| a.key.cmp(&b.key));
        totals
    }

    fn sorted_edges(mut edges: Vec<JourneyEdge>) -> Vec<JourneyEdge> {
        edges.sort_by(|a, b| (&a.source, &a.target).cmp(&(&b.source, &b.target)));
        edges
    }

    #[test]
    fn test_rechunking_invariance() {
        let rows = dataset();
        let whole = run(&[&rows]);

        for size in 1..rows.len() {
            let chunks: Vec<&[Record]> = rows.chunks(size).collect();
            let split = run(&chunks);

            assert_eq!(split.overview, whole.overview, "chunk size {}", size);
            assert_eq!(sorted(split.by_category.clone()), sorted(whole.by_category.clone()));
            assert_eq!(sorted(split.monthly.clone()), sorted(whole.monthly.clone()));
            assert_eq!(sorted_edges(split.edges), sorted_edges(whole.edges.clone()));
        }

        assert_eq!(whole.overview.total_orders, 7);
        assert_eq!(whole.overview.total_revenue, 29.75);
    }

    #[test]
    fn test_group_sums_commutative() {
        let rows = dataset();
        let (left, right) = rows.split_at(3);

        let forward = run(&[left, right]);
        let backward = run(&[right, left]);

        assert_eq!(sorted(forward.by_category), sorted(backward.by_category));
        assert_eq!(sorted(forward.monthly), sorted(backward.monthly));
        assert_eq!(forward.overview, backward.overview);
    }

    #[test]
    fn test_group_keys_in_first_appearance_order() {
        let results = run(&[&dataset()]);

        let categories: Vec<_> = results.by_category.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(categories, vec!["Books", "Games", "Toys"]);
        assert_eq!(results.by_category[0].value, 17.25);

        let months: Vec<_> = results.monthly.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(months, vec!["2024-01", "unknown", "2024-02"]);
        assert_eq!(results.monthly[1].value, 7.25);
    }

    #[test]
    fn test_missing_columns_only_affect_their_aggregate() {
        let mut acc = RunAccumulator::new(LastProductIndex::default());
        let mut columns = ColumnSet::all();
        columns.category = false;
        columns.payment_date = false;

        acc.absorb(&RecordChunk {
            columns,
            records: dataset(),
        });
        let results = acc.finish();

        assert_eq!(results.overview.total_orders, 7);
        assert!(results.by_category.is_empty());
        assert!(results.monthly.is_empty());
        assert!(!results.edges.is_empty());
    }

    #[test]
    fn test_amount_column_absent() {
        let mut totals = Totals::default();
        let mut columns = ColumnSet::all();
        columns.amount = false;

        totals.absorb(&RecordChunk {
            columns,
            records: dataset(),
        });

        assert_eq!(totals.rows, 7);
        assert_eq!(totals.revenue, 0.0);
    }

    #[test]
    fn test_seeded_run_continues_journey() {
        let mut seed = LastProductIndex::default();
        seed.record("a@x.com", "P9");

        let mut acc = RunAccumulator::new(seed);
        acc.absorb(&RecordChunk {
            columns: ColumnSet::all(),
            records: vec![record("a@x.com", "P1", None, 1.0, Some(1))],
        });
        let results = acc.finish();

        assert_eq!(
            results.edges,
            vec![JourneyEdge {
                source: "P9".into(),
                target: "P1".into(),
                value: 1
            }]
        );
        assert_eq!(results.last_products.get("a@x.com"), Some("P1"));
    }
}
