//! Customer product-journey graph.

use crate::model::JourneyEdge;
use crate::source::RecordChunk;
use chrono::NaiveDateTime;
use indexmap::IndexMap;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// Last product seen per customer email.
///
/// Stitches a customer's journey across chunk boundaries, and across runs
/// when carried over through the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastProductIndex {
    by_email: HashMap<String, String>,
}

impl LastProductIndex {
    pub fn record(&mut self, email: impl Into<String>, product: impl Into<String>) {
        self.by_email.insert(email.into(), product.into());
    }

    pub fn get(&self, email: &str) -> Option<&str> {
        self.by_email.get(email).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_email.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_email.is_empty()
    }
}

/// Directed edge counts, in order of first observation.
#[derive(Debug, Clone, Default)]
pub struct JourneyGraph {
    edges: IndexMap<(String, String), u64>,
}

fn by_payment_date(a: &Option<NaiveDateTime>, b: &Option<NaiveDateTime>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

impl JourneyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&mut self, source: &str, target: &str) {
        *self
            .edges
            .entry((source.to_string(), target.to_string()))
            .or_insert(0) += 1;
    }

    /// Add one chunk's transitions and advance `last` to this chunk's last
    /// product per customer.
    ///
    /// Rows are grouped by email and stably sorted by payment date (missing
    /// dates last), so ties keep source order.
    pub fn absorb(&mut self, chunk: &RecordChunk, last: &mut LastProductIndex) {
        if !(chunk.columns.email && chunk.columns.product) {
            return;
        }

        let mut per_customer: BTreeMap<&str, Vec<(Option<NaiveDateTime>, &str)>> = BTreeMap::new();
        for record in &chunk.records {
            if let (Some(email), Some(product)) = (&record.email, &record.product) {
                per_customer
                    .entry(email.as_str())
                    .or_default()
                    .push((record.payment_date, product.as_str()));
            }
        }

        for (email, mut purchases) in per_customer {
            purchases.sort_by(|a, b| by_payment_date(&a.0, &b.0));

            let products: Vec<&str> = purchases.into_iter().map(|(_, p)| p).collect();
            let (Some(first), Some(final_product)) = (products.first(), products.last()) else {
                continue;
            };

            if let Some(previous) = last.get(email) {
                let previous = previous.to_string();
                self.bump(&previous, first);
            }
            for pair in products.windows(2) {
                self.bump(pair[0], pair[1]);
            }

            last.record(email, *final_product);
        }
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Count for a single edge, 0 when never observed.
    pub fn weight(&self, source: &str, target: &str) -> u64 {
        self.edges
            .get(&(source.to_string(), target.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn into_edges(self) -> Vec<JourneyEdge> {
        self.edges
            .into_iter()
            .map(|((source, target), value)| JourneyEdge {
                source,
                target,
                value,
            })
            .collect()
    }
}
