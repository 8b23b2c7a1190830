//! Column-name normalization and cell coercion.
//!
//! Coercion never fails: an unparsable amount becomes 0.0 and an unparsable
//! timestamp becomes null, so one bad row cannot abort a run.

use super::{ColumnSet, RawChunk, Record, RecordChunk};
use chrono::{DateTime, NaiveDate, NaiveDateTime};

/// Trim, replace spaces with underscores, lowercase.
pub fn normalize_column_name(name: &str) -> String {
    name.trim().replace(' ', "_").to_lowercase()
}

/// Parse an amount, defaulting to 0.0.
pub fn coerce_amount(value: Option<&str>) -> f64 {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

/// Parse a timestamp in any of the accepted layouts, `None` otherwise.
///
/// Offsets are converted to UTC and dropped.
pub fn coerce_timestamp(value: Option<&str>) -> Option<NaiveDateTime> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.naive_utc());
    }
    // Postgres timestamptz text output, e.g. "2024-01-05 10:00:00+00"
    if let Ok(ts) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(ts.naive_utc());
    }
    for format in DATETIME_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, format) {
            return Some(ts);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    None
}

fn clean_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn clean_email(value: Option<&str>) -> Option<String> {
    clean_text(value).map(|v| v.to_lowercase())
}

/// Positions of the known columns within a raw batch.
#[derive(Debug, Default)]
struct ColumnIndex {
    email: Option<usize>,
    product: Option<usize>,
    category: Option<usize>,
    name: Option<usize>,
    phone: Option<usize>,
    amount: Option<usize>,
    payment_date: Option<usize>,
}

impl ColumnIndex {
    fn resolve(columns: &[String]) -> Self {
        let mut index = Self::default();
        for (i, column) in columns.iter().enumerate() {
            let slot = match normalize_column_name(column).as_str() {
                "email" => &mut index.email,
                "product" => &mut index.product,
                "category" => &mut index.category,
                "name" => &mut index.name,
                "phone" => &mut index.phone,
                "amount" => &mut index.amount,
                "payment_date" => &mut index.payment_date,
                _ => continue,
            };
            // First occurrence wins when two raw names normalize alike
            slot.get_or_insert(i);
        }
        index
    }

    fn column_set(&self) -> ColumnSet {
        ColumnSet {
            email: self.email.is_some(),
            product: self.product.is_some(),
            category: self.category.is_some(),
            name: self.name.is_some(),
            phone: self.phone.is_some(),
            amount: self.amount.is_some(),
            payment_date: self.payment_date.is_some(),
        }
    }
}

fn cell(row: &[Option<String>], idx: Option<usize>) -> Option<&str> {
    idx.and_then(|i| row.get(i)).and_then(|v| v.as_deref())
}

/// Normalize a raw batch into records.
pub fn normalize_chunk(raw: &RawChunk) -> RecordChunk {
    let index = ColumnIndex::resolve(&raw.columns);

    let records = raw
        .rows
        .iter()
        .map(|row| Record {
            email: clean_email(cell(row, index.email)),
            product: clean_text(cell(row, index.product)),
            category: clean_text(cell(row, index.category)),
            name: clean_text(cell(row, index.name)),
            phone: clean_text(cell(row, index.phone)),
            amount: coerce_amount(cell(row, index.amount)),
            payment_date: coerce_timestamp(cell(row, index.payment_date)),
        })
        .collect();

    RecordChunk {
        columns: index.column_set(),
        records,
    }
}

/// Locate the raw column that normalizes to `payment_date`.
pub fn payment_date_column(columns: &[String]) -> Option<&str> {
    columns
        .iter()
        .find(|c| normalize_column_name(c) == "payment_date")
        .map(String::as_str)
}
