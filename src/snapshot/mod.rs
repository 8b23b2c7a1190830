//! Columnar snapshot of the normalized dataset.
//!
//! The snapshot is a single parquet file holding every record of the last
//! completed run. It is written through [`SnapshotWriter`] and only ever
//! replaced by rename, so readers see either the previous file or the new one.

mod writer;

pub use writer::SnapshotWriter;

use crate::error::{PipelineError, Result, SnapshotIoSource};
use crate::source::Record;
use arrow::array::{Array, ArrayRef, Float64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, NaiveDateTime};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::cmp::Ordering;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// Schema shared by every part file and the merged snapshot.
pub fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("email", DataType::Utf8, true),
        Field::new("product", DataType::Utf8, true),
        Field::new("category", DataType::Utf8, true),
        Field::new("name", DataType::Utf8, true),
        Field::new("phone", DataType::Utf8, true),
        Field::new("amount", DataType::Float64, false),
        Field::new(
            "payment_date",
            DataType::Timestamp(TimeUnit::Microsecond, None),
            true,
        ),
    ]))
}

fn text_column<'a>(records: &'a [Record], f: impl Fn(&'a Record) -> &'a Option<String>) -> ArrayRef {
    Arc::new(records.iter().map(|r| f(r).as_deref()).collect::<StringArray>())
}

/// Encode records as one batch.
pub fn records_to_batch(records: &[Record]) -> std::result::Result<RecordBatch, ArrowError> {
    let amounts: Float64Array = records.iter().map(|r| Some(r.amount)).collect();
    let dates: TimestampMicrosecondArray = records
        .iter()
        .map(|r| r.payment_date.map(|ts| ts.and_utc().timestamp_micros()))
        .collect();

    RecordBatch::try_new(
        schema(),
        vec![
            text_column(records, |r| &r.email),
            text_column(records, |r| &r.product),
            text_column(records, |r| &r.category),
            text_column(records, |r| &r.name),
            text_column(records, |r| &r.phone),
            Arc::new(amounts),
            Arc::new(dates),
        ],
    )
}

fn column<'a, T: Array + 'static>(
    batch: &'a RecordBatch,
    name: &str,
) -> std::result::Result<&'a T, ArrowError> {
    let idx = batch.schema().index_of(name)?;
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| ArrowError::SchemaError(format!("column '{}' has an unexpected type", name)))
}

fn text_at(array: &StringArray, i: usize) -> Option<String> {
    (!array.is_null(i)).then(|| array.value(i).to_string())
}

/// Decode a batch written by [`records_to_batch`].
pub fn batch_to_records(batch: &RecordBatch) -> std::result::Result<Vec<Record>, ArrowError> {
    let email = column::<StringArray>(batch, "email")?;
    let product = column::<StringArray>(batch, "product")?;
    let category = column::<StringArray>(batch, "category")?;
    let name = column::<StringArray>(batch, "name")?;
    let phone = column::<StringArray>(batch, "phone")?;
    let amount = column::<Float64Array>(batch, "amount")?;
    let payment_date = column::<TimestampMicrosecondArray>(batch, "payment_date")?;

    let records = (0..batch.num_rows())
        .map(|i| Record {
            email: text_at(email, i),
            product: text_at(product, i),
            category: text_at(category, i),
            name: text_at(name, i),
            phone: text_at(phone, i),
            amount: if amount.is_null(i) { 0.0 } else { amount.value(i) },
            payment_date: if payment_date.is_null(i) {
                None
            } else {
                DateTime::from_timestamp_micros(payment_date.value(i)).map(|ts| ts.naive_utc())
            },
        })
        .collect();
    Ok(records)
}

/// Open a parquet file and iterate its batches.
pub(crate) fn read_batches(path: &Path) -> Result<Vec<RecordBatch>> {
    let err = |e: SnapshotIoSource| PipelineError::snapshot(path, e);

    let file = File::open(path).map_err(|e| err(e.into()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| err(e.into()))?
        .build()
        .map_err(|e| err(e.into()))?;

    reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| err(e.into()))
}

/// Visit every record of a snapshot in stored order.
fn scan(path: &Path, mut visit: impl FnMut(Record) -> bool) -> Result<()> {
    for batch in read_batches(path)? {
        let records = batch_to_records(&batch).map_err(|e| PipelineError::snapshot(path, e))?;
        for record in records {
            if !visit(record) {
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Every record in the snapshot.
pub fn read_all(path: &Path) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    scan(path, |r| {
        records.push(r);
        true
    })?;
    Ok(records)
}

/// Records `offset..offset + limit` in stored order.
pub fn read_rows(path: &Path, offset: usize, limit: usize) -> Result<Vec<Record>> {
    let mut records = Vec::with_capacity(limit.min(1024));
    if limit == 0 {
        return Ok(records);
    }

    let mut seen = 0usize;
    scan(path, |r| {
        if seen >= offset {
            records.push(r);
        }
        seen += 1;
        records.len() < limit
    })?;
    Ok(records)
}

/// All purchases of one customer, ordered by payment date (undated last).
///
/// `email` is matched case-insensitively.
pub fn customer_sequence(path: &Path, email: &str) -> Result<Vec<Record>> {
    let email = email.trim().to_lowercase();
    let mut records = Vec::new();
    scan(path, |r| {
        if r.email.as_deref() == Some(email.as_str()) {
            records.push(r);
        }
        true
    })?;

    records.sort_by(|a, b| compare_dates(a.payment_date, b.payment_date));
    Ok(records)
}

fn compare_dates(a: Option<NaiveDateTime>, b: Option<NaiveDateTime>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
