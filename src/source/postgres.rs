//! Postgres-backed chunk source.
//!
//! Every column is selected as `text`, so the same coercion rules apply
//! whatever the column's declared type. Rows are pulled through a server-side
//! portal, `chunk_size` rows per round trip, inside a read-only transaction.

use super::normalize::{normalize_chunk, payment_date_column};
use super::{ChunkReader, ChunkSource, RawChunk, Record};
use crate::config::SourceConfig;
use crate::error::{ConfigError, PipelineError, Result};
use tokio::sync::mpsc;
use tokio_postgres::{Client, NoTls};

/// Batches buffered between the producer task and the reader.
const CHANNEL_CAPACITY: usize = 2;

/// Schema-qualified table reference.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TableRef {
    schema: Option<String>,
    name: String,
}

impl TableRef {
    fn parse(table: &str) -> Self {
        match table.split_once('.') {
            Some((schema, name)) => Self {
                schema: Some(schema.to_string()),
                name: name.to_string(),
            },
            None => Self {
                schema: None,
                name: table.to_string(),
            },
        }
    }

    fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Reflected shape of the source table.
#[derive(Debug, Clone)]
struct TableShape {
    columns: Vec<String>,
    order_column: Option<String>,
}

impl TableShape {
    fn select_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("t.{}::text AS {}", quote_ident(c), quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Full-table scan, oldest payment first.
    fn scan_sql(&self, table: &TableRef) -> String {
        let mut sql = format!("SELECT {} FROM {} AS t", self.select_list(), table.quoted());
        if let Some(column) = &self.order_column {
            sql.push_str(&format!(" ORDER BY t.{} ASC", quote_ident(column)));
        }
        sql
    }

    /// One page, newest payment first.
    fn page_sql(&self, table: &TableRef) -> String {
        let mut sql = format!("SELECT {} FROM {} AS t", self.select_list(), table.quoted());
        if let Some(column) = &self.order_column {
            sql.push_str(&format!(" ORDER BY t.{} DESC NULLS LAST", quote_ident(column)));
        }
        sql.push_str(" LIMIT $1 OFFSET $2");
        sql
    }
}

/// Chunk source over a Postgres table.
#[derive(Debug, Clone)]
pub struct PostgresSource {
    config: SourceConfig,
}

impl PostgresSource {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    async fn connect(&self) -> Result<Client> {
        let url = self.config.require_connection_string()?;
        let pg_config: tokio_postgres::Config = url
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("invalid DATABASE_URL: {}", e)))?;

        let (client, connection) = pg_config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("postgres connection error: {}", e);
            }
        });
        Ok(client)
    }

    async fn reflect(&self, client: &Client, table: &TableRef) -> Result<TableShape> {
        let rows = client
            .query(
                "SELECT column_name::text FROM information_schema.columns \
                 WHERE table_name::text = $1::text \
                 AND ($2::text IS NULL OR table_schema::text = $2::text) \
                 ORDER BY ordinal_position",
                &[&table.name, &table.schema],
            )
            .await?;

        let columns: Vec<String> = rows
            .iter()
            .map(|row| row.try_get::<_, String>(0))
            .collect::<std::result::Result<_, _>>()?;

        if columns.is_empty() {
            return Err(ConfigError::TableNotFound(self.config.table.clone()).into());
        }

        let order_column = payment_date_column(&columns).map(str::to_string);
        if order_column.is_none() {
            tracing::warn!(
                "Table {} has no payment date column, rows arrive in storage order",
                self.config.table
            );
        }

        Ok(TableShape {
            columns,
            order_column,
        })
    }
}

fn rows_to_raw(columns: &[String], rows: &[tokio_postgres::Row]) -> Result<RawChunk> {
    let mut raw = RawChunk::new(columns.to_vec());
    for row in rows {
        let values = (0..columns.len())
            .map(|i| row.try_get::<_, Option<String>>(i))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raw.rows.push(values);
    }
    Ok(raw)
}

/// Rows requested per portal fetch. The protocol limit is `i32::MAX`.
fn fetch_size(chunk_size: usize) -> i32 {
    i32::try_from(chunk_size).unwrap_or(i32::MAX)
}

/// A fetch shorter than what was requested means the portal is drained.
fn is_last_fetch(fetched: usize, requested: i32) -> bool {
    fetched < requested as usize
}

async fn stream_portal(
    client: &mut Client,
    sql: &str,
    columns: &[String],
    chunk_size: usize,
    tx: &mpsc::Sender<Result<RawChunk>>,
) -> Result<()> {
    let transaction = client.build_transaction().read_only(true).start().await?;
    let statement = transaction.prepare(sql).await?;
    let portal = transaction.bind(&statement, &[]).await?;
    let max_rows = fetch_size(chunk_size);

    loop {
        let rows = transaction.query_portal(&portal, max_rows).await?;
        if rows.is_empty() {
            break;
        }

        let exhausted = is_last_fetch(rows.len(), max_rows);
        let raw = rows_to_raw(columns, &rows)?;
        tracing::debug!("Fetched {} rows", raw.len());

        if tx.send(Ok(raw)).await.is_err() {
            // Reader gone, nothing left to do
            return Ok(());
        }
        if exhausted {
            break;
        }
    }

    transaction.commit().await?;
    Ok(())
}

impl ChunkSource for PostgresSource {
    async fn open(&self, chunk_size: usize) -> Result<ChunkReader> {
        let table = TableRef::parse(&self.config.table);
        let mut client = self.connect().await?;
        let shape = self.reflect(&client, &table).await?;
        let sql = shape.scan_sql(&table);

        tracing::info!(
            "Streaming {} ({} columns) in chunks of {}",
            self.config.table,
            shape.columns.len(),
            chunk_size
        );

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            if let Err(e) = stream_portal(&mut client, &sql, &shape.columns, chunk_size, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        Ok(ChunkReader::new(rx))
    }

    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<Record>> {
        let table = TableRef::parse(&self.config.table);
        let client = self.connect().await?;
        let shape = self.reflect(&client, &table).await?;

        let limit = i64::try_from(limit).map_err(|e| PipelineError::SourceRead(e.to_string()))?;
        let offset = i64::try_from(offset).map_err(|e| PipelineError::SourceRead(e.to_string()))?;
        let rows = client.query(&shape.page_sql(&table), &[&limit, &offset]).await?;

        let raw = rows_to_raw(&shape.columns, &rows)?;
        Ok(normalize_chunk(&raw).records)
    }
}
