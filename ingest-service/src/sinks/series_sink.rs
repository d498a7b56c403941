use std::time::Duration;

use futures::StreamExt;
use series_client::db::SeriesStore;
use series_client::domain::{meter_column_name, Bucket};

use crate::pipeline::{Envelope, IngestError, Sink};

/// Which column of the target table a bucket lands in.
#[derive(Debug, Clone)]
pub enum ColumnSpec {
    /// Single-quantity table: every bucket goes to this column.
    Fixed(String),
    /// Wide multi-meter table: the column is derived from the bucket's
    /// entity code.
    PerEntity,
}

/// Drains a bucket stream into one series table through the
/// reconciliation store's idempotent merge.
///
/// The table and any needed columns are ensured up front, before the
/// first upsert, so a missing column can never surface as an upsert
/// failure mid-stream. Storage failures are retried with linear
/// backoff before the table is abandoned for this run.
pub struct ReconcilingSink {
    store: SeriesStore,
    table: String,
    column: ColumnSpec,
    max_retries: u32,
    retry_backoff: Duration,
}

impl ReconcilingSink {
    pub fn new(store: SeriesStore, table: impl Into<String>, column: ColumnSpec) -> Self {
        Self {
            store,
            table: table.into(),
            column,
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }

    pub fn with_retries(mut self, max_retries: u32, retry_backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = retry_backoff;
        self
    }

    /// Create the table and, for a fixed-column table, its value
    /// column. Per-entity columns are ensured as entities appear.
    pub async fn prepare(&self) -> Result<(), IngestError> {
        self.store
            .ensure_series_table(&self.table)
            .await
            .map_err(|e| IngestError::Storage(format!("ensuring table {}: {e}", self.table)))?;
        if let ColumnSpec::Fixed(col) = &self.column {
            self.store
                .ensure_column(&self.table, col)
                .await
                .map_err(|e| IngestError::Storage(format!("ensuring column {col}: {e}")))?;
        }
        Ok(())
    }

    fn column_for(&self, bucket: &Bucket) -> Result<String, IngestError> {
        match &self.column {
            ColumnSpec::Fixed(col) => Ok(col.clone()),
            ColumnSpec::PerEntity => bucket
                .entity
                .as_deref()
                .map(meter_column_name)
                .ok_or_else(|| {
                    IngestError::Storage(format!(
                        "bucket at {} has no entity for per-entity table {}",
                        bucket.start, self.table
                    ))
                }),
        }
    }

    async fn merge_with_retry(&self, column: &str, bucket: &Bucket) -> Result<(), IngestError> {
        let mut attempt: u32 = 0;
        loop {
            let res = self.store.merge(&self.table, column, bucket.start, bucket.value).await;
            match res {
                Ok(()) => {
                    metrics::counter!("buckets_merged_total").increment(1);
                    return Ok(());
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        error = %e,
                        table = %self.table,
                        attempt,
                        "bucket merge failed, retrying with backoff"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => {
                    metrics::counter!("merge_errors_total").increment(1);
                    return Err(IngestError::Storage(format!(
                        "merge into {} gave up after {attempt} retries: {e}",
                        self.table
                    )));
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Sink for ReconcilingSink {
    async fn run<S>(&self, mut input: S) -> Result<u64, IngestError>
    where
        S: futures::Stream<Item = Result<Envelope<Bucket>, IngestError>> + Send + Unpin + 'static,
    {
        self.prepare().await?;

        let mut merged: u64 = 0;
        let mut ensured_columns: Vec<String> = Vec::new();

        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                // A structural source error ends this source's import;
                // everything merged so far stays durable.
                Err(e) => {
                    tracing::error!(error = %e, table = %self.table, "source failed mid-import");
                    return Err(e);
                }
            };

            let column = self.column_for(&env.payload)?;
            if matches!(self.column, ColumnSpec::PerEntity)
                && !ensured_columns.iter().any(|c| c == &column)
            {
                self.store
                    .ensure_column(&self.table, &column)
                    .await
                    .map_err(|e| IngestError::Storage(format!("ensuring column {column}: {e}")))?;
                ensured_columns.push(column.clone());
            }

            self.merge_with_retry(&column, &env.payload).await?;
            merged += 1;

            if let Ok(dur) = std::time::SystemTime::now().duration_since(env.received_at) {
                metrics::histogram!("ingest_end_to_end_latency_seconds").record(dur.as_secs_f64());
            }
        }

        tracing::info!(table = %self.table, merged, "bucket import complete");
        Ok(merged)
    }
}
