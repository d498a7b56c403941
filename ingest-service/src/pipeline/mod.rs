use std::{pin::Pin, sync::Arc};

use futures::{Stream, StreamExt};
use series_client::domain::{Bucket, Sample};

use crate::aggregate::BucketAggregator;

/// A sample or bucket moving through a pipeline, tagged with the time
/// it entered the run (for end-to-end latency metrics).
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: std::time::SystemTime,
}

impl<T> Envelope<T> {
    pub fn now(payload: T) -> Self {
        Self { payload, received_at: std::time::SystemTime::now() }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    /// A source document is missing an expected structural marker.
    /// Aborts that source's import only.
    #[error("format error: {0}")]
    Format(String),
    /// Transport/timeout/HTTP failure. Retried by the next scheduled
    /// run, never within-run.
    #[error("network error: {0}")]
    Network(String),
    /// Schema creation, column addition or upsert failure; fatal for
    /// the affected table for this run.
    #[error("storage error: {0}")]
    Storage(String),
    /// Deliberate skip once the daily external-call budget is spent.
    /// Informational, not a failure.
    #[error("skipped, daily call quota exhausted: {0}")]
    QuotaExceeded(String),
    /// An instant that cannot be resolved against the transition
    /// table; the sample is dropped with a warning.
    #[error("timezone ambiguity: {0}")]
    TimezoneAmbiguity(String),
}

impl IngestError {
    pub fn is_quota_skip(&self) -> bool {
        matches!(self, IngestError::QuotaExceeded(_))
    }
}

pub type SampleStream =
    Pin<Box<dyn Stream<Item = Result<Envelope<Sample>, IngestError>> + Send>>;
pub type BucketStream =
    Pin<Box<dyn Stream<Item = Result<Envelope<Bucket>, IngestError>> + Send>>;

#[async_trait::async_trait]
pub trait Source: Send + Sync {
    async fn stream(&self) -> SampleStream;
}

#[async_trait::async_trait]
pub trait Transform: Send + Sync {
    async fn apply(&self, input: Envelope<Sample>) -> Result<Envelope<Sample>, IngestError>;
}

#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    /// Drain the bucket stream into the store. Returns the number of
    /// buckets merged, or the first structural/storage error.
    async fn run<S>(&self, input: S) -> Result<u64, IngestError>
    where
        S: Stream<Item = Result<Envelope<Bucket>, IngestError>> + Send + Unpin + 'static;
}

/// One source's parse -> normalize -> aggregate -> merge pipeline.
///
/// A sample rejected by a transform (validation, timezone resolution)
/// is dropped with a warning; a structural source error aborts this
/// pipeline but never the rest of the run.
pub struct Pipeline<S, K> {
    pub source: S,
    pub transforms: Vec<Arc<dyn Transform>>,
    pub aggregator: BucketAggregator,
    pub sink: K,
}

impl<S, K> Pipeline<S, K>
where
    S: Source + Send + Sync + 'static,
    K: Sink + Send + Sync + 'static,
{
    pub async fn run(self) -> Result<u64, IngestError> {
        let mut stream = self.source.stream().await;

        for t in self.transforms {
            let t_arc = t.clone();
            stream = Box::pin(
                stream
                    .then(move |item| {
                        let t_inner = t_arc.clone();
                        async move {
                            match item {
                                Ok(env) => match t_inner.apply(env).await {
                                    Ok(env) => Some(Ok(env)),
                                    Err(e) => {
                                        tracing::warn!(error = %e, "sample dropped by transform");
                                        metrics::counter!("samples_dropped_total").increment(1);
                                        None
                                    }
                                },
                                Err(e) => Some(Err(e)),
                            }
                        }
                    })
                    .filter_map(|x| async move { x }),
            );
        }

        let buckets = self.aggregator.aggregate(stream);
        self.sink.run(buckets).await
    }
}
