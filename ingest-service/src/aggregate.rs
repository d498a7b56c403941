use futures::StreamExt;
use series_client::domain::{bucket::floor_to_bucket, Bucket, Quantity, Sample};
use time::Duration;

use crate::pipeline::{BucketStream, Envelope, SampleStream};

/// How the samples inside one half-hour window reduce to the stored
/// bucket value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Last sample in `[start, start + 30min)`. Used for power/energy
    /// counters and punctual weather readings.
    Latest,
    /// Mean over the preceding half hour, inclusive of BOTH window
    /// boundaries: a sample landing exactly on a boundary counts
    /// toward the bucket ending there and seeds the bucket starting
    /// there. Mirrors the metering platform's own irradiance
    /// averaging and must not be "fixed".
    MeanInclusiveBoundary,
    /// Sum of samples in `[start, start + 30min)`.
    Sum,
}

/// Reduces a chronologically ordered sample stream into half-hour
/// buckets. Windows with no contributing samples are never emitted;
/// their absence is the gap detector's business.
pub struct BucketAggregator {
    pub reduction: Reduction,
    pub entity: Option<String>,
}

impl BucketAggregator {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction, entity: None }
    }

    pub fn for_entity(reduction: Reduction, entity: impl Into<String>) -> Self {
        Self { reduction, entity: Some(entity.into()) }
    }

    pub fn aggregate(self, input: SampleStream) -> BucketStream {
        match self.reduction {
            Reduction::MeanInclusiveBoundary => Box::pin(mean_inclusive(input, self.entity)),
            Reduction::Latest | Reduction::Sum => {
                Box::pin(windowed(input, self.reduction, self.entity))
            }
        }
    }
}

fn make_bucket(
    start: time::PrimitiveDateTime,
    quantity: Quantity,
    value: Option<f64>,
    entity: &Option<String>,
) -> Envelope<Bucket> {
    Envelope::now(Bucket { start, quantity, value, entity: clone_entity(entity) })
}

fn clone_entity(entity: &Option<String>) -> Option<String> {
    entity.as_ref().cloned()
}

/// Half-open `[start, start + 30min)` windows with latest-value or sum
/// reduction.
fn windowed(
    mut input: SampleStream,
    reduction: Reduction,
    entity: Option<String>,
) -> impl futures::Stream<Item = Result<Envelope<Bucket>, crate::pipeline::IngestError>> {
    async_stream::stream! {
        let mut window: Option<time::PrimitiveDateTime> = None;
        let mut quantity = Quantity::Power;
        let mut latest: Option<f64> = None;
        let mut sum = 0.0f64;
        let mut seen = 0u32;

        while let Some(item) = input.next().await {
            let sample: Sample = match item {
                Ok(env) => env.payload,
                Err(e) => {
                    yield Err(e);
                    continue;
                }
            };

            let w = floor_to_bucket(sample.ts);
            if let Some(cur) = window {
                if cur != w && seen > 0 {
                    let value = match reduction {
                        Reduction::Sum => Some(sum),
                        _ => latest,
                    };
                    yield Ok(make_bucket(cur, quantity, value, &entity));
                    latest = None;
                    sum = 0.0;
                    seen = 0;
                }
            }
            window = Some(w);
            quantity = sample.quantity;
            match reduction {
                Reduction::Sum => {
                    if let Some(v) = sample.value {
                        sum += v;
                        seen += 1;
                    }
                }
                _ => {
                    latest = sample.value;
                    seen += 1;
                }
            }
        }

        if seen > 0 {
            if let Some(start) = window {
                let value = match reduction {
                    Reduction::Sum => Some(sum),
                    _ => latest,
                };
                yield Ok(make_bucket(start, quantity, value, &entity));
            }
        }
    }
}

/// The inclusive-both-ends running mean: step through samples
/// accumulating sum and count; on passing a `:00`/`:30` mark emit
/// `sum / count` for the bucket ending there, then reset the
/// accumulator to hold only the boundary sample (not zero) so it also
/// contributes to the following bucket.
fn mean_inclusive(
    mut input: SampleStream,
    entity: Option<String>,
) -> impl futures::Stream<Item = Result<Envelope<Bucket>, crate::pipeline::IngestError>> {
    async_stream::stream! {
        let mut sum = 0.0f64;
        let mut count = 0u32;
        let mut quantity = Quantity::SolarRadiation;
        let mut last_ts: Option<time::PrimitiveDateTime> = None;
        let mut ended_on_boundary = false;

        while let Some(item) = input.next().await {
            let sample: Sample = match item {
                Ok(env) => env.payload,
                Err(e) => {
                    yield Err(e);
                    continue;
                }
            };
            let v = match sample.value {
                Some(v) => v,
                None => continue,
            };

            sum += v;
            count += 1;
            quantity = sample.quantity;
            last_ts = Some(sample.ts);

            let t = sample.ts;
            if (t.minute() == 0 || t.minute() == 30) && t.second() == 0 && t.nanosecond() == 0 {
                // Bucket ending at this boundary; stored keyed by its start.
                let start = sample.ts - Duration::minutes(30);
                yield Ok(make_bucket(start, quantity, Some(sum / count as f64), &entity));
                sum = v;
                count = 1;
                ended_on_boundary = true;
            } else {
                ended_on_boundary = false;
            }
        }

        // A trailing partial window still gets its mean, keyed by the
        // window it falls in; a stream that ended exactly on a
        // boundary has already emitted everything.
        if count > 0 && !ended_on_boundary {
            if let Some(ts) = last_ts {
                let start = floor_to_bucket(ts);
                yield Ok(make_bucket(start, quantity, Some(sum / count as f64), &entity));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use series_client::domain::SourceKind;
    use time::macros::datetime;

    fn sample(ts: time::PrimitiveDateTime, value: f64) -> Result<Envelope<Sample>, crate::pipeline::IngestError> {
        Ok(Envelope::now(Sample {
            ts,
            quantity: Quantity::SolarRadiation,
            value: Some(value),
            source: SourceKind::WeatherCsv,
        }))
    }

    fn run(agg: BucketAggregator, samples: Vec<Result<Envelope<Sample>, crate::pipeline::IngestError>>) -> Vec<Bucket> {
        let input: SampleStream = Box::pin(futures::stream::iter(samples));
        let out = block_on(agg.aggregate(input).collect::<Vec<_>>());
        out.into_iter().map(|r| r.expect("no errors expected").payload).collect()
    }

    #[test]
    fn inclusive_boundary_mean_counts_boundary_sample_twice() {
        let samples = vec![
            sample(datetime!(2024-06-01 12:00:00), 10.0),
            sample(datetime!(2024-06-01 12:10:00), 20.0),
            sample(datetime!(2024-06-01 12:20:00), 30.0),
            sample(datetime!(2024-06-01 12:30:00), 40.0),
            sample(datetime!(2024-06-01 12:40:00), 50.0),
            sample(datetime!(2024-06-01 12:50:00), 60.0),
        ];
        let buckets = run(BucketAggregator::new(Reduction::MeanInclusiveBoundary), samples);

        // Bucket ending 12:00 holds just the leading boundary sample.
        assert_eq!(buckets[0].start, datetime!(2024-06-01 11:30:00));
        assert_eq!(buckets[0].value, Some(10.0));

        // Bucket ending 12:30 averages 12:00..12:30 inclusive.
        assert_eq!(buckets[1].start, datetime!(2024-06-01 12:00:00));
        assert_eq!(buckets[1].value, Some((10.0 + 20.0 + 30.0 + 40.0) / 4.0));

        // Bucket ending 13:00 re-counts the 12:30 sample.
        assert_eq!(buckets[2].start, datetime!(2024-06-01 12:30:00));
        assert_eq!(buckets[2].value, Some((40.0 + 50.0 + 60.0) / 3.0));
        assert_eq!(buckets.len(), 3);
    }

    #[test]
    fn sub_minute_samples_near_a_boundary_stay_aligned() {
        let samples = vec![
            sample(datetime!(2024-06-01 12:00:00), 10.0),
            sample(datetime!(2024-06-01 12:30:00), 40.0),
            sample(datetime!(2024-06-01 12:30:20), 42.0),
        ];
        let buckets = run(BucketAggregator::new(Reduction::MeanInclusiveBoundary), samples);
        assert!(buckets.iter().all(|b| b.is_aligned()));

        // Only 12:30:00 closes the bucket ending there; 12:30:20 joins
        // the trailing window, which flushes keyed to 12:30.
        assert_eq!(buckets[1].start, datetime!(2024-06-01 12:00:00));
        assert_eq!(buckets[1].value, Some(25.0));
        assert_eq!(buckets[2].start, datetime!(2024-06-01 12:30:00));
        assert_eq!(buckets[2].value, Some(41.0));
        assert_eq!(buckets.len(), 3);
    }

    #[test]
    fn latest_value_wins_within_a_window() {
        let samples = vec![
            sample(datetime!(2024-06-01 10:05:00), 1.0),
            sample(datetime!(2024-06-01 10:20:00), 2.0),
            sample(datetime!(2024-06-01 10:40:00), 3.0),
        ];
        let buckets = run(BucketAggregator::new(Reduction::Latest), samples);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].start, datetime!(2024-06-01 10:00:00));
        assert_eq!(buckets[0].value, Some(2.0));
        assert_eq!(buckets[1].start, datetime!(2024-06-01 10:30:00));
        assert_eq!(buckets[1].value, Some(3.0));
    }

    #[test]
    fn sum_reduction_adds_window_samples() {
        let samples = vec![
            sample(datetime!(2024-06-01 10:05:00), 1.5),
            sample(datetime!(2024-06-01 10:25:00), 2.5),
        ];
        let buckets = run(BucketAggregator::new(Reduction::Sum), samples);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].value, Some(4.0));
    }

    #[test]
    fn empty_windows_are_not_emitted() {
        let samples = vec![
            sample(datetime!(2024-06-01 10:05:00), 1.0),
            sample(datetime!(2024-06-01 11:40:00), 2.0),
        ];
        let buckets = run(BucketAggregator::new(Reduction::Latest), samples);
        let starts: Vec<_> = buckets.iter().map(|b| b.start).collect();
        assert_eq!(
            starts,
            vec![datetime!(2024-06-01 10:00:00), datetime!(2024-06-01 11:30:00)]
        );
    }

    #[test]
    fn all_emitted_buckets_are_aligned() {
        let samples = vec![
            sample(datetime!(2024-06-01 09:59:59), 1.0),
            sample(datetime!(2024-06-01 10:00:01), 2.0),
            sample(datetime!(2024-06-01 10:31:07), 3.0),
            sample(datetime!(2024-06-01 23:45:00), 4.0),
        ];
        let buckets = run(BucketAggregator::new(Reduction::Latest), samples);
        assert!(buckets.iter().all(|b| b.is_aligned()));
    }

    #[test]
    fn entity_is_attached_to_every_bucket() {
        let samples = vec![sample(datetime!(2024-06-01 10:05:00), 1.0)];
        let buckets = run(
            BucketAggregator::for_entity(Reduction::Latest, "pv2_gen"),
            samples,
        );
        assert_eq!(buckets[0].entity.as_deref(), Some("pv2_gen"));
    }
}
