use std::time::SystemTime;

use series_client::domain::{Quantity, Sample, SourceKind};

use crate::pipeline::{Envelope, IngestError, SampleStream, Source};

use super::{combine, parse_flexible_date};

/// Per-meter billing-quality readings export from the metering
/// platform, as tabular text handed over by the driver.
///
/// Columns are mapped by header name: either a combined `timestamp`
/// column or a `date` + `time` pair, plus a `reading` column. A
/// trailing unit-of-measure column, and anything else unrecognized,
/// is ignored. Timestamps are platform-native GMT.
pub struct ReadingsExportSource {
    body: String,
}

impl ReadingsExportSource {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

enum TimeLayout {
    Combined(usize),
    Split { date: usize, time: usize },
}

struct Layout {
    when: TimeLayout,
    reading: usize,
}

fn resolve_layout(headers: &csv::StringRecord) -> Result<Layout, IngestError> {
    let columns: Vec<String> = headers
        .iter()
        .map(|h| h.to_lowercase().replace(' ', ""))
        .collect();

    let reading = columns
        .iter()
        .position(|c| c.contains("reading") || c.contains("value"))
        .ok_or_else(|| {
            IngestError::Format("reading column not found in readings export header".into())
        })?;

    if let Some(ts) = columns.iter().position(|c| c.contains("timestamp")) {
        return Ok(Layout { when: TimeLayout::Combined(ts), reading });
    }
    let date = columns.iter().position(|c| c.contains("date")).ok_or_else(|| {
        IngestError::Format("date column not found in readings export header".into())
    })?;
    match columns.iter().position(|c| c.contains("time")) {
        Some(time) => Ok(Layout { when: TimeLayout::Split { date, time }, reading }),
        // Some exports stamp whole days only.
        None => Ok(Layout { when: TimeLayout::Combined(date), reading }),
    }
}

fn row_timestamp(
    layout: &Layout,
    record: &csv::StringRecord,
) -> Result<time::PrimitiveDateTime, IngestError> {
    let get = |idx: usize| -> Result<&str, IngestError> {
        record
            .get(idx)
            .ok_or_else(|| IngestError::Format(format!("readings export row too short: {record:?}")))
    };
    match layout.when {
        TimeLayout::Split { date, time } => combine(get(date)?, get(time)?),
        TimeLayout::Combined(idx) => {
            let raw = get(idx)?.trim();
            match raw.split_once(['T', ' ']) {
                Some((d, t)) => combine(d, t),
                None => Ok(time::PrimitiveDateTime::new(
                    parse_flexible_date(raw)?,
                    time::Time::MIDNIGHT,
                )),
            }
        }
    }
}

#[async_trait::async_trait]
impl Source for ReadingsExportSource {
    async fn stream(&self) -> SampleStream {
        let body = self.body.clone();
        let s = async_stream::try_stream! {
            let mut rdr = csv::ReaderBuilder::new()
                .flexible(true)
                .from_reader(body.as_bytes());
            let headers = rdr
                .headers()
                .map_err(|e| IngestError::Format(format!("failed to read readings export header: {e}")))?
                .clone();
            let layout = resolve_layout(&headers)?;

            for result in rdr.records() {
                let record = result
                    .map_err(|e| IngestError::Format(format!("failed to read readings export row: {e}")))?;
                if record.iter().all(|f| f.trim().is_empty()) {
                    continue;
                }
                let ts = row_timestamp(&layout, &record)?;
                let raw = record.get(layout.reading).unwrap_or("").trim();
                let value = if raw.is_empty() {
                    None
                } else {
                    Some(raw.parse::<f64>().map_err(|e| {
                        IngestError::Format(format!("bad reading '{raw}': {e}"))
                    })?)
                };
                yield Envelope {
                    payload: Sample {
                        ts,
                        quantity: Quantity::MeterReading,
                        value,
                        source: SourceKind::ReadingsExport,
                    },
                    received_at: SystemTime::now(),
                };
            }
        };
        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{executor::block_on, StreamExt};
    use time::macros::datetime;

    fn collect(body: &str) -> Vec<Result<Sample, IngestError>> {
        block_on(async {
            ReadingsExportSource::new(body)
                .stream()
                .await
                .map(|r| r.map(|env| env.payload))
                .collect::<Vec<_>>()
                .await
        })
    }

    #[test]
    fn combined_timestamp_layout() {
        let body = "timestamp,reading,units\n2024-05-01T00:30:00,1234.5,kWh\n";
        let samples: Vec<Sample> = collect(body).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].ts, datetime!(2024-05-01 00:30:00));
        assert_eq!(samples[0].value, Some(1234.5));
        assert_eq!(samples[0].quantity, Quantity::MeterReading);
        assert!(!samples[0].source.is_civil_local());
    }

    #[test]
    fn split_date_time_layout_with_trailing_unit() {
        let body = "Date,Time,Reading,Unit\n01/05/2024,00:30,1234.5,kWh\n";
        let samples: Vec<Sample> = collect(body).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(samples[0].ts, datetime!(2024-05-01 00:30:00));
    }

    #[test]
    fn date_only_rows_stamp_midnight() {
        let body = "date,reading\n2024-05-01,1234.5\n";
        let samples: Vec<Sample> = collect(body).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(samples[0].ts, datetime!(2024-05-01 00:00:00));
    }

    #[test]
    fn missing_reading_column_is_a_format_error() {
        let out = collect("date,time\n2024-05-01,00:30\n");
        match &out[0] {
            Err(IngestError::Format(msg)) => assert!(msg.contains("reading column")),
            other => panic!("expected format error, got {other:?}"),
        }
    }
}
