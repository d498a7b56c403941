use std::time::SystemTime;

use series_client::domain::{Quantity, Sample, SourceKind};
use time::{Date, Month, PrimitiveDateTime, Time};

use crate::pipeline::{Envelope, IngestError, SampleStream, Source};

/// Raw power/flow feed from the metering platform: not JSON but a
/// JavaScript table literal of the shape
///
/// ```text
/// rows: [[new Date(2016,0,31,23,30,0), 1.5], [new Date(...), null], ...]
/// ```
///
/// Parsed with an explicit tokenizer state machine rather than string
/// chasing or a JS evaluator. The `Date` constructor's month argument
/// is 0-based and is corrected to 1-based here. Timestamps are
/// civil-local wall-clock; run the output through the timezone
/// normalizer.
pub struct MeterFlowsSource {
    body: String,
}

impl MeterFlowsSource {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SeekRows,
    ReadDate,
    ReadValue,
    SeekNext,
}

const ROWS_MARKER: &str = "rows";
const DATE_MARKER: &str = "new Date(";

fn parse_date_args(args: &str) -> Result<PrimitiveDateTime, IngestError> {
    let nums: Vec<i64> = args
        .split(',')
        .map(|a| a.trim().parse::<i64>())
        .collect::<Result<_, _>>()
        .map_err(|e| IngestError::Format(format!("bad Date() arguments '{args}': {e}")))?;
    if nums.len() < 5 || nums.len() > 6 {
        return Err(IngestError::Format(format!(
            "expected 5 or 6 Date() arguments, got {} in '{args}'",
            nums.len()
        )));
    }
    // JavaScript months run 0..=11.
    let month = Month::try_from(nums[1] as u8 + 1)
        .map_err(|e| IngestError::Format(format!("bad month in Date({args}): {e}")))?;
    let date = Date::from_calendar_date(nums[0] as i32, month, nums[2] as u8)
        .map_err(|e| IngestError::Format(format!("bad date in Date({args}): {e}")))?;
    let second = nums.get(5).copied().unwrap_or(0);
    let time = Time::from_hms(nums[3] as u8, nums[4] as u8, second as u8)
        .map_err(|e| IngestError::Format(format!("bad time in Date({args}): {e}")))?;
    Ok(PrimitiveDateTime::new(date, time))
}

/// Tokenize the table literal into `(timestamp, value)` rows. `null`
/// value cells come back as `None`.
pub fn parse_flows(body: &str) -> Result<Vec<(PrimitiveDateTime, Option<f64>)>, IngestError> {
    let mut rows = Vec::new();
    let mut state = State::SeekRows;
    let mut pos = 0usize;
    let mut ts = None;

    loop {
        match state {
            State::SeekRows => {
                match body[pos..].find(ROWS_MARKER) {
                    Some(off) => {
                        pos += off + ROWS_MARKER.len();
                        state = State::ReadDate;
                    }
                    None => {
                        return Err(IngestError::Format(
                            "rows marker not found in flows response".into(),
                        ))
                    }
                }
            }
            State::ReadDate => {
                match body[pos..].find(DATE_MARKER) {
                    Some(off) => {
                        let args_start = pos + off + DATE_MARKER.len();
                        let args_end = body[args_start..].find(')').ok_or_else(|| {
                            IngestError::Format("unterminated Date() constructor".into())
                        })?;
                        ts = Some(parse_date_args(&body[args_start..args_start + args_end])?);
                        pos = args_start + args_end + 1;
                        state = State::ReadValue;
                    }
                    // No further rows; the table is done.
                    None => break,
                }
            }
            State::ReadValue => {
                let rest = &body[pos..];
                let cell_start = rest.find(',').ok_or_else(|| {
                    IngestError::Format("value cell missing after Date() in flows row".into())
                })? + 1;
                let cell_end = rest[cell_start..].find([',', ']']).ok_or_else(|| {
                    IngestError::Format("unterminated value cell in flows row".into())
                })?;
                let cell = rest[cell_start..cell_start + cell_end].trim();
                let value = if cell.eq_ignore_ascii_case("null") || cell.is_empty() {
                    None
                } else {
                    Some(cell.parse::<f64>().map_err(|e| {
                        IngestError::Format(format!("bad value cell '{cell}': {e}"))
                    })?)
                };
                let stamp = ts.take().ok_or_else(|| {
                    IngestError::Format("value cell without a preceding Date()".into())
                })?;
                rows.push((stamp, value));
                pos += cell_start + cell_end;
                state = State::SeekNext;
            }
            State::SeekNext => {
                // Skip the row terminator; the next Date() search does
                // the rest.
                state = State::ReadDate;
            }
        }
    }
    Ok(rows)
}

#[async_trait::async_trait]
impl Source for MeterFlowsSource {
    async fn stream(&self) -> SampleStream {
        let body = self.body.clone();
        let s = async_stream::try_stream! {
            let rows = parse_flows(&body)?;
            for (ts, value) in rows {
                yield Envelope {
                    payload: Sample { ts, quantity: Quantity::Power, value, source: SourceKind::MeterFlows },
                    received_at: SystemTime::now(),
                };
            }
        };
        Box::pin(s)
    }
}
