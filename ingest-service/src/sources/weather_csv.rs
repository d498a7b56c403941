use std::{path::PathBuf, time::SystemTime};

use series_client::domain::{Quantity, Sample, SourceKind};
use time::{Date, Month, PrimitiveDateTime, Time};

use crate::pipeline::{Envelope, IngestError, SampleStream, Source};

use super::combine;

/// Weather-station CSV export carrying minutely (or 10-minutely) solar
/// radiation, either as a local file or as a string fetched from the
/// station's web form.
///
/// The header line is located by pattern, not position: the first line
/// with a `date`/`day` column fragment followed by a `solar` fragment.
/// Columns are then mapped by name, so upstream reordering or extra
/// trailing columns (UV, soil moisture, ...) are harmless. Two date
/// layouts exist in the wild and both are supported:
/// - a combined `date` column plus a `time` column
/// - split `year`/`month`/`day`/`hour`/`min` columns
///
/// Timestamps are civil-local wall-clock; run the output through the
/// timezone normalizer.
pub enum WeatherCsvSource {
    File(PathBuf),
    Text(String),
}

impl WeatherCsvSource {
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Self {
        Self::File(path.into())
    }

    pub fn from_text(body: impl Into<String>) -> Self {
        Self::Text(body.into())
    }

    async fn read_body(&self) -> Result<String, IngestError> {
        match self {
            Self::Text(body) => Ok(body.clone()),
            Self::File(path) => tokio::fs::read_to_string(path)
                .await
                .map_err(|e| IngestError::Format(format!("failed to read {}: {e}", path.display()))),
        }
    }
}

/// Scan the station web form's HTML response for the first anchor
/// pointing at a CSV file; the form generates the day's CSV on POST
/// and links to it from the result page. Returns the path relative to
/// the station base URL.
pub fn csv_link_in_page(html: &str) -> Option<String> {
    let is_path_char = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '/';
    let mut from = 0;
    while let Some(off) = html[from..].find("<a href=") {
        let rest = &html[from + off + "<a href=".len()..];
        if let Some(ext) = rest.find(".csv") {
            let head = &rest[..ext];
            let path_start = head
                .char_indices()
                .rev()
                .take_while(|(_, c)| is_path_char(*c))
                .last()
                .map(|(i, _)| i);
            if let Some(s) = path_start {
                return Some(format!("{}{}", &head[s..], ".csv"));
            }
        }
        from += off + 1;
    }
    None
}

enum DateLayout {
    Combined { date: usize, time: usize },
    Split { year: usize, month: usize, day: usize, hour: usize, minute: usize },
}

struct HeaderLayout {
    sol_rad: usize,
    date: DateLayout,
}

fn is_header_line(line: &str) -> bool {
    let low = line.to_lowercase();
    let date_pos = match low.find("date").or_else(|| low.find("day")) {
        Some(p) => p,
        None => return false,
    };
    let rest = &low[date_pos..];
    match rest.find(',') {
        Some(comma) => rest[comma..].contains("solar"),
        None => false,
    }
}

fn resolve_layout(header: &str) -> Result<HeaderLayout, IngestError> {
    // Strip whitespace and lowercase to make name matching painless.
    let columns: Vec<String> = header
        .split(',')
        .map(|c| c.to_lowercase().replace(' ', "").replace('"', "").trim().to_string())
        .collect();

    let sol_rad = columns
        .iter()
        .position(|c| c.contains("solar"))
        .ok_or_else(|| {
            IngestError::Format("solar radiation column not found in weather CSV header".into())
        })?;

    if let Some(date) = columns.iter().position(|c| c.contains("date")) {
        let time = columns.iter().position(|c| c.contains("time")).ok_or_else(|| {
            IngestError::Format("time column not found in weather CSV header".into())
        })?;
        return Ok(HeaderLayout { sol_rad, date: DateLayout::Combined { date, time } });
    }

    let find = |name: &str| -> Result<usize, IngestError> {
        columns.iter().position(|c| c == name).ok_or_else(|| {
            IngestError::Format(format!("'{name}' column not found in weather CSV header"))
        })
    };
    Ok(HeaderLayout {
        sol_rad,
        date: DateLayout::Split {
            year: find("year")?,
            month: find("month")?,
            day: find("day")?,
            hour: find("hour")?,
            minute: find("min")?,
        },
    })
}

fn row_timestamp(layout: &HeaderLayout, record: &csv::StringRecord) -> Result<PrimitiveDateTime, IngestError> {
    let get = |idx: usize| -> Result<&str, IngestError> {
        record
            .get(idx)
            .ok_or_else(|| IngestError::Format(format!("weather CSV row too short: {record:?}")))
    };
    match &layout.date {
        DateLayout::Combined { date, time } => combine(get(*date)?, get(*time)?),
        DateLayout::Split { year, month, day, hour, minute } => {
            let num = |idx: usize| -> Result<i32, IngestError> {
                get(idx)?.trim().parse::<i32>().map_err(|e| {
                    IngestError::Format(format!("bad date field in weather CSV row: {e}"))
                })
            };
            let m = Month::try_from(num(*month)? as u8)
                .map_err(|e| IngestError::Format(format!("bad month in weather CSV row: {e}")))?;
            let date = Date::from_calendar_date(num(*year)?, m, num(*day)? as u8)
                .map_err(|e| IngestError::Format(format!("bad date in weather CSV row: {e}")))?;
            let time = Time::from_hms(num(*hour)? as u8, num(*minute)? as u8, 0)
                .map_err(|e| IngestError::Format(format!("bad time in weather CSV row: {e}")))?;
            Ok(PrimitiveDateTime::new(date, time))
        }
    }
}

fn parse_body(body: &str) -> Result<(HeaderLayout, String), IngestError> {
    let mut lines = body.lines();
    let header = lines
        .by_ref()
        .find(|l| is_header_line(l))
        .ok_or_else(|| IngestError::Format("header line not found in weather CSV".into()))?;
    let layout = resolve_layout(header)?;
    let rest: String = lines.collect::<Vec<_>>().join("\n");
    Ok((layout, rest))
}

#[async_trait::async_trait]
impl Source for WeatherCsvSource {
    async fn stream(&self) -> SampleStream {
        let body = self.read_body().await;
        let s = async_stream::try_stream! {
            let body = body?;
            let (layout, rest) = parse_body(&body)?;
            let mut rdr = csv::ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .from_reader(rest.as_bytes());

            for result in rdr.records() {
                let record = result
                    .map_err(|e| IngestError::Format(format!("failed to read weather CSV row: {e}")))?;
                if record.iter().all(|f| f.trim().is_empty()) {
                    continue;
                }
                let ts = row_timestamp(&layout, &record)?;
                let value = match record.get(layout.sol_rad).map(str::trim) {
                    Some(v) if !v.is_empty() => Some(v.parse::<f64>().map_err(|e| {
                        IngestError::Format(format!("bad solar radiation value '{v}': {e}"))
                    })?),
                    _ => None,
                };
                yield Envelope {
                    payload: Sample {
                        ts,
                        quantity: Quantity::SolarRadiation,
                        value,
                        source: SourceKind::WeatherCsv,
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

    fn collect(src: WeatherCsvSource) -> Vec<Result<Sample, IngestError>> {
        block_on(async {
            src.stream()
                .await
                .map(|r| r.map(|env| env.payload))
                .collect::<Vec<_>>()
                .await
        })
    }

    #[test]
    fn web_form_layout_with_combined_date() {
        let body = "\
Filton weather station export
DATE,TIME,TEMP C,HUM %,SOLAR W/m2,UV
2016-01-30,10:00,5.2,80,55.5,0
2016-01-30,10:10,5.3,80,60.0,0
";
        let samples: Vec<Sample> =
            collect(WeatherCsvSource::from_text(body)).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].ts, datetime!(2016-01-30 10:00:00));
        assert_eq!(samples[0].value, Some(55.5));
        assert_eq!(samples[0].quantity, Quantity::SolarRadiation);
        assert!(samples[0].source.is_civil_local());
    }

    #[test]
    fn file_layout_with_split_date_fields() {
        let body = "\
day,month,year,hour,min,Solar,UV,Daily ET
30,1,2016,10,0,55.5,0,0
30,1,2016,10,1,60.0,0,0
";
        let samples: Vec<Sample> =
            collect(WeatherCsvSource::from_text(body)).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].ts, datetime!(2016-01-30 10:00:00));
        assert_eq!(samples[1].ts, datetime!(2016-01-30 10:01:00));
    }

    #[test]
    fn missing_header_names_the_marker() {
        let body = "no,useful,columns\n1,2,3\n";
        let out = collect(WeatherCsvSource::from_text(body));
        assert_eq!(out.len(), 1);
        match &out[0] {
            Err(IngestError::Format(msg)) => assert!(msg.contains("header line")),
            other => panic!("expected format error, got {other:?}"),
        }
    }

    #[test]
    fn preamble_lines_are_skipped_before_the_header() {
        let body = "\
Filton export for BEC
station,uptime,notes
DATE,TIME,TEMP C,SOLAR W/m2
2016-01-30,10:00,5.2,55.5
";
        let samples: Vec<Sample> =
            collect(WeatherCsvSource::from_text(body)).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, Some(55.5));
    }

    #[test]
    fn csv_link_is_found_in_the_form_response() {
        let html = r#"<html><body>
            <a href="wxsql.php">back</a>
            <p>Your file is ready:</p>
            <a href="data/2016-01/wx2016-01-30.csv">download</a>
        </body></html>"#;
        assert_eq!(
            csv_link_in_page(html).as_deref(),
            Some("data/2016-01/wx2016-01-30.csv")
        );
        assert_eq!(csv_link_in_page("<html>no links</html>"), None);
    }

    #[test]
    fn trailing_columns_are_ignored() {
        let body = "\
DATE,TIME,SOLAR W/m2
2016-01-30,10:00,55.5,extra,junk
";
        let samples: Vec<Sample> =
            collect(WeatherCsvSource::from_text(body)).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(samples.len(), 1);
    }
}
