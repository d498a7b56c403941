use std::{path::PathBuf, time::SystemTime};

use series_client::domain::{Quantity, Sample, SourceKind};

use crate::pipeline::{Envelope, IngestError, SampleStream, Source};

use super::combine;

/// Marker line that precedes the data rows.
const READINGS_MARKER: &str = r#""date","time","reading""#;

/// Single-substance weather-station CSV (Create Centre roof style).
///
/// The file names the recorded quantity on a `Substance` line in its
/// preamble; readings start after a `"Date","Time","Reading"` marker
/// and each row is date, time, reading, with a trailing unit column
/// (degC, %, W/m2) that is ignored. Timestamps in these exports are
/// already GMT and bypass the timezone normalizer.
pub struct StationCsvSource {
    path: PathBuf,
}

impl StationCsvSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

/// Quick sniff used by the import-directory scanner to tell this
/// format from the multi-column weather export.
pub fn looks_like_station_export(body: &str) -> bool {
    body.lines().take(20).any(|l| l.to_lowercase().contains("substance"))
}

/// The quantity a station export reports on, from its preamble.
pub fn substance_of(body: &str) -> Option<Quantity> {
    body.lines()
        .take(20)
        .filter(|l| l.to_lowercase().contains("substance"))
        .find_map(substance_quantity)
}

fn substance_quantity(line: &str) -> Option<Quantity> {
    let low = line.to_lowercase();
    // Ordered so "solar radiation" cannot be shadowed by a substring.
    [
        ("relative humidity", Quantity::RelativeHumidity),
        ("air temperature", Quantity::AirTemperature),
        ("rainfall", Quantity::Rainfall),
        ("solar radiation", Quantity::SolarRadiation),
    ]
    .into_iter()
    .find(|(name, _)| low.contains(name))
    .map(|(_, q)| q)
}

fn parse_preamble<'a, I: Iterator<Item = &'a str>>(lines: &mut I) -> Result<Quantity, IngestError> {
    let mut quantity = None;
    for line in lines.by_ref() {
        let low = line.to_lowercase();
        if low.contains("substance") && quantity.is_none() {
            quantity = substance_quantity(line);
            if quantity.is_none() {
                return Err(IngestError::Format(format!(
                    "unrecognized substance in station CSV: {}",
                    line.trim()
                )));
            }
        }
        if low.contains(READINGS_MARKER) {
            return quantity.ok_or_else(|| {
                IngestError::Format("substance line not found in station CSV".into())
            });
        }
    }
    Err(IngestError::Format(if quantity.is_some() {
        r#""Date","Time","Reading" marker not found in station CSV"#.into()
    } else {
        "substance line not found in station CSV".into()
    }))
}

#[async_trait::async_trait]
impl Source for StationCsvSource {
    async fn stream(&self) -> SampleStream {
        let path = self.path.clone();
        let s = async_stream::try_stream! {
            let body = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| IngestError::Format(format!("failed to read {}: {e}", path.display())))?;

            let mut lines = body.lines();
            let quantity = parse_preamble(&mut lines)?;
            let rest: String = lines.collect::<Vec<_>>().join("\n");

            let mut rdr = csv::ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .from_reader(rest.as_bytes());

            for result in rdr.records() {
                let record = result
                    .map_err(|e| IngestError::Format(format!("failed to read station CSV row: {e}")))?;
                if record.iter().all(|f| f.trim().is_empty()) {
                    continue;
                }
                let short = || IngestError::Format(format!("station CSV row too short: {record:?}"));
                let date = record.get(0).ok_or_else(short)?;
                let time = record.get(1).ok_or_else(short)?;
                let reading = record.get(2).ok_or_else(short)?;
                let ts = combine(date, time)?;
                let value = reading
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| IngestError::Format(format!("bad reading '{reading}': {e}")))?;
                yield Envelope {
                    payload: Sample { ts, quantity, value: Some(value), source: SourceKind::StationCsv },
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

    #[test]
    fn substance_line_selects_the_quantity() {
        assert_eq!(
            substance_quantity("Substance: Air Temperature"),
            Some(Quantity::AirTemperature)
        );
        assert_eq!(
            substance_quantity("Substance,Solar Radiation,"),
            Some(Quantity::SolarRadiation)
        );
        assert_eq!(substance_quantity("Substance: Wind Speed"), None);
    }

    #[test]
    fn preamble_requires_both_markers() {
        let ok = "Station: Create Centre roof\nSubstance: Rainfall\n\"Date\",\"Time\",\"Reading\"\n";
        assert_eq!(parse_preamble(&mut ok.lines()).unwrap(), Quantity::Rainfall);

        let no_marker = "Substance: Rainfall\nno data here\n";
        match parse_preamble(&mut no_marker.lines()) {
            Err(IngestError::Format(msg)) => assert!(msg.contains("marker")),
            other => panic!("expected format error, got {other:?}"),
        }

        let no_substance = "\"Date\",\"Time\",\"Reading\"\n";
        match parse_preamble(&mut no_substance.lines()) {
            Err(IngestError::Format(msg)) => assert!(msg.contains("substance")),
            other => panic!("expected format error, got {other:?}"),
        }
    }

    #[test]
    fn sniff_spots_a_station_export() {
        assert!(looks_like_station_export("header\nSubstance: Rainfall\n"));
        assert!(!looks_like_station_export("DATE,TIME,SOLAR W/m2\n"));
    }
}
