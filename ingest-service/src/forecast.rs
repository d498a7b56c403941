use serde::Deserialize;
use series_client::db::SeriesStore;
use time::{Duration, OffsetDateTime, PrimitiveDateTime, Time};

use crate::{driver::ApiDriver, pipeline::IngestError, report::Report};

/// Historical cloud-cover/visibility importer for the forecast API.
///
/// Fetched day by day, resuming one hour past the latest stored row so
/// a day is never fetched twice; when the history table is empty the
/// window opens at the oldest power bucket instead, backfilling the
/// whole generation record. Every request goes through the shared
/// call budget, so a long backfill simply continues across runs as
/// quota allows.
pub struct ForecastImporter {
    store: SeriesStore,
    base_url: String,
    api_key: String,
    latitude: f64,
    longitude: f64,
    table: String,
    power_table: String,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    #[serde(default)]
    hourly: Option<DataBlock>,
    #[serde(default)]
    daily: Option<DataBlock>,
}

#[derive(Debug, Deserialize)]
struct DataBlock {
    #[serde(default)]
    data: Vec<DataPoint>,
}

#[derive(Debug, Deserialize)]
struct DataPoint {
    time: i64,
    #[serde(rename = "cloudCover", default)]
    cloud_cover: Option<f64>,
    #[serde(default)]
    visibility: Option<f64>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    icon: Option<String>,
}

impl DataPoint {
    fn is_empty(&self) -> bool {
        self.cloud_cover.is_none()
            && self.visibility.is_none()
            && self.summary.is_none()
            && self.icon.is_none()
    }

    fn timestamp(&self) -> Result<PrimitiveDateTime, IngestError> {
        let dt = OffsetDateTime::from_unix_timestamp(self.time)
            .map_err(|e| IngestError::Format(format!("bad unix time {}: {e}", self.time)))?;
        Ok(PrimitiveDateTime::new(dt.date(), dt.time()))
    }
}

/// The day range still to fetch, both endpoints pinned to midday so a
/// DST transition cannot shift which civil day a request lands on.
pub fn resume_window(
    stored: Option<(PrimitiveDateTime, PrimitiveDateTime)>,
    power_extremes: Option<(PrimitiveDateTime, PrimitiveDateTime)>,
    now: PrimitiveDateTime,
) -> (PrimitiveDateTime, PrimitiveDateTime) {
    let noon = time::macros::time!(12:00);
    let start = match stored {
        Some((_, latest)) => latest + Duration::hours(1),
        None => match power_extremes {
            Some((oldest, _)) => oldest,
            None => now - Duration::days(1),
        },
    };
    (
        PrimitiveDateTime::new(start.date(), noon),
        PrimitiveDateTime::new(now.date(), noon),
    )
}

impl ForecastImporter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: SeriesStore,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        latitude: f64,
        longitude: f64,
        table: impl Into<String>,
        power_table: impl Into<String>,
    ) -> Self {
        Self {
            store,
            base_url: base_url.into(),
            api_key: api_key.into(),
            latitude,
            longitude,
            table: table.into(),
            power_table: power_table.into(),
        }
    }

    fn day_url(&self, day: PrimitiveDateTime) -> String {
        let unix = day.assume_utc().unix_timestamp();
        format!(
            "{}/{}/{},{},{}?units=si&exclude=currently,minutely,alerts",
            self.base_url, self.api_key, self.latitude, self.longitude, unix
        )
    }

    /// Import as much history as the call budget allows. Quota
    /// exhaustion is an informational note, not a failure.
    pub async fn run(
        &self,
        driver: &ApiDriver,
        now: PrimitiveDateTime,
        report: &mut Report,
    ) -> Result<u64, IngestError> {
        self.store
            .ensure_forecast_tables(&self.table)
            .await
            .map_err(|e| IngestError::Storage(format!("ensuring forecast tables: {e}")))?;

        let stored = self
            .store
            .time_extremes(&self.table, None)
            .await
            .map_err(|e| IngestError::Storage(format!("reading forecast extremes: {e}")))?;
        let power = self
            .store
            .time_extremes(&self.power_table, None)
            .await
            .unwrap_or(None);
        let (mut day, end) = resume_window(stored, power, now);

        let mut merged: u64 = 0;
        while day < end {
            let doc = match driver.get_json(&self.day_url(day)).await {
                Ok(doc) => doc,
                Err(e) if e.is_quota_skip() => {
                    report.info(format!("forecast import paused at {}: {e}", day.date()));
                    return Ok(merged);
                }
                Err(e) => return Err(e),
            };
            let response: ForecastResponse = serde_json::from_value(doc)
                .map_err(|e| IngestError::Format(format!("bad forecast response: {e}")))?;

            for hour in response.hourly.map(|b| b.data).unwrap_or_default() {
                if hour.is_empty() {
                    continue;
                }
                let ts = hour.timestamp()?;
                self.store
                    .merge_forecast_hour(
                        &self.table,
                        ts,
                        hour.cloud_cover,
                        hour.visibility,
                        hour.summary.as_deref(),
                        hour.icon.as_deref(),
                    )
                    .await
                    .map_err(|e| IngestError::Storage(format!("merging forecast hour: {e}")))?;
                merged += 1;
            }

            for daily in response.daily.map(|b| b.data).unwrap_or_default() {
                if daily.is_empty() {
                    continue;
                }
                self.store
                    .merge_forecast_day(
                        &self.table,
                        day.date(),
                        daily.cloud_cover,
                        daily.visibility,
                        daily.summary.as_deref(),
                        daily.icon.as_deref(),
                    )
                    .await
                    .map_err(|e| IngestError::Storage(format!("merging forecast day: {e}")))?;
                merged += 1;
            }

            day += Duration::days(1);
        }
        tracing::info!(merged, table = %self.table, "forecast history import complete");
        Ok(merged)
    }
}
