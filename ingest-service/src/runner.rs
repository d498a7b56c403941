use std::{path::Path, sync::Arc, time::Duration};

use series_client::db::{day_queries, SeriesStore};
use series_client::domain::{meter_column_name, Meter, Quantity};
use time::{Duration as TimeDuration, OffsetDateTime, PrimitiveDateTime};
use tokio::io::AsyncWriteExt;

use crate::{
    aggregate::{BucketAggregator, Reduction},
    config::AppConfig,
    detector,
    driver::{self, ApiDriver, CallBudget},
    forecast::ForecastImporter,
    normalize::{CivilTimeNormalizer, SampleValidation, TransitionTable},
    pipeline::{IngestError, Pipeline, Transform},
    report::Report,
    sinks::{ColumnSpec, ReconcilingSink},
    solar::DaylightWindow,
    sources::{
        meter_flows::MeterFlowsSource, platform_json, readings_export::ReadingsExportSource,
        station_csv, weather_csv, weather_csv::WeatherCsvSource,
    },
};

/// Delivery seam for the finished report. E-mail lives behind this
/// boundary; the engine only hands over text.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// Appends the rendered report to the local log file.
pub struct LogFileNotifier {
    path: std::path::PathBuf,
}

impl LogFileNotifier {
    pub fn new<P: Into<std::path::PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl Notifier for LogFileNotifier {
    async fn notify(&self, subject: &str, body: &str) -> anyhow::Result<()> {
        let mut text = format!("==== {subject} ====\n");
        text.push_str(body);
        text.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        Ok(())
    }
}

pub fn utc_now() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_utc();
    PrimitiveDateTime::new(now.date(), now.time())
}

/// One scheduled batch run: sync entities, import every source, then
/// run the detector over the reconciled series. Each source fails
/// independently; its error becomes a report warning and the run
/// carries on. Only an unreachable database aborts the run.
pub struct Runner {
    cfg: AppConfig,
    store: SeriesStore,
    driver: ApiDriver,
    table: Arc<TransitionTable>,
    token: String,
}

impl Runner {
    pub async fn new(cfg: AppConfig, store: SeriesStore) -> anyhow::Result<Self> {
        let ceiling = cfg.forecast.as_ref().map(|f| f.call_ceiling).unwrap_or(1000);
        let budget = Arc::new(CallBudget::new(ceiling));
        let driver =
            ApiDriver::new(Duration::from_secs(cfg.http_timeout_secs), budget)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
        let token = driver::read_token_file(&cfg.platform.token_path)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        let now = utc_now();
        let table = Arc::new(TransitionTable::uk(now.year() - 15, now.year() + 5));
        Ok(Self { cfg, store, driver, table, token })
    }

    fn civil_transforms(&self) -> Vec<Arc<dyn Transform>> {
        vec![
            Arc::new(CivilTimeNormalizer::new(self.table.clone())),
            Arc::new(SampleValidation),
        ]
    }

    fn utc_transforms(&self) -> Vec<Arc<dyn Transform>> {
        vec![Arc::new(SampleValidation)]
    }

    fn note_outcome(report: &mut Report, label: &str, res: Result<u64, IngestError>) {
        match res {
            Ok(merged) => {
                tracing::info!(label, merged, "source imported");
            }
            Err(e) if e.is_quota_skip() => report.info(format!("{label}: {e}")),
            Err(e) => report.warn(format!("{label}: {e}")),
        }
    }

    pub async fn run(&self) -> Report {
        let now = utc_now();
        let mut report = Report::new(now);

        let meters = self.sync_entities(&mut report).await;
        self.import_meter_flows(&meters, &mut report).await;
        self.import_meter_readings(&meters, &mut report).await;
        self.import_dropped_csv_files(&mut report).await;
        self.import_filton_web(now, &mut report).await;
        self.import_forecast_history(now, &mut report).await;
        self.run_detector(now, &meters, &mut report).await;

        let power_table = &self.cfg.platform.power_table;
        if let Ok(rows) = self.store.row_count(power_table, None).await {
            tracing::info!(rows, table = %power_table, "reconciled power series size");
        }

        report
    }

    /// Refresh the sites and meters tables from the platform listings
    /// and return the meters to import. A sync failure falls back to
    /// the stored meter set.
    async fn sync_entities(&self, report: &mut Report) -> Vec<Meter> {
        let pool = self.store.pool();
        if let Err(e) = day_queries::ensure_entity_tables(pool).await {
            report.error(format!("entity tables unavailable: {e}"));
            return Vec::new();
        }

        let base = &self.cfg.platform.base_url;
        let sites_url = format!("{base}/a/site?authkey={}", self.token);
        match self.driver.get_paged(&sites_url, &["sites"]).await {
            Ok(doc) => match platform_json::parse_sites(&doc) {
                Ok(sites) => {
                    for site in &sites {
                        if let Err(e) = day_queries::upsert_site(pool, site).await {
                            report.warn(format!("storing site {}: {e}", site.code));
                        }
                    }
                }
                Err(e) => report.warn(format!("site listing: {e}")),
            },
            Err(e) if e.is_quota_skip() => report.info(format!("site listing: {e}")),
            Err(e) => report.warn(format!("site listing: {e}")),
        }

        let meters_url = format!("{base}/a/meter?authkey={}", self.token);
        match self.driver.get_paged(&meters_url, &["meters"]).await {
            Ok(doc) => match platform_json::parse_meters(&doc) {
                Ok(meters) => {
                    for meter in &meters {
                        if let Err(e) = day_queries::upsert_meter(pool, meter).await {
                            report.warn(format!("storing meter {}: {e}", meter.code));
                        }
                    }
                }
                Err(e) => report.warn(format!("meter listing: {e}")),
            },
            Err(e) if e.is_quota_skip() => report.info(format!("meter listing: {e}")),
            Err(e) => report.warn(format!("meter listing: {e}")),
        }

        match day_queries::all_meters(pool).await {
            Ok(meters) => meters,
            Err(e) => {
                report.error(format!("reading stored meters: {e}"));
                Vec::new()
            }
        }
    }

    /// Where to resume a meter's import from: just past its latest
    /// stored bucket, or a month back for a meter never seen before.
    async fn resume_from(&self, table: &str, column: &str, now: PrimitiveDateTime) -> PrimitiveDateTime {
        match self.store.time_extremes(table, Some(column)).await {
            Ok(Some((_, latest))) => latest + TimeDuration::minutes(30),
            _ => now - TimeDuration::days(30),
        }
    }

    async fn import_meter_flows(&self, meters: &[Meter], report: &mut Report) {
        let now = utc_now();
        let table = &self.cfg.platform.power_table;
        for meter in meters {
            let column = meter_column_name(&meter.code);
            let start = self.resume_from(table, &column, now).await;
            let url = format!(
                "{}/a/flow?meter={}&start={}&end={}&authkey={}",
                self.cfg.platform.base_url,
                meter.code,
                start.date(),
                now.date(),
                self.token
            );
            let body = match self.driver.get_text(&url).await {
                Ok(body) => body,
                Err(e) => {
                    Self::note_outcome(report, &format!("flows for {}", meter.code), Err(e));
                    continue;
                }
            };
            let pipeline = Pipeline {
                source: MeterFlowsSource::new(body),
                transforms: self.civil_transforms(),
                aggregator: BucketAggregator::for_entity(Reduction::Latest, meter.code.clone()),
                sink: self.sink(table, ColumnSpec::PerEntity),
            };
            Self::note_outcome(report, &format!("flows for {}", meter.code), pipeline.run().await);
        }
    }

    async fn import_meter_readings(&self, meters: &[Meter], report: &mut Report) {
        let table = &self.cfg.platform.readings_table;
        for meter in meters {
            let url = format!(
                "{}/a/meter/{}/readings?authkey={}",
                self.cfg.platform.base_url, meter.code, self.token
            );
            let body = match self.driver.get_text(&url).await {
                Ok(body) => body,
                Err(e) => {
                    Self::note_outcome(report, &format!("readings for {}", meter.code), Err(e));
                    continue;
                }
            };
            let pipeline = Pipeline {
                source: ReadingsExportSource::new(body),
                transforms: self.utc_transforms(),
                aggregator: BucketAggregator::for_entity(Reduction::Latest, meter.code.clone()),
                sink: self.sink(table, ColumnSpec::PerEntity),
            };
            Self::note_outcome(
                report,
                &format!("readings for {}", meter.code),
                pipeline.run().await,
            );
        }
    }

    async fn import_dropped_csv_files(&self, report: &mut Report) {
        let dir = &self.cfg.weather.import_dir;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                report.warn(format!("import directory {}: {e}", dir.display()));
                return;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !name.to_lowercase().ends_with(".csv") {
                continue;
            }
            let label = format!("weather file {name}");
            match self.import_weather_file(&path).await {
                Ok(merged) => {
                    tracing::info!(file = name, merged, "weather file imported");
                    let imported = path.with_extension("csv.imported");
                    if let Err(e) = tokio::fs::rename(&path, &imported).await {
                        report.warn(format!("{label}: imported but not renamed: {e}"));
                    }
                }
                Err(e) => Self::note_outcome(report, &label, Err(e)),
            }
        }
    }

    async fn import_weather_file(&self, path: &Path) -> Result<u64, IngestError> {
        let body = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| IngestError::Format(format!("failed to read {}: {e}", path.display())))?;

        if station_csv::looks_like_station_export(&body) {
            let quantity = station_csv::substance_of(&body).ok_or_else(|| {
                IngestError::Format("unrecognized substance in station CSV".into())
            })?;
            let reduction = match quantity {
                Quantity::Rainfall => Reduction::Sum,
                _ => Reduction::Latest,
            };
            let pipeline = Pipeline {
                source: station_csv::StationCsvSource::new(path),
                transforms: self.utc_transforms(),
                aggregator: BucketAggregator::new(reduction),
                sink: self.sink(
                    &self.cfg.weather.station_table,
                    ColumnSpec::Fixed(quantity.column().to_string()),
                ),
            };
            pipeline.run().await
        } else {
            let pipeline = Pipeline {
                source: WeatherCsvSource::from_text(body),
                transforms: self.civil_transforms(),
                aggregator: BucketAggregator::new(Reduction::MeanInclusiveBoundary),
                sink: self.sink(
                    &self.cfg.weather.filton_table,
                    ColumnSpec::Fixed(Quantity::SolarRadiation.column().to_string()),
                ),
            };
            pipeline.run().await
        }
    }

    /// Fetch per-day CSVs from the station web form, resuming from the
    /// day after the latest stored bucket.
    async fn import_filton_web(&self, now: PrimitiveDateTime, report: &mut Report) {
        let (form_url, base_url) = match (
            self.cfg.weather.filton_form_url.as_ref(),
            self.cfg.weather.filton_base_url.as_ref(),
        ) {
            (Some(form), Some(base)) => (form, base),
            _ => return,
        };

        let table = &self.cfg.weather.filton_table;
        let mut day = match self.store.time_extremes(table, None).await {
            Ok(Some((_, latest))) => latest.date() + TimeDuration::days(1),
            _ => now.date() - TimeDuration::days(7),
        };
        let today = now.date();

        while day < today {
            let label = format!("station web CSV for {day}");
            let result = self.import_filton_day(form_url, base_url, day).await;
            if let Err(e) = &result {
                if e.is_quota_skip() {
                    report.info(format!("{label}: {e}"));
                    return;
                }
            }
            Self::note_outcome(report, &label, result);
            day += TimeDuration::days(1);
        }
    }

    async fn import_filton_day(
        &self,
        form_url: &str,
        base_url: &str,
        day: time::Date,
    ) -> Result<u64, IngestError> {
        let fields = [
            ("formYear", format!("{:04}", day.year())),
            ("formMonth", format!("{:02}", day.month() as u8)),
            ("formDate", format!("{:02}", day.day())),
            ("submit1", "submit".to_string()),
        ];
        let page = self.driver.post_form(form_url, &fields).await?;
        let link = weather_csv::csv_link_in_page(&page).ok_or_else(|| {
            IngestError::Format(format!("no CSV link in web form response for {day}"))
        })?;
        let body = self.driver.get_text(&format!("{base_url}/{link}")).await?;

        let pipeline = Pipeline {
            source: WeatherCsvSource::from_text(body),
            transforms: self.civil_transforms(),
            aggregator: BucketAggregator::new(Reduction::MeanInclusiveBoundary),
            sink: self.sink(
                &self.cfg.weather.filton_table,
                ColumnSpec::Fixed(Quantity::SolarRadiation.column().to_string()),
            ),
        };
        pipeline.run().await
    }

    async fn import_forecast_history(&self, now: PrimitiveDateTime, report: &mut Report) {
        let forecast = match &self.cfg.forecast {
            Some(forecast) => forecast,
            None => return,
        };
        let api_key = match driver::read_api_key_file(&forecast.api_key_path).await {
            Ok(key) => key,
            Err(e) => {
                report.warn(format!("forecast API key: {e}"));
                return;
            }
        };
        let importer = ForecastImporter::new(
            self.store.clone(),
            forecast.base_url.clone(),
            api_key,
            forecast.latitude,
            forecast.longitude,
            forecast.table.clone(),
            self.cfg.platform.power_table.clone(),
        );
        match importer.run(&self.driver, now, report).await {
            Ok(merged) => tracing::info!(merged, "forecast history imported"),
            Err(e) => report.warn(format!("forecast history: {e}")),
        }
    }

    async fn run_detector(&self, now: PrimitiveDateTime, meters: &[Meter], report: &mut Report) {
        let detector_cfg = self.cfg.detector.clone().unwrap_or_default();

        let now_local = self.table.utc_to_civil(now).unwrap_or(now);
        let date = detector::target_date(now_local);
        let generation: Vec<String> = if detector_cfg.generation_meters.is_empty() {
            meters.iter().map(|m| meter_column_name(&m.code)).collect()
        } else {
            detector_cfg.generation_meters.iter().map(|c| meter_column_name(c)).collect()
        };
        if generation.is_empty() {
            report.warn("no meters known; skipping gap and anomaly detection");
            return;
        }

        let pool = self.store.pool();
        let table = &self.cfg.platform.power_table;
        let rows = match day_queries::meter_day_rows(pool, table, &generation, date).await {
            Ok(rows) => rows,
            Err(e) => {
                report.error(format!("reading power data for {date}: {e}"));
                return;
            }
        };

        let sol_rad = Quantity::SolarRadiation.column();
        let mut irradiance = Vec::new();
        for (label, table) in [
            ("filton", &self.cfg.weather.filton_table),
            ("create centre", &self.cfg.weather.station_table),
        ] {
            match day_queries::irradiance_for_day(pool, table, sol_rad, date).await {
                Ok(map) if !map.is_empty() => irradiance.push((label.to_string(), map)),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, table, "irradiance unavailable"),
            }
        }

        let window =
            DaylightWindow::for_date(date, detector_cfg.latitude, detector_cfg.longitude);
        let latest_known = self
            .store
            .time_extremes(table, None)
            .await
            .ok()
            .flatten()
            .map(|(_, hi)| hi);
        let params = detector::DetectorParams {
            decent_irradiance: detector_cfg.decent_irradiance,
        };

        let findings =
            detector::detect(date, &generation, &rows, &irradiance, window, latest_known, &params);
        if findings.is_empty() {
            report.info(format!("all {date} power data present and plausible"));
        } else {
            report.findings(&findings);
        }
    }

    fn sink(&self, table: &str, column: ColumnSpec) -> ReconcilingSink {
        let sink_cfg = self.cfg.sink.clone();
        let (retries, backoff) = sink_cfg
            .map(|s| (s.max_retries, Duration::from_millis(s.retry_backoff_ms)))
            .unwrap_or((3, Duration::from_millis(500)));
        ReconcilingSink::new(self.store.clone(), table, column).with_retries(retries, backoff)
    }
}
