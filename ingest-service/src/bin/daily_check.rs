use anyhow::Result;
use ingest_service::{
    detector::{self, DetectorParams},
    normalize::TransitionTable,
    observability,
    report::Report,
    runner::utc_now,
    solar::DaylightWindow,
};
use ingest_service::config::AppConfig;
use series_client::db::{day_queries, SeriesStore};
use series_client::domain::{meter_column_name, Quantity};
use sqlx::postgres::PgPoolOptions;

/// Detector-only run: no imports, just scan yesterday's reconciled
/// power series for gaps and implausible zeros and print the report.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    let pool = PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect(&cfg.database.uri)
        .await?;
    let store = SeriesStore::new(pool);

    let detector_cfg = cfg.detector.clone().unwrap_or_default();
    let now = utc_now();
    let table = TransitionTable::uk(now.year() - 1, now.year() + 1);
    let now_local = table.utc_to_civil(now).unwrap_or(now);
    let date = detector::target_date(now_local);
    let mut report = Report::new(now);

    let meters: Vec<String> = if detector_cfg.generation_meters.is_empty() {
        day_queries::all_meters(store.pool())
            .await?
            .iter()
            .map(|m| meter_column_name(&m.code))
            .collect()
    } else {
        detector_cfg.generation_meters.iter().map(|c| meter_column_name(c)).collect()
    };
    if meters.is_empty() {
        anyhow::bail!("no meters known; nothing to check");
    }

    let table = &cfg.platform.power_table;
    let rows = day_queries::meter_day_rows(store.pool(), table, &meters, date).await?;

    let sol_rad = Quantity::SolarRadiation.column();
    let mut irradiance = Vec::new();
    for (label, irr_table) in [
        ("filton", &cfg.weather.filton_table),
        ("create centre", &cfg.weather.station_table),
    ] {
        if let Ok(map) = day_queries::irradiance_for_day(store.pool(), irr_table, sol_rad, date).await {
            if !map.is_empty() {
                irradiance.push((label.to_string(), map));
            }
        }
    }

    let window = DaylightWindow::for_date(date, detector_cfg.latitude, detector_cfg.longitude);
    let latest_known = store.time_extremes(table, None).await?.map(|(_, hi)| hi);
    let params = DetectorParams { decent_irradiance: detector_cfg.decent_irradiance };

    let findings = detector::detect(date, &meters, &rows, &irradiance, window, latest_known, &params);
    if findings.is_empty() {
        report.info(format!("all {date} power data present and plausible"));
    } else {
        report.findings(&findings);
    }

    println!("{}", report.render("Daily power data check"));
    if report.has_error() {
        std::process::exit(1);
    }
    Ok(())
}
