use anyhow::{bail, Result};
use ingest_service::{
    aggregate::{BucketAggregator, Reduction},
    config::AppConfig,
    normalize::{CivilTimeNormalizer, SampleValidation, TransitionTable},
    observability,
    pipeline::Pipeline,
    sinks::{ColumnSpec, ReconcilingSink},
    sources::{station_csv, weather_csv::WeatherCsvSource},
};
use series_client::db::SeriesStore;
use series_client::domain::Quantity;
use sqlx::postgres::PgPoolOptions;
use std::{env, sync::Arc};
use time::OffsetDateTime;

/// One-shot import of a local weather CSV, bypassing the watched
/// directory. Handy for backfilling years of station exports.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: import_weather_csv <csv_file_path>");
    }
    let file_path = &args[1];

    let cfg = AppConfig::load()?;

    let pool = PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect(&cfg.database.uri)
        .await?;
    let store = SeriesStore::new(pool);

    let body = tokio::fs::read_to_string(file_path).await?;
    let year = OffsetDateTime::now_utc().year();
    let table = Arc::new(TransitionTable::uk(year - 20, year + 5));

    let merged = if station_csv::looks_like_station_export(&body) {
        let quantity = match station_csv::substance_of(&body) {
            Some(q) => q,
            None => bail!("unrecognized substance in {file_path}"),
        };
        let reduction = match quantity {
            Quantity::Rainfall => Reduction::Sum,
            _ => Reduction::Latest,
        };
        let pipeline = Pipeline {
            source: station_csv::StationCsvSource::new(file_path),
            transforms: vec![Arc::new(SampleValidation)],
            aggregator: BucketAggregator::new(reduction),
            sink: ReconcilingSink::new(
                store,
                &cfg.weather.station_table,
                ColumnSpec::Fixed(quantity.column().to_string()),
            ),
        };
        pipeline.run().await?
    } else {
        let pipeline = Pipeline {
            source: WeatherCsvSource::from_file(file_path),
            transforms: vec![
                Arc::new(CivilTimeNormalizer::new(table)),
                Arc::new(SampleValidation),
            ],
            aggregator: BucketAggregator::new(Reduction::MeanInclusiveBoundary),
            sink: ReconcilingSink::new(
                store,
                &cfg.weather.filton_table,
                ColumnSpec::Fixed(Quantity::SolarRadiation.column().to_string()),
            ),
        };
        pipeline.run().await?
    };

    tracing::info!(merged, file = file_path, "weather CSV imported");
    Ok(())
}
