use anyhow::Result;
use ingest_service::{
    config::AppConfig,
    metrics_server, observability,
    runner::{LogFileNotifier, Notifier, Runner},
};
use series_client::db::SeriesStore;
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr);
    }

    // An unreachable database is the only hard abort: no report, a
    // non-zero exit for the scheduler to notice.
    let pool = PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect(&cfg.database.uri)
        .await?;
    let store = SeriesStore::new(pool);

    let notifier = LogFileNotifier::new(cfg.report_log_path.clone());
    let runner = Runner::new(cfg, store).await?;
    let report = runner.run().await;

    let text = report.render("Half-hourly telemetry import and check");
    println!("{text}");
    notifier.notify("telemetry run report", &text).await?;

    if report.has_error() {
        tracing::warn!("run finished with findings or warnings; see report");
    }
    Ok(())
}
