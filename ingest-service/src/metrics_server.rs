use std::net::SocketAddr;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder and serve `/metrics` on a
/// background task. Called at most once, before any pipeline runs.
pub fn init(bind_addr: &str) {
    let handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "failed to install Prometheus metrics recorder");
            return;
        }
    };
    let _ = PROM_HANDLE.set(handle);

    let addr: SocketAddr = match bind_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(error = %e, bind_addr, "invalid metrics bind address");
            return;
        }
    };

    tokio::spawn(async move {
        let app = Router::new().route("/metrics", get(render_metrics));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(error = %e, %addr, "failed to bind metrics listener");
                return;
            }
        };
        if let Err(e) = axum::serve(listener, app.into_make_service()).await {
            tracing::error!(error = %e, "metrics server error");
        }
    });
}

async fn render_metrics() -> String {
    PROM_HANDLE.get().map(PrometheusHandle::render).unwrap_or_default()
}
