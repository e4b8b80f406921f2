//! Prometheus endpoint for the loader's internal metrics.

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use snafu::prelude::*;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::error::{AddressParseSnafu, MetricsBindSnafu, MonitoringError, PrometheusInitSnafu};

/// Install the metrics recorder and expose it over HTTP.
///
/// `/metrics` renders the recorder; `/health` answers liveness probes.
/// The socket is bound before this returns, so a taken port fails
/// startup instead of dying later inside a background task.
pub async fn start(address: &str) -> Result<(), MonitoringError> {
    let addr: SocketAddr = address.parse().context(AddressParseSnafu)?;
    let recorder = PrometheusBuilder::new()
        .install_recorder()
        .context(PrometheusInitSnafu)?;
    let listener = TcpListener::bind(addr).await.context(MetricsBindSnafu)?;

    let render = move || {
        let recorder = recorder.clone();
        async move { recorder.render() }
    };
    let routes = Router::new()
        .route("/metrics", get(render))
        .route("/health", get(|| async { "ok\n" }));

    info!(%addr, "Metrics endpoint up");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, routes).await {
            warn!("Metrics endpoint stopped: {e}");
        }
    });

    Ok(())
}
