//! HTTP endpoint for a running stage.
//!
//! `/metrics` renders the Prometheus recorder. `/health` answers with the
//! stage name and how long the process has been running, so an operator can
//! tell which stage a long run belongs to.

use axum::extract::State;
use axum::{Json, Router, routing::get};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use snafu::prelude::*;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{MetricsError, PrometheusInitSnafu};

/// Shared by the endpoint handlers.
#[derive(Clone)]
struct Endpoint {
    handle: PrometheusHandle,
    stage: Arc<str>,
    started_at: DateTime<Utc>,
}

/// Body of `/health`.
#[derive(Debug, Serialize, PartialEq)]
pub struct Health {
    pub status: &'static str,
    pub stage: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
}

impl Health {
    fn at(stage: &str, started_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            status: "ok",
            stage: stage.to_string(),
            started_at,
            uptime_secs: (now - started_at).num_seconds().max(0),
        }
    }
}

/// Install the Prometheus recorder and serve `stage`'s endpoint on `addr`.
pub fn init(addr: SocketAddr, stage: &str) -> Result<(), MetricsError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    let endpoint = Endpoint {
        handle,
        stage: Arc::from(stage),
        started_at: Utc::now(),
    };
    tokio::spawn(serve(addr, endpoint));
    Ok(())
}

async fn serve(addr: SocketAddr, endpoint: Endpoint) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "Failed to bind metrics endpoint");
            return;
        }
    };
    info!(%addr, stage = %endpoint.stage, "Serving /metrics and /health");

    let app = Router::new()
        .route("/metrics", get(render_metrics))
        .route("/health", get(health))
        .with_state(endpoint);
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "Metrics endpoint stopped");
    }
}

async fn render_metrics(State(endpoint): State<Endpoint>) -> String {
    endpoint.handle.render()
}

async fn health(State(endpoint): State<Endpoint>) -> Json<Health> {
    Json(Health::at(&endpoint.stage, endpoint.started_at, Utc::now()))
}
