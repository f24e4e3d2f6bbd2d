// rest/mod.rs — HTTP surface for orchestrator probes.
//
// Axum server exposing GET /health. The handler only reads a snapshot of the
// health monitor; it never touches the database or Slack, so response time is
// independent of check-cycle duration.
//
// Status mapping:
//   Healthy | Degraded → 200 (liveness holds through a single blip)
//   Down              → 503

use anyhow::Result;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::health::HealthState;
use crate::CanaryContext;

pub async fn serve(ctx: Arc<CanaryContext>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", ctx.settings.bind_address, ctx.settings.port).parse()?;
    let router = build_router(ctx);

    info!("health endpoint listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn build_router(ctx: Arc<CanaryContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(ctx)
}

async fn health(State(ctx): State<Arc<CanaryContext>>) -> (StatusCode, Json<Value>) {
    let snapshot = ctx.monitor.snapshot().await;
    let code = match snapshot.state {
        HealthState::Healthy | HealthState::Degraded => StatusCode::OK,
        HealthState::Down => StatusCode::SERVICE_UNAVAILABLE,
    };

    let body = json!({
        "status": snapshot.state,
        "datastack": ctx.settings.datastack,
        "consecutive_failures": snapshot.consecutive_failures,
        "last_result": snapshot.last_result,
        "last_failure_detail": snapshot.last_failure_detail,
        "uptime_secs": ctx.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    });
    (code, Json(body))
}
