//! Metrics and probe endpoints.
//!
//! - `/metrics` - Prometheus metrics in text format
//! - `/healthz` - liveness: the process is running
//! - `/readyz` - readiness: startup has finished (leadership held when
//!   enabled, cache warm, poll manager running); the body reports how many
//!   poll watches are registered so a stuck startup is distinguishable from
//!   an idle controller
//!
//! Binds to `--metrics-bind-address` (`:8081` by default).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tracing::info;

use crate::metrics::REGISTRY;
use crate::poller::GitPoller;

/// Flipped once by the controller after leadership is held and the shared
/// cache and poll manager are running; read by `/readyz`.
pub struct Readiness {
    ready: AtomicBool,
    poller: Arc<GitPoller>,
}

impl Readiness {
    pub fn new(poller: Arc<GitPoller>) -> Self {
        Self {
            ready: AtomicBool::new(false),
            poller,
        }
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

pub async fn serve_probes(addr: &str, readiness: Arc<Readiness>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(readiness);

    let listener = TcpListener::bind(addr).await?;
    info!("metrics endpoint on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics() -> Response {
    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("encoding metrics: {e}"),
        )
            .into_response(),
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok\n")
}

async fn readyz(State(readiness): State<Arc<Readiness>>) -> Response {
    if readiness.is_ready() {
        let watches = readiness.poller.watch_count();
        (StatusCode::OK, format!("ok: {watches} poll watches\n")).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting\n").into_response()
    }
}
