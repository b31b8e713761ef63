use std::{net::SocketAddr, sync::Arc};

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::rendezvous::{
    telemetry::{self, SharedPrometheusHandle},
    tunnel::relay::Relay,
};

#[derive(Clone)]
pub struct AdminState {
    pub prom: SharedPrometheusHandle,
    /// Absent when this process only runs peers.
    pub relay: Option<Arc<Relay>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/sessions", get(sessions))
        .route("/connections", get(connections))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(admin_addr = %addr, "admin: listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    sessions: usize,
    connections: usize,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let (sessions, connections) = match &st.relay {
        Some(r) => (r.manager().session_count().await, r.connections().len()),
        None => (0, 0),
    };
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            sessions,
            connections,
        }),
    )
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

async fn sessions(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let snap = match &st.relay {
        Some(r) => r.manager().snapshot().await,
        None => Vec::new(),
    };
    (StatusCode::OK, Json(snap))
}

async fn connections(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let snap: Vec<telemetry::ConnectionInfo> = match &st.relay {
        Some(r) => r.connections().snapshot(),
        None => Vec::new(),
    };
    (StatusCode::OK, Json(snap))
}
