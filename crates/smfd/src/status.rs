//! HTTP status endpoint. Exposes repository state as JSON.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

use smf_core::seid;
use smf_services::{PipelineStats, SessionRepository};

#[derive(Clone)]
pub struct StatusState {
    pub repository: Arc<SessionRepository>,
}

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub instance_id: u64,
    pub mode:        String,
    pub contexts:    usize,
    pub pipeline:    Option<PipelineStats>,
}

async fn handle_status(State(state): State<StatusState>) -> Json<StatusResponse> {
    let repo = &state.repository;
    Json(StatusResponse {
        instance_id: repo.instance_id(),
        mode:        repo.mode().to_string(),
        contexts:    repo.pool().len(),
        pipeline:    repo.pipeline_stats(),
    })
}

// ── /contexts ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ContextsResponse {
    pub contexts: Vec<ContextInfo>,
}

#[derive(Debug, Serialize)]
pub struct ContextInfo {
    pub reference: String,
    pub seid:      Option<String>,
    pub supi:      String,
    pub status:    String,
}

async fn handle_contexts(State(state): State<StatusState>) -> Json<ContextsResponse> {
    let pool = state.repository.pool();
    let mut contexts = Vec::with_capacity(pool.len());
    for ctx in pool.snapshot() {
        let guard = ctx.lock().await;
        contexts.push(ContextInfo {
            reference: ctx.reference().to_string(),
            seid:      pool.seid_of(ctx.reference()).map(seid::to_hex),
            supi:      guard.supi.clone(),
            status:    format!("{:?}", guard.status),
        });
    }
    contexts.sort_by(|a, b| a.reference.cmp(&b.reference));
    Json(ContextsResponse { contexts })
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: StatusState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status",   get(handle_status))
        .route("/contexts", get(handle_contexts))
        .with_state(state)
        .layer(cors)
}

pub async fn serve(
    state: StatusState,
    port: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "status endpoint listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
