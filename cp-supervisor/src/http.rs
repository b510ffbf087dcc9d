use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use dashmap::DashSet;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cp_adapters::{Command, Infrastructure};

/// Shared state for the three routes a workflow's HTTP server exposes
///. `worker_cache` is the "worker-server cache" —
/// here just the set of worker IDs seen so far, since request handling
/// itself is delegated to the workflow's single infrastructure submitter
/// rather than one server per worker.
#[derive(Clone)]
struct HttpState {
    infra: Arc<dyn Infrastructure>,
    worker_cache: Arc<DashSet<String>>,
}

async fn mcp_handler(State(state): State<HttpState>, Json(body): Json<Value>) -> impl IntoResponse {
    submit_and_respond(&state.infra, Command::new("mcp_request", body)).await
}

async fn worker_handler(
    State(state): State<HttpState>,
    Path(worker_id): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    state.worker_cache.insert(worker_id.clone());
    submit_and_respond(&state.infra, Command::new("worker_request", json!({ "worker_id": worker_id, "body": body }))).await
}

async fn observer_handler(State(state): State<HttpState>, Json(body): Json<Value>) -> impl IntoResponse {
    submit_and_respond(&state.infra, Command::new("observer_request", body)).await
}

async fn submit_and_respond(infra: &Arc<dyn Infrastructure>, command: Command) -> impl IntoResponse {
    match infra.submit_and_wait(command).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

fn build_router(infra: Arc<dyn Infrastructure>) -> Router {
    let state = HttpState {
        infra,
        worker_cache: Arc::new(DashSet::new()),
    };
    Router::new()
        .route("/mcp", post(mcp_handler))
        .route("/worker/:worker_id", post(worker_handler))
        .route("/observer", post(observer_handler))
        .with_state(state)
}

/// A workflow's running HTTP server: the accept-loop task plus the
/// cancellation token that drives its graceful shutdown (`close()` under
/// force, else a graceful wait with a grace period).
#[derive(Debug)]
pub struct HttpServerHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

/// Binds the TCP listener step runs on its own, ahead of infrastructure
/// and session allocation ("record the actual port").
pub async fn bind_listener() -> anyhow::Result<(tokio::net::TcpListener, u16)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

impl HttpServerHandle {
    /// Registers the three routes on an already-bound listener and spawns
    /// the accept loop in the background.
    pub fn serve(listener: tokio::net::TcpListener, infra: Arc<dyn Infrastructure>) -> Self {
        let router = build_router(infra);
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();

        let join = tokio::spawn(async move {
            let result = axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "workflow http server exited with error");
            }
        });

        Self { shutdown, join }
    }

    /// Graceful shutdown: signal and wait up to `grace_period`.
    pub async fn shutdown(self, grace_period: std::time::Duration) {
        self.shutdown.cancel();
        if tokio::time::timeout(grace_period, self.join).await.is_err() {
            warn!("workflow http server did not stop within grace period");
        }
    }

    /// Immediate shutdown: abort the accept loop without waiting.
    pub fn close(self) {
        self.join.abort();
        info!("workflow http server closed");
    }
}
