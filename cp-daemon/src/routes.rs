use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use cp_control_plane::ControlPlane;
use cp_core::{WorkflowId, WorkflowState};
use cp_eventbus::EventFilter;
use cp_registry::ListQuery;
use cp_supervisor::ShutdownOptions;
use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::dto::{CreateWorkflowRequest, ListParams, StopParams, WorkflowView};
use crate::error::ApiError;

/// The minimal HTTP/SSE surface named in the expanded spec: create, start,
/// pause, resume, stop, get, list, subscribe. Everything beyond that
/// (auth, pagination links, OpenAPI docs) is left to whatever external
/// client embeds this daemon.
pub fn router(control_plane: Arc<ControlPlane>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    // SSE streams are long-lived by design, so the request timeout layer
    // only wraps the request/response routes, not `/events`.
    let request_routes = Router::new()
        .route("/workflows", post(create_workflow).get(list_workflows))
        .route("/workflows/:id", get(get_workflow))
        .route("/workflows/:id/start", post(start_workflow))
        .route("/workflows/:id/pause", post(pause_workflow))
        .route("/workflows/:id/resume", post(resume_workflow))
        .route("/workflows/:id/stop", post(stop_workflow))
        .layer(TimeoutLayer::new(Duration::from_secs(30)));

    let stream_routes = Router::new()
        .route("/events", get(subscribe_all))
        .route("/workflows/:id/events", get(subscribe_workflow));

    request_routes
        .merge(stream_routes)
        .with_state(control_plane)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
}

fn parse_id(raw: &str) -> Result<WorkflowId, ApiError> {
    raw.parse().map_err(|_| {
        ApiError(cp_core::ControlPlaneError::InvalidSpec {
            reason: format!("invalid workflow id: {raw}"),
        })
    })
}

async fn create_workflow(
    State(cp): State<Arc<ControlPlane>>,
    Json(req): Json<CreateWorkflowRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let wf = cp.create(req.into()).await?;
    Ok(Json(WorkflowView::from(&wf)))
}

async fn list_workflows(
    State(cp): State<Arc<ControlPlane>>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let mut query = ListQuery::default();
    if let Some(state) = params.state.as_deref() {
        let parsed = parse_state(state)?;
        query.states = HashSet::from([parsed]);
    }
    query.template_id = params.template_id;
    query.offset = params.offset.unwrap_or(0);
    query.limit = params.limit;

    let workflows = cp.list(&query).await?;
    Ok(Json(workflows.iter().map(WorkflowView::from).collect::<Vec<_>>()))
}

fn parse_state(raw: &str) -> Result<WorkflowState, ApiError> {
    let state = match raw {
        "pending" => WorkflowState::Pending,
        "running" => WorkflowState::Running,
        "paused" => WorkflowState::Paused,
        "completed" => WorkflowState::Completed,
        "failed" => WorkflowState::Failed,
        "stopped" => WorkflowState::Stopped,
        other => {
            return Err(ApiError(cp_core::ControlPlaneError::InvalidSpec {
                reason: format!("unknown state filter: {other}"),
            }))
        }
    };
    Ok(state)
}

async fn get_workflow(
    State(cp): State<Arc<ControlPlane>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let wf = cp.get(id).await?;
    Ok(Json(WorkflowView::from(&wf)))
}

async fn start_workflow(
    State(cp): State<Arc<ControlPlane>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let wf = cp.start(id).await?;
    Ok(Json(WorkflowView::from(&wf)))
}

async fn pause_workflow(
    State(cp): State<Arc<ControlPlane>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let wf = cp.pause(id).await?;
    Ok(Json(WorkflowView::from(&wf)))
}

async fn resume_workflow(
    State(cp): State<Arc<ControlPlane>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let wf = cp.resume(id).await?;
    Ok(Json(WorkflowView::from(&wf)))
}

async fn stop_workflow(
    State(cp): State<Arc<ControlPlane>>,
    Path(id): Path<String>,
    Query(params): Query<StopParams>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let opts = ShutdownOptions {
        force: params.force,
        grace_period: params.grace_period_secs.map(Duration::from_secs),
    };
    let wf = cp.stop(id, opts).await?;
    Ok(Json(WorkflowView::from(&wf)))
}

/// `GET /events`: every classified event on the bus, as an SSE stream
///.
async fn subscribe_all(
    State(cp): State<Arc<ControlPlane>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let cancel = CancellationToken::new();
    let rx = cp.subscribe_filtered(EventFilter::default(), cancel);
    sse_from_receiver(rx)
}

async fn subscribe_workflow(
    State(cp): State<Arc<ControlPlane>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let id = parse_id(&id)?;
    let cancel = CancellationToken::new();
    let rx = cp.subscribe_workflow(id, cancel);
    Ok(sse_from_receiver(rx))
}

fn sse_from_receiver(
    mut rx: tokio::sync::mpsc::Receiver<cp_eventbus::ControlPlaneEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx)).map(|event| {
        Ok(Event::default()
            .event(event.event_type.as_str())
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("serialization error")))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
