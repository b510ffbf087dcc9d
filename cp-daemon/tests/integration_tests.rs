use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use cp_adapters::testkit::{FakeFabricFactory, FakeInfrastructureFactory, FakeSessionFactory};
use cp_adapters::{AgentProvider, PosixProcessProbe, Role, StaticAgentProvider};
use cp_control_plane::{build_registry, ControlPlane};
use cp_daemon::routes;
use cp_eventbus::EventBus;
use cp_health::{HealthPolicy, SystemClock};
use cp_registry::SqliteSessionRepository;
use cp_supervisor::{Supervisor, SupervisorConfig};
use serde_json::{json, Value};
use tower::ServiceExt;

/// Spins up the real router against fakes, the same way a `TestApp`
/// boots its axum app against an in-memory database.
async fn test_router() -> axum::Router {
    let repo = Arc::new(SqliteSessionRepository::open_in_memory().await.unwrap());
    let probe = Arc::new(PosixProcessProbe);
    let registry = build_registry("proj-a", repo, probe);

    let coordinator: Arc<dyn AgentProvider> = Arc::new(StaticAgentProvider::new(Role::Coordinator, "c", vec![]));
    let event_bus = Arc::new(EventBus::new());
    let supervisor = Arc::new(Supervisor::new(
        None,
        Arc::new(FakeSessionFactory),
        Arc::new(FakeInfrastructureFactory::default()),
        Arc::new(FakeFabricFactory),
        coordinator,
        None,
        event_bus.clone(),
        SupervisorConfig::default(),
    ));

    let control_plane = ControlPlane::new(registry, supervisor, event_bus, HealthPolicy::default(), Arc::new(SystemClock)).unwrap();
    routes::router(control_plane)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

#[tokio::test]
async fn create_then_get_round_trips_over_http() {
    let router = test_router().await;

    let create_body = json!({ "template_id": "t", "initial_prompt": "hello" });
    let response = router
        .clone()
        .oneshot(json_request("POST", "/workflows", create_body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created = body_json(response).await;
    assert_eq!(created["state"], "pending");
    let id = created["id"].as_str().unwrap().to_string();

    let response = router
        .oneshot(Request::builder().uri(format!("/workflows/{id}")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = body_json(response).await;
    assert_eq!(fetched["id"], id);
}

#[tokio::test]
async fn get_unknown_workflow_returns_404() {
    let router = test_router().await;

    let response = router
        .oneshot(
            Request::builder()
                .uri(format!("/workflows/{}", cp_core::WorkflowId::new()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn start_then_stop_transitions_through_http() {
    let router = test_router().await;

    let create_body = json!({ "template_id": "t", "initial_prompt": "hello" });
    let response = router
        .clone()
        .oneshot(json_request("POST", "/workflows", create_body))
        .await
        .unwrap();
    let created = body_json(response).await;
    let id = created["id"].as_str().unwrap().to_string();

    let response = router
        .clone()
        .oneshot(Request::builder().method("POST").uri(format!("/workflows/{id}/start")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let started = body_json(response).await;
    assert_eq!(started["state"], "running");

    let response = router
        .oneshot(Request::builder().method("POST").uri(format!("/workflows/{id}/stop?force=true")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stopped = body_json(response).await;
    assert_eq!(stopped["state"], "failed");
}

#[tokio::test]
async fn list_filters_by_state() {
    let router = test_router().await;

    for _ in 0..2 {
        let create_body = json!({ "template_id": "t", "initial_prompt": "hello" });
        router.clone().oneshot(json_request("POST", "/workflows", create_body)).await.unwrap();
    }

    let response = router
        .oneshot(Request::builder().uri("/workflows?state=pending").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let listed = body_json(response).await;
    assert_eq!(listed.as_array().unwrap().len(), 2);
}
