use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bunny_rest_proxy::identity::IdentityMap;
use bunny_rest_proxy::lifecycle::ShutdownFlags;
use bunny_rest_proxy::router::{build_router, AppState};
use tower::ServiceExt;

fn empty_state() -> Arc<AppState> {
    Arc::new(AppState {
        identities: IdentityMap::new(vec![]),
        publishers: HashMap::new(),
        consumers: HashMap::new(),
        subscribers: Vec::new(),
        flags: Arc::new(ShutdownFlags::default()),
        consume_success_status: StatusCode::RESET_CONTENT,
    })
}

#[tokio::test]
async fn liveness_route_returns_ok() {
    let app = build_router(empty_state());
    let response = app.oneshot(Request::builder().uri("/").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn ready_route_reflects_shutdown_flags() {
    let state = empty_state();
    let app = build_router(state.clone());

    let response = app.clone().oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    state.flags.force_pending();
    let response = app.oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn publish_to_unconfigured_queue_is_unknown_queue() {
    let app = build_router(empty_state());
    let response = app.oneshot(Request::builder().method("POST").uri("/publish/nope").body(Body::from("{}")).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn consume_from_unconfigured_queue_is_unknown_queue() {
    let app = build_router(empty_state());
    let response = app.oneshot(Request::builder().uri("/consume/nope").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unregistered_path_falls_back_to_unknown_queue_json() {
    let app = build_router(empty_state());
    let response = app.oneshot(Request::builder().uri("/something-else").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn metrics_route_stays_reachable_during_pending_shutdown() {
    let state = empty_state();
    state.flags.force_pending();
    let app = build_router(state);

    let response = app.oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn non_exempt_routes_reject_during_pending_shutdown() {
    let state = empty_state();
    state.flags.force_pending();
    let app = build_router(state);

    let response = app.oneshot(Request::builder().uri("/consume/whatever").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
