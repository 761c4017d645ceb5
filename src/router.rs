use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::consumer::Consumer;
use crate::error::ProxyError;
use crate::identity::IdentityMap;
use crate::lifecycle::ShutdownFlags;
use crate::metrics;
use crate::publisher::{check_publisher_identity, Publisher};
use crate::subscriber::Subscriber;
use crate::types::{is_pass_through_header, CORRELATION_HEADER, IDENTITY_HEADER, MESSAGE_COUNT_HEADER, TOKEN_HEADER};

pub struct AppState {
    pub identities: IdentityMap,
    pub publishers: HashMap<String, Publisher>,
    pub consumers: HashMap<String, Consumer>,
    pub subscribers: Vec<Arc<Subscriber>>,
    pub flags: Arc<ShutdownFlags>,
    pub consume_success_status: StatusCode,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/ready", get(readiness))
        .route("/metrics", get(metrics))
        .route("/publish/{queue}", post(publish))
        .route("/consume/{queue}", get(consume))
        .fallback(unknown_route)
        .layer(middleware::from_fn_with_state(state.clone(), reject_during_shutdown))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// During `pendingShutdown`, every route except `/` and `/metrics`
/// answers 503, per spec.md §4.7.
async fn reject_during_shutdown(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let path = request.uri().path();
    if state.flags.pending_shutdown() && path != "/" && path != "/metrics" {
        return ProxyError::ShuttingDown.into_response();
    }
    next.run(request).await
}

async fn liveness() -> Response {
    (StatusCode::OK, Json(json!({ "status": "healthy", "service": "bunny-rest-proxy", "timestamp": Utc::now().to_rfc3339() }))).into_response()
}

async fn readiness(State(state): State<Arc<AppState>>) -> Response {
    let body = json!({ "status": if state.flags.pending_shutdown() || state.flags.error_shutdown() { "not_ready" } else { "ready" }, "timestamp": Utc::now().to_rfc3339() });
    if state.flags.pending_shutdown() || state.flags.error_shutdown() {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    } else {
        (StatusCode::OK, Json(body)).into_response()
    }
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let publishers: Vec<Publisher> = state.publishers.values().cloned().collect();
    let consumers: Vec<Consumer> = state.consumers.values().cloned().collect();
    metrics::render(&publishers, &consumers, &state.subscribers).into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn pass_through_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str();
            if is_pass_through_header(name) {
                value.to_str().ok().map(|v| (name.to_string(), v.to_string()))
            } else {
                None
            }
        })
        .collect()
}

async fn publish(State(state): State<Arc<AppState>>, Path(queue): Path<String>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(publisher) = state.publishers.get(&queue) else {
        return ProxyError::UnknownQueue.into_response();
    };

    let identity = header_str(&headers, IDENTITY_HEADER);
    let token = header_str(&headers, TOKEN_HEADER);
    if let Err(e) = check_publisher_identity(&state.identities, publisher, identity, token) {
        return e.into_response();
    }

    let content_type = header_str(&headers, "content-type");
    let correlation_id = header_str(&headers, CORRELATION_HEADER);
    let extra_headers = pass_through_headers(&headers);

    match publisher.send_message(content_type, correlation_id, &extra_headers, &body).await {
        Ok(outcome) => (StatusCode::CREATED, Json(outcome)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn consume(State(state): State<Arc<AppState>>, Path(queue): Path<String>, headers: HeaderMap) -> Response {
    let Some(consumer) = state.consumers.get(&queue) else {
        return ProxyError::UnknownQueue.into_response();
    };

    let identity = header_str(&headers, IDENTITY_HEADER);
    let token = header_str(&headers, TOKEN_HEADER);
    if let Err(e) = state.identities.check(consumer.allowed_identities(), identity, token) {
        return e.into_response();
    }

    match consumer.consume_one().await {
        Ok(Some(outcome)) => {
            let mut response = (state.consume_success_status, outcome.body).into_response();
            let response_headers = response.headers_mut();
            response_headers.insert("content-type", outcome.content_type.parse().unwrap_or_else(|_| "application/octet-stream".parse().unwrap()));
            if let Ok(value) = axum::http::HeaderValue::try_from(outcome.message_count.to_string()) {
                response_headers.insert(MESSAGE_COUNT_HEADER, value);
            }
            for (name, value) in &outcome.pass_through_headers {
                if let (Ok(name), Ok(value)) = (axum::http::HeaderName::try_from(name.as_str()), axum::http::HeaderValue::try_from(value.as_str())) {
                    response_headers.insert(name, value);
                }
            }
            response
        }
        Ok(None) => ProxyError::Empty.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn unknown_route() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "UNKNOWN_QUEUE", "message": "unknown queue" }))).into_response()
}
