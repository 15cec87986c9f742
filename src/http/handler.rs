//! The instrumented request handler.
//!
//! Every request gets a span and an access-log event. The response is always
//! `200 hello, world!`; the telemetry path can only log.

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::IntoResponse,
};
use opentelemetry::KeyValue;
use uuid::Uuid;

use crate::event::AccessLogEvent;
use crate::http::server::AppState;
use crate::observability::metrics;

pub const RESPONSE_BODY: &str = "hello, world!";

/// Random alphanumeric payload of `len` characters.
pub fn random_message(len: usize) -> String {
    (0..len).map(|_| fastrand::alphanumeric()).collect()
}

pub async fn access_log_handler(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> impl IntoResponse {
    let started = Instant::now();
    let traceno = Uuid::new_v4();

    let mut span = state.propagator.start_span(&headers, uri.path().to_string());
    span.set_tag("status", "N");
    span.set_tag("traceNo", traceno.to_string());
    span.log_event(
        "message",
        vec![KeyValue::new("message", random_message(state.message_len))],
    );

    span.log_event("client_send", Vec::new());
    if let Some(downstream) = &state.downstream {
        match downstream.call(&state.propagator, &span).await {
            Ok(status) => {
                tracing::debug!(traceno = %traceno, status = %status, "Downstream responded");
            }
            Err(e) => {
                span.set_error(e.to_string());
                tracing::warn!(
                    traceno = %traceno,
                    downstream = %downstream.uri(),
                    error = %e,
                    "Downstream request failed"
                );
            }
        }
    }
    span.log_event("client_receive", Vec::new());

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.host())
        .unwrap_or_default();
    let path = uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or_else(|| uri.path());
    let ip = remote.ip().to_string();

    let event = AccessLogEvent::builder()
        .method(method.as_str())
        .host(host)
        .path(path)
        .ip(ip.as_str())
        .response_time(started.elapsed())
        .traceno(traceno)
        .message(random_message(state.message_len))
        .trace(span.trace_id().to_string(), span.span_id().to_string())
        .build();

    // Same client, same partition.
    state.producer.produce(&event, &ip);

    span.finish();
    metrics::record_request(method.as_str(), StatusCode::OK.as_u16(), started);
    (StatusCode::OK, RESPONSE_BODY)
}
