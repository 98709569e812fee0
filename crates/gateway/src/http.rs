use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use rpb_contracts::ErrorKind;
use rpb_remote::{API_SESSION_ID_HEADER, RemoteSession, credential_from_headers};
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use ulid::Ulid;

use crate::Gateway;

mod chassis;
mod tasks;
mod websocket;

const REQUEST_ID_HEADER: &str = "x-rpb-request-id";

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Request id assigned by the tracking middleware; echoed in error traces.
#[derive(Debug, Clone)]
pub(crate) struct RequestId(pub String);

/// The authenticated caller of a `/rest/*` route.
#[derive(Clone)]
pub(crate) struct CallerSession {
    pub credential: String,
    pub session: Arc<RemoteSession>,
}

pub fn router(gateway: Gateway) -> Router {
    let rest = Router::new()
        .route(
            "/rest/chassis",
            get(chassis::list_chassis).post(chassis::create_chassis),
        )
        .route("/rest/chassis/edit", put(chassis::edit_chassis))
        .route("/rest/chassis/delete", delete(chassis::delete_chassis_batch))
        .route(
            "/rest/chassis/{id}",
            get(chassis::get_chassis).delete(chassis::delete_chassis),
        )
        .route(
            "/rest/chassis/{id}/hosts",
            get(chassis::related_hosts).put(chassis::set_chassis_hosts),
        )
        .route("/rest/hosts", get(chassis::list_hosts))
        .route(
            "/rest/hosts/{host_id}/chassis",
            get(chassis::related_chassis).put(chassis::reconcile_host),
        )
        .route("/rest/privileges", post(chassis::check_privileges))
        .route("/rest/tasks", get(tasks::list_tasks))
        .route(
            "/rest/websocket/session/generate-ticket",
            get(websocket::generate_ticket),
        )
        .route_layer(middleware::from_fn_with_state(
            gateway.clone(),
            require_session,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/ws", get(websocket::upgrade))
        .merge(rest)
        .layer(middleware::from_fn(track_request))
        .with_state(gateway)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    gauges: BTreeMap<&'static str, usize>,
}

async fn readyz(State(gateway): State<Gateway>) -> impl IntoResponse {
    let mut gauges = BTreeMap::new();
    gauges.insert("session_cache_entries", gateway.sessions.len());
    gauges.insert("subscribers", gateway.subscribers.len());
    gauges.insert("work_queue_depth", gateway.queue.depth());
    gauges.insert("outstanding_tickets", gateway.tickets.len());

    Json(ReadyzResponse {
        status: "ready",
        gauges,
    })
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Assigns a request id, runs the request in a span carrying it and records
/// the request metrics.
async fn track_request(mut req: Request, next: Next) -> Response {
    let request_id = extract_request_id(req.headers());
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let method = req.method().to_string();
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let span = tracing::info_span!(
        "http.request",
        request_id = %request_id,
        method = %method,
        route = %route,
        status = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    );
    let started = Instant::now();

    let response = async move {
        let response = next.run(req).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::Span::current().record("latency_ms", latency_ms);
        tracing::Span::current().record("status", response.status().as_u16());
        response
    }
    .instrument(span)
    .await;

    crate::metrics::observe_http_request(
        &route,
        &method,
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

#[derive(Debug, Deserialize)]
struct CredentialQuery {
    #[serde(rename = "vmware-api-session-id")]
    session_id: Option<String>,
}

/// Resolves the caller credential (header first, then query parameter)
/// through the session cache before any `/rest/*` handler runs.
async fn require_session(
    State(gateway): State<Gateway>,
    Query(query): Query<CredentialQuery>,
    mut req: Request,
    next: Next,
) -> Response {
    let request_id = request_id_of(&req);

    let credential = credential_from_headers(req.headers()).or_else(|| {
        query
            .session_id
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    });

    let Some(credential) = credential else {
        return json_error(
            StatusCode::UNAUTHORIZED,
            "ERR_MISSING_CREDENTIAL",
            ErrorKind::AuthRejected,
            format!("missing {} header or query parameter", API_SESSION_ID_HEADER),
            &request_id,
            false,
        )
        .into_response();
    };

    match gateway.sessions.get(&credential).await {
        Ok(session) => {
            req.extensions_mut()
                .insert(CallerSession { credential, session });
            next.run(req).await
        }
        Err(err) => {
            let kind = err.kind();
            json_error(
                StatusCode::UNAUTHORIZED,
                err.code(),
                kind,
                err.to_string(),
                &request_id,
                kind == ErrorKind::BackendUnreachable,
            )
            .into_response()
        }
    }
}

fn request_id_of(req: &Request) -> String {
    req.extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse {
    code: String,
    kind: ErrorKind,
    message: String,
    /// Request id plus error code, for correlating with server logs.
    trace: String,
    retryable: bool,
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    kind: ErrorKind,
    message: impl Into<String>,
    request_id: &str,
    retryable: bool,
) -> ApiError {
    let code = code.into();
    let trace = format!("request_id={} code={} kind={}", request_id, code, kind.as_str());
    (
        status,
        Json(ErrorResponse {
            code,
            kind,
            message: message.into(),
            trace,
            retryable,
        }),
    )
}

fn invalid_body(request_id: &str, reason: impl std::fmt::Display) -> ApiError {
    json_error(
        StatusCode::BAD_REQUEST,
        "ERR_INVALID_PARAMS",
        ErrorKind::InvalidRequest,
        format!("invalid request body: {}", reason),
        request_id,
        false,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_sanitised() {
        assert_eq!(sanitize_request_id("abc-123_x.y"), Some("abc-123_x.y".to_string()));
        assert_eq!(sanitize_request_id("a b<c>"), Some("abc".to_string()));
        assert_eq!(sanitize_request_id("<>"), None);
        assert_eq!(sanitize_request_id(&"x".repeat(100)).map(|s| s.len()), Some(64));
    }

    #[test]
    fn error_payload_carries_kind_and_trace() {
        let (status, Json(body)) = json_error(
            StatusCode::UNAUTHORIZED,
            "ERR_AUTH_REJECTED",
            ErrorKind::AuthRejected,
            "rejected",
            "req-1",
            false,
        );
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["kind"], "AUTH_REJECTED");
        assert_eq!(value["code"], "ERR_AUTH_REJECTED");
        assert_eq!(
            value["trace"],
            "request_id=req-1 code=ERR_AUTH_REJECTED kind=AUTH_REJECTED"
        );
    }
}
