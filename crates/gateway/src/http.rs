use std::sync::Arc;
use std::time::{Duration, Instant};

use advisor_contracts::{AskRequest, CreateSessionResponse};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use ulid::Ulid;

use crate::agent::HttpAgentClient;
use crate::audit::{AuditLogger, RedactionPolicy, TracingAuditSink};
use crate::clock::SystemClock;
use crate::config::{GatewayConfig, StartupError};
use crate::error::{GatewayError, normalize};
use crate::gateway::Gateway;
use crate::pipeline::CallContext;
use crate::session::InMemorySessionStore;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const AGENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const SECURITY_HEADERS: [(HeaderName, &str); 5] = [
    (header::X_FRAME_OPTIONS, "DENY"),
    (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
    (header::X_XSS_PROTECTION, "1; mode=block"),
    (
        header::STRICT_TRANSPORT_SECURITY,
        "max-age=31536000; includeSubDomains",
    ),
    (
        header::CONTENT_SECURITY_POLICY,
        "default-src 'self'; img-src 'self' data: https:; style-src 'self' 'unsafe-inline';",
    ),
];

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    gateway: Gateway,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: GatewayConfig, gateway: Gateway, shutdown: CancellationToken) -> Self {
        Self {
            config,
            gateway,
            shutdown,
        }
    }

    /// Wires the production collaborators: the HTTP agent client, an
    /// in-memory session store, the system clock and the tracing audit sink.
    pub fn from_config(
        config: GatewayConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, StartupError> {
        let agent = HttpAgentClient::new(config.agent_url.clone(), AGENT_CONNECT_TIMEOUT)
            .map_err(|_| StartupError {
                code: "ERR_AGENT_UNAVAILABLE",
                message: "failed to initialize agent client".to_string(),
            })?;

        let audit = AuditLogger::new(Arc::new(TracingAuditSink::new(
            RedactionPolicy::from_verbose(config.audit_verbose),
        )));

        let gateway = Gateway::new(
            &config,
            Arc::new(agent),
            Arc::new(InMemorySessionStore::new()),
            Arc::new(SystemClock),
            audit,
        );

        Ok(Self::new(config, gateway, shutdown))
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }
}

/// Request id resolved for the current request; echoed on the response.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/{session_id}", delete(end_session))
        .route("/v1/ask", post(ask))
        .layer(axum::middleware::from_fn(request_context))
        .with_state(state)
}

async fn request_context(mut request: Request, next: axum::middleware::Next) -> Response {
    let request_id = extract_request_id(request.headers());
    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    for (name, value) in SECURITY_HEADERS {
        headers.insert(name, HeaderValue::from_static(value));
    }
    response
}

async fn healthz() -> &'static str {
    "ok"
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

async fn create_session(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
) -> (StatusCode, Json<CreateSessionResponse>) {
    let started = Instant::now();
    let span = tracing::info_span!(
        "session.create",
        request_id = %request_id,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let response = span.in_scope(|| {
        let sessions = state.gateway.sessions();
        let session = sessions.create_session();

        tracing::Span::current().record("latency_ms", started.elapsed().as_millis() as u64);
        tracing::Span::current().record("outcome", "ok");

        CreateSessionResponse {
            session_id: session.id,
            expires_in_secs: sessions.timeout().as_secs(),
        }
    });

    crate::metrics::observe_http_request(
        "/v1/sessions",
        "POST",
        StatusCode::OK.as_u16(),
        started.elapsed(),
    );
    (StatusCode::OK, Json(response))
}

async fn end_session(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(session_id): Path<String>,
) -> StatusCode {
    let started = Instant::now();
    let removed = state.gateway.sessions().end(&session_id);
    tracing::info!(request_id = %request_id, removed, "session.end");

    crate::metrics::observe_http_request(
        "/v1/sessions/{session_id}",
        "DELETE",
        StatusCode::NO_CONTENT.as_u16(),
        started.elapsed(),
    );
    StatusCode::NO_CONTENT
}

async fn ask(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    req: Result<Json<AskRequest>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let span = tracing::info_span!(
        "gateway.ask",
        request_id = %request_id,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let Json(req) = req.map_err(|_| {
            let err = GatewayError::Validation("invalid JSON body".to_string());
            state.gateway.reject(&request_id, &err);
            err
        })?;
        let ctx = CallContext::new(request_id.clone(), state.shutdown.child_token());
        state.gateway.ask(req, &ctx).await
    }
    .instrument(span.clone())
    .await;

    let outcome = match &result {
        Ok(_) => "ok",
        Err(err) if err.is_rejection() => "rejected",
        Err(_) => "error",
    };
    span.record("latency_ms", started.elapsed().as_millis() as u64);
    span.record("outcome", outcome);

    let response = match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => error_response(&err),
    };

    crate::metrics::observe_http_request(
        "/v1/ask",
        "POST",
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

fn error_response(err: &GatewayError) -> Response {
    let mut headers = HeaderMap::new();
    if let Some(retry_after) = err.retry_after() {
        let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
        headers.insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
    }
    (err.status(), headers, Json(normalize(err))).into_response()
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
