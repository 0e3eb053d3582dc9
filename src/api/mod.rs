//! HTTP surface: axum router, authentication, rate limiting and the JSON
//! response envelope shared by every endpoint.

pub mod handlers;
pub mod rate_limit;

use crate::config::Config;
use crate::error::{ModerationError, ValidationError};
use crate::orchestrator::ModerationOrchestrator;
use crate::statistics::{RejectReason, StatEvent};
use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rate_limit::{RateDecision, RateLimiter};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const API_KEY_QUERY: &str = "apiKey";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// (method, path, description, requires API key)
pub const ENDPOINTS: &[(&str, &str, &str, bool)] = &[
    ("GET", "/health", "Service liveness", false),
    ("GET", "/info", "API description", false),
    ("POST", "/moderate", "Stateless moderation of one text", false),
    ("POST", "/analyze", "Detailed assessment; stateful when userId is given", false),
    ("POST", "/batch", "Moderate up to 50 texts", true),
    ("GET", "/stats", "Aggregate counters", true),
    ("GET", "/warnings/:user_id", "A user's warning state", true),
    ("DELETE", "/warnings/:user_id", "Reset a user's warnings", true),
];

tokio::task_local! {
    static REQUEST_ID: String;
}

/// Id of the request being served, when called inside one.
pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(|id| id.clone()).ok()
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ModerationOrchestrator>,
    pub limiter: Arc<RateLimiter>,
    api_key: Arc<str>,
    pub max_text_length: usize,
    pub max_body_bytes: usize,
    pub rate_limit_description: String,
    pub started_at: DateTime<Utc>,
    trust_forwarded_for: bool,
}

impl AppState {
    pub fn new(orchestrator: Arc<ModerationOrchestrator>, config: &Config) -> Self {
        let rate = &config.server.rate_limit;
        Self {
            orchestrator,
            limiter: Arc::new(RateLimiter::new(
                rate.requests,
                Duration::from_secs(rate.window_seconds),
            )),
            api_key: Arc::from(config.server.api_key.as_str()),
            max_text_length: config.limits.max_text_length,
            max_body_bytes: config.server.max_body_bytes,
            rate_limit_description: format!(
                "{} requests per {} seconds per IP/API key",
                rate.requests, rate.window_seconds
            ),
            started_at: Utc::now(),
            trust_forwarded_for: config.server.trust_forwarded_for,
        }
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }

    fn record(&self, event: StatEvent) {
        if let Some(statistics) = self.orchestrator.statistics() {
            statistics.record_event(event);
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{}", .0.body_text())]
    InvalidBody(#[from] JsonRejection),
    #[error("valid API key required")]
    Unauthorized,
    #[error("rate limit exceeded, retry in {retry_after} seconds")]
    RateLimited { retry_after: u64 },
    #[error("route {method} {path} not found")]
    NotFound { method: String, path: String },
    #[error("{0}")]
    Internal(String),
}

impl From<ModerationError> for ApiError {
    fn from(e: ModerationError) -> Self {
        match e {
            ModerationError::Validation(e) => ApiError::Validation(e),
            ModerationError::Persistence(e) => {
                ApiError::Internal(format!("change applied in memory only: {e}"))
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    success: bool,
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    available_endpoints: Option<Vec<&'static str>>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidBody(rejection) => rejection.status(),
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            log::error!("Request failed: {self}");
        }

        let retry_after = match &self {
            ApiError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        };
        let body = ErrorBody {
            success: false,
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.to_string(),
            request_id: current_request_id(),
            retry_after,
            available_endpoints: matches!(self, ApiError::NotFound { .. })
                .then(|| ENDPOINTS.iter().map(|(_, path, _, _)| *path).collect()),
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(seconds) = retry_after {
            response
                .headers_mut()
                .insert("retry-after", HeaderValue::from(seconds));
        }
        response
    }
}

/// Success envelope: `{success, requestId, data}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub data: T,
}

pub fn envelope<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        request_id: current_request_id(),
        data,
    })
}

pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/batch", post(handlers::batch))
        .route("/stats", get(handlers::stats))
        .route(
            "/warnings/:user_id",
            get(handlers::get_warnings).delete(handlers::clear_warnings),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    let limited = Router::new()
        .route("/info", get(handlers::info))
        .route("/moderate", post(handlers::moderate))
        .route("/analyze", post(handlers::analyze))
        .merge(protected)
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(limited)
        .fallback(handlers::not_found)
        .layer(DefaultBodyLimit::max(state.max_body_bytes))
        .layer(middleware::from_fn_with_state(state.clone(), request_context))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Bind and serve until Ctrl+C or SIGTERM.
pub async fn serve(state: AppState, bind_address: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("Invalid bind address: {bind_address}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    log::info!("ModBot API listening on http://{addr}");

    let sweeper = state.limiter.spawn_sweeper();
    let app = create_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("API server failed")?;

    sweeper.abort();
    log::info!("ModBot API stopped");
    Ok(())
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            log::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}

/// Assigns the request id and logs every request with its outcome.
async fn request_context(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let client = client_ip(&req, state.trust_forwarded_for);
    let started = std::time::Instant::now();

    log::info!("[{request_id}] {method} {path} from {client}");
    let mut response = REQUEST_ID.scope(request_id.clone(), next.run(req)).await;

    log::info!(
        "[{request_id}] {} in {}ms",
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let caller = format!(
        "{}:{}",
        client_ip(&req, state.trust_forwarded_for),
        supplied_api_key(&req).unwrap_or_else(|| "anonymous".to_string())
    );

    match state.limiter.check(&caller) {
        RateDecision::Allowed { remaining } => {
            let mut response = next.run(req).await;
            let headers = response.headers_mut();
            headers.insert("x-ratelimit-limit", HeaderValue::from(state.limiter.limit()));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
            response
        }
        RateDecision::Limited { retry_after } => {
            log::warn!("Rate limit exceeded for {caller}");
            state.record(StatEvent::RequestRejected(RejectReason::RateLimited));
            ApiError::RateLimited {
                retry_after: retry_after.as_secs().max(1),
            }
            .into_response()
        }
    }
}

async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    match supplied_api_key(&req) {
        Some(key) if key.as_str() == &*state.api_key => next.run(req).await,
        _ => {
            state.record(StatEvent::RequestRejected(RejectReason::Unauthorized));
            ApiError::Unauthorized.into_response()
        }
    }
}

/// Key from the `x-api-key` header, falling back to the `apiKey` query
/// parameter.
fn supplied_api_key(req: &Request) -> Option<String> {
    if let Some(key) = header_str(req.headers(), API_KEY_HEADER) {
        return Some(key.to_string());
    }
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == API_KEY_QUERY)
        .map(|(_, value)| value.into_owned())
}

/// Peer address of the connection. `X-Forwarded-For` is only consulted when
/// `server.trust_forwarded_for` is set.
fn client_ip(req: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        if let Some(first) = header_str(req.headers(), "x-forwarded-for")
            .and_then(|forwarded| forwarded.split(',').next())
            .map(str::trim)
            .filter(|first| !first.is_empty())
        {
            return first.to_string();
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}
