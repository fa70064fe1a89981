//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ask` | Citation-grounded answer to a clinical question |
//! | `POST` | `/diagnose/step` | Run the next stage of a diagnostic session |
//! | `GET`  | `/diagnose/{session_id}` | Current session state and history |
//! | `GET`  | `/health` | Liveness (returns version) |
//! | `GET`  | `/health/ready` | Readiness (corpus database reachable) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Ask responses always carry the full response body. `Completed` and
//! `Rejected` are 200; a `Failed` ask is 400 (`invalid_query`), 504
//! (`ask_timeout`) or 503 (any collaborator failure).
//!
//! Diagnose errors: `bad_request` (400), `not_found` (404),
//! `session_busy` / `session_terminated` (409).
//!
//! # Request ids
//!
//! Every response carries `x-request-id`, generated when the caller sent
//! none. An ask without an explicit `trace_id` uses the request id.

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, Request, State},
    http::{HeaderMap, HeaderName, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use harness_core::diagnose::{DiagnosticSession, StepInput};
use harness_core::error::DiagnoseError;
use harness_core::models::{AskResponse, AskStatus};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::ask::AskService;
use crate::config::Config;
use crate::corpus::SqliteCorpus;
use crate::diagnose::{DiagnoseService, StepResponse};

const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    ask: Arc<AskService>,
    diagnose: Arc<DiagnoseService>,
    /// Probed by `/health/ready`; absent when serving a non-SQLite corpus.
    corpus: Option<Arc<SqliteCorpus>>,
}

impl AppState {
    pub fn new(
        ask: Arc<AskService>,
        diagnose: Arc<DiagnoseService>,
        corpus: Option<Arc<SqliteCorpus>>,
    ) -> Self {
        Self {
            ask,
            diagnose,
            corpus,
        }
    }
}

/// Fixed-window request counter per client address.
#[derive(Clone)]
struct RateLimiter {
    limit: u32,
    windows: Cache<IpAddr, Arc<AtomicU32>>,
}

impl RateLimiter {
    fn per_minute(limit: u32) -> Self {
        Self {
            limit,
            windows: Cache::builder()
                .max_capacity(100_000)
                .time_to_live(Duration::from_secs(60))
                .build(),
        }
    }

    async fn allow(&self, client: IpAddr) -> bool {
        let counter = self
            .windows
            .get_with(client, async { Arc::new(AtomicU32::new(0)) })
            .await;
        counter.fetch_add(1, Ordering::Relaxed) < self.limit
    }
}

async fn rate_limit(
    State(limiter): State<RateLimiter>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if limiter.allow(addr.ip()).await {
        return next.run(request).await;
    }
    tracing::warn!(client = %addr.ip(), limit = limiter.limit, "rate limit exceeded");
    AppError {
        status: StatusCode::TOO_MANY_REQUESTS,
        code: "rate_limited".to_string(),
        message: "Rate limit exceeded".to_string(),
    }
    .into_response()
}

/// Build the router. `rate_limit_per_minute = 0` disables rate limiting.
pub fn router(state: AppState, rate_limit_per_minute: u32) -> Router {
    let mut api = Router::new()
        .route("/ask", post(handle_ask))
        .route("/diagnose/step", post(handle_diagnose_step))
        .route("/diagnose/{session_id}", get(handle_diagnose_get));
    if rate_limit_per_minute > 0 {
        api = api.route_layer(middleware::from_fn_with_state(
            RateLimiter::per_minute(rate_limit_per_minute),
            rate_limit,
        ));
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/health/ready", get(handle_ready))
        .merge(api)
        .with_state(state)
        .layer(PropagateRequestIdLayer::new(REQUEST_ID))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetRequestIdLayer::new(REQUEST_ID, MakeRequestUuid))
}

/// Serve on an already-bound listener until the process is terminated.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    rate_limit_per_minute: u32,
) -> anyhow::Result<()> {
    let app = router(state, rate_limit_per_minute);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// `harness serve`: bind `[server].bind` and serve the API.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let (ask, corpus) = AskService::from_config(config).await?;
    let ask = Arc::new(ask);
    let diagnose = Arc::new(DiagnoseService::from_config(config, ask.clone())?);
    let state = AppState::new(ask, diagnose, Some(corpus));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "harness server listening");
    println!("Harness server listening on http://{}", config.server.bind);

    serve(listener, state, config.server.rate_limit_per_minute).await
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

impl From<DiagnoseError> for AppError {
    fn from(err: DiagnoseError) -> Self {
        let status = match err {
            DiagnoseError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            DiagnoseError::SessionBusy(_) | DiagnoseError::SessionTerminated(_) => {
                StatusCode::CONFLICT
            }
            DiagnoseError::InvalidInput(_) | DiagnoseError::MissingIntake => {
                StatusCode::BAD_REQUEST
            }
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunks: Option<u64>,
}

async fn handle_ready(State(state): State<AppState>) -> Result<Json<ReadyResponse>, AppError> {
    let Some(corpus) = &state.corpus else {
        return Ok(Json(ReadyResponse {
            status: "ready".to_string(),
            chunks: None,
        }));
    };
    let checked = match corpus.ping().await {
        Ok(()) => corpus.chunk_count().await,
        Err(e) => Err(e),
    };
    let chunks = checked.map_err(|e| {
        tracing::error!(error = %e, "readiness probe failed");
        AppError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "not_ready".to_string(),
            message: "the evidence index is currently unavailable".to_string(),
        }
    })?;
    Ok(Json(ReadyResponse {
        status: "ready".to_string(),
        chunks: Some(chunks),
    }))
}

// ============ POST /ask ============

#[derive(Deserialize)]
struct AskRequest {
    query: String,
    #[serde(default)]
    trace_id: Option<String>,
}

fn ask_status_code(response: &AskResponse) -> StatusCode {
    match response.status {
        AskStatus::Completed | AskStatus::Rejected => StatusCode::OK,
        AskStatus::Failed => match response.error.as_ref().map(|e| e.code.as_str()) {
            Some("invalid_query") => StatusCode::BAD_REQUEST,
            Some("ask_timeout") => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        },
    }
}

async fn handle_ask(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(req) = body?;
    let trace_id = req.trace_id.or_else(|| {
        headers
            .get(&REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });

    let response = state.ask.ask(&req.query, trace_id).await;
    Ok((ask_status_code(&response), Json(response)).into_response())
}

// ============ /diagnose ============

#[derive(Deserialize)]
struct DiagnoseStepRequest {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    input: StepInput,
}

async fn handle_diagnose_step(
    State(state): State<AppState>,
    body: Result<Json<DiagnoseStepRequest>, JsonRejection>,
) -> Result<Json<StepResponse>, AppError> {
    let Json(req) = body?;
    let response = state.diagnose.step(req.session_id, req.input).await?;
    Ok(Json(response))
}

async fn handle_diagnose_get(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<DiagnosticSession>, AppError> {
    Ok(Json(state.diagnose.get(&session_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness_core::error::AskError;
    use harness_core::models::AskDiagnostics;

    #[test]
    fn test_failed_ask_status_codes() {
        let timeout = AskResponse::failed("t", &AskError::AskTimeout(30_000), AskDiagnostics::default());
        assert_eq!(ask_status_code(&timeout), StatusCode::GATEWAY_TIMEOUT);

        let invalid = AskResponse::failed(
            "t",
            &AskError::InvalidQuery("empty".into()),
            AskDiagnostics::default(),
        );
        assert_eq!(ask_status_code(&invalid), StatusCode::BAD_REQUEST);

        let down = AskResponse::failed(
            "t",
            &AskError::GenerationUnavailable("refused".into()),
            AskDiagnostics::default(),
        );
        assert_eq!(ask_status_code(&down), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_rejected_ask_is_ok() {
        let rejected = AskResponse::rejected(
            "t",
            0.0,
            vec!["insufficient evidence".into()],
            AskDiagnostics::default(),
        );
        assert_eq!(ask_status_code(&rejected), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rate_limiter_fixed_window() {
        let limiter = RateLimiter::per_minute(2);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limiter.allow(ip).await);
        assert!(limiter.allow(ip).await);
        assert!(!limiter.allow(ip).await);
        assert!(limiter.allow("10.0.0.2".parse().unwrap()).await);
    }
}
