use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::{to_bytes, Body};
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use http_body_util::LengthLimitError;
use markr_api::MarkrApi;
use markr_core::{AggregateError, AggregateStats, IngestError};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

const MARKR_CONTENT_TYPE: &str = "text/xml+markr";
const GENERIC_FAILURE_MESSAGE: &str = "An unexpected error occurred.";

#[derive(Debug, Clone)]
struct ServiceState {
    api: MarkrApi,
    operation_timeout: Duration,
    max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    error: &'static str,
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct ImportResponse {
    success: bool,
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    message: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "markr-service")]
#[command(about = "HTTP service for ingesting and aggregating MCQ test results")]
struct Args {
    #[arg(long, env = "MARKR_DB", default_value = "./markr.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "MARKR_BIND", default_value = "0.0.0.0:5000")]
    bind: SocketAddr,
    #[arg(long, env = "MARKR_OPERATION_TIMEOUT_MS", default_value_t = 10_000)]
    operation_timeout_ms: u64,
    #[arg(long, env = "MARKR_MAX_BODY_BYTES", default_value_t = 16 * 1024 * 1024)]
    max_body_bytes: usize,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ErrorBody { error: self.error, message: self.message };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceFailure {
    fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        Self { status, error, message: message.into() }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "Bad Request", message)
    }

    fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "Validation Error", message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "Not Found", message)
    }

    fn unsupported_media_type() -> Self {
        Self::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Unsupported Media Type",
            format!("Expected Content-Type: {MARKR_CONTENT_TYPE}"),
        )
    }

    fn payload_too_large(limit: usize) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "Payload Too Large",
            format!("Request body exceeds {limit} bytes"),
        )
    }

    fn method_not_allowed() -> Self {
        Self::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "Method Not Allowed",
            "The method is not allowed for the requested URL.",
        )
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error", message)
    }

    /// Maps an operation error to its response. A zero-denominator test is a
    /// server fault (500) while a missing test is a 404.
    fn classify(err: &anyhow::Error) -> Self {
        if let Some(IngestError::Validation(parse_error)) = err.downcast_ref::<IngestError>() {
            return Self::validation(parse_error.to_string());
        }

        match err.downcast_ref::<AggregateError>() {
            Some(not_found @ AggregateError::NotFound(_)) => Self::not_found(not_found.to_string()),
            Some(degenerate @ AggregateError::DegenerateInput(_)) => {
                Self::internal(degenerate.to_string())
            }
            None => {
                tracing::error!(error = %format!("{err:#}"), "unexpected operation failure");
                Self::internal(GENERIC_FAILURE_MESSAGE)
            }
        }
    }
}

impl ServiceState {
    async fn run_blocking<T, F>(
        &self,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(MarkrApi) -> anyhow::Result<T> + Send + 'static,
    {
        let api = self.api.clone();
        let handle = tokio::task::spawn_blocking(move || op(api));
        let join_result = tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
            tracing::error!(
                operation = operation_label,
                timeout_ms = u64::try_from(self.operation_timeout.as_millis()).unwrap_or(u64::MAX),
                "operation timed out"
            );
            ServiceFailure::internal(GENERIC_FAILURE_MESSAGE)
        })?;

        let op_result = join_result.map_err(|err| {
            tracing::error!(operation = operation_label, error = %err, "operation join failure");
            ServiceFailure::internal(GENERIC_FAILURE_MESSAGE)
        })?;

        op_result.map_err(|err| ServiceFailure::classify(&err))
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/import", post(import))
        .route("/results/:test_id/aggregate", get(aggregate))
        .route("/health", get(health))
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let api = MarkrApi::new(args.db);
    let schema = api
        .migrate()
        .with_context(|| format!("failed to prepare database at {}", api.db_path().display()))?;
    tracing::info!(
        db = %api.db_path().display(),
        schema_version = schema.current_version,
        "database ready"
    );

    let state = ServiceState {
        api,
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        max_body_bytes: args.max_body_bytes,
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "markr service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn import(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<ImportResponse>, ServiceFailure> {
    let content_type = headers.get(CONTENT_TYPE).and_then(|value| value.to_str().ok());
    if content_type != Some(MARKR_CONTENT_TYPE) {
        tracing::warn!(?content_type, "rejected import with unsupported content type");
        return Err(ServiceFailure::unsupported_media_type());
    }

    let body = to_bytes(body, state.max_body_bytes).await.map_err(|err| {
        let err = err.into_inner();
        if err.is::<LengthLimitError>() {
            tracing::warn!(limit = state.max_body_bytes, "rejected oversized import body");
            ServiceFailure::payload_too_large(state.max_body_bytes)
        } else {
            tracing::warn!(error = %err, "failed to read import body");
            ServiceFailure::bad_request("Failed to read request body")
        }
    })?;

    if body.is_empty() {
        return Err(ServiceFailure::bad_request("Request body is empty"));
    }

    let report = state.run_blocking("import", move |api| api.import_xml(&body)).await?;
    Ok(Json(ImportResponse {
        success: true,
        message: format!("Successfully processed {} test results", report.processed),
    }))
}

async fn aggregate(
    State(state): State<ServiceState>,
    Path(test_id): Path<String>,
) -> Result<Json<AggregateStats>, ServiceFailure> {
    let stats = state
        .run_blocking("aggregate", move |api| api.aggregate(&test_id))
        .await?;
    Ok(Json(stats))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { message: "OK" })
}

async fn not_found() -> ServiceFailure {
    ServiceFailure::not_found("The requested resource was not found.")
}

async fn method_not_allowed() -> ServiceFailure {
    ServiceFailure::method_not_allowed()
}
