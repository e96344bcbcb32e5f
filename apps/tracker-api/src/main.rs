use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracker_agent::{AgentBuilder, DialogueAgent, PredictionResponse};
use tracker_policy::{IntentMappingPolicy, MappingPolicyConfig};
use tracker_protocol::{ConversationId, DomainSpec, TrackerError, TrackerSnapshot};

mod openapi;

use crate::openapi::openapi_spec;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Memory,
    File,
}

#[derive(Debug, Parser)]
#[command(name = "tracker-api")]
#[command(about = "Serve conversation trackers over HTTP")]
struct Cli {
    #[arg(long, default_value = "0.0.0.0:5005")]
    listen: SocketAddr,
    /// Domain descriptor (JSON). Without one only built-in actions exist.
    #[arg(long)]
    domain: Option<PathBuf>,
    /// Intent-to-action mapping (JSON).
    #[arg(long)]
    policy: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = StoreKind::Memory)]
    store: StoreKind,
    /// Directory for the file store.
    #[arg(long, default_value = ".trackers")]
    root: PathBuf,
    /// Allowed CORS origins. Use `*` to allow any origin.
    #[arg(long, num_args = 0..)]
    cors: Vec<String>,
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Log at debug level.
    #[arg(long)]
    debug: bool,
    /// Log at info level.
    #[arg(short, long)]
    verbose: bool,
    #[arg(long, default_value_t = 10_000)]
    persist_timeout_ms: u64,
    /// Trackers kept in memory; 0 reads every request from the store.
    #[arg(long, default_value_t = 1024)]
    resident_capacity: usize,
}

#[derive(Clone)]
struct AppState {
    agent: DialogueAgent,
}

#[derive(Debug, Deserialize)]
struct ContinueRequest {
    executed_action: Option<String>,
    #[serde(default)]
    events: Vec<Value>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<TrackerError> for ApiError {
    fn from(error: TrackerError) -> Self {
        let status = match &error {
            TrackerError::NotFound(_) => StatusCode::NOT_FOUND,
            TrackerError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ if error.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(%error, "request failed");
        } else {
            warn!(%error, "request rejected");
        }
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(&cli)?;

    let agent = build_agent(&cli)?;
    let app = router(AppState { agent }).layer(cors_layer(&cli.cors)?);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(listen = %cli.listen, store = ?cli.store, "tracker-api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn init_tracing(cli: &Cli) -> Result<Option<WorkerGuard>> {
    let default_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file_layer, guard) = match &cli.log_file {
        Some(path) => {
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow!("--log-file must name a file, got {}", path.display()))?;
            let dir = path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .unwrap_or_else(|| FsPath::new("."));
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(guard)
}

fn build_agent(cli: &Cli) -> Result<DialogueAgent> {
    let mut builder = AgentBuilder::new()
        .persist_timeout(Duration::from_millis(cli.persist_timeout_ms))
        .resident_capacity(cli.resident_capacity);

    if let Some(path) = &cli.domain {
        let domain = DomainSpec::load(path)
            .with_context(|| format!("failed to load domain from {}", path.display()))?;
        info!(
            intents = domain.intents.len(),
            slots = domain.slots.len(),
            actions = domain.actions.len(),
            "domain loaded"
        );
        builder = builder.domain(Arc::new(domain));
    }

    if let Some(path) = &cli.policy {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read policy {}", path.display()))?;
        let config: MappingPolicyConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse policy {}", path.display()))?;
        builder = builder.policy(Arc::new(IntentMappingPolicy::from_config(config)));
    }

    if cli.store == StoreKind::File {
        builder = builder.file_backend(&cli.root);
    }
    Ok(builder.build())
}

fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    if origins.is_empty() {
        return Ok(CorsLayer::new());
    }
    if origins.iter().any(|origin| origin == "*") {
        return Ok(CorsLayer::permissive());
    }
    let origins = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).with_context(|| format!("invalid CORS origin {origin}"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(hello))
        .route("/version", get(version))
        .route("/healthz", get(healthz))
        .route("/openapi.json", get(openapi_json))
        .route(
            "/conversations/{conversation_id}/parse",
            get(parse_query).post(parse_body),
        )
        .route(
            "/conversations/{conversation_id}/continue",
            post(continue_predicting),
        )
        .route(
            "/conversations/{conversation_id}/tracker/events",
            post(append_events),
        )
        .route(
            "/conversations/{conversation_id}/tracker",
            get(retrieve_tracker)
                .put(replace_tracker)
                .delete(delete_tracker),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn hello() -> String {
    format!("hello from tracker-api: {VERSION}")
}

async fn version() -> Json<Value> {
    Json(json!({ "version": VERSION }))
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "tracker-api",
        "store": state.agent.store().backend_name(),
    }))
}

async fn openapi_json() -> Json<Value> {
    Json(openapi_spec())
}

async fn parse_query(
    Path(conversation_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> ApiResult<Json<PredictionResponse>> {
    let message = params
        .get("query")
        .or_else(|| params.get("q"))
        .cloned();
    handle_parse(&state, &conversation_id, message).await
}

async fn parse_body(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
    Json(params): Json<Map<String, Value>>,
) -> ApiResult<Json<PredictionResponse>> {
    let message = params
        .get("query")
        .or_else(|| params.get("q"))
        .map(|value| match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        });
    handle_parse(&state, &conversation_id, message).await
}

async fn handle_parse(
    state: &AppState,
    conversation_id: &str,
    message: Option<String>,
) -> ApiResult<Json<PredictionResponse>> {
    let conversation_id = parse_conversation_id(conversation_id)?;
    let message =
        message.ok_or_else(|| ApiError::not_found("Invalid parse parameter specified"))?;
    let response = state
        .agent
        .handle_message(&conversation_id, &message)
        .await?;
    Ok(Json(response))
}

async fn continue_predicting(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<ContinueRequest>,
) -> ApiResult<Json<PredictionResponse>> {
    let conversation_id = parse_conversation_id(&conversation_id)?;
    let events = state.agent.parse_events(request.events)?;
    let response = state
        .agent
        .continue_message_handling(&conversation_id, request.executed_action.as_deref(), events)
        .await?;
    Ok(Json(response))
}

async fn append_events(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
    Json(batch): Json<Vec<Value>>,
) -> ApiResult<Json<TrackerSnapshot>> {
    let conversation_id = parse_conversation_id(&conversation_id)?;
    let events = state.agent.parse_events(batch)?;
    let snapshot = state.agent.append_events(&conversation_id, events).await?;
    Ok(Json(snapshot))
}

async fn retrieve_tracker(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<TrackerSnapshot>> {
    let conversation_id = parse_conversation_id(&conversation_id)?;
    let snapshot = state.agent.tracker_snapshot(&conversation_id).await?;
    Ok(Json(snapshot))
}

async fn replace_tracker(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
    Json(batch): Json<Vec<Value>>,
) -> ApiResult<Json<TrackerSnapshot>> {
    let conversation_id = parse_conversation_id(&conversation_id)?;
    let events = state.agent.parse_events(batch)?;
    let snapshot = state.agent.replace_tracker(&conversation_id, events).await?;
    Ok(Json(snapshot))
}

async fn delete_tracker(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<StatusCode> {
    let conversation_id = parse_conversation_id(&conversation_id)?;
    if state.agent.delete_conversation(&conversation_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(TrackerError::NotFound(conversation_id.into_inner()).into())
    }
}

fn parse_conversation_id(raw: &str) -> ApiResult<ConversationId> {
    Ok(ConversationId::parse(raw)?)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
