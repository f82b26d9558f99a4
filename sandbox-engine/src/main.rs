use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use sandbox_engine::config::EngineConfig;
use sandbox_engine::error::{CommandError, ErrorKind, SandboxError};
use sandbox_engine::memory::{
    ExtractedString, MemoryRegion, VolatilityAnalysis, VolatilityRunner, VolatilityStatus,
};
use sandbox_engine::observability::{init_logging, SERVICE_NAME};
use sandbox_engine::sandbox::orchestrator::SessionInfo;
use sandbox_engine::sandbox::{
    DockerCli, ExecutionReport, SampleSource, SandboxConfig, SandboxOrchestrator,
};
use sandbox_engine::{
    analyze_memory_with_volatility, check_volatility_available, extract_strings_from_dump,
    get_memory_regions,
};

/// Room for the config part and multipart framing on top of the sample
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<SandboxOrchestrator>,
    dumps_dir: Arc<PathBuf>,
    volatility: Arc<VolatilityRunner>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
    version: String,
    active_sessions: usize,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: ErrorKind,
}

/// Error surfaced to HTTP callers with a status derived from its kind
struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let status = match kind {
            ErrorKind::Configuration | ErrorKind::Parsing => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AccessDenied => StatusCode::FORBIDDEN,
            ErrorKind::Environment => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            body: ErrorBody {
                error: message.into(),
                kind,
            },
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }
}

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<CommandError> for ApiError {
    fn from(err: CommandError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[derive(Deserialize)]
struct RegionsRequest {
    file_path: PathBuf,
}

#[derive(Deserialize)]
struct StringsRequest {
    file_path: PathBuf,
    #[serde(default = "default_min_length")]
    min_length: usize,
    #[serde(default = "default_encoding")]
    encoding: String,
}

#[derive(Deserialize)]
struct VolatilityRequest {
    file_path: PathBuf,
    #[serde(default)]
    plugins: Vec<String>,
}

fn default_min_length() -> usize {
    4
}

fn default_encoding() -> String {
    "both".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env()?;
    config.validate()?;
    init_logging(&config.logging)?;

    info!("Starting Nexus-Security Sandbox Engine");

    let runtime = Arc::new(DockerCli::new(
        config.runtime.docker_binary.clone(),
        config.runtime.work_dir.clone(),
    )?);
    let orchestrator = Arc::new(SandboxOrchestrator::new(runtime, &config.runtime));

    std::fs::create_dir_all(&config.runtime.dumps_dir).with_context(|| {
        format!("Failed to create dumps dir {}", config.runtime.dumps_dir.display())
    })?;
    info!("Serving memory dumps from {}", config.runtime.dumps_dir.display());
    let volatility = VolatilityRunner::new(
        config.runtime.volatility_binary.clone(),
        config.runtime.volatility_timeout(),
    );

    let state = AppState {
        orchestrator,
        dumps_dir: Arc::new(config.runtime.dumps_dir.clone()),
        volatility: Arc::new(volatility),
    };

    let body_limit = (config.runtime.max_sample_size + MULTIPART_OVERHEAD) as usize;
    let cors = if config.server.enable_cors {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/sandbox/execute", post(execute_sample))
        .route("/sandbox/sessions", get(list_sessions))
        .route("/memory/regions", post(memory_regions))
        .route("/memory/strings", post(memory_strings))
        .route("/memory/volatility", post(memory_volatility))
        .route("/memory/volatility/status", get(volatility_status))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        );

    let addr = config.server.bind_address();
    info!("Sandbox Engine listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: state.orchestrator.sessions().len(),
    })
}

async fn execute_sample(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ExecutionReport>, ApiError> {
    let mut sample: Option<(String, Vec<u8>)> = None;
    let mut config = SandboxConfig::default();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        warn!("Failed to read multipart field: {}", e);
        ApiError::bad_request(format!("invalid multipart body: {}", e))
    })? {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "sample" => {
                let name = field.file_name().unwrap_or("sample").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("failed to read sample: {}", e)))?;
                sample = Some((name, data.to_vec()));
            }
            "config" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("failed to read config: {}", e)))?;
                config = serde_json::from_str(&text)
                    .map_err(|e| ApiError::bad_request(format!("invalid config JSON: {}", e)))?;
            }
            other => warn!("Ignoring unexpected multipart field '{}'", other),
        }
    }

    let (name, data) = sample.ok_or_else(|| ApiError::bad_request("missing 'sample' part"))?;
    info!("Received sample {} ({} bytes)", name, data.len());

    let report = state
        .orchestrator
        .execute_sample(SampleSource::Bytes { name, data }, config)
        .await
        .map_err(|e| {
            error!("Sandbox execution failed: {}", e);
            ApiError::from(e)
        })?;

    Ok(Json(report))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.orchestrator.sessions().list())
}

async fn memory_regions(
    State(state): State<AppState>,
    Json(request): Json<RegionsRequest>,
) -> Result<Json<Vec<MemoryRegion>>, ApiError> {
    let regions = get_memory_regions(state.dumps_dir.as_path(), &request.file_path).await?;
    Ok(Json(regions))
}

async fn memory_strings(
    State(state): State<AppState>,
    Json(request): Json<StringsRequest>,
) -> Result<Json<Vec<ExtractedString>>, ApiError> {
    let strings = extract_strings_from_dump(
        state.dumps_dir.as_path(),
        &request.file_path,
        request.min_length,
        &request.encoding,
    )
    .await?;
    Ok(Json(strings))
}

async fn memory_volatility(
    State(state): State<AppState>,
    Json(request): Json<VolatilityRequest>,
) -> Result<Json<VolatilityAnalysis>, ApiError> {
    let analysis = analyze_memory_with_volatility(
        &state.volatility,
        state.dumps_dir.as_path(),
        &request.file_path,
        &request.plugins,
    )
    .await
    .map_err(|e| {
        error!("Volatility analysis failed: {}", e);
        ApiError::from(e)
    })?;
    Ok(Json(analysis))
}

async fn volatility_status(State(state): State<AppState>) -> Json<VolatilityStatus> {
    Json(check_volatility_available(&state.volatility).await)
}
