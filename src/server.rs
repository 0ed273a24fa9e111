use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use parking_lot::RwLock;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    api::{BenchmarkBody, GenerateBody, GenerateResponse, HealthResponse, KeyRequest},
    auth::{KeyMinter, KeyStore, KeyVerifier, MintedKey},
    benchmark::{self, BenchmarkReport},
    config::AppConfig,
    error::ServiceError,
    model::ModelRuntime,
    scheduler::Scheduler,
};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub scheduler: Arc<Scheduler>,
    pub runtime: Arc<dyn ModelRuntime>,
    pub keys: Arc<dyn KeyStore>,
    pub benchmark_lock: Arc<tokio::sync::Mutex<()>>,
    pub probe_lock: Arc<tokio::sync::Mutex<()>>,
    pub last_benchmark: Arc<RwLock<Option<BenchmarkReport>>>,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        scheduler: Arc<Scheduler>,
        runtime: Arc<dyn ModelRuntime>,
        keys: Arc<dyn KeyStore>,
    ) -> Self {
        Self {
            config,
            scheduler,
            runtime,
            keys,
            benchmark_lock: Arc::new(tokio::sync::Mutex::new(())),
            probe_lock: Arc::new(tokio::sync::Mutex::new(())),
            last_benchmark: Arc::new(RwLock::new(None)),
        }
    }

    /// Resolve the `X-API-Key` header to an owner.
    fn authenticate(&self, headers: &HeaderMap) -> Result<String, ServiceError> {
        let secret = headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(ServiceError::Unauthorized)?;
        self.keys.verify(secret)
    }

    /// Re-probe a runtime that was missing at startup. At most one probe
    /// runs at a time; concurrent callers see the current state.
    async fn refresh_model(&self) -> bool {
        if self.runtime.is_loaded() {
            return true;
        }
        let Ok(_probing) = self.probe_lock.try_lock() else {
            return false;
        };
        match self.runtime.load().await {
            Ok(()) => {
                info!(model = self.runtime.model_name(), "model became available");
                true
            }
            Err(err) => {
                warn!(error = %err, "model still unavailable");
                false
            }
        }
    }

    async fn ensure_model_loaded(&self) -> Result<(), ServiceError> {
        if self.refresh_model().await {
            Ok(())
        } else {
            Err(ServiceError::ModelLoading)
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate))
        .route("/keys/generate", post(generate_key))
        .route("/benchmark", post(run_benchmark).get(last_benchmark))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::new(
        state.refresh_model().await,
        state.runtime.model_path(),
        state.scheduler.stats(),
    ))
}

async fn generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<GenerateBody>,
) -> Result<Response, ServiceError> {
    let owner = state.authenticate(&headers)?;
    state.ensure_model_loaded().await?;

    let request = body.into_request(&state.config, &owner)?;
    let streaming = request.stream;
    let stream = state.scheduler.submit(request)?;
    info!(request_id = stream.id(), %owner, streaming, "generation accepted");

    if streaming {
        Ok(stream.into_sse().into_response())
    } else {
        // Dropping this future on disconnect drops the stream, which cancels.
        let result = stream.collect().await?;
        Ok(Json(GenerateResponse::from(result)).into_response())
    }
}

async fn generate_key(
    State(state): State<AppState>,
    Json(request): Json<KeyRequest>,
) -> Result<Json<MintedKey>, ServiceError> {
    let owner = request.validate()?;
    let minted = state.keys.mint(owner)?;
    info!(owner, "API key issued");
    Ok(Json(minted))
}

async fn run_benchmark(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BenchmarkBody>,
) -> Result<Json<BenchmarkReport>, ServiceError> {
    let owner = state.authenticate(&headers)?;
    state.ensure_model_loaded().await?;
    let plan = body.into_plan(&state.config)?;

    let _running = state
        .benchmark_lock
        .try_lock()
        .map_err(|_| ServiceError::BenchmarkBusy)?;

    info!(
        %owner,
        runs = plan.runs,
        context_sizes = ?plan.context_sizes,
        "running benchmark"
    );

    let report = benchmark::run_report(
        &state.scheduler,
        &plan,
        &state.config,
        state.runtime.model_name(),
        &owner,
    )
    .await?;
    state.last_benchmark.write().replace(report.clone());

    Ok(Json(report))
}

async fn last_benchmark(State(state): State<AppState>) -> Json<Option<BenchmarkReport>> {
    Json(state.last_benchmark.read().clone())
}
