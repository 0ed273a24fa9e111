use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edge_llm_service::{
    AppConfig, AppState, MemoryKeyStore, ModelRuntime, RuntimeBackend, Scheduler,
    SchedulerConfig, ScriptedRuntime, build_router, model::OllamaRuntime,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!(
        listen_addr = %config.listen_addr,
        backend = ?config.backend,
        model = %config.model_name,
        "starting inference service"
    );

    let runtime = select_runtime(&config)?;
    if let Err(err) = runtime.load().await {
        // Keep serving while the model is missing; /health and /generate re-probe it.
        tracing::warn!(error = %err, "model not available, starting degraded");
    } else {
        tracing::info!(model = runtime.model_name(), "model ready");
    }

    let keys = MemoryKeyStore::new(config.api_key_pepper.as_deref());
    for (owner, secret) in &config.api_keys {
        keys.insert(secret, owner)?;
    }
    tracing::info!(count = keys.len(), "API keys seeded from environment");

    let scheduler = Scheduler::start(runtime.clone(), SchedulerConfig::from_app(&config));
    let state = AppState::new(config.clone(), scheduler.clone(), runtime, Arc::new(keys));
    let router = build_router(state);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown();
    tracing::info!("shutdown complete");
    Ok(())
}

fn select_runtime(config: &AppConfig) -> anyhow::Result<Arc<dyn ModelRuntime>> {
    let runtime: Arc<dyn ModelRuntime> = match config.backend {
        RuntimeBackend::Ollama => Arc::new(OllamaRuntime::new(
            config.ollama_host.clone(),
            config.model_name.clone(),
            config.model_path.clone(),
            config.keep_alive.clone(),
            config.n_threads,
        )?),
        RuntimeBackend::Scripted => Arc::new(ScriptedRuntime::echo()),
        #[cfg(feature = "tch-backend")]
        RuntimeBackend::Torch => Arc::new(edge_llm_service::model::TorchRuntime::new(config)),
        #[cfg(not(feature = "tch-backend"))]
        RuntimeBackend::Torch => {
            anyhow::bail!("RUNTIME_BACKEND=torch requires building with the `tch-backend` feature")
        }
    };
    Ok(runtime)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
