//! facegated: HTTP front end for the facegate recognition pipelines.

pub mod config;
pub mod engine;
pub mod error;
pub mod http_interface;
pub mod scratch;

use anyhow::{bail, Context, Result};
use config::{Config, EngineKind};
use facegate_core::{MockEngine, RecognitionEngine};

/// Construct the recognition engine named by `config`.
pub fn build_engine(config: &Config) -> Result<Box<dyn RecognitionEngine>> {
    match config.engine {
        EngineKind::Mock => Ok(Box::new(MockEngine::new())),
        #[cfg(feature = "onnx")]
        EngineKind::Onnx => {
            let engine = facegate_core::onnx::OnnxEngine::load(&config.model_dir)
                .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
            Ok(Box::new(engine))
        }
        #[cfg(not(feature = "onnx"))]
        EngineKind::Onnx => bail!("this build has no ONNX support; set FACEGATE_ENGINE=mock"),
    }
}

/// Run the daemon until SIGINT or SIGTERM.
///
/// In-flight requests are drained, then the engine thread is joined so the
/// engine is finalized before this returns.
pub async fn serve(config: Config) -> Result<()> {
    std::fs::create_dir_all(&config.tmp_dir)
        .with_context(|| format!("creating scratch root {}", config.tmp_dir.display()))?;
    if config.max_body_bytes == 0 {
        bail!("FACEGATE_MAX_BODY_BYTES must be positive");
    }

    let engine = build_engine(&config)?;
    tracing::info!(engine = engine.name(), "engine initialized");
    let (handle, worker) = engine::spawn_engine(engine, config.queue_depth, config.request_timeout())
        .context("spawning engine thread")?;

    let state = http_interface::AppState::new(handle, config.tmp_dir.clone());
    let app = http_interface::router(state, config.max_body_bytes);

    let listener = tokio::net::TcpListener::bind((config.bind_host.as_str(), config.port))
        .await
        .with_context(|| format!("binding {}:{}", config.bind_host, config.port))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        max_body_bytes = config.max_body_bytes,
        timeout_secs = config.request_timeout_secs,
        "facegated listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router (and every EngineHandle clone in it) is gone now, so the
    // engine loop sees a closed channel.
    tokio::task::spawn_blocking(move || worker.join())
        .await
        .context("joining engine thread")?;
    tracing::info!("facegated stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
