//! transcribe - bounded-concurrency speech transcription service
//!
//! Accepts uploaded audio over HTTP, admits at most `concurrency_limit`
//! transcriptions at once and answers every request within its deadline.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use transcribe_common::config::EngineKind;
use transcribe_common::ServiceConfig;
use transcribe_server::engine::warm_up_until_ready;
use transcribe_server::service::TranscriptionService;
use transcribe_server::{logging, AppState};

/// Command-line arguments. Each overrides the matching config file entry.
#[derive(Parser, Debug)]
#[command(name = "transcribe")]
#[command(about = "Bounded-concurrency audio transcription service")]
#[command(version)]
struct Args {
    /// TOML config file
    #[arg(short, long, env = "TRANSCRIBE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long, env = "TRANSCRIBE_BIND")]
    bind: Option<SocketAddr>,

    /// Maximum transcriptions admitted at once
    #[arg(long, env = "TRANSCRIBE_LIMIT_CONCURRENCY")]
    limit_concurrency: Option<usize>,

    /// End-to-end request deadline in seconds
    #[arg(long, env = "TRANSCRIBE_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// Largest accepted upload in bytes
    #[arg(long, env = "TRANSCRIBE_MAX_UPLOAD_BYTES")]
    max_upload_bytes: Option<u64>,

    /// Engine implementation (remote or stub)
    #[arg(long, env = "TRANSCRIBE_ENGINE")]
    engine: Option<EngineKind>,

    /// Upstream inference URL for the remote engine
    #[arg(long, env = "TRANSCRIBE_ENGINE_URL")]
    engine_url: Option<String>,

    /// Log filter when RUST_LOG is unset (e.g. "info" or "transcribe_server=debug")
    #[arg(long, env = "TRANSCRIBE_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Args {
    fn apply(&self, config: &mut ServiceConfig) {
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(limit) = self.limit_concurrency {
            config.admission.concurrency_limit = limit;
        }
        if let Some(secs) = self.timeout_secs {
            config.admission.request_timeout_secs = secs;
        }
        if let Some(bytes) = self.max_upload_bytes {
            config.ingest.max_upload_bytes = bytes;
        }
        if let Some(kind) = self.engine {
            config.engine.kind = kind;
        }
        if let Some(url) = &self.engine_url {
            config.engine.url = Some(url.clone());
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_control = logging::init(args.log_level.as_deref());

    let mut config =
        ServiceConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);
    if let Err(e) = log_control.apply_configured(&config.logging.level) {
        warn!("{:#}, keeping current log filter", e);
    }

    config.validate().context("Invalid configuration")?;

    info!("Starting transcribe v{}", env!("CARGO_PKG_VERSION"));
    info!(
        concurrency_limit = config.admission.concurrency_limit,
        request_timeout_secs = config.admission.request_timeout_secs,
        max_upload_bytes = config.ingest.max_upload_bytes,
        "Admission settings"
    );

    let engine = transcribe_server::engine::build_engine(&config.engine)
        .context("Failed to initialize transcription engine")?;
    info!("Engine: {}", engine.name());

    let shutdown = CancellationToken::new();
    tokio::spawn(warm_up_until_ready(
        Arc::clone(&engine),
        config.warmup_retry(),
        shutdown.clone(),
    ));

    let service = Arc::new(TranscriptionService::new(&config, engine));
    let app = transcribe_server::build_router(AppState::new(Arc::clone(&service)));

    let listener = tokio::net::TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.bind))?;
    info!("Listening on http://{}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&service), shutdown))
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, then stop admitting new work.
/// In-flight requests keep their slots and finish normally.
async fn shutdown_signal(service: Arc<TranscriptionService>, shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }

    shutdown.cancel();
    service.admission().close();
}
