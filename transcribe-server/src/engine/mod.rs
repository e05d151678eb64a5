//! Transcription engines
//!
//! An engine turns one uploaded clip into text. The service never knows
//! which implementation it is talking to; it only sees
//! [`TranscriptionEngine`] behind an `Arc`.

mod remote;
mod stub;

pub use remote::RemoteEngine;
pub use stub::StubEngine;

use crate::audio::{prepare_for_model, PrepareSettings, PreparedAudio};
use crate::error::EngineError;
use crate::ingest::UploadedAudio;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use transcribe_common::api::Decoder;
use transcribe_common::config::{EngineConfig, EngineKind};
use transcribe_common::{Error, Result};

/// Per-request engine options, already validated against the service policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscribeOptions {
    pub language: String,
    pub decoder: Decoder,
}

/// What an engine hands back for one clip
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    pub text: String,
    pub confidence: Option<f32>,
    /// Language the engine reports, if it differs from the request
    pub language: Option<String>,
    pub audio_duration: Option<Duration>,
}

#[async_trait]
pub trait TranscriptionEngine: Send + Sync {
    /// Short identifier reported on `/health`
    fn name(&self) -> &str;

    /// Whether the engine accepts work. Engines without a warm-up are always ready.
    fn is_ready(&self) -> bool {
        true
    }

    /// Bring the engine to readiness. Retried by [`warm_up_until_ready`] until it succeeds.
    async fn warm_up(&self) -> std::result::Result<(), EngineError> {
        Ok(())
    }

    /// Decode `audio` and transcribe it.
    ///
    /// Implementations must return promptly with [`EngineError::Cancelled`]
    /// once `cancel` fires. Blocking work belongs on the blocking pool.
    async fn decode_and_transcribe(
        &self,
        audio: UploadedAudio,
        options: TranscribeOptions,
        cancel: CancellationToken,
    ) -> std::result::Result<EngineOutput, EngineError>;
}

/// Construct the engine selected in config
pub fn build_engine(config: &EngineConfig) -> Result<Arc<dyn TranscriptionEngine>> {
    let settings = prepare_settings(config);
    match config.kind {
        EngineKind::Remote => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| Error::Config("engine.url is required for the remote engine".into()))?;
            let warmup = TranscribeOptions {
                language: config.default_language.clone(),
                decoder: config.default_decoder,
            };
            Ok(Arc::new(RemoteEngine::new(url, settings, warmup)?))
        }
        EngineKind::Stub => Ok(Arc::new(StubEngine::new(
            Duration::from_millis(config.stub_latency_ms),
            config.stub_text.clone(),
            settings,
        ))),
    }
}

pub(crate) fn prepare_settings(config: &EngineConfig) -> PrepareSettings {
    PrepareSettings {
        max_duration: Duration::from_secs(config.max_duration_secs),
        normalize: config.normalize,
    }
}

/// Longest single warm-up attempt before it counts as failed
const WARM_UP_ATTEMPT_LIMIT: Duration = Duration::from_secs(30);

/// Warm the engine up, retrying every `retry` until it is ready or `shutdown` fires
pub async fn warm_up_until_ready(
    engine: Arc<dyn TranscriptionEngine>,
    retry: Duration,
    shutdown: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => return,
            outcome = tokio::time::timeout(WARM_UP_ATTEMPT_LIMIT, engine.warm_up()) => outcome,
        };
        match outcome {
            Ok(Ok(())) => {
                info!(engine = engine.name(), attempt, "Engine ready");
                return;
            }
            Ok(Err(e)) => {
                warn!(
                    engine = engine.name(),
                    attempt,
                    retry_secs = retry.as_secs_f64(),
                    error = %e,
                    "Engine warm-up failed"
                );
            }
            Err(_) => {
                warn!(engine = engine.name(), attempt, "Engine warm-up timed out");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(retry) => {}
        }
    }
}

/// Run audio preparation on the blocking pool.
///
/// The decode loop polls `cancel` between packets, so an abandoned request
/// frees its blocking thread shortly after cancellation.
pub(crate) async fn prepare_blocking(
    audio: UploadedAudio,
    settings: PrepareSettings,
    cancel: CancellationToken,
) -> std::result::Result<PreparedAudio, EngineError> {
    tokio::task::spawn_blocking(move || prepare_for_model(&audio, &settings, &cancel))
        .await
        .map_err(|e| EngineError::Internal(format!("audio preparation task failed: {}", e)))?
}
