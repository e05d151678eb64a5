//! Local stand-in engine
//!
//! Decodes the audio for real, then waits a fixed latency and returns a
//! canned transcript. Useful for load testing the admission path without
//! a model.

use super::{prepare_blocking, EngineOutput, TranscribeOptions, TranscriptionEngine};
use crate::audio::PrepareSettings;
use crate::error::EngineError;
use crate::ingest::UploadedAudio;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct StubEngine {
    latency: Duration,
    text: String,
    settings: PrepareSettings,
}

impl StubEngine {
    pub fn new(latency: Duration, text: String, settings: PrepareSettings) -> Self {
        Self {
            latency,
            text,
            settings,
        }
    }
}

#[async_trait]
impl TranscriptionEngine for StubEngine {
    fn name(&self) -> &str {
        "stub"
    }

    async fn decode_and_transcribe(
        &self,
        audio: UploadedAudio,
        options: TranscribeOptions,
        cancel: CancellationToken,
    ) -> Result<EngineOutput, EngineError> {
        let prepared = prepare_blocking(audio, self.settings, cancel.clone()).await?;

        tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            _ = tokio::time::sleep(self.latency) => {}
        }

        let text = if self.text.is_empty() {
            format!(
                "[{:.1}s of {} audio, {} decoder]",
                prepared.duration.as_secs_f64(),
                options.language,
                options.decoder
            )
        } else {
            self.text.clone()
        };

        debug!(frames = prepared.samples.len(), "Stub transcription complete");

        Ok(EngineOutput {
            text,
            confidence: None,
            language: None,
            audio_duration: Some(prepared.duration),
        })
    }
}
