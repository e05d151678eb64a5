//! Upstream inference server client
//!
//! Audio is prepared locally (decode, 16 kHz mono, optional normalization)
//! and posted to the upstream as a 16-bit WAV body. The upstream answers
//! with `{"text": ..., "confidence": ..., "language": ...}`.
//!
//! The engine is not ready until a warm-up request (half a second of
//! silence) has reached the upstream.

use super::{prepare_blocking, EngineOutput, TranscribeOptions, TranscriptionEngine};
use crate::audio::wav::encode_pcm16;
use crate::audio::{PrepareSettings, MODEL_SAMPLE_RATE};
use crate::error::EngineError;
use crate::ingest::UploadedAudio;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use transcribe_common::api::AudioFormat;
use transcribe_common::{Error, Result};

/// Upstream statuses that mean the audio itself was rejected
const CLIENT_REJECTIONS: [StatusCode; 3] = [
    StatusCode::BAD_REQUEST,
    StatusCode::UNSUPPORTED_MEDIA_TYPE,
    StatusCode::UNPROCESSABLE_ENTITY,
];

/// Longest upstream error body quoted in our own error
const ERROR_SNIPPET_LEN: usize = 200;

/// Bytes of an upstream error body read before giving up on the rest
const ERROR_BODY_READ_LIMIT: usize = 4 * 1024;

#[derive(Debug, Deserialize)]
struct UpstreamTranscript {
    text: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    language: Option<String>,
}

pub struct RemoteEngine {
    client: reqwest::Client,
    url: Url,
    settings: PrepareSettings,
    /// Options sent with the warm-up request
    warmup: TranscribeOptions,
    ready: AtomicBool,
}

impl RemoteEngine {
    pub fn new(url: &str, settings: PrepareSettings, warmup: TranscribeOptions) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::Config(format!("invalid engine.url '{}': {}", url, e)))?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url,
            settings,
            warmup,
            ready: AtomicBool::new(false),
        })
    }

    async fn post(
        &self,
        wav: Vec<u8>,
        options: &TranscribeOptions,
    ) -> std::result::Result<UpstreamTranscript, EngineError> {
        let response = self
            .client
            .post(self.url.clone())
            .query(&[
                ("language", options.language.as_str()),
                ("decoder", options.decoder.as_str()),
            ])
            .header(reqwest::header::CONTENT_TYPE, AudioFormat::Wav.mime())
            .body(wav)
            .send()
            .await
            .map_err(|e| EngineError::Internal(format!("upstream request failed: {}", e)))?;

        let status = response.status();
        debug!(status_code = status.as_u16(), "Upstream engine response");

        if !status.is_success() {
            let snippet = error_snippet(response).await;
            if CLIENT_REJECTIONS.contains(&status) {
                return Err(EngineError::Decode(format!(
                    "upstream rejected audio ({}): {}",
                    status, snippet
                )));
            }
            warn!(status_code = status.as_u16(), body = %snippet, "Upstream engine error");
            return Err(EngineError::Internal(format!("upstream returned {}", status)));
        }

        response
            .json::<UpstreamTranscript>()
            .await
            .map_err(|e| EngineError::Internal(format!("invalid upstream response: {}", e)))
    }
}

/// First characters of an error body; stops reading after [`ERROR_BODY_READ_LIMIT`] bytes
async fn error_snippet(mut response: reqwest::Response) -> String {
    let mut body: Vec<u8> = Vec::new();
    while body.len() < ERROR_BODY_READ_LIMIT {
        match response.chunk().await {
            Ok(Some(chunk)) => body.extend_from_slice(&chunk),
            Ok(None) | Err(_) => break,
        }
    }
    body.truncate(ERROR_BODY_READ_LIMIT);
    String::from_utf8_lossy(&body)
        .chars()
        .take(ERROR_SNIPPET_LEN)
        .collect()
}

#[async_trait]
impl TranscriptionEngine for RemoteEngine {
    fn name(&self) -> &str {
        "remote"
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Any answer other than a transport error or an upstream fault counts as
    /// reachable; an upstream that rejects silence as undecodable is still up.
    async fn warm_up(&self) -> std::result::Result<(), EngineError> {
        let silence = vec![0.0f32; MODEL_SAMPLE_RATE as usize / 2];
        let wav = encode_pcm16(&silence, MODEL_SAMPLE_RATE)?;

        match self.post(wav, &self.warmup).await {
            Ok(_) | Err(EngineError::Decode(_)) => {
                self.ready.store(true, Ordering::Release);
                info!(url = %self.url, "Upstream engine reachable");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn decode_and_transcribe(
        &self,
        audio: UploadedAudio,
        options: TranscribeOptions,
        cancel: CancellationToken,
    ) -> std::result::Result<EngineOutput, EngineError> {
        let prepared = prepare_blocking(audio, self.settings, cancel.clone()).await?;
        let wav = encode_pcm16(&prepared.samples, prepared.sample_rate())?;

        let transcript = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = self.post(wav, &options) => result?,
        };

        Ok(EngineOutput {
            text: transcript.text,
            confidence: transcript.confidence,
            language: transcript.language,
            audio_duration: Some(prepared.duration),
        })
    }
}
