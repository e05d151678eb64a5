//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use transcribe_common::ServiceConfig;
use transcribe_server::engine::{EngineOutput, TranscribeOptions, TranscriptionEngine};
use transcribe_server::error::EngineError;
use transcribe_server::ingest::UploadedAudio;
use transcribe_server::service::TranscriptionService;
use transcribe_server::{build_router, AppState};

/// What the scripted engine does once its latency has passed
#[derive(Debug, Clone)]
pub enum Behaviour {
    Echo,
    Decode,
    Internal,
    Panic,
}

/// Engine double that sleeps (cancellably) and then follows its script
pub struct ScriptedEngine {
    latency: Duration,
    behaviour: Behaviour,
    pub calls: AtomicUsize,
    pub cancelled: AtomicUsize,
    running: AtomicUsize,
    pub max_running: AtomicUsize,
    ready: AtomicBool,
}

impl ScriptedEngine {
    pub fn new(latency: Duration, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            latency,
            behaviour,
            calls: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            ready: AtomicBool::new(true),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

#[async_trait]
impl TranscriptionEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn decode_and_transcribe(
        &self,
        audio: UploadedAudio,
        options: TranscribeOptions,
        cancel: CancellationToken,
    ) -> Result<EngineOutput, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        let slept = tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.latency) => true,
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        if !slept {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            return Err(EngineError::Cancelled);
        }

        match self.behaviour {
            Behaviour::Echo => Ok(EngineOutput {
                text: format!("{} bytes of {} in {}", audio.size(), audio.format(), options.language),
                confidence: Some(0.5),
                language: None,
                audio_duration: Some(Duration::from_secs(2)),
            }),
            Behaviour::Decode => Err(EngineError::Decode("not speech".into())),
            Behaviour::Internal => Err(EngineError::Internal("device lost".into())),
            Behaviour::Panic => panic!("engine bug"),
        }
    }
}

pub fn config(concurrency_limit: usize, timeout_secs: u64) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.admission.concurrency_limit = concurrency_limit;
    config.admission.request_timeout_secs = timeout_secs;
    config.engine.parallelism = concurrency_limit;
    config
}

pub fn service(config: &ServiceConfig, engine: Arc<ScriptedEngine>) -> Arc<TranscriptionService> {
    Arc::new(TranscriptionService::new(config, engine))
}

pub fn router(service: Arc<TranscriptionService>) -> axum::Router {
    build_router(AppState::new(service))
}

pub const BOUNDARY: &str = "XyZtranscribeBoundary";

/// Build a `multipart/form-data` body from `(name, file_name, content_type, data)` parts
pub fn multipart_body(parts: &[(&str, Option<&str>, Option<&str>, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, file_name, content_type, data) in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        let mut disposition = format!("Content-Disposition: form-data; name=\"{}\"", name);
        if let Some(file_name) = file_name {
            disposition.push_str(&format!("; filename=\"{}\"", file_name));
        }
        body.extend_from_slice(disposition.as_bytes());
        body.extend_from_slice(b"\r\n");
        if let Some(content_type) = content_type {
            body.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(data.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

pub fn multipart_content_type() -> String {
    format!("multipart/form-data; boundary={}", BOUNDARY)
}
