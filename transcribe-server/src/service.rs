//! Transcription service
//!
//! Orchestrates ingest, admission and inference for one request and owns
//! its state machine:
//!
//! ```text
//! Received -> Validating -> Admitted -> Transcribing -> Completed
//!                 |             |             |
//!                 v             v             v
//!              Rejected      Rejected    TimedOut | Failed
//! ```
//!
//! The admission slot is released exactly once, at the single point where
//! inference returns; the ticket's `Drop` covers futures abandoned mid-flight.

use crate::admission::{AdmissionController, AdmissionError};
use crate::context::RequestContext;
use crate::engine::{TranscribeOptions, TranscriptionEngine};
use crate::error::{TranscriptionError, ValidationError};
use crate::inference::InferenceWorker;
use crate::ingest::{DeclaredUpload, Ingestor, UploadedAudio};
use axum::body::Bytes;
use futures::Stream;
use serde::Deserialize;
use std::fmt;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use transcribe_common::api::{Decoder, StatusResponse, TerminalCounts, TranscribeResponse};
use transcribe_common::time::duration_to_millis;
use transcribe_common::wer::{compute_wer, WerReport};
use transcribe_common::ServiceConfig;
use uuid::Uuid;

/// Lifecycle of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Validating,
    Admitted,
    Transcribing,
    Completed,
    Rejected,
    TimedOut,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed
                | RequestState::Rejected
                | RequestState::TimedOut
                | RequestState::Failed
        )
    }

    /// Terminal state a failure lands in
    pub fn for_error(err: &TranscriptionError) -> Self {
        match err {
            TranscriptionError::Validation(_) | TranscriptionError::AdmissionTimeout { .. } => {
                RequestState::Rejected
            }
            TranscriptionError::Cancelled { .. } => RequestState::TimedOut,
            TranscriptionError::EngineFailure { .. } => RequestState::Failed,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Received => "received",
            RequestState::Validating => "validating",
            RequestState::Admitted => "admitted",
            RequestState::Transcribing => "transcribing",
            RequestState::Completed => "completed",
            RequestState::Rejected => "rejected",
            RequestState::TimedOut => "timed_out",
            RequestState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Live and terminal request counters
#[derive(Debug, Default)]
struct ServiceStats {
    active: AtomicUsize,
    admitted: AtomicUsize,
    transcribing: AtomicUsize,
    completed: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    failed: AtomicU64,
}

impl ServiceStats {
    /// Gauge of requests currently sitting in `state`, for states that hold a slot
    fn gauge(&self, state: RequestState) -> Option<&AtomicUsize> {
        match state {
            RequestState::Admitted => Some(&self.admitted),
            RequestState::Transcribing => Some(&self.transcribing),
            _ => None,
        }
    }

    fn record(&self, state: RequestState) {
        let counter = match state {
            RequestState::Completed => &self.completed,
            RequestState::Rejected => &self.rejected,
            RequestState::TimedOut => &self.timed_out,
            RequestState::Failed => &self.failed,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn terminal(&self) -> TerminalCounts {
        TerminalCounts {
            completed: self.completed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Per-request bookkeeping: context, current state and the active gauge
pub struct RequestTracker {
    ctx: RequestContext,
    state: RequestState,
    stats: Arc<ServiceStats>,
}

impl RequestTracker {
    fn new(ctx: RequestContext, stats: Arc<ServiceStats>) -> Self {
        stats.active.fetch_add(1, Ordering::Relaxed);
        debug!(request_id = %ctx.id(), "Request received");
        Self {
            ctx,
            state: RequestState::Received,
            stats,
        }
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn id(&self) -> Uuid {
        self.ctx.id()
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    fn transition(&mut self, to: RequestState) {
        if self.state == to || self.state.is_terminal() {
            return;
        }
        debug!(
            request_id = %self.ctx.id(),
            from = %self.state,
            to = %to,
            elapsed_ms = self.ctx.elapsed().as_millis() as u64,
            "Request state change"
        );
        if let Some(gauge) = self.stats.gauge(self.state) {
            gauge.fetch_sub(1, Ordering::Relaxed);
        }
        if let Some(gauge) = self.stats.gauge(to) {
            gauge.fetch_add(1, Ordering::Relaxed);
        }
        self.state = to;
        self.stats.record(to);
    }

    /// Move to the terminal state matching `result` and hand it back
    pub fn finish<T>(mut self, result: Result<T, TranscriptionError>) -> Result<T, TranscriptionError> {
        match &result {
            Ok(_) => self.transition(RequestState::Completed),
            Err(err) => {
                self.transition(RequestState::for_error(err));
                debug!(
                    request_id = %self.ctx.id(),
                    code = err.error_code(),
                    error = %err,
                    "Request failed"
                );
            }
        }
        result
    }
}

impl Drop for RequestTracker {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        if let Some(gauge) = self.stats.gauge(self.state) {
            gauge.fetch_sub(1, Ordering::Relaxed);
        }
        if !self.state.is_terminal() {
            // Handler future dropped before finishing (client disconnected)
            self.ctx.cancel_token().cancel();
            debug!(request_id = %self.ctx.id(), state = %self.state, "Request abandoned");
        }
    }
}

/// Options as supplied by the client, unvalidated
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestOptions {
    pub language: Option<String>,
    pub decoder: Option<String>,
    pub reference: Option<String>,
}

/// Options after validation against the service policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub engine: TranscribeOptions,
    pub reference: Option<String>,
}

/// Languages and decoders the service accepts
#[derive(Debug, Clone)]
struct OptionPolicy {
    default_language: String,
    languages: Vec<String>,
    default_decoder: Decoder,
}

impl OptionPolicy {
    fn resolve(&self, raw: &RequestOptions) -> Result<ResolvedOptions, ValidationError> {
        let language = match raw.language.as_deref().map(str::trim) {
            None | Some("") => self.default_language.clone(),
            Some(language) => {
                let language = language.to_ascii_lowercase();
                if !self.languages.contains(&language) {
                    return Err(ValidationError::InvalidOption(format!(
                        "unsupported language '{}' (supported: {})",
                        language,
                        self.languages.join(", ")
                    )));
                }
                language
            }
        };

        let decoder = match raw.decoder.as_deref().map(str::trim) {
            None | Some("") => self.default_decoder,
            Some(decoder) => decoder
                .parse::<Decoder>()
                .map_err(|e| ValidationError::InvalidOption(e.to_string()))?,
        };

        Ok(ResolvedOptions {
            engine: TranscribeOptions { language, decoder },
            reference: raw.reference.clone(),
        })
    }
}

/// Outcome of a completed transcription
#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    pub request_id: Uuid,
    pub text: String,
    pub confidence: Option<f32>,
    pub language: String,
    pub decoder: Decoder,
    pub audio_duration: Option<Duration>,
    pub processing_duration: Duration,
    pub wer: Option<WerReport>,
}

impl From<TranscriptionResult> for TranscribeResponse {
    fn from(result: TranscriptionResult) -> Self {
        TranscribeResponse {
            request_id: result.request_id,
            text: result.text,
            duration_ms: duration_to_millis(result.processing_duration),
            audio_duration_secs: result.audio_duration.map(|d| d.as_secs_f64()),
            language: result.language,
            decoder: result.decoder,
            confidence: result.confidence,
            wer: result.wer,
        }
    }
}

pub struct TranscriptionService {
    ingestor: Ingestor,
    admission: AdmissionController,
    worker: InferenceWorker,
    policy: OptionPolicy,
    request_timeout: Duration,
    stats: Arc<ServiceStats>,
}

impl TranscriptionService {
    pub fn new(config: &ServiceConfig, engine: Arc<dyn TranscriptionEngine>) -> Self {
        info!(
            engine = engine.name(),
            concurrency_limit = config.admission.concurrency_limit,
            parallelism = config.engine.parallelism,
            request_timeout_secs = config.admission.request_timeout_secs,
            "Transcription service ready"
        );

        Self {
            ingestor: Ingestor::new(config.ingest.clone()),
            admission: AdmissionController::new(config.admission.concurrency_limit),
            worker: InferenceWorker::new(engine, config.engine.parallelism),
            policy: OptionPolicy {
                default_language: config.engine.default_language.clone(),
                languages: config.engine.languages.clone(),
                default_decoder: config.engine.default_decoder,
            },
            request_timeout: config.request_timeout(),
            stats: Arc::new(ServiceStats::default()),
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn engine_name(&self) -> &str {
        self.worker.engine_name()
    }

    pub fn engine_ready(&self) -> bool {
        self.worker.engine_ready()
    }

    /// Start the clock for a new request
    pub fn begin(&self) -> RequestTracker {
        RequestTracker::new(RequestContext::new(self.request_timeout), Arc::clone(&self.stats))
    }

    /// Validate client options; failures move the request to `Rejected` via [`RequestTracker::finish`]
    pub fn resolve_options(
        &self,
        tracker: &mut RequestTracker,
        raw: &RequestOptions,
    ) -> Result<ResolvedOptions, TranscriptionError> {
        tracker.transition(RequestState::Validating);
        Ok(self.policy.resolve(raw)?)
    }

    /// Read the upload body
    pub async fn ingest<S, E>(
        &self,
        tracker: &mut RequestTracker,
        body: S,
        declared: &DeclaredUpload,
    ) -> Result<UploadedAudio, TranscriptionError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        tracker.transition(RequestState::Validating);
        self.ingestor.ingest(body, declared, &tracker.ctx).await
    }

    /// Admit the request and run inference on already-ingested audio
    pub async fn run(
        &self,
        tracker: &mut RequestTracker,
        audio: UploadedAudio,
        options: ResolvedOptions,
    ) -> Result<TranscriptionResult, TranscriptionError> {
        let ctx = tracker.ctx.clone();

        let mut ticket = match self.admission.acquire(ctx.id(), ctx.deadline()).await {
            Ok(ticket) => ticket,
            Err(AdmissionError::Timeout { waited }) => {
                return Err(TranscriptionError::AdmissionTimeout { waited })
            }
            Err(AdmissionError::Closed) => {
                warn!(request_id = %ctx.id(), "Rejecting request during shutdown");
                return Err(TranscriptionError::AdmissionTimeout {
                    waited: ctx.elapsed(),
                });
            }
        };
        tracker.transition(RequestState::Admitted);

        let ResolvedOptions { engine, reference } = options;
        let requested_language = engine.language.clone();
        let decoder = engine.decoder;

        tracker.transition(RequestState::Transcribing);
        let outcome = self.worker.transcribe(audio, engine, &ctx).await;
        self.admission.release(&mut ticket);
        let output = outcome?;

        let wer = reference.as_deref().map(|reference| compute_wer(&output.text, reference));

        Ok(TranscriptionResult {
            request_id: ctx.id(),
            text: output.text,
            confidence: output.confidence,
            language: output.language.unwrap_or(requested_language),
            decoder,
            audio_duration: output.audio_duration,
            processing_duration: ctx.elapsed(),
            wer,
        })
    }

    /// Full pipeline for a body whose options are known up front
    pub async fn handle<S, E>(
        &self,
        body: S,
        declared: &DeclaredUpload,
        options: &RequestOptions,
    ) -> Result<TranscriptionResult, TranscriptionError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let mut tracker = self.begin();
        let result = self.handle_tracked(&mut tracker, body, declared, options).await;
        tracker.finish(result)
    }

    async fn handle_tracked<S, E>(
        &self,
        tracker: &mut RequestTracker,
        body: S,
        declared: &DeclaredUpload,
        options: &RequestOptions,
    ) -> Result<TranscriptionResult, TranscriptionError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let options = self.resolve_options(tracker, options)?;
        let audio = self.ingest(tracker, body, declared).await?;
        self.run(tracker, audio, options).await
    }

    /// Snapshot for `/status`
    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            capacity: self.admission.capacity(),
            in_flight: self.admission.in_flight(),
            available: self.admission.available(),
            waiting: self.admission.waiting(),
            active_requests: self.stats.active.load(Ordering::Relaxed),
            admitted: self.stats.admitted.load(Ordering::Relaxed),
            transcribing: self.stats.transcribing.load(Ordering::Relaxed),
            terminal: self.stats.terminal(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOutput;
    use crate::error::EngineError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio_util::sync::CancellationToken;

    struct EchoEngine {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TranscriptionEngine for EchoEngine {
        fn name(&self) -> &str {
            "echo"
        }

        async fn decode_and_transcribe(
            &self,
            audio: UploadedAudio,
            options: TranscribeOptions,
            _cancel: CancellationToken,
        ) -> Result<EngineOutput, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if audio.size() < 4 {
                return Err(EngineError::Decode("too short to be audio".into()));
            }
            Ok(EngineOutput {
                text: format!("namaste {}", options.language),
                confidence: Some(0.9),
                language: None,
                audio_duration: Some(Duration::from_secs(3)),
            })
        }
    }

    fn service() -> (TranscriptionService, Arc<EchoEngine>) {
        let engine = Arc::new(EchoEngine {
            calls: AtomicUsize::new(0),
        });
        (TranscriptionService::new(&ServiceConfig::default(), engine.clone()), engine)
    }

    fn body(data: &'static [u8]) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
        futures::stream::iter(vec![Ok(Bytes::from_static(data))])
    }

    fn wav() -> DeclaredUpload {
        DeclaredUpload {
            content_type: Some("audio/wav".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_completed_request() {
        let (service, engine) = service();
        let options = RequestOptions {
            language: Some("TA".to_string()),
            decoder: Some("ctc".to_string()),
            reference: Some("Namaste, ta!".to_string()),
        };

        let result = service.handle(body(b"RIFFdata"), &wav(), &options).await.unwrap();

        assert_eq!(result.text, "namaste ta");
        assert_eq!(result.language, "ta");
        assert_eq!(result.decoder, Decoder::Ctc);
        assert_eq!(result.wer.as_ref().and_then(|w| w.wer), Some(0.0));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);

        let status = service.status();
        assert_eq!(status.terminal.completed, 1);
        assert_eq!(status.in_flight, 0);
        assert_eq!(status.active_requests, 0);
        assert_eq!(status.admitted + status.transcribing, 0);
    }

    #[tokio::test]
    async fn test_defaults_applied() {
        let (service, _) = service();
        let result = service
            .handle(body(b"RIFFdata"), &wav(), &RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(result.language, "hi");
        assert_eq!(result.decoder, Decoder::Rnnt);
        assert!(result.wer.is_none());

        let response: TranscribeResponse = result.into();
        assert_eq!(response.audio_duration_secs, Some(3.0));
    }

    #[tokio::test]
    async fn test_invalid_language_rejected_before_engine() {
        let (service, engine) = service();
        let options = RequestOptions {
            language: Some("klingon".to_string()),
            ..Default::default()
        };

        let err = service.handle(body(b"RIFFdata"), &wav(), &options).await.unwrap_err();
        assert!(matches!(
            err,
            TranscriptionError::Validation(ValidationError::InvalidOption(_))
        ));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
        assert_eq!(service.status().terminal.rejected, 1);
    }

    #[tokio::test]
    async fn test_invalid_decoder_rejected() {
        let (service, _) = service();
        let options = RequestOptions {
            decoder: Some("beam".to_string()),
            ..Default::default()
        };
        let err = service.handle(body(b"RIFFdata"), &wav(), &options).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_engine_failure_counted_and_slot_freed() {
        let (service, _) = service();
        let err = service
            .handle(body(b"ab"), &wav(), &RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(RequestState::for_error(&err), RequestState::Failed);

        let status = service.status();
        assert_eq!(status.terminal.failed, 1);
        assert_eq!(status.in_flight, 0);
        assert_eq!(service.admission().acquired_total(), service.admission().released_total());
    }

    #[tokio::test]
    async fn test_closed_admission_answers_busy() {
        let (service, engine) = service();
        service.admission().close();

        let err = service
            .handle(body(b"RIFFdata"), &wav(), &RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TranscriptionError::AdmissionTimeout { .. }));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_transitions_stop_at_terminal() {
        let stats = Arc::new(ServiceStats::default());
        let mut tracker = RequestTracker::new(RequestContext::new(Duration::from_secs(1)), stats.clone());
        tracker.transition(RequestState::Validating);
        tracker.transition(RequestState::Rejected);
        tracker.transition(RequestState::Completed);

        assert_eq!(tracker.state(), RequestState::Rejected);
        assert_eq!(stats.terminal().rejected, 1);
        assert_eq!(stats.terminal().completed, 0);
        drop(tracker);
        assert_eq!(stats.active.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_dropped_tracker_cancels_request() {
        let stats = Arc::new(ServiceStats::default());
        let tracker = RequestTracker::new(RequestContext::new(Duration::from_secs(1)), stats);
        let token = tracker.context().cancel_token().clone();
        drop(tracker);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_slot_gauges_follow_state() {
        fn gauges(stats: &ServiceStats) -> (usize, usize) {
            (
                stats.admitted.load(Ordering::Relaxed),
                stats.transcribing.load(Ordering::Relaxed),
            )
        }
        let stats = Arc::new(ServiceStats::default());

        let mut finished = RequestTracker::new(RequestContext::new(Duration::from_secs(1)), stats.clone());
        finished.transition(RequestState::Validating);
        finished.transition(RequestState::Admitted);
        assert_eq!(gauges(&stats), (1, 0));
        finished.transition(RequestState::Transcribing);
        assert_eq!(gauges(&stats), (0, 1));

        let mut abandoned = RequestTracker::new(RequestContext::new(Duration::from_secs(1)), stats.clone());
        abandoned.transition(RequestState::Admitted);
        assert_eq!(gauges(&stats), (1, 1));

        let _ = finished.finish::<()>(Err(TranscriptionError::internal("boom")));
        assert_eq!(gauges(&stats), (1, 0));
        drop(abandoned);
        assert_eq!(gauges(&stats), (0, 0));
    }
}
