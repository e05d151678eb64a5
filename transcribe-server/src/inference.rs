//! Inference worker
//!
//! Owns the shared engine handle and bounds concurrent engine calls with an
//! inner semaphore sized to the engine's parallelism. Every wait here is
//! bounded by the request deadline.

use crate::context::RequestContext;
use crate::engine::{EngineOutput, TranscribeOptions, TranscriptionEngine};
use crate::error::TranscriptionError;
use crate::ingest::UploadedAudio;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{sleep_until, timeout_at};
use tracing::{debug, error, warn};

const STAGE: &str = "inference";

pub struct InferenceWorker {
    engine: Arc<dyn TranscriptionEngine>,
    gate: Arc<Semaphore>,
    parallelism: usize,
}

impl InferenceWorker {
    pub fn new(engine: Arc<dyn TranscriptionEngine>, parallelism: usize) -> Self {
        let parallelism = parallelism.max(1);
        Self {
            engine,
            gate: Arc::new(Semaphore::new(parallelism)),
            parallelism,
        }
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    pub fn engine_ready(&self) -> bool {
        self.engine.is_ready()
    }

    /// Engine calls currently running (including abandoned ones still winding down)
    pub fn busy(&self) -> usize {
        self.parallelism - self.gate.available_permits()
    }

    /// Run one engine call for `audio`.
    ///
    /// Returns `Cancelled` as soon as the deadline passes or the request is
    /// cancelled. The engine call itself keeps its gate permit until it
    /// actually returns, so an abandoned call still counts against
    /// parallelism while it winds down. An engine that has not finished
    /// warming up is refused without being called.
    pub async fn transcribe(
        &self,
        audio: UploadedAudio,
        options: TranscribeOptions,
        ctx: &RequestContext,
    ) -> Result<EngineOutput, TranscriptionError> {
        if !self.engine.is_ready() {
            warn!(request_id = %ctx.id(), engine = self.engine.name(), "Engine not ready");
            return Err(TranscriptionError::internal("engine not ready"));
        }

        let deadline = ctx.deadline();

        let permit = tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => {
                return Err(TranscriptionError::Cancelled { stage: STAGE });
            }
            acquired = timeout_at(deadline, self.gate.clone().acquire_owned()) => match acquired {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(TranscriptionError::internal("engine gate closed")),
                Err(_) => {
                    debug!(request_id = %ctx.id(), "Deadline passed waiting for engine");
                    return Err(TranscriptionError::Cancelled { stage: STAGE });
                }
            },
        };

        debug!(
            request_id = %ctx.id(),
            remaining_ms = ctx.remaining().as_millis() as u64,
            "Engine gate acquired"
        );

        let cancel = ctx.child_token();
        // Cancels the engine if this future is dropped (client went away)
        let _abandon = cancel.clone().drop_guard();

        let engine = Arc::clone(&self.engine);
        let engine_cancel = cancel.clone();
        let request_id = ctx.id();
        let mut call = tokio::spawn(async move {
            let _permit = permit;
            let result = engine
                .decode_and_transcribe(audio, options, engine_cancel)
                .await;
            debug!(request_id = %request_id, ok = result.is_ok(), "Engine call returned");
            result
        });

        tokio::select! {
            joined = &mut call => match joined {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(err)) => Err(err.into()),
                Err(join_err) => {
                    error!(request_id = %ctx.id(), error = %join_err, "Engine task failed");
                    Err(TranscriptionError::internal(format!("engine task failed: {}", join_err)))
                }
            },
            _ = sleep_until(deadline) => {
                cancel.cancel();
                warn!(
                    request_id = %ctx.id(),
                    elapsed_ms = ctx.elapsed().as_millis() as u64,
                    "Deadline exceeded during inference, engine cancelled"
                );
                Err(TranscriptionError::Cancelled { stage: STAGE })
            }
            _ = ctx.cancel_token().cancelled() => {
                Err(TranscriptionError::Cancelled { stage: STAGE })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, EngineFailureReason};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;
    use transcribe_common::api::{AudioFormat, Decoder};

    /// Sleeps for `latency`, optionally ignoring cancellation, and tracks overlap
    struct SleepEngine {
        latency: Duration,
        honour_cancel: bool,
        running: AtomicUsize,
        max_running: AtomicUsize,
        saw_cancel: AtomicBool,
    }

    impl SleepEngine {
        fn new(latency: Duration, honour_cancel: bool) -> Arc<Self> {
            Arc::new(Self {
                latency,
                honour_cancel,
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                saw_cancel: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl TranscriptionEngine for SleepEngine {
        fn name(&self) -> &str {
            "sleep"
        }

        async fn decode_and_transcribe(
            &self,
            _audio: UploadedAudio,
            options: TranscribeOptions,
            cancel: CancellationToken,
        ) -> Result<EngineOutput, EngineError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);

            let result = if self.honour_cancel {
                tokio::select! {
                    _ = cancel.cancelled() => Err(EngineError::Cancelled),
                    _ = tokio::time::sleep(self.latency) => Ok(()),
                }
            } else {
                tokio::time::sleep(self.latency).await;
                Ok(())
            };
            if cancel.is_cancelled() {
                self.saw_cancel.store(true, Ordering::SeqCst);
            }

            self.running.fetch_sub(1, Ordering::SeqCst);
            result.map(|_| EngineOutput {
                text: format!("ok-{}", options.language),
                ..Default::default()
            })
        }
    }

    struct FailingEngine(fn() -> Result<EngineOutput, EngineError>);

    #[async_trait]
    impl TranscriptionEngine for FailingEngine {
        fn name(&self) -> &str {
            "failing"
        }

        async fn decode_and_transcribe(
            &self,
            _audio: UploadedAudio,
            _options: TranscribeOptions,
            _cancel: CancellationToken,
        ) -> Result<EngineOutput, EngineError> {
            (self.0)()
        }
    }

    /// Never finishes warming up; counts calls that slip through anyway
    struct ColdEngine {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TranscriptionEngine for ColdEngine {
        fn name(&self) -> &str {
            "cold"
        }

        fn is_ready(&self) -> bool {
            false
        }

        async fn decode_and_transcribe(
            &self,
            _audio: UploadedAudio,
            _options: TranscribeOptions,
            _cancel: CancellationToken,
        ) -> Result<EngineOutput, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(EngineOutput::default())
        }
    }

    fn audio() -> UploadedAudio {
        UploadedAudio::in_memory(AudioFormat::Wav, vec![0u8; 16])
    }

    fn options() -> TranscribeOptions {
        TranscribeOptions {
            language: "hi".to_string(),
            decoder: Decoder::Rnnt,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_passes_output_through() {
        let worker = InferenceWorker::new(SleepEngine::new(Duration::from_secs(1), true), 1);
        let ctx = RequestContext::new(Duration::from_secs(10));

        let output = worker.transcribe(audio(), options(), &ctx).await.unwrap();
        assert_eq!(output.text, "ok-hi");
        assert_eq!(worker.busy(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_calls_serialized() {
        let engine = SleepEngine::new(Duration::from_secs(1), true);
        let worker = Arc::new(InferenceWorker::new(engine.clone(), 1));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let worker = worker.clone();
            handles.push(tokio::spawn(async move {
                let ctx = RequestContext::new(Duration::from_secs(10));
                worker.transcribe(audio(), options(), &ctx).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(engine.max_running.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallelism_two_overlaps() {
        let engine = SleepEngine::new(Duration::from_secs(1), true);
        let worker = Arc::new(InferenceWorker::new(engine.clone(), 2));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let worker = worker.clone();
            handles.push(tokio::spawn(async move {
                let ctx = RequestContext::new(Duration::from_secs(10));
                worker.transcribe(audio(), options(), &ctx).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(engine.max_running.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_engine() {
        let engine = SleepEngine::new(Duration::from_secs(30), true);
        let worker = InferenceWorker::new(engine.clone(), 1);
        let ctx = RequestContext::new(Duration::from_secs(2));
        let start = Instant::now();

        let result = worker.transcribe(audio(), options(), &ctx).await;
        assert!(matches!(result, Err(TranscriptionError::Cancelled { .. })));
        assert_eq!(start.elapsed(), Duration::from_secs(2));

        // Let the engine task observe its cancelled token
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(engine.saw_cancel.load(Ordering::SeqCst));
        assert_eq!(worker.busy(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stubborn_engine_keeps_gate_until_return() {
        let engine = SleepEngine::new(Duration::from_secs(5), false);
        let worker = InferenceWorker::new(engine, 1);
        let ctx = RequestContext::new(Duration::from_secs(1));

        let result = worker.transcribe(audio(), options(), &ctx).await;
        assert!(matches!(result, Err(TranscriptionError::Cancelled { .. })));
        assert_eq!(worker.busy(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(worker.busy(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_wait_bounded_by_deadline() {
        let worker = Arc::new(InferenceWorker::new(
            SleepEngine::new(Duration::from_secs(10), true),
            1,
        ));

        let holder = {
            let worker = worker.clone();
            tokio::spawn(async move {
                let ctx = RequestContext::new(Duration::from_secs(60));
                worker.transcribe(audio(), options(), &ctx).await
            })
        };
        tokio::task::yield_now().await;

        let ctx = RequestContext::new(Duration::from_secs(3));
        let start = Instant::now();
        let result = worker.transcribe(audio(), options(), &ctx).await;
        assert!(matches!(result, Err(TranscriptionError::Cancelled { .. })));
        assert_eq!(start.elapsed(), Duration::from_secs(3));

        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_decode_failure_mapped() {
        let worker = InferenceWorker::new(
            Arc::new(FailingEngine(|| Err(EngineError::Decode("not audio".into())))),
            1,
        );
        let ctx = RequestContext::new(Duration::from_secs(5));

        match worker.transcribe(audio(), options(), &ctx).await {
            Err(TranscriptionError::EngineFailure { reason, .. }) => {
                assert_eq!(reason, EngineFailureReason::Decode)
            }
            other => panic!("expected decode failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_engine_panic_is_internal() {
        let worker = InferenceWorker::new(
            Arc::new(FailingEngine(|| panic!("model exploded"))),
            1,
        );
        let ctx = RequestContext::new(Duration::from_secs(5));

        match worker.transcribe(audio(), options(), &ctx).await {
            Err(TranscriptionError::EngineFailure { reason, .. }) => {
                assert_eq!(reason, EngineFailureReason::Internal)
            }
            other => panic!("expected internal failure, got {other:?}"),
        }
        assert_eq!(worker.busy(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_cancel_stops_engine() {
        let engine = SleepEngine::new(Duration::from_secs(30), true);
        let worker = InferenceWorker::new(engine.clone(), 1);
        let ctx = RequestContext::new(Duration::from_secs(60));

        let token = ctx.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let result = worker.transcribe(audio(), options(), &ctx).await;
        assert!(matches!(result, Err(TranscriptionError::Cancelled { .. })));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(engine.saw_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_engine_not_ready_is_internal() {
        let engine = Arc::new(ColdEngine {
            calls: AtomicUsize::new(0),
        });
        let worker = InferenceWorker::new(engine.clone(), 1);
        let ctx = RequestContext::new(Duration::from_secs(5));

        assert!(!worker.engine_ready());
        match worker.transcribe(audio(), options(), &ctx).await {
            Err(TranscriptionError::EngineFailure { reason, .. }) => {
                assert_eq!(reason, EngineFailureReason::Internal)
            }
            other => panic!("expected internal failure, got {other:?}"),
        }
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
        assert_eq!(worker.busy(), 0);
    }
}
