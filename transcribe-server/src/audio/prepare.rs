//! Upload-to-model audio preparation
//!
//! Decode, downmix, resample to [`MODEL_SAMPLE_RATE`], then optionally
//! normalize loudness toward [`TARGET_LOUDNESS_DBFS`].

use super::{decode::decode_to_mono, resample::resample_mono};
use crate::error::EngineError;
use crate::ingest::UploadedAudio;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Sample rate every engine receives
pub const MODEL_SAMPLE_RATE: u32 = 16_000;

/// Loudness target for normalization, in dBFS RMS
pub const TARGET_LOUDNESS_DBFS: f32 = -23.0;

const PEAK_LIMIT: f32 = 0.99;
const SILENCE_RMS: f32 = 1e-6;

#[derive(Debug, Clone, Copy)]
pub struct PrepareSettings {
    pub max_duration: Duration,
    pub normalize: bool,
}

/// 16 kHz mono audio ready for inference
#[derive(Debug, Clone)]
pub struct PreparedAudio {
    pub samples: Vec<f32>,
    pub duration: Duration,
}

impl PreparedAudio {
    pub fn sample_rate(&self) -> u32 {
        MODEL_SAMPLE_RATE
    }
}

/// Turn an upload into model-ready audio.
///
/// Blocking; call from `spawn_blocking`.
pub fn prepare_for_model(
    audio: &UploadedAudio,
    settings: &PrepareSettings,
    cancel: &CancellationToken,
) -> Result<PreparedAudio, EngineError> {
    let decoded = decode_to_mono(audio, settings.max_duration, cancel)?;
    let duration = decoded.duration();

    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    let mut samples = resample_mono(decoded.samples, decoded.sample_rate, MODEL_SAMPLE_RATE)?;
    if settings.normalize {
        normalize_loudness(&mut samples, TARGET_LOUDNESS_DBFS);
    }

    debug!(
        duration_secs = duration.as_secs_f64(),
        frames = samples.len(),
        normalized = settings.normalize,
        "Audio prepared for model"
    );

    Ok(PreparedAudio { samples, duration })
}

/// Scale samples so their RMS level hits `target_dbfs`, limited so the
/// peak stays under [`PEAK_LIMIT`]. Silence is left untouched.
pub fn normalize_loudness(samples: &mut [f32], target_dbfs: f32) {
    let rms = rms(samples);
    if rms < SILENCE_RMS {
        return;
    }

    let target_rms = 10f32.powf(target_dbfs / 20.0);
    let mut gain = target_rms / rms;

    let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    if peak * gain > PEAK_LIMIT {
        gain = PEAK_LIMIT / peak;
    }

    for sample in samples.iter_mut() {
        *sample *= gain;
    }
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}
