//! Sample-rate conversion to the model rate

use crate::error::EngineError;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::debug;

/// Resample mono audio from `input_rate` to `output_rate`.
///
/// The whole clip is processed as one chunk; upload duration is already
/// bounded by the decode step.
pub fn resample_mono(
    input: Vec<f32>,
    input_rate: u32,
    output_rate: u32,
) -> Result<Vec<f32>, EngineError> {
    if input_rate == output_rate || input.is_empty() {
        return Ok(input);
    }
    if input_rate == 0 {
        return Err(EngineError::Decode("stream reports a zero sample rate".to_string()));
    }

    let input_frames = input.len();
    let mut resampler = FastFixedIn::<f32>::new(
        output_rate as f64 / input_rate as f64,
        1.0,
        PolynomialDegree::Septic,
        input_frames,
        1,
    )
    .map_err(|e| EngineError::Internal(format!("failed to create resampler: {}", e)))?;

    let waves_in = vec![input];
    let mut output = resampler
        .process(&waves_in, None)
        .map_err(|e| EngineError::Internal(format!("resampling failed: {}", e)))?;
    let samples = output.pop().unwrap_or_default();

    debug!(
        input_rate,
        output_rate,
        input_frames,
        output_frames = samples.len(),
        "Resampled audio"
    );

    Ok(samples)
}
