//! WAV encoding of prepared audio

use crate::error::EngineError;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::io::Cursor;

/// Encode mono f32 samples as 16-bit PCM WAV
pub fn encode_pcm16(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, EngineError> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)
            .map_err(|e| EngineError::Internal(format!("wav header: {}", e)))?;
        for &sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
            writer
                .write_sample(value)
                .map_err(|e| EngineError::Internal(format!("wav write: {}", e)))?;
        }
        writer
            .finalize()
            .map_err(|e| EngineError::Internal(format!("wav finalize: {}", e)))?;
    }

    Ok(cursor.into_inner())
}
