//! Audio preparation for the engine
//!
//! Uploads arrive in any supported container. Before inference they are
//! decoded, downmixed to mono, resampled to 16 kHz and optionally
//! loudness-normalized.

pub mod decode;
pub mod prepare;
pub mod resample;
pub mod wav;

pub use decode::{decode_to_mono, DecodedAudio};
pub use prepare::{prepare_for_model, PrepareSettings, PreparedAudio, MODEL_SAMPLE_RATE};
