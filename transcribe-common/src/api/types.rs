//! Shared API request/response types

use crate::wer::WerReport;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ========================================
// Audio formats
// ========================================

/// Audio container formats accepted for upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Mp3,
    Flac,
    Ogg,
    Mp4,
    Aac,
}

impl AudioFormat {
    pub fn all() -> &'static [AudioFormat] {
        &[
            AudioFormat::Wav,
            AudioFormat::Mp3,
            AudioFormat::Flac,
            AudioFormat::Ogg,
            AudioFormat::Mp4,
            AudioFormat::Aac,
        ]
    }

    /// Resolve a `Content-Type` header value.
    ///
    /// Parameters after `;` are ignored and matching is case-insensitive.
    /// Returns `None` for non-audio or unknown types.
    ///
    /// # Examples
    ///
    /// ```
    /// use transcribe_common::api::AudioFormat;
    ///
    /// assert_eq!(AudioFormat::from_mime("audio/x-wav"), Some(AudioFormat::Wav));
    /// assert_eq!(AudioFormat::from_mime("Audio/MPEG; rate=44100"), Some(AudioFormat::Mp3));
    /// assert_eq!(AudioFormat::from_mime("text/plain"), None);
    /// ```
    pub fn from_mime(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            "audio/wav" | "audio/x-wav" | "audio/wave" | "audio/vnd.wave" => Some(AudioFormat::Wav),
            "audio/mpeg" | "audio/mp3" | "audio/mpeg3" | "audio/x-mpeg-3" => Some(AudioFormat::Mp3),
            "audio/flac" | "audio/x-flac" => Some(AudioFormat::Flac),
            "audio/ogg" | "application/ogg" | "audio/vorbis" => Some(AudioFormat::Ogg),
            "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Some(AudioFormat::Mp4),
            "audio/aac" | "audio/x-aac" => Some(AudioFormat::Aac),
            _ => None,
        }
    }

    /// Resolve a file extension (without the dot)
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "wav" | "wave" => Some(AudioFormat::Wav),
            "mp3" => Some(AudioFormat::Mp3),
            "flac" => Some(AudioFormat::Flac),
            "ogg" | "oga" => Some(AudioFormat::Ogg),
            "m4a" | "mp4" => Some(AudioFormat::Mp4),
            "aac" => Some(AudioFormat::Aac),
            _ => None,
        }
    }

    /// Canonical file extension, used as a demuxer hint
    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Flac => "flac",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Mp4 => "m4a",
            AudioFormat::Aac => "aac",
        }
    }

    /// Canonical MIME type
    pub fn mime(self) -> &'static str {
        match self {
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Flac => "audio/flac",
            AudioFormat::Ogg => "audio/ogg",
            AudioFormat::Mp4 => "audio/mp4",
            AudioFormat::Aac => "audio/aac",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

// ========================================
// Decoding strategy
// ========================================

/// Decoding head used by the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decoder {
    Ctc,
    Rnnt,
}

impl Decoder {
    pub fn as_str(self) -> &'static str {
        match self {
            Decoder::Ctc => "ctc",
            Decoder::Rnnt => "rnnt",
        }
    }
}

impl FromStr for Decoder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ctc" => Ok(Decoder::Ctc),
            "rnnt" => Ok(Decoder::Rnnt),
            other => Err(Error::InvalidInput(format!(
                "unknown decoder '{}' (expected ctc or rnnt)",
                other
            ))),
        }
    }
}

impl fmt::Display for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ========================================
// Responses
// ========================================

/// `POST /transcribe` success body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeResponse {
    pub request_id: Uuid,
    pub text: String,
    /// Wall-clock time from arrival to result
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_duration_secs: Option<f64>,
    pub language: String,
    pub decoder: Decoder,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wer: Option<WerReport>,
}

/// Error envelope: `{"error": {"code": ..., "message": ...}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable machine-readable code (e.g. `SERVER_BUSY`)
    pub code: String,
    pub message: String,
}

/// `GET /health` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` while the engine is not ready
    pub status: String,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub engine: String,
    pub engine_ready: bool,
}

/// Requests that reached each terminal state since startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalCounts {
    pub completed: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub failed: u64,
}

/// `GET /status` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub capacity: usize,
    pub in_flight: usize,
    pub available: usize,
    pub waiting: usize,
    /// Requests received and not yet finished, in any state
    pub active_requests: usize,
    /// Requests holding a slot and waiting for the engine
    pub admitted: usize,
    /// Requests holding a slot with an engine call running
    pub transcribing: usize,
    pub terminal: TerminalCounts,
}
