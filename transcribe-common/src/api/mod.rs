//! Shared HTTP API types
//!
//! Framework-free request/response types used by the server and by
//! clients of `POST /transcribe`.

pub mod types;

pub use types::{
    AudioFormat, Decoder, ErrorBody, ErrorDetail, HealthResponse, StatusResponse,
    TerminalCounts, TranscribeResponse,
};
