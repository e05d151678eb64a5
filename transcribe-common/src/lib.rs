//! # Transcribe Common Library
//!
//! Shared code for the Transcribe service and its clients:
//! - Configuration loading (TOML + environment + defaults)
//! - Error type shared by configuration and helpers
//! - HTTP API request/response types
//! - Word error rate scoring
//! - Time helpers

pub mod api;
pub mod config;
pub mod error;
pub mod time;
pub mod wer;

pub use config::ServiceConfig;
pub use error::{Error, Result};
