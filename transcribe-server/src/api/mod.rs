//! HTTP API handlers

pub mod health;
pub mod transcribe;

pub use health::health_routes;
pub use transcribe::transcribe_routes;
