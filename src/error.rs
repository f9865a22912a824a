// src/error.rs

use std::fmt;

/// Engine failure classes. Initialization failures are fatal to startup;
/// device failures are recoverable (the channel falls back to no input);
/// unsupported-format requests are rejected before any partial construction.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Audio context / device layer unavailable at startup.
    Initialization(String),
    /// Input device missing or permission denied.
    Device(String),
    /// Unknown effect or instrument type requested.
    UnsupportedFormat(String),
    /// Operation invoked before the engine or channel was ready.
    NotInitialized(&'static str),
    SessionNotFound(String),
    TrackNotFound(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Initialization(msg) => {
                write!(f, "failed to initialize audio engine: {}", msg)
            }
            EngineError::Device(msg) => write!(f, "audio device error: {}", msg),
            EngineError::UnsupportedFormat(what) => write!(f, "unsupported type: {}", what),
            EngineError::NotInitialized(op) => {
                write!(f, "{} called before the engine was initialized", op)
            }
            EngineError::SessionNotFound(id) => write!(f, "recording session not found: {}", id),
            EngineError::TrackNotFound(id) => write!(f, "recording track not found: {}", id),
        }
    }
}

impl std::error::Error for EngineError {}
