use std::io;

use thiserror::Error;

/// Any failure surfaced by this crate.
///
/// Every variant is local to the component that produced it; callers recover
/// by retrying a load, fixing a configuration or rebuilding a processor.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Fetching or decoding a sample failed.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[cfg(feature = "http")]
    #[error("failed to fetch '{path}': {source}")]
    Http {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to decode '{path}': {reason}")]
    Decode { path: String, reason: String },
    #[error("'{path}' is neither WAV nor MP3 data")]
    UnsupportedFormat { path: String },
    #[error("'{path}' decoded to zero frames")]
    Empty { path: String },
}

/// A parameter or construction argument was out of range.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be a positive number of seconds, got {value}")]
    NonPositiveDuration { name: &'static str, value: f64 },
    #[error("{name} must be a finite level >= 0, got {value}")]
    InvalidLevel { name: &'static str, value: f64 },
    #[error("{name} is out of range: {value}")]
    InvalidParameter { name: &'static str, value: f64 },
    #[error("reverb time must be positive, got {0}")]
    NonPositiveReverbTime(f64),
    #[error("sample rate must be positive, got {0}")]
    InvalidSampleRate(f64),
    #[error("unsupported channel count {0}")]
    InvalidChannelCount(usize),
    #[error("buffer length must be at least one frame")]
    ZeroLength,
    #[error("length only applies to noise voices")]
    NotANoiseVoice,
    #[error("invalid configuration json: {0}")]
    Json(#[from] serde_json::Error),
}

/// An offline render did not produce a buffer.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render was cancelled before completion")]
    Cancelled,
    #[error("render job ended without delivering a buffer")]
    Aborted,
}

/// A signal-graph operation mixed nodes from different contexts.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("cannot connect nodes that belong to different audio contexts")]
    ForeignContext,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
