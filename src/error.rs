//! Error taxonomy for map matching and route building.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Fixed set of failure codes surfaced to the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NoMatch,
    NoSegment,
    Invalid,
    RateLimit,
    Network,
    Empty,
    StitchGap,
    DecodeError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NoMatch => "no_match",
            ErrorCode::NoSegment => "no_segment",
            ErrorCode::Invalid => "invalid",
            ErrorCode::RateLimit => "rate_limit",
            ErrorCode::Network => "network",
            ErrorCode::Empty => "empty",
            ErrorCode::StitchGap => "stitch_gap",
            ErrorCode::DecodeError => "decode_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged matching failure: `{code, message, details?}`.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{code}: {message}")]
pub struct MatchError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl MatchError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

pub type Result<T> = std::result::Result<T, MatchError>;

/// Failures below the HTTP status level.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("transport error: {0}")]
    Other(String),
}

impl From<TransportError> for MatchError {
    fn from(e: TransportError) -> Self {
        MatchError::new(ErrorCode::Network, e.to_string())
    }
}
