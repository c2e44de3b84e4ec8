//! Typed failures of the remote boundary.

use thiserror::Error;

/// Failure of a single Request Executor call.
///
/// The variant decides how the read path degrades: `NotImplemented` is
/// answered with fallback data and never retried, `Transient` is retried
/// with backoff, `Validation` is surfaced as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
  /// Endpoint is missing on the server (404 / "Cannot GET ...")
  #[error("endpoint not implemented ({status}): {message}")]
  NotImplemented { status: u16, message: String },

  /// Network failure, timeout, rate limit or 5xx
  #[error("transient failure{}: {message}", status_suffix(.status))]
  Transient {
    status: Option<u16>,
    message: String,
  },

  /// Request rejected by the server (4xx other than 404)
  #[error("request rejected ({status}): {reason}")]
  Validation { status: u16, reason: String },

  /// Response body did not match the expected schema
  #[error("failed to decode response: {0}")]
  Decode(String),
}

fn status_suffix(status: &Option<u16>) -> String {
  status.map(|s| format!(" ({})", s)).unwrap_or_default()
}

impl FetchError {
  /// Classify an HTTP-style status and server message.
  pub fn from_status(status: u16, message: impl Into<String>) -> Self {
    let message = message.into();
    if status == 404 || message.starts_with("Cannot ") {
      return FetchError::NotImplemented { status, message };
    }
    match status {
      0 | 408 | 429 => FetchError::Transient {
        status: Some(status),
        message,
      },
      s if s >= 500 => FetchError::Transient {
        status: Some(s),
        message,
      },
      s => FetchError::Validation { status: s, reason: message },
    }
  }

  pub fn network(message: impl Into<String>) -> Self {
    FetchError::Transient {
      status: None,
      message: message.into(),
    }
  }

  pub fn is_retriable(&self) -> bool {
    matches!(self, FetchError::Transient { .. })
  }

  pub fn is_not_implemented(&self) -> bool {
    matches!(self, FetchError::NotImplemented { .. })
  }

  /// Short name of the failure class, for structured logs.
  pub fn kind(&self) -> &'static str {
    match self {
      FetchError::NotImplemented { .. } => "not_implemented",
      FetchError::Transient { .. } => "transient",
      FetchError::Validation { .. } => "validation",
      FetchError::Decode(_) => "decode",
    }
  }
}

impl From<serde_json::Error> for FetchError {
  fn from(e: serde_json::Error) -> Self {
    FetchError::Decode(e.to_string())
  }
}
