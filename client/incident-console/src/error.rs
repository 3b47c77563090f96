//! Structured error types for the incident console.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsoleError {
  /// The request never reached the server.
  #[error("network unreachable: {0}")]
  NetworkUnreachable(String),

  /// 401/403: credentials or a protected resource were rejected.
  #[error("auth rejected ({status}): {message}")]
  AuthRejected { status: u16, message: String },

  /// Any other non-success response.
  #[error("server error ({status}): {message}")]
  Server { status: u16, message: String },

  #[error("token expired")]
  TokenExpired,

  #[error("token invalid: {0}")]
  TokenInvalid(String),

  #[error("too many attempts, retry in {retry_after_secs} seconds")]
  RateLimited { retry_after_secs: i64 },

  #[error("status change for {id} rejected: {source}")]
  OptimisticConflict {
    id: String,
    #[source]
    source: Box<ConsoleError>,
  },

  #[error("malformed response: {0}")]
  MalformedResponse(String),

  /// Refresh failed, or completed after the session was logged out.
  #[error("session ended: {0}")]
  SessionEnded(String),

  #[error("config: {0}")]
  Config(String),

  #[error("json: {0}")]
  Json(#[from] serde_json::Error),

  #[error("io: {0}")]
  Io(#[from] std::io::Error),
}

impl ConsoleError {
  pub fn malformed(msg: impl Into<String>) -> Self {
    Self::MalformedResponse(msg.into())
  }

  pub fn session_ended(msg: impl Into<String>) -> Self {
    Self::SessionEnded(msg.into())
  }

  pub fn conflict(id: &str, source: ConsoleError) -> Self {
    Self::OptimisticConflict {
      id: id.to_string(),
      source: Box::new(source),
    }
  }

  /// Short machine-readable kind for output lines.
  pub fn kind(&self) -> &'static str {
    match self {
      Self::NetworkUnreachable(_) => "network_unreachable",
      Self::AuthRejected { .. } => "auth_rejected",
      Self::Server { .. } => "server",
      Self::TokenExpired => "token_expired",
      Self::TokenInvalid(_) => "token_invalid",
      Self::RateLimited { .. } => "rate_limited",
      Self::OptimisticConflict { .. } => "optimistic_conflict",
      Self::MalformedResponse(_) => "malformed_response",
      Self::SessionEnded(_) => "session_ended",
      Self::Config(_) => "config",
      Self::Json(_) => "json",
      Self::Io(_) => "io",
    }
  }

  pub fn is_unauthorized(&self) -> bool {
    matches!(self, Self::AuthRejected { status: 401, .. })
  }

  /// Whether pressing "Retry" could plausibly succeed.
  pub fn is_retryable(&self) -> bool {
    match self {
      Self::NetworkUnreachable(_) | Self::Server { .. } => true,
      Self::OptimisticConflict { source, .. } => source.is_retryable(),
      _ => false,
    }
  }

  /// Message attached to the auth / incidents state slices.
  pub fn user_message(&self) -> String {
    match self {
      Self::NetworkUnreachable(_) => {
        "Unable to reach the server, check your connection".to_string()
      }
      Self::AuthRejected { message, .. } => message.clone(),
      Self::Server { message, .. } => message.clone(),
      Self::TokenExpired => "Session token expired, please log in again".to_string(),
      Self::TokenInvalid(_) => "Session token invalid, please log in again".to_string(),
      Self::RateLimited { retry_after_secs } => {
        format!("Too many login attempts. Please try again in {} seconds", retry_after_secs)
      }
      Self::OptimisticConflict { id, source } => {
        format!("Could not update incident {}: {}", id, source.user_message())
      }
      Self::MalformedResponse(msg) => format!("Invalid response from server ({})", msg),
      Self::SessionEnded(_) => "Session ended, please log in again".to_string(),
      Self::Config(msg) => format!("Configuration error: {}", msg),
      Self::Json(e) => format!("Invalid data from server: {}", e),
      Self::Io(e) => format!("Local storage error: {}", e),
    }
  }
}

impl From<reqwest::Error> for ConsoleError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_decode() {
      Self::MalformedResponse(e.to_string())
    } else {
      // Builder, connect, timeout and body-send failures: nothing usable came back.
      Self::NetworkUnreachable(e.to_string())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn offline_and_rejected_have_distinct_messages() {
    let offline = ConsoleError::NetworkUnreachable("connection refused".into());
    let rejected = ConsoleError::AuthRejected {
      status: 401,
      message: "Invalid credentials".into(),
    };
    assert!(offline.user_message().contains("check your connection"));
    assert_eq!(rejected.user_message(), "Invalid credentials");
    assert_ne!(offline.kind(), rejected.kind());
    assert!(rejected.is_unauthorized());
  }

  #[test]
  fn conflict_wraps_and_inherits_retryability() {
    let err = ConsoleError::conflict("inc-1", ConsoleError::NetworkUnreachable("down".into()));
    assert_eq!(err.kind(), "optimistic_conflict");
    assert!(err.is_retryable());
    assert!(err.to_string().contains("inc-1"));
  }
}
