//! Core types for the incident console (JSON contracts + internal models).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Severity / status enums
// ---------------------------------------------------------------------------

/// Declaration order is the canonical rank: CRITICAL sorts first ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
  Critical,
  High,
  Medium,
  Low,
}

impl Severity {
  pub const ALL: [Severity; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];

  pub fn from_str_loose(s: &str) -> Option<Self> {
    match s.trim().to_ascii_uppercase().as_str() {
      "CRITICAL" => Some(Self::Critical),
      "HIGH" => Some(Self::High),
      "MEDIUM" => Some(Self::Medium),
      "LOW" => Some(Self::Low),
      _ => None,
    }
  }

  /// CRITICAL=0 < HIGH=1 < MEDIUM=2 < LOW=3.
  pub fn rank(self) -> u8 {
    match self {
      Self::Critical => 0,
      Self::High => 1,
      Self::Medium => 2,
      Self::Low => 3,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Critical => "CRITICAL",
      Self::High => "HIGH",
      Self::Medium => "MEDIUM",
      Self::Low => "LOW",
    }
  }
}

impl fmt::Display for Severity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
  Open,
  Resolved,
  Escalated,
}

impl Status {
  pub const ALL: [Status; 3] = [Self::Open, Self::Resolved, Self::Escalated];

  pub fn from_str_loose(s: &str) -> Option<Self> {
    match s.trim().to_ascii_uppercase().as_str() {
      "OPEN" => Some(Self::Open),
      "RESOLVED" => Some(Self::Resolved),
      "ESCALATED" => Some(Self::Escalated),
      _ => None,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Open => "OPEN",
      Self::Resolved => "RESOLVED",
      Self::Escalated => "ESCALATED",
    }
  }
}

impl fmt::Display for Status {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Known incident categories. The wire field stays a free-form string.
pub const CATEGORIES: [&str; 6] = [
  "Malware",
  "Intrusion",
  "Data Exfiltration",
  "DDoS",
  "Phishing",
  "Unauthorized Access",
];

/// Canonical spelling of a known category, matched case-insensitively.
pub fn known_category(name: &str) -> Option<&'static str> {
  CATEGORIES
    .iter()
    .copied()
    .find(|c| c.eq_ignore_ascii_case(name.trim()))
}

// ---------------------------------------------------------------------------
// Incident record
// ---------------------------------------------------------------------------

/// One security incident as served by the backend and pushed by the stream.
/// Unknown fields are silently ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
  pub id: String,
  pub severity: Severity,
  pub category: String,
  pub source: String,
  pub timestamp: DateTime<Utc>,
  pub status: Status,
}

impl Incident {
  /// An incident that raises the critical alert when it lands in the store.
  pub fn is_critical_open(&self) -> bool {
    self.severity == Severity::Critical && self.status == Status::Open
  }
}

// ---------------------------------------------------------------------------
// Connection / fetch lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
  Connected,
  Connecting,
  #[default]
  Disconnected,
}

/// Request lifecycle shared by the login flow and the incidents fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
  #[default]
  Idle,
  Loading,
  Succeeded,
  Failed,
}

// ---------------------------------------------------------------------------
// REST payloads
// ---------------------------------------------------------------------------

/// `GET /api/incidents` body. Older deployments return a bare array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IncidentsResponse {
  Envelope {
    incidents: Vec<Incident>,
    #[serde(default)]
    total: Option<u64>,
  },
  Bare(Vec<Incident>),
}

impl IncidentsResponse {
  pub fn into_incidents(self) -> Vec<Incident> {
    match self {
      Self::Envelope { incidents, .. } => incidents,
      Self::Bare(incidents) => incidents,
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
  pub username: &'a str,
  pub password: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
  pub access_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
  pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPatch {
  pub status: Status,
}

// ---------------------------------------------------------------------------
// CLI stream wrappers
// ---------------------------------------------------------------------------

/// Structured error output line for the console binary.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorOutput {
  pub error: bool,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub kind: Option<String>,
  pub retryable: bool,
}

impl ErrorOutput {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      error: true,
      message: message.into(),
      kind: None,
      retryable: false,
    }
  }

  pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
    self.kind = Some(kind.into());
    self
  }

  pub fn retryable(mut self, retryable: bool) -> Self {
    self.retryable = retryable;
    self
  }
}
