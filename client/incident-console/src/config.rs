//! Console configuration with sane defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Environment variable prefix for overrides (`INCIDENT_CONSOLE_BASE_URL`, ...).
const ENV_PREFIX: &str = "INCIDENT_CONSOLE_";

/// Tunables for the backend, the realtime stream and the auth lifecycle.
#[derive(Debug, Clone)]
pub struct Config {
  /// Backend origin, no trailing slash.
  pub base_url: String,
  /// SSE path for incident push events.
  pub stream_path: String,
  /// Per-request timeout for REST calls.
  pub request_timeout: Duration,
  /// Reconnection attempts after a lost stream before giving up.
  pub reconnect_attempts: usize,
  /// First reconnection delay; doubled per attempt.
  pub reconnect_initial_delay: Duration,
  /// Cap on the reconnection delay.
  pub reconnect_max_delay: Duration,
  /// Failed logins tolerated inside `rate_limit_window` before lockout.
  pub max_failed_logins: usize,
  /// Trailing window for counting failures; also the lockout length.
  pub rate_limit_window: chrono::Duration,
  /// Default page size for derived views.
  pub rows_per_page: usize,
  /// Directory holding the persisted token file.
  pub home_dir: PathBuf,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      base_url: "http://127.0.0.1:5000".into(),
      stream_path: "/api/incidents/stream".into(),
      request_timeout: Duration::from_secs(30),
      reconnect_attempts: 5,
      reconnect_initial_delay: Duration::from_secs(1),
      reconnect_max_delay: Duration::from_secs(16),
      max_failed_logins: 5,
      rate_limit_window: chrono::Duration::minutes(15),
      rows_per_page: 10,
      home_dir: default_home_dir(),
    }
  }
}

impl Config {
  /// Defaults overridden by `INCIDENT_CONSOLE_*` variables. Unparseable values
  /// are ignored with a warning.
  pub fn from_env() -> Self {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
    let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
    let mut config = Self::default();

    if let Some(url) = var("BASE_URL") {
      config.base_url = url.trim_end_matches('/').to_string();
    }
    if let Some(path) = var("STREAM_PATH") {
      config.stream_path = path;
    }
    if let Some(secs) = parse_var::<u64>("REQUEST_TIMEOUT_SECS", var("REQUEST_TIMEOUT_SECS")) {
      config.request_timeout = Duration::from_secs(secs);
    }
    if let Some(n) = parse_var::<usize>("RECONNECT_ATTEMPTS", var("RECONNECT_ATTEMPTS")) {
      config.reconnect_attempts = n;
    }
    if let Some(ms) = parse_var::<u64>("RECONNECT_DELAY_MS", var("RECONNECT_DELAY_MS")) {
      config.reconnect_initial_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = parse_var::<u64>("RECONNECT_MAX_DELAY_MS", var("RECONNECT_MAX_DELAY_MS")) {
      config.reconnect_max_delay = Duration::from_millis(ms);
    }
    if let Some(n) = parse_var::<usize>("ROWS_PER_PAGE", var("ROWS_PER_PAGE")) {
      if n > 0 {
        config.rows_per_page = n;
      }
    }
    if let Some(dir) = var("HOME") {
      config.home_dir = PathBuf::from(dir);
    }
    config
  }

  pub fn url(&self, path: &str) -> String {
    format!("{}{}", self.base_url, path)
  }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Option<T> {
  let raw = raw?;
  match raw.trim().parse() {
    Ok(v) => Some(v),
    Err(_) => {
      tracing::warn!("ignoring {}{}={:?}: not a valid number", ENV_PREFIX, name, raw);
      None
    }
  }
}

fn default_home_dir() -> PathBuf {
  dirs::home_dir()
    .map(|h| h.join(".incident-console"))
    .unwrap_or_else(|| PathBuf::from(".incident-console"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  #[test]
  fn defaults_match_stream_bounds() {
    let config = Config::default();
    assert_eq!(config.reconnect_attempts, 5);
    assert_eq!(config.reconnect_initial_delay, Duration::from_secs(1));
    assert_eq!(config.reconnect_max_delay, Duration::from_secs(16));
    assert_eq!(config.max_failed_logins, 5);
    assert_eq!(config.rate_limit_window, chrono::Duration::minutes(15));
  }

  #[test]
  fn lookup_overrides_and_ignores_garbage() {
    let vars: HashMap<&str, &str> = [
      ("INCIDENT_CONSOLE_BASE_URL", "https://feed.example.com/"),
      ("INCIDENT_CONSOLE_RECONNECT_ATTEMPTS", "3"),
      ("INCIDENT_CONSOLE_ROWS_PER_PAGE", "zero"),
    ]
    .into_iter()
    .collect();
    let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
    assert_eq!(config.base_url, "https://feed.example.com");
    assert_eq!(config.reconnect_attempts, 3);
    assert_eq!(config.rows_per_page, 10);
    assert_eq!(config.url("/api/incidents"), "https://feed.example.com/api/incidents");
  }
}
