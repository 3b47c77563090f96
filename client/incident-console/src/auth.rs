//! Auth state machine: login, token refresh hand-off, logout, client-side
//! login rate limiting and the token expiry watchdog.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::ConsoleError;
use crate::storage::{TokenStore, USERNAME_KEY};
use crate::token;
use crate::types::LoadStatus;

// ---------------------------------------------------------------------------
// Login endpoint seam
// ---------------------------------------------------------------------------

/// The unauthenticated login endpoint. Returns the raw response body since
/// its shape is not fixed.
#[async_trait]
pub trait AuthApi: Send + Sync {
  async fn login(&self, username: &str, password: &str) -> Result<Value, ConsoleError>;
}

// ---------------------------------------------------------------------------
// Token extraction
// ---------------------------------------------------------------------------

type TokenAccessor = fn(&Value) -> Option<&Value>;

/// Candidate token locations in priority order.
const TOKEN_FIELDS: [(&str, TokenAccessor); 5] = [
  ("access_token", |v| v.get("access_token")),
  ("token", |v| v.get("token")),
  ("jwt", |v| v.get("jwt")),
  ("data.token", |v| v.get("data").and_then(|d| d.get("token"))),
  ("accessToken", |v| v.get("accessToken")),
];

/// First non-empty string found among the candidate fields.
pub fn extract_token(payload: &Value) -> Option<String> {
  TOKEN_FIELDS.iter().find_map(|(field, accessor)| {
    let token = accessor(payload)?.as_str()?.trim();
    if token.is_empty() {
      return None;
    }
    tracing::debug!("login token found in `{}`", field);
    Some(token.to_string())
  })
}

// ---------------------------------------------------------------------------
// Pure state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoginAttempt {
  pub timestamp: DateTime<Utc>,
  pub failed: bool,
}

/// Failures tolerated inside a trailing window before the form locks.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
  pub max_failures: usize,
  pub window: chrono::Duration,
}

impl Default for RateLimitPolicy {
  fn default() -> Self {
    Self {
      max_failures: 5,
      window: chrono::Duration::minutes(15),
    }
  }
}

impl From<&Config> for RateLimitPolicy {
  fn from(config: &Config) -> Self {
    Self {
      max_failures: config.max_failed_logins,
      window: config.rate_limit_window,
    }
  }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuthState {
  #[serde(skip_serializing)]
  pub token: Option<String>,
  pub is_authenticated: bool,
  pub status: LoadStatus,
  pub error: Option<String>,
  pub login_attempts: Vec<LoginAttempt>,
  pub rate_limit_until: Option<DateTime<Utc>>,
  /// Bumped by every logout; refreshes started under an older generation
  /// must not re-authenticate the session.
  pub generation: u64,
}

impl AuthState {
  /// Rejects while `now < rate_limit_until`, reporting whole seconds left
  /// (rounded up).
  pub fn check_rate_limit(&self, now: DateTime<Utc>) -> Result<(), ConsoleError> {
    match self.rate_limit_until {
      Some(until) if now < until => {
        let remaining_ms = (until - now).num_milliseconds();
        Err(ConsoleError::RateLimited {
          retry_after_secs: (remaining_ms + 999) / 1000,
        })
      }
      _ => Ok(()),
    }
  }

  pub fn login_started(&mut self) {
    self.status = LoadStatus::Loading;
    self.error = None;
  }

  /// Install a token; expired tokens are never stored.
  pub fn set_token(&mut self, token: &str, now: DateTime<Utc>) -> Result<(), ConsoleError> {
    if token::is_expired_at(Some(token), now) {
      self.clear_auth();
      return Err(ConsoleError::TokenExpired);
    }
    self.token = Some(token.to_string());
    self.is_authenticated = true;
    Ok(())
  }

  pub fn login_succeeded(&mut self, token: &str, now: DateTime<Utc>) -> Result<(), ConsoleError> {
    self.set_token(token, now)?;
    self.status = LoadStatus::Succeeded;
    self.error = None;
    self.clear_rate_limit();
    Ok(())
  }

  /// Record a failed attempt. Returns the lockout error when this failure
  /// pushes the trailing window over the limit.
  pub fn login_failed(
    &mut self,
    message: String,
    now: DateTime<Utc>,
    policy: &RateLimitPolicy,
  ) -> Option<ConsoleError> {
    self.status = LoadStatus::Failed;
    self.login_attempts.push(LoginAttempt {
      timestamp: now,
      failed: true,
    });
    self.login_attempts.retain(|a| now - a.timestamp < policy.window);

    let failures = self.login_attempts.iter().filter(|a| a.failed).count();
    if failures >= policy.max_failures {
      self.rate_limit_until = Some(now + policy.window);
      let lockout = ConsoleError::RateLimited {
        retry_after_secs: policy.window.num_seconds(),
      };
      self.error = Some(format!(
        "Too many failed login attempts. Locked for {} minutes.",
        policy.window.num_minutes()
      ));
      return Some(lockout);
    }

    self.error = Some(message);
    None
  }

  pub fn clear_auth(&mut self) {
    self.token = None;
    self.is_authenticated = false;
  }

  pub fn clear_rate_limit(&mut self) {
    self.login_attempts.clear();
    self.rate_limit_until = None;
  }

  pub fn logout(&mut self) {
    self.clear_auth();
    self.status = LoadStatus::Idle;
    self.error = None;
    self.clear_rate_limit();
    self.generation += 1;
  }
}

/// State-slice message for a failed login.
fn login_error_message(err: &ConsoleError) -> String {
  match err {
    ConsoleError::TokenExpired => "Received expired token from server".to_string(),
    ConsoleError::MalformedResponse(_) => "Invalid response from server (missing token)".to_string(),
    other => other.user_message(),
  }
}

// ---------------------------------------------------------------------------
// Session (shared, persisted, timed)
// ---------------------------------------------------------------------------

/// The live auth state shared by the gateway, the console and the expiry
/// watchdog.
pub struct AuthSession {
  state: Mutex<AuthState>,
  store: Arc<dyn TokenStore>,
  policy: RateLimitPolicy,
  expiry_timer: Mutex<Option<JoinHandle<()>>>,
  /// Latest accepted token, `None` while logged out.
  tokens: watch::Sender<Option<String>>,
  this: Weak<AuthSession>,
}

impl AuthSession {
  pub fn new(store: Arc<dyn TokenStore>, policy: RateLimitPolicy) -> Arc<Self> {
    Arc::new_cyclic(|this| Self {
      state: Mutex::new(AuthState::default()),
      store,
      policy,
      expiry_timer: Mutex::new(None),
      tokens: watch::channel(None).0,
      this: this.clone(),
    })
  }

  fn state(&self) -> MutexGuard<'_, AuthState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Follow token changes: refreshes publish the new token, logouts publish
  /// `None`. Re-publishing the same value wakes nobody.
  pub fn subscribe_tokens(&self) -> watch::Receiver<Option<String>> {
    self.tokens.subscribe()
  }

  fn publish_token(&self, token: Option<&str>) {
    self.tokens.send_if_modified(|current| {
      if current.as_deref() == token {
        return false;
      }
      *current = token.map(String::from);
      true
    });
  }

  /// Adopt the persisted token if it is still valid, otherwise wipe it.
  pub fn initialize(&self) -> bool {
    let persisted = self.store.load_token();
    let now = Utc::now();
    let accepted = match persisted.as_deref() {
      Some(t) => self.state().set_token(t, now).is_ok(),
      None => false,
    };

    if accepted {
      tracing::info!("restored persisted session");
      self.publish_token(persisted.as_deref());
      self.arm_expiry_timer(persisted);
    } else {
      if persisted.is_some() {
        tracing::info!("discarding expired persisted token");
      }
      self.state().clear_auth();
      self.publish_token(None);
      if let Err(e) = self.store.clear_token() {
        tracing::warn!("failed to clear persisted token: {}", e);
      }
    }
    accepted
  }

  pub fn snapshot(&self) -> AuthState {
    self.state().clone()
  }

  pub fn token(&self) -> Option<String> {
    self.state().token.clone()
  }

  pub fn is_authenticated(&self) -> bool {
    self.state().is_authenticated
  }

  pub fn generation(&self) -> u64 {
    self.state().generation
  }

  /// Who logged in during this session. Not restored from a persisted token.
  pub fn username(&self) -> Option<String> {
    self.store.session_value(USERNAME_KEY)
  }

  /// Full login flow against the unauthenticated endpoint.
  pub async fn login(
    &self,
    api: &dyn AuthApi,
    username: &str,
    password: &str,
  ) -> Result<String, ConsoleError> {
    {
      let mut state = self.state();
      if let Err(e) = state.check_rate_limit(Utc::now()) {
        tracing::warn!("login blocked locally: {}", e);
        state.status = LoadStatus::Failed;
        state.error = Some(e.user_message());
        return Err(e);
      }
      state.login_started();
    }

    let outcome = match api.login(username, password).await {
      Ok(payload) => match extract_token(&payload) {
        Some(t) if token::is_expired(Some(t.as_str())) => Err(ConsoleError::TokenExpired),
        Some(t) => Ok(t),
        None => Err(ConsoleError::malformed("missing token")),
      },
      Err(e) => Err(e),
    };

    let now = Utc::now();
    match outcome {
      Ok(t) => {
        let accepted = self.state().login_succeeded(&t, now);
        if let Err(e) = accepted {
          return Err(self.record_login_failure(e, now));
        }
        if let Err(e) = self.store.save_token(&t) {
          tracing::warn!("failed to persist token: {}", e);
        }
        self.store.set_session_value(USERNAME_KEY, username);
        self.publish_token(Some(&t));
        self.arm_expiry_timer(Some(t.clone()));
        tracing::info!("login succeeded for {}", username);
        Ok(t)
      }
      Err(e) => Err(self.record_login_failure(e, now)),
    }
  }

  fn record_login_failure(&self, err: ConsoleError, now: DateTime<Utc>) -> ConsoleError {
    let message = login_error_message(&err);
    tracing::warn!("login failed: {}", err);
    match self.state().login_failed(message, now, &self.policy) {
      Some(lockout) => {
        tracing::warn!("login locked out: {}", lockout);
        lockout
      }
      None => err,
    }
  }

  /// Accept a refreshed token unless it is already expired, in which case
  /// the session is cleared.
  pub fn token_received(&self, token: &str) -> Result<(), ConsoleError> {
    let mut state = self.state();
    self.install_token(&mut state, token)
  }

  /// Like [`token_received`](Self::token_received) but refuses tokens whose
  /// refresh started before a logout.
  pub fn token_received_for(&self, token: &str, generation: u64) -> Result<(), ConsoleError> {
    let mut state = self.state();
    if state.generation != generation {
      tracing::info!("dropping refreshed token: session logged out meanwhile");
      return Err(ConsoleError::session_ended("logged out during token refresh"));
    }
    self.install_token(&mut state, token)
  }

  fn install_token(&self, state: &mut AuthState, token: &str) -> Result<(), ConsoleError> {
    match state.set_token(token, Utc::now()) {
      Ok(()) => {
        if let Err(e) = self.store.save_token(token) {
          tracing::warn!("failed to persist token: {}", e);
        }
        self.publish_token(Some(token));
        self.arm_expiry_timer(Some(token.to_string()));
        Ok(())
      }
      Err(e) => {
        tracing::warn!("rejecting received token: {}", e);
        if let Err(e) = self.store.clear_token() {
          tracing::warn!("failed to clear persisted token: {}", e);
        }
        self.publish_token(None);
        self.cancel_expiry_timer();
        Err(e)
      }
    }
  }

  pub fn logout(&self) {
    self.state().logout();
    if let Err(e) = self.store.clear_token() {
      tracing::warn!("failed to clear persisted token: {}", e);
    }
    self.store.clear_session();
    self.publish_token(None);
    self.cancel_expiry_timer();
    tracing::info!("logged out");
  }

  pub fn clear_rate_limit(&self) {
    self.state().clear_rate_limit();
  }

  // -------------------------------------------------------------------------
  // Expiry watchdog
  // -------------------------------------------------------------------------

  /// Replace the watchdog with one for `token`. Without a runtime (plain
  /// unit tests) no timer is armed.
  fn arm_expiry_timer(&self, token: Option<String>) {
    self.cancel_expiry_timer();
    let Some(token) = token else {
      return;
    };
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      tracing::debug!("no runtime; expiry watchdog not armed");
      return;
    };

    let delay = Duration::from_millis(token::ms_until_expiry(Some(token.as_str())));
    let this = self.this.clone();
    let task = handle.spawn(async move {
      tokio::time::sleep(delay).await;
      let Some(session) = this.upgrade() else {
        return;
      };
      if session.token().as_deref() == Some(token.as_str()) {
        tracing::warn!("token expired; logging out");
        // Runs inside the task being cancelled; take the handle first so
        // logout does not abort us mid-way.
        session.take_expiry_timer();
        session.logout();
      }
    });

    let mut slot = self.expiry_timer.lock().unwrap_or_else(|e| e.into_inner());
    *slot = Some(task);
  }

  fn take_expiry_timer(&self) -> Option<JoinHandle<()>> {
    self.expiry_timer.lock().unwrap_or_else(|e| e.into_inner()).take()
  }

  fn cancel_expiry_timer(&self) {
    if let Some(task) = self.take_expiry_timer() {
      task.abort();
    }
  }

  #[cfg(test)]
  pub(crate) fn has_expiry_timer(&self) -> bool {
    self.expiry_timer.lock().map(|t| t.is_some()).unwrap_or(false)
  }
}

impl Drop for AuthSession {
  fn drop(&mut self) {
    self.cancel_expiry_timer();
  }
}
