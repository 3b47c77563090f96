//! Application context: owns every component and wires them together.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auth::{AuthApi, AuthSession, AuthState, RateLimitPolicy};
use crate::config::Config;
use crate::error::ConsoleError;
use crate::gateway::{HttpGateway, IncidentApi};
use crate::optimistic::OptimisticCoordinator;
use crate::realtime::{ManagerState, RealtimeManager, SseTransport, Transport};
use crate::storage::FileTokenStore;
use crate::store::SharedStore;
use crate::types::{Incident, Status};
use crate::view::{summarize, FilterState, IncidentView, SummaryCounts, ViewMemo};

/// Words in an incidents error that mean the session, not the data, is the
/// problem.
const AUTH_ERROR_MARKERS: [&str; 3] = ["token", "session", "login"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "retry", content = "count")]
pub enum RetryOutcome {
  LoggedOut,
  Refetched(usize),
}

pub struct Console {
  config: Config,
  session: Arc<AuthSession>,
  auth_api: Arc<dyn AuthApi>,
  incident_api: Arc<dyn IncidentApi>,
  store: SharedStore,
  realtime: Arc<RealtimeManager>,
  /// Moves the stream onto refreshed tokens and closes it when the session
  /// ends. Runs while the stream is wanted.
  follower: Mutex<Option<JoinHandle<()>>>,
  coordinator: OptimisticCoordinator,
  memo: Mutex<ViewMemo>,
}

impl Console {
  /// Production wiring: file-backed token, HTTP gateway, SSE stream.
  pub fn new(config: Config) -> Result<Self, ConsoleError> {
    let token_store = Arc::new(FileTokenStore::new(&config.home_dir));
    let session = AuthSession::new(token_store, RateLimitPolicy::from(&config));
    let gateway = Arc::new(HttpGateway::new(&config, session.clone())?);
    let transport = Arc::new(SseTransport::new(&config)?);
    Ok(Self::from_parts(config, session, gateway.clone(), gateway, transport))
  }

  pub fn from_parts(
    config: Config,
    session: Arc<AuthSession>,
    auth_api: Arc<dyn AuthApi>,
    incident_api: Arc<dyn IncidentApi>,
    transport: Arc<dyn Transport>,
  ) -> Self {
    let store = SharedStore::default();
    Self {
      realtime: Arc::new(RealtimeManager::new(transport, store.clone())),
      follower: Mutex::new(None),
      coordinator: OptimisticCoordinator::new(incident_api.clone(), store.clone()),
      config,
      session,
      auth_api,
      incident_api,
      store,
      memo: Mutex::new(ViewMemo::default()),
    }
  }

  // -------------------------------------------------------------------------
  // Session
  // -------------------------------------------------------------------------

  /// Adopt a persisted token if it is still valid.
  pub fn initialize(&self) -> bool {
    self.session.initialize()
  }

  pub async fn login(&self, username: &str, password: &str) -> Result<(), ConsoleError> {
    self
      .session
      .login(self.auth_api.as_ref(), username, password)
      .await
      .map(|_| ())
  }

  pub fn logout(&self) {
    self.stop_realtime();
    self.session.logout();
  }

  pub fn is_authenticated(&self) -> bool {
    self.session.is_authenticated()
  }

  pub fn auth_state(&self) -> AuthState {
    self.session.snapshot()
  }

  pub fn username(&self) -> Option<String> {
    self.session.username()
  }

  // -------------------------------------------------------------------------
  // Data
  // -------------------------------------------------------------------------

  /// Replace the store contents with a fresh snapshot.
  pub async fn load_incidents(&self) -> Result<usize, ConsoleError> {
    self.store.lock().fetch_started();
    match self.incident_api.fetch_incidents().await {
      Ok(incidents) => {
        let count = incidents.len();
        self.store.lock().replace_all(incidents);
        tracing::info!("loaded {} incidents", count);
        Ok(count)
      }
      Err(e) => {
        tracing::warn!("incident fetch failed: {}", e);
        self.store.lock().fetch_failed(e.user_message());
        Err(e)
      }
    }
  }

  /// Open the push stream with the current token and keep it on the
  /// session's token from then on.
  pub fn start_realtime(&self) -> Result<(), ConsoleError> {
    let mut tokens = self.session.subscribe_tokens();
    let token = tokens
      .borrow_and_update()
      .clone()
      .ok_or_else(|| ConsoleError::session_ended("not logged in"))?;
    self.realtime.connect(&token);

    let realtime = self.realtime.clone();
    let task = tokio::spawn(async move {
      while tokens.changed().await.is_ok() {
        let next = tokens.borrow_and_update().clone();
        match next {
          Some(token) => {
            tracing::info!("session token changed; reconnecting push stream");
            realtime.connect(&token);
          }
          None => {
            tracing::info!("session ended; closing push stream");
            realtime.disconnect();
            break;
          }
        }
      }
    });
    if let Some(previous) = self.replace_follower(Some(task)) {
      previous.abort();
    }
    Ok(())
  }

  fn replace_follower(&self, task: Option<JoinHandle<()>>) -> Option<JoinHandle<()>> {
    let mut slot = self.follower.lock().unwrap_or_else(|e| e.into_inner());
    std::mem::replace(&mut *slot, task)
  }

  /// Snapshot first, then the stream, so pushes land on a populated table.
  pub async fn start(&self) -> Result<usize, ConsoleError> {
    let count = self.load_incidents().await?;
    self.start_realtime()?;
    Ok(count)
  }

  pub fn stop_realtime(&self) {
    if let Some(follower) = self.replace_follower(None) {
      follower.abort();
    }
    self.realtime.disconnect();
  }

  pub fn realtime_state(&self) -> ManagerState {
    self.realtime.state()
  }

  pub async fn patch_status(&self, id: &str, status: Status) -> Result<Incident, ConsoleError> {
    self.coordinator.patch_status(id, status).await
  }

  /// Log out when the last incidents error was an auth problem, otherwise
  /// refetch.
  pub async fn retry(&self) -> Result<RetryOutcome, ConsoleError> {
    let auth_problem = self.store.lock().error().is_some_and(|e| {
      let e = e.to_lowercase();
      AUTH_ERROR_MARKERS.iter().any(|m| e.contains(m))
    });
    if auth_problem {
      tracing::info!("retry after auth error; logging out");
      self.logout();
      return Ok(RetryOutcome::LoggedOut);
    }
    self.store.lock().clear_error();
    self.load_incidents().await.map(RetryOutcome::Refetched)
  }

  // -------------------------------------------------------------------------
  // Views
  // -------------------------------------------------------------------------

  pub fn view(&self, state: &FilterState) -> IncidentView {
    let mut memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
    let store = self.store.lock();
    memo.view(&store, state)
  }

  /// Filter state seeded with the configured page size.
  pub fn default_filter(&self) -> FilterState {
    FilterState {
      rows_per_page: self.config.rows_per_page,
      ..FilterState::default()
    }
  }

  pub fn summary(&self) -> SummaryCounts {
    summarize(&self.store.lock().all())
  }

  pub fn critical_alert(&self) -> Option<Incident> {
    self.store.lock().last_critical_incident().cloned()
  }

  pub fn dismiss_alert(&self) {
    self.store.lock().clear_critical_alert();
  }

  pub fn subscribe_alerts(&self) -> mpsc::UnboundedReceiver<Incident> {
    self.store.lock().subscribe_alerts()
  }

  pub fn store(&self) -> &SharedStore {
    &self.store
  }

  pub fn config(&self) -> &Config {
    &self.config
  }
}

impl Drop for Console {
  fn drop(&mut self) {
    if let Some(follower) = self.replace_follower(None) {
      follower.abort();
    }
  }
}
