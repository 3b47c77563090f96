//! Realtime push channel: transport sessions and the manager that feeds the
//! incident store from them.
//!
//! A [`Transport`] opens a session that yields [`TransportEvent`]s until it is
//! torn down. [`SseTransport`] is the production implementation over
//! `GET /api/incidents/stream`, reconnecting on an exponential schedule whose
//! attempt budget resets after every successful connect.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::{HeaderValue, ACCEPT};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::config::Config;
use crate::error::ConsoleError;
use crate::gateway::error_for_status;
use crate::store::SharedStore;
use crate::types::{ConnectionStatus, Incident};

/// Event names that carry a full incident record.
pub const INCIDENT_EVENTS: [&str; 3] = ["incident_update", "incident", "new_incident"];

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
  Connected,
  Disconnected { reason: String },
  Error { message: String },
  Message { event: String, data: String },
}

// ---------------------------------------------------------------------------
// Reconnect policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
  pub attempts: usize,
  pub initial_delay: Duration,
  pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
  fn default() -> Self {
    Self::from(&Config::default())
  }
}

impl From<&Config> for ReconnectPolicy {
  fn from(config: &Config) -> Self {
    Self {
      attempts: config.reconnect_attempts,
      initial_delay: config.reconnect_initial_delay,
      max_delay: config.reconnect_max_delay,
    }
  }
}

impl ReconnectPolicy {
  /// Fresh delay schedule: `initial_delay` doubling up to `max_delay`,
  /// `attempts` entries long.
  pub fn schedule(&self) -> impl Iterator<Item = Duration> + Send {
    ExponentialBuilder::default()
      .with_min_delay(self.initial_delay)
      .with_max_delay(self.max_delay)
      .with_factor(2.0)
      .with_max_times(self.attempts)
      .build()
  }
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// One open push session. Dropping it tears the connection down.
pub struct TransportSession {
  events: mpsc::Receiver<TransportEvent>,
  task: Option<JoinHandle<()>>,
}

impl TransportSession {
  pub fn new(events: mpsc::Receiver<TransportEvent>, task: Option<JoinHandle<()>>) -> Self {
    Self { events, task }
  }

  pub async fn next(&mut self) -> Option<TransportEvent> {
    self.events.recv().await
  }
}

impl Drop for TransportSession {
  fn drop(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }
}

pub trait Transport: Send + Sync {
  /// Start a session authenticated with `token`. Must be called inside a
  /// tokio runtime.
  fn open(&self, token: &str) -> TransportSession;
}

// ---------------------------------------------------------------------------
// SSE transport
// ---------------------------------------------------------------------------

pub struct SseTransport {
  client: reqwest::Client,
  url: Url,
  policy: ReconnectPolicy,
}

impl SseTransport {
  pub fn new(config: &Config) -> Result<Self, ConsoleError> {
    let url = Url::parse(&config.url(&config.stream_path))
      .map_err(|e| ConsoleError::Config(format!("invalid stream url: {}", e)))?;
    // No overall timeout: the stream stays open indefinitely.
    let client = reqwest::Client::builder()
      .connect_timeout(config.request_timeout)
      .build()
      .map_err(|e| ConsoleError::Config(format!("stream client: {}", e)))?;
    Ok(Self {
      client,
      url,
      policy: ReconnectPolicy::from(config),
    })
  }
}

impl Transport for SseTransport {
  fn open(&self, token: &str) -> TransportSession {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let task = tokio::spawn(run_sse(
      self.client.clone(),
      self.url.clone(),
      token.to_string(),
      self.policy.clone(),
      tx,
    ));
    TransportSession::new(rx, Some(task))
  }
}

async fn connect_sse(client: &reqwest::Client, url: &Url, token: &str) -> Result<reqwest::Response, ConsoleError> {
  let resp = client
    .get(url.clone())
    .bearer_auth(token)
    .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
    .send()
    .await
    .map_err(|e| ConsoleError::NetworkUnreachable(e.to_string()))?;
  let status = resp.status();
  if !status.is_success() {
    let body = resp.text().await.unwrap_or_default();
    return Err(error_for_status(status.as_u16(), &body, "Stream rejected"));
  }
  Ok(resp)
}

/// Connection loop. Returns when the budget is spent, the backend rejects the
/// token, or the session is dropped.
async fn run_sse(
  client: reqwest::Client,
  url: Url,
  token: String,
  policy: ReconnectPolicy,
  tx: mpsc::Sender<TransportEvent>,
) {
  let mut schedule = policy.schedule();
  loop {
    match connect_sse(&client, &url, &token).await {
      Ok(resp) => {
        tracing::info!("realtime stream connected");
        if tx.send(TransportEvent::Connected).await.is_err() {
          return;
        }
        schedule = policy.schedule();

        let mut events = Box::pin(resp.bytes_stream().eventsource());
        let reason = loop {
          match events.next().await {
            Some(Ok(ev)) => {
              let msg = TransportEvent::Message {
                event: ev.event,
                data: ev.data,
              };
              if tx.send(msg).await.is_err() {
                return;
              }
            }
            Some(Err(e)) => break e.to_string(),
            None => break "stream closed by server".to_string(),
          };
        };
        tracing::warn!("realtime stream lost: {}", reason);
        if tx.send(TransportEvent::Disconnected { reason }).await.is_err() {
          return;
        }
      }
      Err(e) => {
        tracing::warn!("realtime connect failed: {}", e);
        let fatal = matches!(e, ConsoleError::AuthRejected { .. });
        let message = e.user_message();
        if tx.send(TransportEvent::Error { message }).await.is_err() || fatal {
          return;
        }
      }
    }

    match schedule.next() {
      Some(delay) => {
        tracing::info!("reconnecting realtime stream in {:?}", delay);
        tokio::time::sleep(delay).await;
      }
      None => {
        tracing::warn!("realtime stream gave up after {} attempts", policy.attempts);
        return;
      }
    }
  }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerState {
  #[default]
  Uninitialized,
  Disconnected,
  Connecting,
  Connected,
}

/// Owns at most one live transport session and mirrors its lifecycle into
/// the store's connection status.
pub struct RealtimeManager {
  transport: Arc<dyn Transport>,
  store: SharedStore,
  state: Arc<Mutex<ManagerState>>,
  pump: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeManager {
  pub fn new(transport: Arc<dyn Transport>, store: SharedStore) -> Self {
    Self {
      transport,
      store,
      state: Arc::new(Mutex::new(ManagerState::Uninitialized)),
      pump: Mutex::new(None),
    }
  }

  pub fn state(&self) -> ManagerState {
    *lock(&self.state)
  }

  /// Replace any current session with one authenticated by `token`.
  pub fn connect(&self, token: &str) {
    self.teardown();
    set_state(&self.state, &self.store, ManagerState::Connecting);
    tracing::debug!("opening realtime session");

    let mut session = self.transport.open(token);
    let state = self.state.clone();
    let store = self.store.clone();
    let pump = tokio::spawn(async move {
      while let Some(event) = session.next().await {
        apply_event(&state, &store, event);
      }
      tracing::debug!("realtime session ended");
      set_state(&state, &store, ManagerState::Disconnected);
    });

    *lock(&self.pump) = Some(pump);
  }

  /// Tear down and forget the current session. Safe to call repeatedly.
  pub fn disconnect(&self) {
    if self.teardown() {
      tracing::info!("realtime disconnected");
    }
    if self.state() != ManagerState::Uninitialized {
      set_state(&self.state, &self.store, ManagerState::Disconnected);
    }
  }

  fn teardown(&self) -> bool {
    match lock(&self.pump).take() {
      Some(pump) => {
        // Aborting the pump drops its session, which aborts the transport task.
        pump.abort();
        true
      }
      None => false,
    }
  }
}

impl Drop for RealtimeManager {
  fn drop(&mut self) {
    self.teardown();
  }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(|e| e.into_inner())
}

fn set_state(state: &Mutex<ManagerState>, store: &SharedStore, next: ManagerState) {
  *lock(state) = next;
  let status = match next {
    ManagerState::Connected => ConnectionStatus::Connected,
    ManagerState::Connecting => ConnectionStatus::Connecting,
    ManagerState::Uninitialized | ManagerState::Disconnected => ConnectionStatus::Disconnected,
  };
  store.lock().set_connection_status(status);
}

fn apply_event(state: &Mutex<ManagerState>, store: &SharedStore, event: TransportEvent) {
  match event {
    TransportEvent::Connected => set_state(state, store, ManagerState::Connected),
    TransportEvent::Disconnected { reason } => {
      tracing::debug!("transport lost: {}", reason);
      set_state(state, store, ManagerState::Disconnected);
    }
    TransportEvent::Error { message } => {
      tracing::debug!("transport error: {}", message);
      set_state(state, store, ManagerState::Disconnected);
    }
    TransportEvent::Message { event, data } => {
      if !INCIDENT_EVENTS.contains(&event.as_str()) {
        tracing::debug!("ignoring realtime event {:?}", event);
        return;
      }
      match serde_json::from_str::<Incident>(&data) {
        Ok(incident) => {
          tracing::debug!("realtime {} for {}", event, incident.id);
          store.lock().upsert(incident);
        }
        Err(e) => tracing::warn!("dropping malformed {} payload: {}", event, e),
      }
    }
  }
}
