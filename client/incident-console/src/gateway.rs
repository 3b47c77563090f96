//! Authenticated request pipeline for the incident backend.
//!
//! Every call carries the current bearer token. A 401 on anything but the
//! refresh endpoint funnels into a single-flight refresh: the first caller
//! posts the stale token to `/api/auth/refresh`, later callers park on a
//! oneshot until that refresh settles, and each then retries exactly once.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use url::Url;

use crate::auth::{AuthApi, AuthSession};
use crate::config::Config;
use crate::error::ConsoleError;
use crate::types::{
  Incident, IncidentsResponse, LoginRequest, RefreshRequest, RefreshResponse, Status, StatusPatch,
};

pub const LOGIN_PATH: &str = "/api/auth/login";
pub const REFRESH_PATH: &str = "/api/auth/refresh";
pub const INCIDENTS_PATH: &str = "/api/incidents";

/// Incident endpoints used by the console and the optimistic coordinator.
#[async_trait]
pub trait IncidentApi: Send + Sync {
  async fn fetch_incidents(&self) -> Result<Vec<Incident>, ConsoleError>;
  async fn patch_status(&self, id: &str, status: Status) -> Result<Incident, ConsoleError>;
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ApiRequest {
  method: Method,
  segments: Vec<String>,
  body: Option<Value>,
  /// Attach the bearer token and take part in the refresh flow.
  authenticated: bool,
  retried: bool,
}

impl ApiRequest {
  pub fn new(method: Method, path: &str) -> Self {
    Self {
      method,
      segments: path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect(),
      body: None,
      authenticated: true,
      retried: false,
    }
  }

  pub fn get(path: &str) -> Self {
    Self::new(Method::GET, path)
  }

  pub fn post(path: &str) -> Self {
    Self::new(Method::POST, path)
  }

  pub fn patch(path: &str) -> Self {
    Self::new(Method::PATCH, path)
  }

  /// Append one raw path segment; it is percent-encoded on send.
  pub fn segment(mut self, segment: &str) -> Self {
    self.segments.push(segment.to_string());
    self
  }

  pub fn json(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn unauthenticated(mut self) -> Self {
    self.authenticated = false;
    self
  }

  pub fn path(&self) -> String {
    format!("/{}", self.segments.join("/"))
  }

  fn is_refresh(&self) -> bool {
    self.path() == REFRESH_PATH
  }

  fn may_refresh(&self) -> bool {
    self.authenticated && !self.retried && !self.is_refresh()
  }

  fn into_retry(mut self) -> Self {
    self.retried = true;
    self
  }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Outcome handed to parked callers. The error is carried as text since
/// `ConsoleError` is not `Clone`.
type RefreshOutcome = Result<String, String>;

#[derive(Default)]
struct RefreshSlot {
  in_flight: bool,
  waiters: Vec<oneshot::Sender<RefreshOutcome>>,
}

/// Ownership of an in-flight refresh. Dropping it unsettled (the leading
/// request was cancelled) frees the slot and fails the parked callers.
struct RefreshLease<'a> {
  slot: &'a Mutex<RefreshSlot>,
  settled: bool,
}

impl RefreshLease<'_> {
  /// Free the slot and hand `outcome` to every parked caller.
  fn settle(mut self, outcome: RefreshOutcome) -> usize {
    self.settled = true;
    release(self.slot, outcome)
  }
}

impl Drop for RefreshLease<'_> {
  fn drop(&mut self) {
    if !self.settled {
      let released = release(self.slot, Err("token refresh abandoned".to_string()));
      tracing::debug!("token refresh cancelled; rejected {} queued request(s)", released);
    }
  }
}

fn release(slot: &Mutex<RefreshSlot>, outcome: RefreshOutcome) -> usize {
  let waiters = {
    let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
    slot.in_flight = false;
    std::mem::take(&mut slot.waiters)
  };
  let count = waiters.len();
  for waiter in waiters {
    let _ = waiter.send(outcome.clone());
  }
  count
}

pub struct HttpGateway {
  client: reqwest::Client,
  base: Url,
  session: Arc<AuthSession>,
  refresh: Mutex<RefreshSlot>,
}

impl HttpGateway {
  pub fn new(config: &Config, session: Arc<AuthSession>) -> Result<Self, ConsoleError> {
    let base = Url::parse(&config.base_url)
      .map_err(|e| ConsoleError::Config(format!("invalid base url {:?}: {}", config.base_url, e)))?;
    if base.cannot_be_a_base() {
      return Err(ConsoleError::Config(format!("base url {:?} cannot carry paths", config.base_url)));
    }

    let client = reqwest::Client::builder()
      .timeout(config.request_timeout)
      .cookie_store(true)
      .default_headers(default_headers())
      .build()
      .map_err(|e| ConsoleError::Config(format!("http client: {}", e)))?;

    Ok(Self {
      client,
      base,
      session,
      refresh: Mutex::new(RefreshSlot::default()),
    })
  }

  pub fn session(&self) -> &Arc<AuthSession> {
    &self.session
  }

  fn slot(&self) -> MutexGuard<'_, RefreshSlot> {
    self.refresh.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn endpoint(&self, segments: &[String]) -> Result<Url, ConsoleError> {
    let mut url = self.base.clone();
    url
      .path_segments_mut()
      .map_err(|_| ConsoleError::Config("base url cannot carry paths".into()))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }

  /// Send `req` and decode a JSON body, refreshing once on 401.
  pub async fn request<T: DeserializeOwned>(&self, req: ApiRequest) -> Result<T, ConsoleError> {
    let token = if req.authenticated { self.session.token() } else { None };
    let resp = self.send(&req, token.as_deref()).await?;

    if resp.status() == StatusCode::UNAUTHORIZED && req.may_refresh() {
      tracing::debug!("{} {} returned 401", req.method, req.path());
      let fresh = self.fresh_token(token).await?;
      let retry = req.into_retry();
      let resp = self.send(&retry, Some(&fresh)).await?;
      return read_json(resp, "Request failed").await;
    }

    let fallback = if req.authenticated { "Request failed" } else { "Login failed" };
    read_json(resp, fallback).await
  }

  async fn send(&self, req: &ApiRequest, token: Option<&str>) -> Result<reqwest::Response, ConsoleError> {
    let url = self.endpoint(&req.segments)?;
    let mut builder = self.client.request(req.method.clone(), url);
    if let Some(token) = token {
      builder = builder.bearer_auth(token);
    }
    if let Some(body) = &req.body {
      builder = builder.json(body);
    }
    let resp = builder.send().await.map_err(|e| {
      tracing::warn!("{} {} failed: {}", req.method, req.path(), e);
      ConsoleError::NetworkUnreachable(e.to_string())
    })?;
    tracing::debug!("{} {} -> {}", req.method, req.path(), resp.status());
    Ok(resp)
  }

  /// A token to retry with after `stale` was rejected.
  async fn fresh_token(&self, stale: Option<String>) -> Result<String, ConsoleError> {
    match self.session.token() {
      // Someone already refreshed while our request was on the wire.
      Some(current) if stale.as_deref() != Some(current.as_str()) => return Ok(current),
      // ...or the session ended (failed refresh, logout).
      None if stale.is_some() => return Err(ConsoleError::session_ended("logged out")),
      _ => {}
    }

    let waiter = {
      let mut slot = self.slot();
      if slot.in_flight {
        let (tx, rx) = oneshot::channel();
        slot.waiters.push(tx);
        Some(rx)
      } else {
        slot.in_flight = true;
        None
      }
    };

    if let Some(rx) = waiter {
      tracing::debug!("waiting on in-flight token refresh");
      return match rx.await {
        Ok(Ok(token)) => Ok(token),
        Ok(Err(message)) => Err(ConsoleError::session_ended(message)),
        Err(_) => Err(ConsoleError::session_ended("token refresh abandoned")),
      };
    }

    let lease = RefreshLease {
      slot: &self.refresh,
      settled: false,
    };
    let generation = self.session.generation();
    let outcome = match self.post_refresh(stale).await {
      Ok(token) => self
        .session
        .token_received_for(&token, generation)
        .map(|_| token),
      Err(e) => Err(e),
    };

    match &outcome {
      Ok(token) => {
        let released = lease.settle(Ok(token.clone()));
        tracing::info!("token refreshed; released {} queued request(s)", released);
      }
      Err(e) => {
        let released = lease.settle(Err(e.to_string()));
        tracing::warn!("token refresh failed: {}; rejected {} queued request(s)", e, released);
        // Only end the session this refresh was started for.
        if self.session.generation() == generation {
          self.session.logout();
        }
      }
    }
    outcome
  }

  async fn post_refresh(&self, stale: Option<String>) -> Result<String, ConsoleError> {
    let body = serde_json::to_value(RefreshRequest {
      access_token: stale.clone(),
    })?;
    let req = ApiRequest::post(REFRESH_PATH).json(body);
    let resp = self.send(&req, stale.as_deref()).await?;
    let refreshed: RefreshResponse = read_json(resp, "Token refresh failed").await?;
    if refreshed.access_token.is_empty() {
      return Err(ConsoleError::malformed("refresh returned an empty token"));
    }
    Ok(refreshed.access_token)
  }
}

fn default_headers() -> HeaderMap {
  let mut headers = HeaderMap::new();
  headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
  headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
  headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
  headers.insert("x-xss-protection", HeaderValue::from_static("1; mode=block"));
  headers
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response, fallback: &str) -> Result<T, ConsoleError> {
  let status = resp.status();
  if status.is_success() {
    return resp.json::<T>().await.map_err(ConsoleError::from);
  }
  let body = resp.text().await.unwrap_or_default();
  Err(error_for_status(status.as_u16(), &body, fallback))
}

/// Map a non-success response, preferring the body's `message` field.
pub(crate) fn error_for_status(status: u16, body: &str, fallback: &str) -> ConsoleError {
  let message = serde_json::from_str::<Value>(body)
    .ok()
    .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
    .filter(|m| !m.is_empty())
    .unwrap_or_else(|| fallback.to_string());
  match status {
    401 | 403 => ConsoleError::AuthRejected { status, message },
    _ => ConsoleError::Server { status, message },
  }
}

#[async_trait]
impl AuthApi for HttpGateway {
  async fn login(&self, username: &str, password: &str) -> Result<Value, ConsoleError> {
    let body = serde_json::to_value(LoginRequest { username, password })?;
    self
      .request(ApiRequest::post(LOGIN_PATH).json(body).unauthenticated())
      .await
  }
}

#[async_trait]
impl IncidentApi for HttpGateway {
  async fn fetch_incidents(&self) -> Result<Vec<Incident>, ConsoleError> {
    let resp: IncidentsResponse = self.request(ApiRequest::get(INCIDENTS_PATH)).await?;
    Ok(resp.into_incidents())
  }

  async fn patch_status(&self, id: &str, status: Status) -> Result<Incident, ConsoleError> {
    let body = serde_json::to_value(StatusPatch { status })?;
    self
      .request(ApiRequest::patch(INCIDENTS_PATH).segment(id).json(body))
      .await
  }
}
