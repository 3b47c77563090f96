//! Integration tests for the incident console against an in-process backend.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::header::{AUTHORIZATION, COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use incident_console::storage::MemoryTokenStore;
use incident_console::types::StatusPatch;
use incident_console::{
  AuthSession, Config, ConnectionStatus, Console, ConsoleError, HttpGateway, Incident, IncidentApi,
  ManagerState, RateLimitPolicy, Severity, Status,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn token(label: &str, secs: i64) -> String {
  let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none","typ":"JWT"}"#);
  let claims = json!({ "exp": Utc::now().timestamp() + secs, "username": "analyst", "jti": label });
  let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
  format!("{}.{}.sig", header, payload)
}

fn incident(id: &str, severity: Severity, status: Status, source: &str) -> Incident {
  Incident {
    id: id.into(),
    severity,
    category: "Intrusion".into(),
    source: source.into(),
    timestamp: Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 0).unwrap(),
    status,
  }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
  for _ in 0..300 {
    if check() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("timed out waiting for {}", what);
}

// ---------------------------------------------------------------------------
// Mock backend
// ---------------------------------------------------------------------------

/// Broadcast event name that makes every open stream end.
const CLOSE_STREAMS: &str = "__close";

struct Backend {
  valid_token: Mutex<String>,
  incidents: Mutex<Vec<Incident>>,
  refresh_calls: AtomicUsize,
  refresh_with_cookie: AtomicUsize,
  refresh_fails: AtomicBool,
  refresh_delay_ms: AtomicU64,
  patch_fails: AtomicBool,
  authorized_fetches: AtomicUsize,
  stream_attempts: AtomicUsize,
  /// Answer stream requests with this status instead of an event stream.
  stream_rejects_with: Mutex<Option<StatusCode>>,
  events: broadcast::Sender<(String, String)>,
}

type Shared = Arc<Backend>;

impl Backend {
  fn new(valid_token: String, incidents: Vec<Incident>) -> Shared {
    let (events, _) = broadcast::channel(16);
    Arc::new(Self {
      valid_token: Mutex::new(valid_token),
      incidents: Mutex::new(incidents),
      refresh_calls: AtomicUsize::new(0),
      refresh_with_cookie: AtomicUsize::new(0),
      refresh_fails: AtomicBool::new(false),
      refresh_delay_ms: AtomicU64::new(100),
      patch_fails: AtomicBool::new(false),
      authorized_fetches: AtomicUsize::new(0),
      stream_attempts: AtomicUsize::new(0),
      stream_rejects_with: Mutex::new(None),
      events,
    })
  }

  fn authorized(&self, headers: &HeaderMap) -> bool {
    let presented = headers
      .get(AUTHORIZATION)
      .and_then(|v| v.to_str().ok())
      .and_then(|v| v.strip_prefix("Bearer "));
    presented == Some(self.valid_token.lock().unwrap().as_str())
  }

  fn push(&self, event: &str, incident: &Incident) {
    let _ = self
      .events
      .send((event.to_string(), serde_json::to_string(incident).unwrap()));
  }

  fn close_streams(&self) {
    let _ = self.events.send((CLOSE_STREAMS.to_string(), String::new()));
  }

  fn stream_attempts(&self) -> usize {
    self.stream_attempts.load(Ordering::SeqCst)
  }
}

fn unauthorized() -> Response {
  (StatusCode::UNAUTHORIZED, Json(json!({ "message": "Invalid token" }))).into_response()
}

async fn login(State(backend): State<Shared>, Json(body): Json<Value>) -> Response {
  if body["password"] != "correct-horse" {
    return (StatusCode::UNAUTHORIZED, Json(json!({ "message": "Invalid credentials" }))).into_response();
  }
  let issued = token("login", 3600);
  *backend.valid_token.lock().unwrap() = issued.clone();
  (
    [(SET_COOKIE, "refresh=r1; Path=/; HttpOnly")],
    Json(json!({ "access_token": issued })),
  )
    .into_response()
}

async fn refresh(State(backend): State<Shared>, headers: HeaderMap, Json(_body): Json<Value>) -> Response {
  let n = backend.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
  if headers
    .get(COOKIE)
    .and_then(|v| v.to_str().ok())
    .is_some_and(|c| c.contains("refresh=r1"))
  {
    backend.refresh_with_cookie.fetch_add(1, Ordering::SeqCst);
  }
  // Hold the refresh open so concurrent 401s pile up behind it.
  let delay = backend.refresh_delay_ms.load(Ordering::SeqCst);
  tokio::time::sleep(Duration::from_millis(delay)).await;
  if backend.refresh_fails.load(Ordering::SeqCst) {
    return (StatusCode::UNAUTHORIZED, Json(json!({ "message": "Refresh token revoked" }))).into_response();
  }
  let issued = token(&format!("refresh-{}", n), 3600);
  *backend.valid_token.lock().unwrap() = issued.clone();
  Json(json!({ "accessToken": issued })).into_response()
}

async fn list(State(backend): State<Shared>, headers: HeaderMap) -> Response {
  if !backend.authorized(&headers) {
    return unauthorized();
  }
  backend.authorized_fetches.fetch_add(1, Ordering::SeqCst);
  let incidents = backend.incidents.lock().unwrap().clone();
  let total = incidents.len();
  Json(json!({ "incidents": incidents, "total": total })).into_response()
}

async fn update(
  State(backend): State<Shared>,
  Path(id): Path<String>,
  headers: HeaderMap,
  Json(body): Json<StatusPatch>,
) -> Response {
  if !backend.authorized(&headers) {
    return unauthorized();
  }
  if backend.patch_fails.load(Ordering::SeqCst) {
    return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "message": "Database unavailable" }))).into_response();
  }
  let mut incidents = backend.incidents.lock().unwrap();
  match incidents.iter_mut().find(|i| i.id == id) {
    Some(record) => {
      record.status = body.status;
      Json(record.clone()).into_response()
    }
    None => (StatusCode::NOT_FOUND, Json(json!({ "message": "Incident not found" }))).into_response(),
  }
}

async fn stream(State(backend): State<Shared>, headers: HeaderMap) -> Response {
  backend.stream_attempts.fetch_add(1, Ordering::SeqCst);
  if let Some(status) = *backend.stream_rejects_with.lock().unwrap() {
    return (status, Json(json!({ "message": "Stream unavailable" }))).into_response();
  }
  if !backend.authorized(&headers) {
    return unauthorized();
  }
  let rx = backend.events.subscribe();
  let events = futures::stream::unfold(rx, |mut rx| async move {
    loop {
      match rx.recv().await {
        Ok((name, _)) if name == CLOSE_STREAMS => return None,
        Ok((name, data)) => {
          return Some((Ok::<_, Infallible>(Event::default().event(name).data(data)), rx));
        }
        Err(broadcast::error::RecvError::Lagged(_)) => continue,
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  });
  Sse::new(events).into_response()
}

async fn serve(backend: Shared) -> String {
  let app = Router::new()
    .route("/api/auth/login", post(login))
    .route("/api/auth/refresh", post(refresh))
    .route("/api/incidents", get(list))
    .route("/api/incidents/stream", get(stream))
    .route("/api/incidents/:id", patch(update))
    .with_state(backend);
  let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    axum::serve(listener, app).await.unwrap();
  });
  format!("http://{}", addr)
}

fn config(base_url: &str, home: &tempfile::TempDir) -> Config {
  Config {
    base_url: base_url.into(),
    home_dir: home.path().to_path_buf(),
    reconnect_attempts: 2,
    reconnect_initial_delay: Duration::from_millis(50),
    reconnect_max_delay: Duration::from_millis(100),
    ..Config::default()
  }
}

async fn settled_stream(console: &Console) -> ManagerState {
  // Longer than the whole reconnect schedule in `config`.
  tokio::time::sleep(Duration::from_millis(400)).await;
  console.realtime_state()
}

fn gateway_with_token(base_url: &str, stale: &str) -> (Arc<AuthSession>, HttpGateway) {
  let session = AuthSession::new(Arc::new(MemoryTokenStore::with_token(stale)), RateLimitPolicy::default());
  assert!(session.initialize());
  let config = Config {
    base_url: base_url.into(),
    ..Config::default()
  };
  let gateway = HttpGateway::new(&config, session.clone()).unwrap();
  (session, gateway)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_401s_share_one_refresh() {
  let backend = Backend::new(token("server-side", 3600), vec![incident("a", Severity::Low, Status::Open, "10.0.0.1")]);
  let base = serve(backend.clone()).await;
  let (session, gateway) = gateway_with_token(&base, &token("stale", 3600));

  let (a, b, c) = tokio::join!(
    gateway.fetch_incidents(),
    gateway.fetch_incidents(),
    gateway.fetch_incidents()
  );

  assert_eq!(a.unwrap().len(), 1);
  assert_eq!(b.unwrap().len(), 1);
  assert_eq!(c.unwrap().len(), 1);
  assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
  assert_eq!(backend.authorized_fetches.load(Ordering::SeqCst), 3);
  assert_eq!(session.token(), Some(backend.valid_token.lock().unwrap().clone()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_refresh_rejects_everyone_and_logs_out() {
  let backend = Backend::new(token("server-side", 3600), Vec::new());
  backend.refresh_fails.store(true, Ordering::SeqCst);
  let base = serve(backend.clone()).await;
  let (session, gateway) = gateway_with_token(&base, &token("stale", 3600));

  let (a, b) = tokio::join!(gateway.fetch_incidents(), gateway.fetch_incidents());

  assert!(a.is_err());
  assert!(b.is_err());
  assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
  assert!(!session.is_authenticated());
  assert_eq!(session.token(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn refresh_outliving_its_session_leaves_the_next_login_alone() {
  let backend = Backend::new(token("server-side", 3600), Vec::new());
  backend.refresh_delay_ms.store(300, Ordering::SeqCst);
  let base = serve(backend.clone()).await;
  let (session, gateway) = gateway_with_token(&base, &token("stale", 3600));
  let gateway = Arc::new(gateway);

  let pending = tokio::spawn({
    let gateway = gateway.clone();
    async move { gateway.fetch_incidents().await }
  });
  eventually("refresh in flight", || backend.refresh_calls.load(Ordering::SeqCst) == 1).await;

  session.logout();
  let fresh = session.login(gateway.as_ref(), "analyst", "correct-horse").await.unwrap();

  let err = pending.await.unwrap().unwrap_err();
  assert!(matches!(err, ConsoleError::SessionEnded(_)), "{:?}", err);
  assert!(session.is_authenticated());
  assert_eq!(session.token(), Some(fresh));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_refresh_frees_the_slot() {
  let backend = Backend::new(token("server-side", 3600), vec![incident("a", Severity::Low, Status::Open, "10.0.0.1")]);
  let base = serve(backend.clone()).await;
  let (session, gateway) = gateway_with_token(&base, &token("stale", 3600));
  let gateway = Arc::new(gateway);

  let leader = tokio::spawn({
    let gateway = gateway.clone();
    async move { gateway.fetch_incidents().await }
  });
  eventually("refresh in flight", || backend.refresh_calls.load(Ordering::SeqCst) == 1).await;
  leader.abort();
  assert!(leader.await.unwrap_err().is_cancelled());
  assert!(session.is_authenticated());

  let next = tokio::time::timeout(Duration::from_secs(3), gateway.fetch_incidents())
    .await
    .expect("refresh slot left occupied");
  assert_eq!(next.unwrap().len(), 1);
  assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn login_refresh_uses_cookie_and_persists_token() {
  let backend = Backend::new(String::new(), Vec::new());
  let base = serve(backend.clone()).await;
  let home = tempfile::tempdir().unwrap();
  let console = Console::new(config(&base, &home)).unwrap();

  let err = console.login("analyst", "wrong").await.unwrap_err();
  assert!(matches!(err, ConsoleError::AuthRejected { status: 401, .. }));
  assert_eq!(console.auth_state().error.as_deref(), Some("Invalid credentials"));

  console.login("analyst", "correct-horse").await.unwrap();
  assert!(console.is_authenticated());
  assert!(home.path().join("console_state.json").exists());

  // Server rotates its key; the next call refreshes transparently.
  *backend.valid_token.lock().unwrap() = token("rotated", 3600);
  assert_eq!(console.load_incidents().await.unwrap(), 0);
  assert_eq!(backend.refresh_with_cookie.load(Ordering::SeqCst), 1);

  // A fresh process picks the refreshed token up from disk.
  let restarted = Console::new(config(&base, &home)).unwrap();
  assert!(restarted.initialize());
  assert_eq!(restarted.load_incidents().await.unwrap(), 0);
  assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejected_patch_rolls_back() {
  let backend = Backend::new(String::new(), vec![incident("a", Severity::High, Status::Open, "10.0.0.1")]);
  let base = serve(backend.clone()).await;
  let home = tempfile::tempdir().unwrap();
  let console = Console::new(config(&base, &home)).unwrap();
  console.login("analyst", "correct-horse").await.unwrap();
  console.load_incidents().await.unwrap();

  let confirmed = console.patch_status("a", Status::Escalated).await.unwrap();
  assert_eq!(confirmed.status, Status::Escalated);

  backend.patch_fails.store(true, Ordering::SeqCst);
  let err = console.patch_status("a", Status::Resolved).await.unwrap_err();

  assert_eq!(err.kind(), "optimistic_conflict");
  let store = console.store().lock();
  assert_eq!(store.get("a").unwrap().status, Status::Escalated);
  assert!(store.error().unwrap().contains("Database unavailable"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pushed_update_raises_alert_until_dismissed() {
  let a = incident("a", Severity::Critical, Status::Open, "10.0.0.1");
  let backend = Backend::new(String::new(), vec![a.clone()]);
  let base = serve(backend.clone()).await;
  let home = tempfile::tempdir().unwrap();
  let console = Console::new(config(&base, &home)).unwrap();
  let mut alerts = console.subscribe_alerts();

  console.login("analyst", "correct-horse").await.unwrap();
  assert_eq!(console.start().await.unwrap(), 1);
  eventually("stream connected", || {
    console.store().lock().connection_status() == ConnectionStatus::Connected
  })
  .await;

  let moved = Incident {
    source: "198.51.100.7".into(),
    ..a.clone()
  };
  backend.push("incident_update", &moved);
  eventually("pushed update applied", || {
    console.store().lock().get("a").map(|i| i.source.as_str()) == Some("198.51.100.7")
  })
  .await;

  assert_eq!(console.store().lock().last_critical_id(), Some("a"));
  assert_eq!(alerts.recv().await.unwrap().id, "a");

  console.dismiss_alert();
  assert_eq!(console.critical_alert(), None);
  assert_eq!(console.store().lock().get("a"), Some(&moved));

  console.logout();
  assert_eq!(console.store().lock().connection_status(), ConnectionStatus::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_stream_reconnects() {
  let backend = Backend::new(String::new(), Vec::new());
  let base = serve(backend.clone()).await;
  let home = tempfile::tempdir().unwrap();
  let console = Console::new(config(&base, &home)).unwrap();
  console.login("analyst", "correct-horse").await.unwrap();
  console.start().await.unwrap();
  eventually("stream connected", || console.realtime_state() == ManagerState::Connected).await;
  assert_eq!(backend.stream_attempts(), 1);

  backend.close_streams();
  eventually("stream reopened", || {
    backend.stream_attempts() == 2 && console.realtime_state() == ManagerState::Connected
  })
  .await;

  let b = incident("b", Severity::Medium, Status::Open, "10.0.0.2");
  backend.push("new_incident", &b);
  eventually("push on the new stream", || console.store().lock().get("b").is_some()).await;
  console.stop_realtime();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_stream_token_is_not_retried() {
  let backend = Backend::new(String::new(), Vec::new());
  *backend.stream_rejects_with.lock().unwrap() = Some(StatusCode::UNAUTHORIZED);
  let base = serve(backend.clone()).await;
  let home = tempfile::tempdir().unwrap();
  let console = Console::new(config(&base, &home)).unwrap();
  console.login("analyst", "correct-horse").await.unwrap();
  console.start().await.unwrap();

  eventually("stream attempted", || backend.stream_attempts() == 1).await;
  assert_eq!(settled_stream(&console).await, ManagerState::Disconnected);
  assert_eq!(backend.stream_attempts(), 1);
  assert_eq!(console.store().lock().connection_status(), ConnectionStatus::Disconnected);
  assert!(console.is_authenticated());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unavailable_stream_gives_up_after_its_budget() {
  let backend = Backend::new(String::new(), Vec::new());
  *backend.stream_rejects_with.lock().unwrap() = Some(StatusCode::SERVICE_UNAVAILABLE);
  let base = serve(backend.clone()).await;
  let home = tempfile::tempdir().unwrap();
  let console = Console::new(config(&base, &home)).unwrap();
  console.login("analyst", "correct-horse").await.unwrap();
  console.start().await.unwrap();

  // One attempt plus `reconnect_attempts` retries.
  eventually("retries spent", || backend.stream_attempts() == 3).await;
  assert_eq!(settled_stream(&console).await, ManagerState::Disconnected);
  assert_eq!(backend.stream_attempts(), 3);
}

#[tokio::test]
async fn offline_backend_is_reported_as_unreachable() {
  let home = tempfile::tempdir().unwrap();
  let console = Console::new(config("http://127.0.0.1:9", &home)).unwrap();

  let err = console.login("analyst", "correct-horse").await.unwrap_err();
  assert_eq!(err.kind(), "network_unreachable");
  assert!(console.auth_state().error.unwrap().contains("check your connection"));
}
