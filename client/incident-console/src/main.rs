//! Binary entrypoint: headless incident console.
//!
//! Logs in (persisted token first, then `INCIDENT_CONSOLE_USERNAME` /
//! `INCIDENT_CONSOLE_PASSWORD`), loads the incident snapshot, opens the
//! realtime stream, then reads one JSON command per stdin line:
//!
//! - `{"cmd":"view","query":"severity=CRITICAL&page=2"}` -> IncidentView
//! - `{"cmd":"patch","id":"inc-1","status":"RESOLVED"}` -> Incident
//! - `{"cmd":"summary"}` -> user, counts, connection and alert state
//! - `{"cmd":"dismiss"}`, `{"cmd":"retry"}`, `{"cmd":"logout"}`
//!
//! Every answer is one JSON line on stdout; failures are ErrorOutput lines.
//! Critical alerts arrive unprompted as `{"alert": Incident}` lines. Logs go
//! to stderr.

use std::io::{self, Write};

use incident_console::query;
use incident_console::types::ErrorOutput;
use incident_console::{Config, ConnectionStatus, Console, ConsoleError, Incident, Status, SummaryCounts};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Command {
  View {
    #[serde(default)]
    query: String,
  },
  Patch {
    id: String,
    status: String,
  },
  Summary,
  Dismiss,
  Retry,
  Logout,
}

#[derive(Serialize)]
struct AlertOutput<'a> {
  alert: &'a Incident,
}

#[derive(Serialize)]
struct Ack {
  ok: bool,
  cmd: &'static str,
}

#[derive(Serialize)]
struct SummaryOutput {
  user: Option<String>,
  summary: SummaryCounts,
  connection: ConnectionStatus,
  critical_alert: Option<Incident>,
  error: Option<String>,
}

fn init_logging() {
  let default_level = "info";
  let _ = tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new(default_level)),
    )
    .with_writer(io::stderr)
    .try_init();
}

fn emit<T: Serialize>(value: &T) {
  let stdout = io::stdout();
  let mut out = stdout.lock();
  let _ = serde_json::to_writer(&mut out, value);
  let _ = writeln!(out);
  let _ = out.flush();
}

fn emit_error(e: &ConsoleError) {
  emit(
    &ErrorOutput::new(e.user_message())
      .with_kind(e.kind())
      .retryable(e.is_retryable()),
  );
}

async fn authenticate(console: &Console) -> Result<(), ConsoleError> {
  if console.initialize() {
    return Ok(());
  }
  let username = std::env::var("INCIDENT_CONSOLE_USERNAME").ok();
  let password = std::env::var("INCIDENT_CONSOLE_PASSWORD").ok();
  match (username, password) {
    (Some(u), Some(p)) => console.login(&u, &p).await,
    _ => Err(ConsoleError::session_ended(
      "no valid session; set INCIDENT_CONSOLE_USERNAME and INCIDENT_CONSOLE_PASSWORD",
    )),
  }
}

/// Handle one command. Returns false when the session is over.
async fn handle(console: &Console, line: &str) -> bool {
  let command: Command = match serde_json::from_str(line) {
    Ok(c) => c,
    Err(e) => {
      emit(&ErrorOutput::new(format!("json parse: {}", e)).with_kind("json"));
      return true;
    }
  };

  match command {
    Command::View { query } => {
      let state = query::from_query_string_onto(&query, &console.default_filter());
      emit(&console.view(&state));
    }
    Command::Patch { id, status } => match Status::from_str_loose(&status) {
      Some(status) => match console.patch_status(&id, status).await {
        Ok(incident) => emit(&incident),
        Err(e) => emit_error(&e),
      },
      None => emit(&ErrorOutput::new(format!("unknown status {:?}", status)).with_kind("validation")),
    },
    Command::Summary => {
      let user = console.username();
      let store = console.store().lock();
      emit(&SummaryOutput {
        user,
        summary: incident_console::view::summarize(&store.all()),
        connection: store.connection_status(),
        critical_alert: store.last_critical_incident().cloned(),
        error: store.error().map(String::from),
      });
    }
    Command::Dismiss => {
      console.dismiss_alert();
      emit(&Ack { ok: true, cmd: "dismiss" });
    }
    Command::Retry => match console.retry().await {
      Ok(outcome) => {
        emit(&outcome);
        if console.is_authenticated() {
          if let Err(e) = console.start_realtime() {
            emit_error(&e);
          }
        } else {
          return false;
        }
      }
      Err(e) => emit_error(&e),
    },
    Command::Logout => {
      console.logout();
      emit(&Ack { ok: true, cmd: "logout" });
      return false;
    }
  }
  true
}

#[tokio::main]
async fn main() {
  init_logging();

  let console = match Console::new(Config::from_env()) {
    Ok(c) => c,
    Err(e) => {
      emit_error(&e);
      std::process::exit(1);
    }
  };

  if let Err(e) = authenticate(&console).await {
    emit_error(&e);
    std::process::exit(1);
  }

  let mut alerts = console.subscribe_alerts();
  match console.start().await {
    Ok(count) => tracing::info!("console ready with {} incidents", count),
    Err(e) => {
      // Keep going: `retry` can refetch.
      emit_error(&e);
      if let Err(e) = console.start_realtime() {
        emit_error(&e);
      }
    }
  }

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  loop {
    tokio::select! {
      line = lines.next_line() => {
        let line = match line {
          Ok(Some(l)) => l,
          Ok(None) => break,
          Err(e) => {
            let _ = writeln!(io::stderr(), "incident-console: read error: {}", e);
            std::process::exit(1);
          }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
          continue;
        }
        if !handle(&console, trimmed).await {
          break;
        }
      }
      Some(incident) = alerts.recv() => {
        emit(&AlertOutput { alert: &incident });
      }
    }
  }

  console.stop_realtime();
}
