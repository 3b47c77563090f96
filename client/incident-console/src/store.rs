//! Normalized incident table plus the connection, fetch and critical-alert
//! slices. Every operation is synchronous and total.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::types::{ConnectionStatus, Incident, LoadStatus, Status};

/// Handle shared by the fetch path, the realtime pump and patch completions.
#[derive(Clone, Default)]
pub struct SharedStore(Arc<Mutex<IncidentStore>>);

impl SharedStore {
  pub fn new(store: IncidentStore) -> Self {
    Self(Arc::new(Mutex::new(store)))
  }

  /// Lock for one atomic step. Never hold the guard across an await.
  pub fn lock(&self) -> MutexGuard<'_, IncidentStore> {
    self.0.lock().unwrap_or_else(|e| e.into_inner())
  }
}

#[derive(Debug, Default)]
pub struct IncidentStore {
  entities: HashMap<String, Incident>,
  /// Insertion order of ids; stable tie-break for the derived views.
  ids: Vec<String>,
  connection_status: ConnectionStatus,
  fetch_status: LoadStatus,
  error: Option<String>,
  last_critical: Option<String>,
  /// Bumped by every mutation.
  revision: u64,
  alerts: Option<mpsc::UnboundedSender<Incident>>,
}

impl IncidentStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Receive every incident that raises the critical alert. Replaces any
  /// earlier subscriber.
  pub fn subscribe_alerts(&mut self) -> mpsc::UnboundedReceiver<Incident> {
    let (tx, rx) = mpsc::unbounded_channel();
    self.alerts = Some(tx);
    rx
  }

  // -------------------------------------------------------------------------
  // Mutations
  // -------------------------------------------------------------------------

  /// Discard everything and index the fetched batch by id (last duplicate wins).
  pub fn replace_all(&mut self, incidents: Vec<Incident>) {
    self.entities.clear();
    self.ids.clear();
    for incident in incidents {
      self.insert(incident);
    }
    let stale_alert = self
      .last_critical
      .as_ref()
      .is_some_and(|id| !self.entities.contains_key(id));
    if stale_alert {
      self.last_critical = None;
    }
    self.fetch_status = LoadStatus::Succeeded;
    self.error = None;
    self.revision += 1;
  }

  /// Insert or fully overwrite. A CRITICAL/OPEN record becomes the last
  /// critical incident and is announced to the alert subscriber.
  pub fn upsert(&mut self, incident: Incident) {
    if incident.is_critical_open() {
      self.last_critical = Some(incident.id.clone());
      let subscriber_gone = self
        .alerts
        .as_ref()
        .is_some_and(|tx| tx.send(incident.clone()).is_err());
      if subscriber_gone {
        self.alerts = None;
      }
    }
    self.insert(incident);
    self.revision += 1;
  }

  /// Change only `status`. Moving the alerted incident off OPEN clears the
  /// alert. Unknown ids are ignored.
  pub fn update_status(&mut self, id: &str, status: Status) {
    let Some(incident) = self.entities.get_mut(id) else {
      tracing::debug!("status update for unknown incident {}", id);
      return;
    };
    incident.status = status;
    if status != Status::Open && self.last_critical.as_deref() == Some(id) {
      self.last_critical = None;
    }
    self.revision += 1;
  }

  pub fn clear_critical_alert(&mut self) {
    if self.last_critical.take().is_some() {
      self.revision += 1;
    }
  }

  pub fn set_connection_status(&mut self, status: ConnectionStatus) {
    if self.connection_status != status {
      self.connection_status = status;
      self.revision += 1;
    }
  }

  pub fn fetch_started(&mut self) {
    self.fetch_status = LoadStatus::Loading;
    self.error = None;
    self.revision += 1;
  }

  pub fn fetch_failed(&mut self, message: impl Into<String>) {
    self.fetch_status = LoadStatus::Failed;
    self.error = Some(message.into());
    self.revision += 1;
  }

  /// Attach an error to the incidents slice without changing fetch status.
  pub fn record_error(&mut self, message: impl Into<String>) {
    self.error = Some(message.into());
    self.revision += 1;
  }

  pub fn clear_error(&mut self) {
    if self.error.take().is_some() {
      self.revision += 1;
    }
  }

  fn insert(&mut self, incident: Incident) {
    if !self.entities.contains_key(&incident.id) {
      self.ids.push(incident.id.clone());
    }
    self.entities.insert(incident.id.clone(), incident);
  }

  // -------------------------------------------------------------------------
  // Reads
  // -------------------------------------------------------------------------

  pub fn get(&self, id: &str) -> Option<&Incident> {
    self.entities.get(id)
  }

  /// All incidents in first-seen order.
  pub fn all(&self) -> Vec<Incident> {
    self
      .ids
      .iter()
      .filter_map(|id| self.entities.get(id))
      .cloned()
      .collect()
  }

  pub fn len(&self) -> usize {
    self.entities.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entities.is_empty()
  }

  pub fn connection_status(&self) -> ConnectionStatus {
    self.connection_status
  }

  pub fn fetch_status(&self) -> LoadStatus {
    self.fetch_status
  }

  pub fn error(&self) -> Option<&str> {
    self.error.as_deref()
  }

  pub fn last_critical_id(&self) -> Option<&str> {
    self.last_critical.as_deref()
  }

  pub fn last_critical_incident(&self) -> Option<&Incident> {
    self.last_critical.as_deref().and_then(|id| self.entities.get(id))
  }

  pub fn revision(&self) -> u64 {
    self.revision
  }
}
