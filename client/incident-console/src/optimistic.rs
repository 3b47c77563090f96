//! Optimistic status changes with rollback.

use std::sync::Arc;

use crate::error::ConsoleError;
use crate::gateway::IncidentApi;
use crate::store::SharedStore;
use crate::types::{Incident, Status};

pub struct OptimisticCoordinator {
  api: Arc<dyn IncidentApi>,
  store: SharedStore,
}

impl OptimisticCoordinator {
  pub fn new(api: Arc<dyn IncidentApi>, store: SharedStore) -> Self {
    Self { api, store }
  }

  /// Apply `status` locally, then confirm it with the backend. A rejection
  /// restores the previous status (when there was one) and is recorded on
  /// the store's error slice.
  pub async fn patch_status(&self, id: &str, status: Status) -> Result<Incident, ConsoleError> {
    let previous = {
      let mut store = self.store.lock();
      let previous = store.get(id).map(|i| i.status);
      store.update_status(id, status);
      previous
    };
    tracing::debug!("optimistic {} -> {} (was {:?})", id, status, previous);

    match self.api.patch_status(id, status).await {
      Ok(confirmed) => {
        let mut store = self.store.lock();
        if store.get(id) != Some(&confirmed) {
          tracing::debug!("server record for {} differs; adopting it", id);
          store.upsert(confirmed.clone());
        }
        Ok(confirmed)
      }
      Err(e) => {
        tracing::warn!("status change for {} rejected: {}", id, e);
        let mut store = self.store.lock();
        match previous {
          Some(previous) => store.update_status(id, previous),
          None => tracing::debug!("no prior status for {}; nothing to roll back", id),
        }
        let err = ConsoleError::conflict(id, e);
        store.record_error(err.user_message());
        Err(err)
      }
    }
  }
}
