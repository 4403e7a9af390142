use serde_json::Value;
use std::sync::Arc;

use crate::connectivity::ConnectivityMonitor;
use crate::error::OfflineError;
use crate::record::{BufferKey, PendingRecord};
use crate::remote::{self, RemoteApi};
use crate::store::BufferStore;

#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// The API stored the pizza; carries the created document.
    Created(Value),
    /// The API was unreachable; the record waits in the buffer.
    Buffered(BufferKey),
}

/// Write path for new pizzas: try the API first, fall back to the buffer
/// when the network is the problem.
pub struct Outbox {
    store: Option<Arc<dyn BufferStore>>,
    remote: Arc<dyn RemoteApi>,
    monitor: ConnectivityMonitor,
}

impl Outbox {
    pub fn new(
        store: Arc<dyn BufferStore>,
        remote: Arc<dyn RemoteApi>,
        monitor: ConnectivityMonitor,
    ) -> Self {
        Self {
            store: Some(store),
            remote,
            monitor,
        }
    }

    /// For when the local store could not be opened: online writes still go
    /// through, offline writes fail with `TransportFailure`.
    pub fn unbuffered(remote: Arc<dyn RemoteApi>, monitor: ConnectivityMonitor) -> Self {
        Self {
            store: None,
            remote,
            monitor,
        }
    }

    /// A rejection is returned to the caller and never buffered, since
    /// replaying the same record would be rejected again.
    pub async fn save(&self, record: PendingRecord) -> Result<SaveOutcome, OfflineError> {
        match remote::submit_one(self.remote.as_ref(), &record).await {
            Ok(created) => {
                self.monitor.set_online(true);
                Ok(SaveOutcome::Created(created))
            }
            Err(OfflineError::TransportFailure(reason)) => {
                self.monitor.report_offline();
                let Some(store) = &self.store else {
                    tracing::warn!(reason = %reason, "api unreachable and no offline buffer");
                    return Err(OfflineError::TransportFailure(reason));
                };

                tracing::warn!(reason = %reason, "api unreachable; buffering pizza");
                let key = store.append(&record).await.inspect_err(|err| {
                    tracing::error!(error = %err, "pizza could not be buffered");
                })?;
                Ok(SaveOutcome::Buffered(key))
            }
            Err(err) => Err(err),
        }
    }
}
