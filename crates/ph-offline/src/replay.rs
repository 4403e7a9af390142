use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::connectivity::ConnectivityMonitor;
use crate::error::OfflineError;
use crate::record::{BufferKey, PendingRecord};
use crate::remote::{self, RemoteApi};
use crate::store::BufferStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    Idle,
    /// Snapshot taken, batch request in flight.
    Draining,
    /// Response received, deciding whether the snapshot can be dropped.
    Reconciling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Another replay was already running.
    Skipped,
    Empty,
    Submitted { count: usize },
    Rejected { message: String },
    Failed { reason: String },
}

/// Published once per successful replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaySucceeded {
    pub count: usize,
}

/// Sends everything in the buffer as one batch and drops it only after the
/// API accepted the batch. Only the keys present in the snapshot are removed,
/// so a record buffered while a request is in flight waits for the next
/// replay instead of being deleted unsent.
pub struct ReplayEngine {
    store: Arc<dyn BufferStore>,
    remote: Arc<dyn RemoteApi>,
    state: Mutex<ReplayState>,
    notifications: broadcast::Sender<ReplaySucceeded>,
}

impl ReplayEngine {
    pub fn new(store: Arc<dyn BufferStore>, remote: Arc<dyn RemoteApi>) -> Self {
        let (notifications, _) = broadcast::channel(16);
        Self {
            store,
            remote,
            state: Mutex::new(ReplayState::Idle),
            notifications,
        }
    }

    pub fn state(&self) -> ReplayState {
        *lock(&self.state)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplaySucceeded> {
        self.notifications.subscribe()
    }

    /// Replays now if online, then again on every reconnect until the
    /// returned handle is aborted.
    pub async fn start(self: &Arc<Self>, monitor: &ConnectivityMonitor) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let watcher = monitor.on_reconnect(move || {
            let engine = Arc::clone(&engine);
            async move {
                engine.replay().await;
            }
        });

        if monitor.is_online() {
            self.replay().await;
        }
        watcher
    }

    /// Never returns an error: every failure is logged and leaves the buffer
    /// as it was.
    pub async fn replay(&self) -> ReplayOutcome {
        let Some(flight) = InFlight::begin(&self.state) else {
            tracing::debug!("replay already in flight");
            return ReplayOutcome::Skipped;
        };

        let snapshot = match self.store.drain().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::error!(error = %err, "reading offline buffer failed");
                return ReplayOutcome::Failed {
                    reason: err.to_string(),
                };
            }
        };
        if snapshot.is_empty() {
            return ReplayOutcome::Empty;
        }

        let (keys, records): (Vec<BufferKey>, Vec<PendingRecord>) = snapshot
            .into_iter()
            .map(|entry| (entry.key, entry.record))
            .unzip();
        let count = records.len();
        tracing::info!(count, "replaying buffered pizzas");

        let response = remote::submit_batch(self.remote.as_ref(), &records).await;
        flight.advance(ReplayState::Reconciling);

        match response {
            Ok(_) => self.reconcile(&keys).await,
            Err(OfflineError::RemoteRejected(message)) => {
                tracing::warn!(count, message = %message, "replay rejected; records kept");
                ReplayOutcome::Rejected { message }
            }
            Err(err) => {
                tracing::warn!(count, error = %err, "replay failed; records kept");
                ReplayOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }

    async fn reconcile(&self, keys: &[BufferKey]) -> ReplayOutcome {
        if let Err(err) = self.store.remove(keys).await {
            tracing::error!(
                count = keys.len(),
                error = %err,
                "batch accepted but buffer could not be emptied; records will be sent again"
            );
            return ReplayOutcome::Failed {
                reason: err.to_string(),
            };
        }

        let count = keys.len();
        tracing::info!(count, "all saved pizzas have been submitted");
        // no subscribers is fine
        let _ = self.notifications.send(ReplaySucceeded { count });
        ReplayOutcome::Submitted { count }
    }
}

fn lock(state: &Mutex<ReplayState>) -> MutexGuard<'_, ReplayState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single-flight guard. Returns the engine to `Idle` when dropped, including
/// when the replay future itself is dropped mid-request.
struct InFlight<'a> {
    state: &'a Mutex<ReplayState>,
}

impl<'a> InFlight<'a> {
    fn begin(state: &'a Mutex<ReplayState>) -> Option<Self> {
        let mut current = lock(state);
        if *current != ReplayState::Idle {
            return None;
        }
        *current = ReplayState::Draining;
        Some(Self { state })
    }

    fn advance(&self, next: ReplayState) {
        *lock(self.state) = next;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        *lock(self.state) = ReplayState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteBufferStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    /// Scripted API: answers from a queue (default: echo success) and can
    /// hold a request open until released.
    #[derive(Default)]
    struct MockRemote {
        calls: AtomicUsize,
        bodies: Mutex<Vec<Value>>,
        responses: Mutex<VecDeque<Result<Value, OfflineError>>>,
        hold: Option<Hold>,
    }

    struct Hold {
        entered: Notify,
        release: Notify,
    }

    impl MockRemote {
        fn answering(response: Result<Value, OfflineError>) -> Self {
            let remote = Self::default();
            remote.responses.lock().unwrap().push_back(response);
            remote
        }

        fn held() -> Self {
            Self {
                hold: Some(Hold {
                    entered: Notify::new(),
                    release: Notify::new(),
                }),
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn wait_entered(&self) {
            let hold = self.hold.as_ref().expect("held remote");
            timeout(WAIT, hold.entered.notified()).await.expect("request started");
        }

        fn release(&self) {
            self.hold.as_ref().expect("held remote").release.notify_one();
        }
    }

    #[async_trait]
    impl RemoteApi for MockRemote {
        async fn create(&self, body: &Value) -> Result<Value, OfflineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.bodies.lock().unwrap().push(body.clone());
            if let Some(hold) = &self.hold {
                hold.entered.notify_one();
                hold.release.notified().await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(body.clone()))
        }
    }

    fn pizza(name: &str) -> PendingRecord {
        PendingRecord::new(json!({ "name": name })).unwrap()
    }

    async fn buffered(store: &SqliteBufferStore) -> Vec<PendingRecord> {
        store
            .drain()
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.record)
            .collect()
    }

    async fn setup(remote: MockRemote) -> (Arc<ReplayEngine>, Arc<SqliteBufferStore>, Arc<MockRemote>) {
        let store = Arc::new(SqliteBufferStore::open_in_memory().await.unwrap());
        let remote = Arc::new(remote);
        let engine = Arc::new(ReplayEngine::new(store.clone(), remote.clone()));
        (engine, store, remote)
    }

    #[tokio::test]
    async fn accepted_batch_empties_buffer_and_notifies_once() {
        let (engine, store, remote) = setup(MockRemote::answering(Ok(json!([
            { "_id": "1" },
            { "_id": "2" }
        ]))))
        .await;
        store.append(&pizza("Margherita")).await.unwrap();
        store.append(&pizza("Pepperoni")).await.unwrap();
        let mut notifications = engine.subscribe();

        let outcome = engine.replay().await;

        assert_eq!(outcome, ReplayOutcome::Submitted { count: 2 });
        assert_eq!(store.len().await.unwrap(), 0);
        assert_eq!(
            remote.bodies.lock().unwrap().as_slice(),
            &[json!([{ "name": "Margherita" }, { "name": "Pepperoni" }])]
        );
        assert_eq!(
            notifications.try_recv().unwrap(),
            ReplaySucceeded { count: 2 }
        );
        assert!(notifications.try_recv().is_err());
        assert_eq!(engine.state(), ReplayState::Idle);
    }

    #[tokio::test]
    async fn rejected_batch_keeps_buffer() {
        let (engine, store, _remote) = setup(MockRemote::answering(Ok(json!({
            "message": "Validation failed"
        }))))
        .await;
        store.append(&pizza("Hawaiian")).await.unwrap();
        let mut notifications = engine.subscribe();

        let outcome = engine.replay().await;

        assert_eq!(
            outcome,
            ReplayOutcome::Rejected {
                message: "Validation failed".into()
            }
        );
        assert_eq!(buffered(&store).await, vec![pizza("Hawaiian")]);
        assert!(notifications.try_recv().is_err());
        assert_eq!(engine.state(), ReplayState::Idle);
    }

    #[tokio::test]
    async fn transport_failure_keeps_buffer() {
        let (engine, store, _remote) = setup(MockRemote::answering(Err(
            OfflineError::TransportFailure("connection refused".into()),
        )))
        .await;
        store.append(&pizza("Margherita")).await.unwrap();
        store.append(&pizza("Pepperoni")).await.unwrap();
        let before = buffered(&store).await;

        let outcome = engine.replay().await;

        assert!(matches!(outcome, ReplayOutcome::Failed { .. }));
        assert_eq!(buffered(&store).await, before);
    }

    #[tokio::test]
    async fn empty_buffer_on_open_makes_no_request() {
        let (engine, _store, remote) = setup(MockRemote::default()).await;
        let monitor = ConnectivityMonitor::new(true);

        let watcher = engine.start(&monitor).await;

        assert_eq!(remote.calls(), 0);
        assert_eq!(engine.replay().await, ReplayOutcome::Empty);
        assert_eq!(remote.calls(), 0);
        watcher.abort();
    }

    #[tokio::test]
    async fn start_while_online_replays_existing_buffer() {
        let (engine, store, remote) = setup(MockRemote::default()).await;
        store.append(&pizza("Supreme")).await.unwrap();
        let monitor = ConnectivityMonitor::new(true);

        let watcher = engine.start(&monitor).await;

        assert_eq!(remote.calls(), 1);
        assert_eq!(store.len().await.unwrap(), 0);
        watcher.abort();
    }

    #[tokio::test]
    async fn start_while_offline_waits_for_reconnect() {
        let (engine, store, remote) = setup(MockRemote::default()).await;
        store.append(&pizza("Veggie")).await.unwrap();
        let monitor = ConnectivityMonitor::new(false);
        let mut notifications = engine.subscribe();

        let watcher = engine.start(&monitor).await;
        assert_eq!(remote.calls(), 0);

        monitor.set_online(true);
        let succeeded = timeout(WAIT, notifications.recv()).await.unwrap().unwrap();

        assert_eq!(succeeded, ReplaySucceeded { count: 1 });
        assert_eq!(store.len().await.unwrap(), 0);
        watcher.abort();
    }

    #[tokio::test]
    async fn rapid_reconnects_submit_the_buffer_once() {
        let (engine, store, remote) = setup(MockRemote::held()).await;
        store.append(&pizza("Margherita")).await.unwrap();
        store.append(&pizza("Pepperoni")).await.unwrap();
        let monitor = ConnectivityMonitor::new(false);
        let mut notifications = engine.subscribe();
        let watcher = engine.start(&monitor).await;

        monitor.set_online(true);
        remote.wait_entered().await;
        for _ in 0..4 {
            monitor.set_online(false);
            monitor.set_online(true);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(remote.calls(), 1);

        remote.release();
        let succeeded = timeout(WAIT, notifications.recv()).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(succeeded, ReplaySucceeded { count: 2 });
        assert_eq!(remote.calls(), 1);
        assert_eq!(store.len().await.unwrap(), 0);
        assert!(notifications.try_recv().is_err());
        watcher.abort();
    }

    #[tokio::test]
    async fn second_trigger_while_draining_is_ignored() {
        let (engine, store, remote) = setup(MockRemote::held()).await;
        store.append(&pizza("Margherita")).await.unwrap();

        let first = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.replay().await }
        });
        remote.wait_entered().await;
        assert_eq!(engine.state(), ReplayState::Draining);

        assert_eq!(engine.replay().await, ReplayOutcome::Skipped);
        assert_eq!(engine.replay().await, ReplayOutcome::Skipped);

        remote.release();
        let outcome = first.await.unwrap();

        assert_eq!(outcome, ReplayOutcome::Submitted { count: 1 });
        assert_eq!(remote.calls(), 1);
        assert_eq!(engine.state(), ReplayState::Idle);
    }

    #[tokio::test]
    async fn record_buffered_during_replay_survives_success() {
        let (engine, store, remote) = setup(MockRemote::held()).await;
        store.append(&pizza("Margherita")).await.unwrap();

        let first = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.replay().await }
        });
        remote.wait_entered().await;
        store.append(&pizza("Calzone")).await.unwrap();
        remote.release();

        assert_eq!(first.await.unwrap(), ReplayOutcome::Submitted { count: 1 });
        assert_eq!(buffered(&store).await, vec![pizza("Calzone")]);
        assert_eq!(
            remote.bodies.lock().unwrap().as_slice(),
            &[json!([{ "name": "Margherita" }])]
        );
    }

    #[tokio::test]
    async fn dropped_replay_returns_engine_to_idle() {
        let (engine, store, remote) = setup(MockRemote::held()).await;
        store.append(&pizza("Margherita")).await.unwrap();

        let first = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.replay().await }
        });
        remote.wait_entered().await;
        first.abort();
        let _ = first.await;

        assert_eq!(engine.state(), ReplayState::Idle);
        assert_eq!(store.len().await.unwrap(), 1);
    }
}
