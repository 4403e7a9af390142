use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy)]
struct LinkState {
    online: bool,
    /// Bumped on every offline -> online flip so observers that miss an
    /// intermediate value still see the reconnect.
    reconnects: u64,
}

/// Tracks whether the API is reachable. Host signals are pushed in through
/// [`ConnectivityMonitor::set_online`]; [`ConnectivityMonitor::spawn_probe`]
/// polls a health endpoint when no such signal exists.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<LinkState>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (sender, _) = watch::channel(LinkState {
            online: initially_online,
            reconnects: 0,
        });
        Self {
            state: Arc::new(sender),
        }
    }

    pub fn is_online(&self) -> bool {
        self.state.borrow().online
    }

    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|state| {
            if state.online == online {
                return false;
            }
            state.online = online;
            if online {
                state.reconnects += 1;
            }
            true
        });

        if changed {
            if online {
                tracing::info!("connectivity restored");
            } else {
                tracing::warn!("connectivity lost");
            }
        }
    }

    /// A save failed because the API could not be reached.
    pub fn report_offline(&self) {
        self.set_online(false);
    }

    /// Runs `callback` once per offline -> online transition. Each invocation
    /// is spawned on its own task so a failing callback cannot stop the
    /// watcher. Abort the returned handle to unregister.
    pub fn on_reconnect<F, Fut>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut receiver = self.state.subscribe();
        let mut seen = receiver.borrow_and_update().reconnects;
        tokio::spawn(async move {
            while receiver.changed().await.is_ok() {
                let current = receiver.borrow_and_update().reconnects;
                if current == seen {
                    continue;
                }
                seen = current;

                let task = tokio::spawn(callback());
                tokio::spawn(async move {
                    if let Err(err) = task.await {
                        tracing::error!(error = %err, "reconnect callback failed");
                    }
                });
            }
        })
    }

    pub fn spawn_probe(
        &self,
        client: reqwest::Client,
        url: String,
        interval: Duration,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = probe_once(&client, &url).await;
                monitor.set_online(online);
            }
        })
    }
}

pub async fn probe_once(client: &reqwest::Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(response) => response.status().is_success(),
        Err(err) => {
            tracing::debug!(url = url, error = %err, "connectivity probe failed");
            false
        }
    }
}
