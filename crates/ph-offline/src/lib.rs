use anyhow::Result;
use ph_core::config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub mod connectivity;
pub mod error;
pub mod outbox;
pub mod record;
pub mod remote;
pub mod replay;
pub mod store;

pub use connectivity::ConnectivityMonitor;
pub use error::OfflineError;
pub use outbox::{Outbox, SaveOutcome};
pub use record::{BufferKey, BufferedRecord, PendingRecord};
pub use remote::{HttpRemoteApi, RemoteApi};
pub use replay::{ReplayEngine, ReplayOutcome, ReplayState, ReplaySucceeded};
pub use store::{BufferStore, SqliteBufferStore};

pub struct OfflineConfig {
    pub api_base_url: String,
    pub store_dir: PathBuf,
    pub poll_interval: Duration,
    pub remote_timeout: Duration,
}

impl OfflineConfig {
    pub fn health_url(&self) -> String {
        format!(
            "{}{}",
            self.api_base_url.trim_end_matches('/'),
            remote::HEALTH_PATH
        )
    }
}

pub fn load_config() -> Result<OfflineConfig> {
    let api_base_url = config::env_or("PIZZA_API_URL", "http://127.0.0.1:3001");
    let store_dir = PathBuf::from(config::env_or("OFFLINE_STORE_DIR", "data"));
    let poll_interval =
        Duration::from_secs(config::u64_from_env("CONNECTIVITY_POLL_SECONDS", 5)?.max(1));
    let remote_timeout =
        Duration::from_secs(config::u64_from_env("REMOTE_TIMEOUT_SECONDS", 10)?.max(1));
    Ok(OfflineConfig {
        api_base_url,
        store_dir,
        poll_interval,
        remote_timeout,
    })
}

/// Store, monitor and replay engine wired to one API.
pub struct OfflineClient {
    pub store: Arc<SqliteBufferStore>,
    pub monitor: ConnectivityMonitor,
    pub engine: Arc<ReplayEngine>,
}

impl OfflineClient {
    pub async fn open(config: &OfflineConfig, initially_online: bool) -> Result<Self> {
        let store = Arc::new(SqliteBufferStore::open(&config.store_dir).await?);
        let remote = Arc::new(HttpRemoteApi::new(
            &config.api_base_url,
            config.remote_timeout,
        )?);
        let engine = Arc::new(ReplayEngine::new(store.clone(), remote));
        Ok(Self {
            store,
            monitor: ConnectivityMonitor::new(initially_online),
            engine,
        })
    }
}
