use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde_json::Value;
use std::time::Duration;

use crate::error::OfflineError;
use crate::record::PendingRecord;

pub const PIZZAS_PATH: &str = "/api/pizzas";
pub const HEALTH_PATH: &str = "/healthz";

/// The pizza creation endpoint. Implementations only fail with
/// `TransportFailure`; a body carrying `message` is returned as-is and judged
/// by [`classify`].
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn create(&self, body: &Value) -> Result<Value, OfflineError>;
}

/// Posts the records as one JSON array, in the order given.
pub async fn submit_batch(
    remote: &dyn RemoteApi,
    records: &[PendingRecord],
) -> Result<Value, OfflineError> {
    let body = Value::Array(records.iter().map(|record| record.as_json().clone()).collect());
    classify(remote.create(&body).await?)
}

pub async fn submit_one(
    remote: &dyn RemoteApi,
    record: &PendingRecord,
) -> Result<Value, OfflineError> {
    classify(remote.create(record.as_json()).await?)
}

/// A response is an error exactly when it is an object with a `message`
/// field; the HTTP status is not consulted.
pub fn classify(response: Value) -> Result<Value, OfflineError> {
    match response.get("message") {
        Some(Value::String(message)) => Err(OfflineError::RemoteRejected(message.clone())),
        Some(other) => Err(OfflineError::RemoteRejected(other.to_string())),
        None => Ok(response),
    }
}

pub struct HttpRemoteApi {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRemoteApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, OfflineError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}{PIZZAS_PATH}", base_url.trim_end_matches('/')),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn create(&self, body: &Value) -> Result<Value, OfflineError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "application/json, text/plain, */*")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let payload = response.json::<Value>().await.map_err(|err| {
            OfflineError::TransportFailure(format!("unreadable response ({status}): {err}"))
        })?;
        tracing::debug!(endpoint = %self.endpoint, %status, "remote create answered");
        Ok(payload)
    }
}
