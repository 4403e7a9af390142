use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::OfflineError;

/// A pizza creation payload waiting to reach the API. The content is opaque
/// to the buffer; only `null` is refused.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct PendingRecord(Value);

impl PendingRecord {
    pub fn new(value: Value) -> Result<Self, OfflineError> {
        Self::validate(&value)?;
        Ok(Self(value))
    }

    pub fn from_json_str(json: &str) -> Result<Self, OfflineError> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| OfflineError::InvalidRecord(format!("invalid JSON payload: {e}")))?;
        Self::new(value)
    }

    pub fn as_json(&self) -> &Value {
        &self.0
    }

    fn validate(value: &Value) -> Result<(), OfflineError> {
        if value.is_null() {
            return Err(OfflineError::InvalidRecord(
                "pending record cannot be null".to_string(),
            ));
        }
        Ok(())
    }
}

/// Local auto-increment key. Never leaves the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferKey(i64);

impl BufferKey {
    pub(crate) fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferedRecord {
    pub key: BufferKey,
    pub record: PendingRecord,
}
