use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::store::StoreUpdate;

/// A write command for the server, with the store updates to apply
/// before sending, on success, and on permanent failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    pub command: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub optimistic_data: Vec<StoreUpdate>,
    #[serde(default)]
    pub success_data: Vec<StoreUpdate>,
    #[serde(default)]
    pub failure_data: Vec<StoreUpdate>,
}

impl Request {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            command: command.into(),
            data: Map::new(),
            optimistic_data: Vec::new(),
            success_data: Vec::new(),
            failure_data: Vec::new(),
        }
    }

    pub fn with_data(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    pub fn with_optimistic(mut self, updates: Vec<StoreUpdate>) -> Self {
        self.optimistic_data = updates;
        self
    }

    pub fn with_success(mut self, updates: Vec<StoreUpdate>) -> Self {
        self.success_data = updates;
        self
    }

    pub fn with_failure(mut self, updates: Vec<StoreUpdate>) -> Self {
        self.failure_data = updates;
        self
    }
}

/// Server reply to a request that reached it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub json_code: i64,
    /// Server clock when the response was produced, epoch milliseconds.
    #[serde(default)]
    pub server_time_ms: Option<u64>,
    /// Server-driven store updates, applied after `success_data`.
    #[serde(default)]
    pub updates: Vec<StoreUpdate>,
}

impl Response {
    pub const OK: i64 = 200;

    pub fn ok() -> Self {
        Self {
            json_code: Self::OK,
            server_time_ms: None,
            updates: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.json_code == Self::OK
    }
}

/// Why a request did not produce a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestError {
    pub name: String,
    pub message: String,
    /// HTTP status, absent when the request never got one.
    #[serde(default)]
    pub status: Option<u16>,
}

impl RequestError {
    pub fn new(name: impl Into<String>, message: impl Into<String>, status: Option<u16>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            status,
        }
    }

    /// Connection-level failure with no status.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new("NetworkError", message, None)
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::new("HttpError", message, Some(status))
    }

    /// Network failures, timeouts, rate limiting and server errors are
    /// worth retrying. Other statuses will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self.status {
            None => true,
            Some(408) | Some(429) => true,
            Some(status) => (500..600).contains(&status),
        }
    }
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} ({status}): {}", self.name, self.message),
            None => write!(f, "{}: {}", self.name, self.message),
        }
    }
}
