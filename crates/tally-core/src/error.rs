/// Errors raised by the reactive store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key {key} is not a member of collection {collection}")]
    KeyOutsideCollection { collection: String, key: String },

    #[error("collection prefix must not be empty")]
    EmptyCollection,

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Outcome of a retry wait that did not complete normally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThrottleError {
    /// The retry budget is spent. The caller must stop retrying and surface
    /// a permanent failure.
    #[error("{throttle}: retries exhausted for {command} ({retry_count} > {max_retries})")]
    RetriesExhausted {
        throttle: String,
        command: String,
        retry_count: u32,
        max_retries: u32,
    },

    /// The pending wait was aborted by `clear()`.
    #[error("{throttle}: retry wait cancelled")]
    Cancelled { throttle: String },
}

/// Errors from the derived value engine.
#[derive(Debug, thiserror::Error)]
pub enum DeriveError {
    #[error("derived value already registered: {0}")]
    DuplicateKey(String),

    #[error("derived value {0} declares no dependencies")]
    NoDependencies(String),

    #[error("derived values still changing after {rounds} propagation rounds")]
    PropagationLimit { rounds: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Permanent failure of a queued request.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("request {command} rejected: {name}: {message}")]
    Rejected {
        command: String,
        name: String,
        message: String,
        status: Option<u16>,
    },

    #[error("request {command} failed with jsonCode {json_code}")]
    JsonCode { command: String, json_code: i64 },

    #[error(transparent)]
    Throttle(#[from] ThrottleError),

    #[error(transparent)]
    Derive(#[from] DeriveError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config value: {0}")]
    InvalidValue(String),

    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type DeriveResult<T> = std::result::Result<T, DeriveError>;
