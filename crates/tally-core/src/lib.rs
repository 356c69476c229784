pub mod config;
pub mod derived;
pub mod error;
pub mod metrics;
pub mod network;
pub mod state;
pub mod store;
pub mod telemetry;

pub use config::TallyConfig;
pub use derived::{DerivedState, DerivedValue, DerivedValueEngine};
pub use error::{ConfigError, DeriveError, QueueError, StoreError, ThrottleError};
pub use metrics::Metrics;
pub use network::{Request, RequestError, RequestThrottle, Response, SequentialQueue, Transport};
pub use state::ClientState;
pub use store::{Store, StoreChange, StoreUpdate};
