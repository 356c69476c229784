//! Request pipeline: retry pacing, the sequential write queue and the
//! server clock offset it tracks.

pub mod request;
pub mod sequential_queue;
pub mod throttle;
pub mod time_skew;
pub mod transport;

pub use request::{Request, RequestError, Response};
pub use sequential_queue::{system_now_ms, Clock, FlushReport, SequentialQueue};
pub use throttle::{CancelHandle, RandomSource, RequestThrottle, SeededRandom, ThreadRandom};
pub use time_skew::TimeSkew;
pub use transport::Transport;
