use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::NetworkConfig;
use crate::error::ThrottleError;
use crate::metrics::Metrics;
use crate::network::request::RequestError;

/// Source of the randomized first wait.
pub trait RandomSource: Send {
    /// Uniform value in `[min, max]`, inclusive.
    fn next_in_range(&mut self, min: u64, max: u64) -> u64;
}

/// Thread-local generator from `rand`.
#[derive(Debug, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_in_range(&mut self, min: u64, max: u64) -> u64 {
        rand::rng().random_range(min..=max)
    }
}

/// Reproducible generator for tests and the `backoff` command.
pub struct SeededRandom(StdRng);

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }
}

impl RandomSource for SeededRandom {
    fn next_in_range(&mut self, min: u64, max: u64) -> u64 {
        self.0.random_range(min..=max)
    }
}

/// Ends the pending wait of the throttle it was taken from.
///
/// Cloneable and usable while the owner of the throttle is busy awaiting
/// that wait.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    pending: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl CancelHandle {
    /// Resolve the pending wait with `ThrottleError::Cancelled`. Returns
    /// whether a wait was still pending.
    pub fn cancel(&self) -> bool {
        match self.take() {
            Some(cancel) => cancel.send(()).is_ok(),
            None => false,
        }
    }

    fn arm(&self, cancel: oneshot::Sender<()>) {
        *self.lock() = Some(cancel);
    }

    fn take(&self) -> Option<oneshot::Sender<()>> {
        self.lock().take()
    }

    fn is_armed(&self) -> bool {
        self.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<oneshot::Sender<()>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exponential backoff with a randomized first wait and a retry ceiling,
/// for one logical request queue.
///
/// Single-flight: the owner awaits each `sleep` before calling it again.
pub struct RequestThrottle {
    name: String,
    wait_time_ms: u64,
    retry_count: u32,
    pending: CancelHandle,
    min_wait_ms: u64,
    max_random_wait_ms: u64,
    max_wait_ms: u64,
    max_retries: u32,
    random: Box<dyn RandomSource>,
    metrics: Option<Metrics>,
}

impl RequestThrottle {
    pub fn new(name: impl Into<String>, config: &NetworkConfig) -> Self {
        Self::with_random(name, config, Box::new(ThreadRandom))
    }

    pub fn with_random(
        name: impl Into<String>,
        config: &NetworkConfig,
        random: Box<dyn RandomSource>,
    ) -> Self {
        let min_wait_ms = config.min_retry_wait_ms;
        let max_random_wait_ms = config.max_random_retry_wait_ms.max(min_wait_ms);
        Self {
            name: name.into(),
            wait_time_ms: 0,
            retry_count: 0,
            pending: CancelHandle::default(),
            min_wait_ms,
            max_random_wait_ms,
            max_wait_ms: config.max_retry_wait_ms.max(max_random_wait_ms),
            max_retries: config.max_request_retries,
            random,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Random wait in the initial range on the first call, then double the
    /// previous wait up to the cap. The result is remembered.
    pub fn get_request_wait_time(&mut self) -> u64 {
        self.wait_time_ms = if self.wait_time_ms == 0 {
            self.random
                .next_in_range(self.min_wait_ms, self.max_random_wait_ms)
        } else {
            self.wait_time_ms.saturating_mul(2).min(self.max_wait_ms)
        };
        self.wait_time_ms
    }

    /// The wait most recently computed, 0 if none since the last `clear()`.
    pub fn last_request_wait_time(&self) -> u64 {
        self.wait_time_ms
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn is_waiting(&self) -> bool {
        self.pending.is_armed()
    }

    /// Handle that cancels whichever wait is pending when it is used.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.pending.clone()
    }

    /// Count one retry of `command` after `error` and wait before it.
    ///
    /// The wait is measured from this call, not from the first poll. The
    /// returned future does not borrow the throttle, so `clear()` or a
    /// `CancelHandle` can end it early with `ThrottleError::Cancelled`. Past
    /// the retry ceiling it resolves immediately with
    /// `ThrottleError::RetriesExhausted`.
    pub fn sleep(
        &mut self,
        error: &RequestError,
        command: &str,
    ) -> impl Future<Output = Result<(), ThrottleError>> + Send + 'static {
        self.retry_count += 1;
        let name = self.name.clone();

        if self.retry_count > self.max_retries {
            warn!(
                throttle = %self.name,
                command,
                retry_count = self.retry_count,
                max_retries = self.max_retries,
                error_name = %error.name,
                error_message = %error.message,
                status = ?error.status,
                "retries exhausted, giving up"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_exhausted(&self.name);
            }
            let err = ThrottleError::RetriesExhausted {
                throttle: name,
                command: command.to_string(),
                retry_count: self.retry_count,
                max_retries: self.max_retries,
            };
            return Wait::Done(Err(err)).run();
        }

        let wait_ms = self.get_request_wait_time();
        info!(
            throttle = %self.name,
            command,
            retry_count = self.retry_count,
            max_retries = self.max_retries,
            wait_time_ms = wait_ms,
            error_name = %error.name,
            error_message = %error.message,
            status = ?error.status,
            "request failed, retrying after wait"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_retry(&self.name);
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.pending.arm(cancel_tx);
        Wait::Timer {
            throttle: name,
            deadline: Instant::now() + Duration::from_millis(wait_ms),
            cancelled: cancel_rx,
        }
        .run()
    }

    /// Cancel any pending wait and reset to the initial state.
    pub fn clear(&mut self) {
        // The waiter may already have finished
        self.pending.cancel();
        self.wait_time_ms = 0;
        self.retry_count = 0;
    }
}

enum Wait {
    Done(Result<(), ThrottleError>),
    Timer {
        throttle: String,
        deadline: Instant,
        cancelled: oneshot::Receiver<()>,
    },
}

impl Wait {
    async fn run(self) -> Result<(), ThrottleError> {
        match self {
            Wait::Done(result) => result,
            Wait::Timer {
                throttle,
                deadline,
                cancelled,
            } => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => Ok(()),
                    Ok(()) = cancelled => Err(ThrottleError::Cancelled { throttle }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::test_harness::MetricTestHarness;
    use opentelemetry::KeyValue;

    /// Always returns the lower bound.
    struct Lowest;

    impl RandomSource for Lowest {
        fn next_in_range(&mut self, min: u64, _max: u64) -> u64 {
            min
        }
    }

    fn config(max_retries: u32) -> NetworkConfig {
        NetworkConfig {
            min_retry_wait_ms: 10,
            max_random_retry_wait_ms: 100,
            max_retry_wait_ms: 1_000,
            max_request_retries: max_retries,
        }
    }

    fn network_error() -> RequestError {
        RequestError::network("connection reset")
    }

    #[test]
    fn first_wait_is_random_then_doubles_to_cap() {
        let mut throttle = RequestThrottle::with_random("q", &config(10), Box::new(Lowest));
        let waits: Vec<u64> = (0..9).map(|_| throttle.get_request_wait_time()).collect();
        assert_eq!(waits, vec![10, 20, 40, 80, 160, 320, 640, 1_000, 1_000]);
        assert_eq!(throttle.last_request_wait_time(), 1_000);
    }

    #[test]
    fn seeded_random_is_reproducible_and_in_range() {
        let mut a = RequestThrottle::with_random("q", &config(10), Box::new(SeededRandom::new(7)));
        let mut b = RequestThrottle::with_random("q", &config(10), Box::new(SeededRandom::new(7)));
        let first = a.get_request_wait_time();
        assert_eq!(first, b.get_request_wait_time());
        assert!((10..=100).contains(&first));
    }

    #[test]
    fn thread_random_stays_in_range() {
        let mut random = ThreadRandom;
        for _ in 0..100 {
            let v = random.next_in_range(10, 12);
            assert!((10..=12).contains(&v));
        }
        assert_eq!(random.next_in_range(5, 5), 5);
    }

    #[test]
    fn inverted_bounds_are_normalized() {
        let cfg = NetworkConfig {
            min_retry_wait_ms: 50,
            max_random_retry_wait_ms: 10,
            max_retry_wait_ms: 5,
            max_request_retries: 1,
        };
        let mut throttle = RequestThrottle::with_random("q", &cfg, Box::new(SeededRandom::new(1)));
        assert_eq!(throttle.get_request_wait_time(), 50);
        assert_eq!(throttle.get_request_wait_time(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_waits_for_the_computed_time() {
        let mut throttle = RequestThrottle::with_random("q", &config(3), Box::new(Lowest));
        let start = tokio::time::Instant::now();
        throttle.sleep(&network_error(), "OpenReport").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
        throttle.sleep(&network_error(), "OpenReport").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(throttle.retry_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_after_max_retries() {
        let mut throttle = RequestThrottle::with_random("q", &config(3), Box::new(Lowest));
        for _ in 0..3 {
            throttle.sleep(&network_error(), "AddComment").await.unwrap();
        }
        let wait_before = throttle.last_request_wait_time();
        let start = tokio::time::Instant::now();
        let err = throttle
            .sleep(&network_error(), "AddComment")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ThrottleError::RetriesExhausted {
                throttle: "q".to_string(),
                command: "AddComment".to_string(),
                retry_count: 4,
                max_retries: 3,
            }
        );
        // Rejection is immediate and does not advance the wait
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(throttle.last_request_wait_time(), wait_before);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_rejects_first_sleep() {
        let mut throttle = RequestThrottle::with_random("q", &config(0), Box::new(Lowest));
        assert!(matches!(
            throttle.sleep(&network_error(), "Ping").await,
            Err(ThrottleError::RetriesExhausted { retry_count: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_resets_to_initial_range() {
        let mut throttle = RequestThrottle::with_random("q", &config(5), Box::new(Lowest));
        for _ in 0..4 {
            throttle.sleep(&network_error(), "Ping").await.unwrap();
        }
        assert_eq!(throttle.last_request_wait_time(), 80);

        throttle.clear();
        assert_eq!(throttle.retry_count(), 0);
        assert_eq!(throttle.last_request_wait_time(), 0);
        assert_eq!(throttle.get_request_wait_time(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cancels_pending_wait() {
        let mut throttle = RequestThrottle::with_random("q", &config(5), Box::new(Lowest));
        let wait = tokio::spawn(throttle.sleep(&network_error(), "Ping"));
        tokio::task::yield_now().await;
        assert!(throttle.is_waiting());

        throttle.clear();
        let result = wait.await.unwrap();
        assert_eq!(
            result,
            Err(ThrottleError::Cancelled {
                throttle: "q".to_string()
            })
        );
        assert!(!throttle.is_waiting());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_handle_ends_wait_without_the_throttle() {
        let mut throttle = RequestThrottle::with_random("q", &config(5), Box::new(Lowest));
        let handle = throttle.cancel_handle();
        assert!(!handle.cancel());

        let wait = throttle.sleep(&network_error(), "Ping");
        let canceller = handle.clone();
        let (result, cancelled) = tokio::join!(wait, async move {
            tokio::time::sleep(Duration::from_millis(3)).await;
            canceller.cancel()
        });
        assert!(cancelled);
        assert!(matches!(result, Err(ThrottleError::Cancelled { .. })));
        // Cancelling does not reset the sequence; clear() does
        assert_eq!(throttle.retry_count(), 1);
        assert!(!throttle.is_waiting());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_measured_from_the_sleep_call() {
        let mut throttle = RequestThrottle::with_random("q", &config(5), Box::new(Lowest));
        let wait = throttle.sleep(&network_error(), "Ping");
        tokio::time::advance(Duration::from_millis(10)).await;

        let polled_at = tokio::time::Instant::now();
        wait.await.unwrap();
        assert_eq!(polled_at.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_after_wait_finished_is_harmless() {
        let mut throttle = RequestThrottle::with_random("q", &config(5), Box::new(Lowest));
        throttle.sleep(&network_error(), "Ping").await.unwrap();
        assert!(!throttle.is_waiting());
        throttle.clear();
        assert_eq!(throttle.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_and_exhaustion_are_counted() {
        let harness = MetricTestHarness::new();
        let mut throttle = RequestThrottle::with_random("q", &config(1), Box::new(Lowest))
            .with_metrics(harness.metrics.clone());
        throttle.sleep(&network_error(), "Ping").await.unwrap();
        let _ = throttle.sleep(&network_error(), "Ping").await;

        let attrs = [KeyValue::new("throttle", "q")];
        harness.assert_counter("tally.throttle.retries", &attrs, 1);
        harness.assert_counter("tally.throttle.exhausted", &attrs, 1);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn backoff_is_monotonic_and_capped(
                seed in any::<u64>(),
                min in 1u64..500,
                spread in 0u64..500,
                cap in 1u64..20_000,
                calls in 1usize..40,
            ) {
                let cfg = NetworkConfig {
                    min_retry_wait_ms: min,
                    max_random_retry_wait_ms: min + spread,
                    max_retry_wait_ms: cap,
                    max_request_retries: 10,
                };
                let ceiling = cap.max(min + spread);
                let mut throttle =
                    RequestThrottle::with_random("p", &cfg, Box::new(SeededRandom::new(seed)));
                let first = throttle.get_request_wait_time();
                prop_assert!(first >= min && first <= min + spread);
                let mut previous = first;
                for _ in 1..calls {
                    let next = throttle.get_request_wait_time();
                    prop_assert!(next >= previous);
                    prop_assert!(next <= ceiling);
                    previous = next;
                }
            }
        }
    }
}
