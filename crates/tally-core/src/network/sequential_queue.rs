use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::request::{Request, Response};
use super::throttle::{CancelHandle, RequestThrottle};
use super::time_skew::TimeSkew;
use super::transport::Transport;
use crate::config::TallyConfig;
use crate::error::{QueueError, StoreError, ThrottleError};
use crate::metrics::Metrics;
use crate::state::ClientState;

/// Wall clock in epoch milliseconds.
pub type Clock = Box<dyn Fn() -> u64 + Send>;

pub fn system_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Outcome of one `flush`.
#[derive(Debug, Default)]
pub struct FlushReport {
    pub succeeded: Vec<Uuid>,
    pub failed: Vec<(Uuid, QueueError)>,
    /// The retry wait was cancelled through a `CancelHandle`; the request at
    /// the head was kept.
    pub cancelled: bool,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty()
    }
}

/// Write requests sent one at a time, in the order they were made.
///
/// Optimistic data is applied on `push`. The pending list lives in the
/// store under the persisted-requests key, so it survives whatever the
/// store survives and can be reloaded with `restore`.
pub struct SequentialQueue<T: Transport> {
    name: String,
    transport: T,
    throttle: RequestThrottle,
    time_skew: TimeSkew,
    requests: VecDeque<Request>,
    persisted_requests_key: String,
    time_skew_key: String,
    paused: bool,
    offline: bool,
    clock: Clock,
    metrics: Option<Metrics>,
}

impl<T: Transport> SequentialQueue<T> {
    pub fn new(name: impl Into<String>, transport: T, config: &TallyConfig) -> Self {
        let name = name.into();
        Self {
            throttle: RequestThrottle::new(name.clone(), &config.network),
            name,
            transport,
            time_skew: TimeSkew::new(),
            requests: VecDeque::new(),
            persisted_requests_key: config.queue.persisted_requests_key.clone(),
            time_skew_key: config.queue.time_skew_key.clone(),
            paused: false,
            offline: false,
            clock: Box::new(system_now_ms),
            metrics: None,
        }
    }

    /// Replace the retry throttle, e.g. with a seeded one.
    pub fn with_throttle(mut self, throttle: RequestThrottle) -> Self {
        self.throttle = match &self.metrics {
            Some(metrics) => throttle.with_metrics(metrics.clone()),
            None => throttle,
        };
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.throttle = self.throttle.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Request> {
        self.requests.iter()
    }

    pub fn throttle(&self) -> &RequestThrottle {
        &self.throttle
    }

    /// Stops a running `flush` at its current retry wait.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.throttle.cancel_handle()
    }

    pub fn time_skew(&self) -> TimeSkew {
        self.time_skew
    }

    pub fn pause(&mut self) {
        self.paused = true;
        info!(queue = %self.name, "queue paused");
    }

    pub fn unpause(&mut self) {
        self.paused = false;
        info!(queue = %self.name, pending = self.requests.len(), "queue unpaused");
    }

    pub fn set_offline(&mut self, offline: bool) {
        if self.offline != offline {
            info!(queue = %self.name, offline, "network status changed");
        }
        self.offline = offline;
    }

    pub fn is_running(&self) -> bool {
        !self.paused && !self.offline
    }

    /// Apply the request's optimistic data and queue it.
    pub fn push(&mut self, state: &mut ClientState, request: Request) -> Result<(), QueueError> {
        state.apply_all(&request.optimistic_data)?;
        debug!(queue = %self.name, command = %request.command, id = %request.id, "request queued");
        self.requests.push_back(request);
        self.persist(state)
    }

    /// Reload the persisted requests and time skew after a restart.
    /// Returns the number of requests restored.
    pub fn restore(&mut self, state: &ClientState) -> Result<usize, QueueError> {
        let stored: Option<Vec<Request>> = state.store().get_as(&self.persisted_requests_key)?;
        self.requests = stored.unwrap_or_default().into();
        if let Some(skew) = state.store().get_as::<i64>(&self.time_skew_key)? {
            self.time_skew = TimeSkew::from_skew(skew);
        }
        self.record_depth();
        info!(queue = %self.name, restored = self.requests.len(), "persisted requests restored");
        Ok(self.requests.len())
    }

    /// Send queued requests in order until the queue is empty.
    ///
    /// Retryable errors wait on the throttle and resend the same request.
    /// Anything else, including an exhausted retry budget, rolls the request
    /// back with its failure data and moves on to the next one. A cancelled
    /// retry wait, or dropping the returned future, leaves the in-flight
    /// request at the head; its retry sequence starts over on the next flush.
    #[tracing::instrument(skip_all, fields(queue = %self.name, pending = self.requests.len()))]
    pub async fn flush(&mut self, state: &mut ClientState) -> FlushReport {
        let mut report = FlushReport::default();
        if !self.is_running() {
            debug!(paused = self.paused, offline = self.offline, "flush skipped");
            return report;
        }
        if self.throttle.retry_count() > 0 {
            debug!(
                retry_count = self.throttle.retry_count(),
                "resetting retry sequence of an abandoned flush"
            );
            self.throttle.clear();
        }

        while let Some(request) = self.requests.front().cloned() {
            let started = (self.clock)();
            match self.transport.send(&request).await {
                Ok(response) if response.is_ok() => {
                    self.complete(state, &request, response, started, &mut report);
                }
                Ok(response) => {
                    let err = QueueError::JsonCode {
                        command: request.command.clone(),
                        json_code: response.json_code,
                    };
                    self.fail(state, &request, err, &mut report);
                }
                Err(error) if error.is_retryable() => {
                    match self.throttle.sleep(&error, &request.command).await {
                        Ok(()) => continue,
                        Err(ThrottleError::Cancelled { .. }) => {
                            warn!(command = %request.command, "retry wait cancelled, stopping flush");
                            self.throttle.clear();
                            report.cancelled = true;
                            break;
                        }
                        Err(exhausted) => {
                            self.fail(state, &request, exhausted.into(), &mut report);
                        }
                    }
                }
                Err(error) => {
                    let err = QueueError::Rejected {
                        command: request.command.clone(),
                        name: error.name,
                        message: error.message,
                        status: error.status,
                    };
                    self.fail(state, &request, err, &mut report);
                }
            }
        }

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            remaining = self.requests.len(),
            "flush finished"
        );
        report
    }

    fn complete(
        &mut self,
        state: &mut ClientState,
        request: &Request,
        response: Response,
        started: u64,
        report: &mut FlushReport,
    ) {
        if let Some(server_time) = response.server_time_ms {
            let skew = self.time_skew.observe(started, (self.clock)(), server_time);
            if let Err(e) = state.set(&self.time_skew_key, json!(skew)) {
                warn!(error = %e, "failed to store time skew");
            }
        }

        let applied = state
            .apply_all(&request.success_data)
            .and_then(|()| state.apply_all(&response.updates));
        if let Err(e) = applied {
            warn!(error = %e, command = %request.command, "failed to apply success data");
        }

        self.throttle.clear();
        self.pop(state);
        if let Some(metrics) = &self.metrics {
            metrics.record_request_succeeded(&request.command);
        }
        debug!(command = %request.command, id = %request.id, "request succeeded");
        report.succeeded.push(request.id);
    }

    fn fail(
        &mut self,
        state: &mut ClientState,
        request: &Request,
        error: QueueError,
        report: &mut FlushReport,
    ) {
        warn!(command = %request.command, id = %request.id, error = %error, "request failed permanently");
        if let Err(e) = state.apply_all(&request.failure_data) {
            warn!(error = %e, command = %request.command, "failed to apply failure data");
        }

        self.throttle.clear();
        self.pop(state);
        if let Some(metrics) = &self.metrics {
            metrics.record_request_failed(&request.command);
        }
        report.failed.push((request.id, error));
    }

    fn pop(&mut self, state: &mut ClientState) {
        self.requests.pop_front();
        if let Err(e) = self.persist(state) {
            warn!(error = %e, "failed to persist request queue");
        }
    }

    fn persist(&mut self, state: &mut ClientState) -> Result<(), QueueError> {
        if self.requests.is_empty() {
            state.remove(&self.persisted_requests_key)?;
        } else {
            let value = serde_json::to_value(&self.requests).map_err(StoreError::from)?;
            state.set(&self.persisted_requests_key, value)?;
        }
        self.record_depth();
        Ok(())
    }

    fn record_depth(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_queue_depth(&self.name, self.requests.len() as u64);
        }
    }
}
