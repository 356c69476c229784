use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

/// OTel instruments for the request pipeline and derived value engine.
/// Built once and shared by reference; cloning is cheap.
#[derive(Clone)]
pub struct Metrics {
    pub throttle_retries: Counter<u64>,
    pub throttle_exhausted: Counter<u64>,
    pub requests_succeeded: Counter<u64>,
    pub requests_failed: Counter<u64>,
    pub queue_depth: Gauge<u64>,
    pub derived_recomputes: Counter<u64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create metrics from the global meter provider. If no meter provider
    /// is configured, the instruments are no-op.
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("tally");
        Self::from_meter(&meter)
    }

    pub fn from_meter(meter: &Meter) -> Self {
        Self {
            throttle_retries: meter
                .u64_counter("tally.throttle.retries")
                .with_description("Retry waits scheduled by a request throttle")
                .build(),
            throttle_exhausted: meter
                .u64_counter("tally.throttle.exhausted")
                .with_description("Retry sequences rejected after the retry ceiling")
                .build(),
            requests_succeeded: meter
                .u64_counter("tally.queue.requests.succeeded")
                .with_description("Queued requests completed successfully")
                .build(),
            requests_failed: meter
                .u64_counter("tally.queue.requests.failed")
                .with_description("Queued requests dropped after a permanent failure")
                .build(),
            queue_depth: meter
                .u64_gauge("tally.queue.depth")
                .with_description("Requests waiting in the sequential queue")
                .build(),
            derived_recomputes: meter
                .u64_counter("tally.derived.recomputes")
                .with_description("Derived value computations by key and mode")
                .build(),
        }
    }

    pub fn record_retry(&self, throttle: &str) {
        self.throttle_retries
            .add(1, &[KeyValue::new("throttle", throttle.to_string())]);
    }

    pub fn record_exhausted(&self, throttle: &str) {
        self.throttle_exhausted
            .add(1, &[KeyValue::new("throttle", throttle.to_string())]);
    }

    pub fn record_request_succeeded(&self, command: &str) {
        self.requests_succeeded
            .add(1, &[KeyValue::new("command", command.to_string())]);
    }

    pub fn record_request_failed(&self, command: &str) {
        self.requests_failed
            .add(1, &[KeyValue::new("command", command.to_string())]);
    }

    pub fn set_queue_depth(&self, queue: &str, depth: u64) {
        self.queue_depth
            .record(depth, &[KeyValue::new("queue", queue.to_string())]);
    }

    /// `delta` is true when the computation ran with source values.
    pub fn record_recompute(&self, key: &str, delta: bool) {
        let mode = if delta { "delta" } else { "full" };
        self.derived_recomputes.add(
            1,
            &[
                KeyValue::new("key", key.to_string()),
                KeyValue::new("mode", mode),
            ],
        );
    }
}

/// In-memory exporter wiring for asserting recorded metrics in tests.
#[cfg(test)]
pub mod test_harness {
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::metrics::data::{AggregatedMetrics, MetricData, ResourceMetrics};
    use opentelemetry_sdk::metrics::{InMemoryMetricExporter, PeriodicReader, SdkMeterProvider};

    use super::Metrics;

    pub struct MetricTestHarness {
        pub metrics: Metrics,
        pub exporter: InMemoryMetricExporter,
        pub meter_provider: SdkMeterProvider,
    }

    impl Default for MetricTestHarness {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MetricTestHarness {
        pub fn new() -> Self {
            let exporter = InMemoryMetricExporter::default();
            let reader = PeriodicReader::builder(exporter.clone()).build();
            let meter_provider = SdkMeterProvider::builder().with_reader(reader).build();
            let meter = meter_provider.meter("tally-test");
            let metrics = Metrics::from_meter(&meter);
            Self {
                metrics,
                exporter,
                meter_provider,
            }
        }

        fn finished_metrics(&self) -> Vec<ResourceMetrics> {
            self.meter_provider.force_flush().expect("flush failed");
            self.exporter
                .get_finished_metrics()
                .expect("failed to get finished metrics")
        }

        /// Assert a u64 counter matching all `attrs` has the expected value.
        pub fn assert_counter(&self, name: &str, attrs: &[KeyValue], expected: u64) {
            let metrics = self.finished_metrics();
            let value = u64_value(&metrics, name, attrs);
            assert_eq!(
                value,
                Some(expected),
                "expected counter {name}{attrs:?} = {expected}, got {value:?}"
            );
        }

        /// Assert a u64 gauge matching all `attrs` has the expected value.
        pub fn assert_gauge(&self, name: &str, attrs: &[KeyValue], expected: u64) {
            self.assert_counter(name, attrs, expected);
        }
    }

    fn u64_value(
        resource_metrics: &[ResourceMetrics],
        name: &str,
        expected_attrs: &[KeyValue],
    ) -> Option<u64> {
        let mut found = None;
        for rm in resource_metrics {
            for sm in rm.scope_metrics() {
                for metric in sm.metrics() {
                    if metric.name() != name {
                        continue;
                    }
                    let matches = |attrs: Vec<KeyValue>| {
                        expected_attrs.iter().all(|expected| attrs.contains(expected))
                    };
                    match metric.data() {
                        AggregatedMetrics::U64(MetricData::Sum(sum)) => {
                            for dp in sum.data_points() {
                                if matches(dp.attributes().cloned().collect()) {
                                    found = Some(dp.value());
                                }
                            }
                        }
                        AggregatedMetrics::U64(MetricData::Gauge(gauge)) => {
                            for dp in gauge.data_points() {
                                if matches(dp.attributes().cloned().collect()) {
                                    found = Some(dp.value());
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        found
    }
}
