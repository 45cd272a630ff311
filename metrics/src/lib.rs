use std::time::{Duration, Instant};

use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Counter<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.add(duration.as_secs_f64(), labels);
    }
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the elapsed time into the wrapped metric when dropped.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start(metric: &'a T) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels: &[],
        }
    }

    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<'a, T: TimerUpdate + Sync> Drop for Timer<'a, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

#[derive(Debug)]
pub struct StateStoreMetrics {
    pub state_write: Histogram<f64>,
    pub write_conflicts: Counter<u64>,
    pub state_changes_created: Counter<u64>,
}

impl Default for StateStoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStoreMetrics {
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("state_store");
        let state_write = meter
            .f64_histogram("virtsnap.state_store.write_duration")
            .with_description("state store write latency in seconds")
            .build();
        let write_conflicts = meter
            .u64_counter("virtsnap.state_store.write_conflicts")
            .with_description("number of optimistic-concurrency write conflicts")
            .build();
        let state_changes_created = meter
            .u64_counter("virtsnap.state_store.state_changes")
            .with_description("number of state changes recorded")
            .build();
        Self {
            state_write,
            write_conflicts,
            state_changes_created,
        }
    }
}

pub mod reconciler_metrics {
    use opentelemetry::metrics::{Counter, Histogram};

    #[derive(Debug)]
    pub struct Metrics {
        pub reconcile_duration: Histogram<f64>,
        pub reconcile_errors: Counter<u64>,
        pub resyncs: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("virtsnap-reconcilers");
            let reconcile_duration = meter
                .f64_histogram("virtsnap.reconciler.duration")
                .with_description("duration of a single reconcile pass in seconds")
                .build();
            let reconcile_errors = meter
                .u64_counter("virtsnap.reconciler.errors")
                .with_description("number of reconcile passes that returned an error")
                .build();
            let resyncs = meter
                .u64_counter("virtsnap.reconciler.resyncs")
                .with_description("number of periodic full resyncs")
                .build();
            Metrics {
                reconcile_duration,
                reconcile_errors,
                resyncs,
            }
        }
    }
}
