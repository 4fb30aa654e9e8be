use crate::{
    aggregator::FlushPolicy,
    engine::StatsSink,
    error::MetricsError,
    events::{AggregationKind, Tags},
};
use dashmap::DashMap;
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

const DEFAULT_SCHEDULE: &str = "@every 1m";

#[derive(Clone)]
struct Sink {
    inner: Arc<dyn StatsSink>,
    schedule: Arc<str>,
}

impl Sink {
    fn record(&self, key: &metrics::Key, kind: AggregationKind, value: f64) {
        let tags = key
            .labels()
            .map(|label| (label.key().to_owned(), label.value().to_owned()))
            .collect::<Tags>();
        if let Err(e) = self.inner.record_value(
            key.name(),
            &tags,
            kind,
            &self.schedule,
            FlushPolicy::WINDOWED,
            value,
        ) {
            log::trace!("dropping {} sample: {e}", key.name());
        }
    }
}

/// Running total of one counter, shared by every handle registered for it.
struct Counter {
    key: metrics::Key,
    sink: Sink,
    total: Arc<Mutex<u64>>,
}

impl Counter {
    /// Applies `change` and records the resulting total while still holding
    /// the lock, so concurrent updates are recorded in order.
    #[allow(clippy::cast_precision_loss)]
    fn update(&self, change: impl FnOnce(u64) -> u64) {
        let mut total = self.total.lock().unwrap_or_else(PoisonError::into_inner);
        *total = change(*total);
        self.sink.record(&self.key, AggregationKind::Last, *total as f64);
    }
}

impl metrics::CounterFn for Counter {
    fn increment(&self, value: u64) {
        self.update(|total| total.saturating_add(value));
    }

    fn absolute(&self, value: u64) {
        self.update(|total| total.max(value));
    }
}

/// Current value of one gauge, shared by every handle registered for it.
struct Gauge {
    key: metrics::Key,
    sink: Sink,
    current: Arc<Mutex<f64>>,
}

impl Gauge {
    fn update(&self, change: impl FnOnce(f64) -> f64) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *current = change(*current);
        self.sink.record(&self.key, AggregationKind::Last, *current);
    }
}

impl metrics::GaugeFn for Gauge {
    fn increment(&self, value: f64) {
        self.update(|current| current + value);
    }

    fn decrement(&self, value: f64) {
        self.update(|current| current - value);
    }

    fn set(&self, value: f64) {
        self.update(|_| value);
    }
}

struct Histogram {
    key: metrics::Key,
    sink: Sink,
}

impl metrics::HistogramFn for Histogram {
    fn record(&self, value: f64) {
        self.sink.record(&self.key, AggregationKind::Average, value);
    }
}

/// A [`metrics::Recorder`] feeding a [`StatsSink`].
///
/// Lets code instrumented with the `metrics` macros ship through the
/// engine. Every metric is aggregated per window on one schedule. Counters
/// and gauges keep their current value here and report it as `last` on
/// every change; histograms are averaged. Metric labels become point tags.
#[derive(Clone)]
pub struct StatsRecorder {
    sink: Sink,
    counters: Arc<DashMap<metrics::Key, Arc<Mutex<u64>>>>,
    gauges: Arc<DashMap<metrics::Key, Arc<Mutex<f64>>>>,
}

impl fmt::Debug for StatsRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsRecorder")
            .field("schedule", &self.sink.schedule)
            .finish_non_exhaustive()
    }
}

impl StatsRecorder {
    pub fn new(sink: Arc<dyn StatsSink>) -> Self {
        Self {
            sink: Sink {
                inner: sink,
                schedule: DEFAULT_SCHEDULE.into(),
            },
            counters: Arc::default(),
            gauges: Arc::default(),
        }
    }

    /// Sets the flush schedule used for every metric.
    ///
    /// # Errors
    /// Returns [`MetricsError::Schedule`] when `schedule` is malformed.
    pub fn schedule(mut self, schedule: &str) -> Result<Self, MetricsError> {
        schedule.parse::<crate::schedule::Schedule>()?;
        self.sink.schedule = schedule.into();
        Ok(self)
    }

    /// Installs this recorder as the global `metrics` recorder.
    ///
    /// # Example
    /// ```no_run
    /// use metrics_dispatch::{MetricsEngine, Settings, StatsRecorder};
    /// use std::sync::Arc;
    ///
    /// let engine = Arc::new(
    ///     MetricsEngine::new(Settings::new("127.0.0.1", 8123, "udp").tag("ksid", "svc")).unwrap(),
    /// );
    /// if let Err(e) = StatsRecorder::new(engine).install() {
    ///     eprintln!("Failed to set up metrics recorder: {e}");
    /// }
    /// metrics::counter!("jobs.done").increment(1);
    /// ```
    ///
    /// # Errors
    /// Fails when a global recorder is already installed.
    pub fn install(self) -> Result<(), MetricsError> {
        metrics::set_global_recorder(self).map_err(Into::into)
    }
}

impl metrics::Recorder for StatsRecorder {
    fn describe_counter(
        &self,
        _key_name: metrics::KeyName,
        _unit: Option<metrics::Unit>,
        _description: metrics::SharedString,
    ) {
    }

    fn describe_gauge(
        &self,
        _key_name: metrics::KeyName,
        _unit: Option<metrics::Unit>,
        _description: metrics::SharedString,
    ) {
    }

    fn describe_histogram(
        &self,
        _key_name: metrics::KeyName,
        _unit: Option<metrics::Unit>,
        _description: metrics::SharedString,
    ) {
    }

    fn register_counter(
        &self,
        key: &metrics::Key,
        _meta: &metrics::Metadata<'_>,
    ) -> metrics::Counter {
        let total = Arc::clone(self.counters.entry(key.clone()).or_default().value());
        metrics::Counter::from_arc(Arc::new(Counter {
            key: key.clone(),
            sink: self.sink.clone(),
            total,
        }))
    }

    fn register_gauge(&self, key: &metrics::Key, _meta: &metrics::Metadata<'_>) -> metrics::Gauge {
        let current = Arc::clone(self.gauges.entry(key.clone()).or_default().value());
        metrics::Gauge::from_arc(Arc::new(Gauge {
            key: key.clone(),
            sink: self.sink.clone(),
            current,
        }))
    }

    fn register_histogram(
        &self,
        key: &metrics::Key,
        _meta: &metrics::Metadata<'_>,
    ) -> metrics::Histogram {
        metrics::Histogram::from_arc(Arc::new(Histogram {
            key: key.clone(),
            sink: self.sink.clone(),
        }))
    }
}
