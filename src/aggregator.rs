use crate::{
    events::{AggregationKind, IDENTITY_TAG, Message, MetricKey, Tags},
    schedule::Schedule,
};
use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

/// What happens to an aggregator's state around a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushPolicy {
    /// Clear the accumulated state after each flush. When unset the value
    /// keeps growing across intervals.
    pub reset: bool,
    /// Skip aggregation and emit every sample as its own point.
    pub raw: bool,
}

impl FlushPolicy {
    /// One point per interval, computed from that interval's samples only.
    pub const WINDOWED: Self = Self {
        reset: true,
        raw: false,
    };
    /// One point per interval, computed from every sample seen so far.
    pub const CUMULATIVE: Self = Self {
        reset: false,
        raw: false,
    };
    /// One point per sample.
    pub const RAW: Self = Self {
        reset: false,
        raw: true,
    };
}

/// Something the scheduler fires on a fixed period.
pub trait Schedulable: Send + Sync {
    fn period(&self) -> Duration;

    /// Produces the point to ship for this firing, if any.
    fn fire(&self) -> Option<Message>;
}

#[derive(Debug, Default)]
struct Accumulator {
    value: f64,
    /// Samples folded into `value`.
    samples: u64,
    /// Samples received since the previous flush.
    fresh: u64,
}

impl Accumulator {
    fn add(&mut self, kind: AggregationKind, sample: f64) {
        self.value = match kind {
            AggregationKind::Count => self.value + 1.0,
            AggregationKind::Sum | AggregationKind::Average => self.value + sample,
            AggregationKind::Max if self.samples > 0 => self.value.max(sample),
            AggregationKind::Min if self.samples > 0 => self.value.min(sample),
            AggregationKind::Max | AggregationKind::Min | AggregationKind::Last => sample,
        };
        self.samples += 1;
        self.fresh += 1;
    }

    #[allow(clippy::cast_precision_loss)]
    fn current(&self, kind: AggregationKind) -> f64 {
        match kind {
            AggregationKind::Average => self.value / self.samples as f64,
            _ => self.value,
        }
    }
}

/// Accumulates the samples of one metric identity between flushes.
///
/// Every aggregator owns its lock, so updates to different identities
/// never contend.
#[derive(Debug)]
pub struct Aggregator {
    key: MetricKey,
    kind: AggregationKind,
    schedule: Schedule,
    policy: FlushPolicy,
    /// Default tags merged with the key's tags, computed once.
    tags: Tags,
    state: Mutex<Accumulator>,
}

impl Aggregator {
    pub fn new(
        key: MetricKey,
        kind: AggregationKind,
        schedule: Schedule,
        policy: FlushPolicy,
        defaults: &Tags,
    ) -> Self {
        let mut tags = defaults.clone();
        for (k, v) in &key.tags {
            if k != IDENTITY_TAG {
                tags.insert(k.clone(), v.clone());
            }
        }

        Self {
            key,
            kind,
            schedule,
            policy,
            tags,
            state: Mutex::new(Accumulator::default()),
        }
    }

    pub const fn key(&self) -> &MetricKey {
        &self.key
    }

    pub const fn kind(&self) -> AggregationKind {
        self.kind
    }

    pub const fn schedule(&self) -> Schedule {
        self.schedule
    }

    pub const fn policy(&self) -> FlushPolicy {
        self.policy
    }

    /// Folds `sample` into the state.
    ///
    /// In raw mode nothing accumulates and the sample comes straight back as
    /// a point for the caller to ship.
    pub fn update(&self, sample: f64) -> Option<Message> {
        if self.policy.raw {
            let value = match self.kind {
                AggregationKind::Count => 1.0,
                _ => sample,
            };
            return Some(self.message(value));
        }

        self.lock().add(self.kind, sample);
        None
    }

    /// Computes the point for the interval that just ended.
    ///
    /// Returns `None` when nothing was recorded since the previous flush.
    pub fn flush(&self) -> Option<Message> {
        let value = {
            let mut state = self.lock();
            if state.fresh == 0 {
                return None;
            }
            let value = state.current(self.kind);
            if self.policy.reset {
                *state = Accumulator::default();
            } else {
                state.fresh = 0;
            }
            value
        };

        Some(self.message(value))
    }

    fn message(&self, value: f64) -> Message {
        Message::now(self.key.name.clone(), self.tags.clone(), value)
    }

    fn lock(&self) -> MutexGuard<'_, Accumulator> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Schedulable for Aggregator {
    fn period(&self) -> Duration {
        self.schedule.period()
    }

    fn fire(&self) -> Option<Message> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    fn defaults() -> Tags {
        Tags::from([
            (IDENTITY_TAG.to_string(), "svc".to_string()),
            ("host".to_string(), "web-1".to_string()),
        ])
    }

    fn aggregator(kind: AggregationKind, policy: FlushPolicy) -> Aggregator {
        let tags = Tags::from([("path".to_string(), "/api".to_string())]);
        Aggregator::new(
            MetricKey::new("request.duration", tags),
            kind,
            "@every 1m".parse().unwrap(),
            policy,
            &defaults(),
        )
    }

    fn flushed_value(aggregator: &Aggregator) -> f64 {
        aggregator.flush().expect("a point to flush").value
    }

    #[test]
    fn average_divides_by_sample_count() {
        let agg = aggregator(AggregationKind::Average, FlushPolicy::WINDOWED);
        for sample in [10.0, 20.0, 30.0] {
            assert!(agg.update(sample).is_none());
        }

        assert!((flushed_value(&agg) - 20.0).abs() < f64::EPSILON);
        assert!(agg.flush().is_none());
    }

    #[test]
    fn max_keeps_the_largest_sample() {
        let agg = aggregator(AggregationKind::Max, FlushPolicy::WINDOWED);
        for sample in [5.0, 9.0, 3.0] {
            agg.update(sample);
        }

        assert!((flushed_value(&agg) - 9.0).abs() < f64::EPSILON);
    }

    #[test]
    fn max_and_min_handle_negative_samples() {
        let agg = aggregator(AggregationKind::Max, FlushPolicy::WINDOWED);
        agg.update(-4.0);
        agg.update(-7.0);
        assert!((flushed_value(&agg) + 4.0).abs() < f64::EPSILON);

        let agg = aggregator(AggregationKind::Min, FlushPolicy::WINDOWED);
        agg.update(4.0);
        agg.update(7.0);
        assert!((flushed_value(&agg) - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn count_ignores_the_sample_value() {
        let agg = aggregator(AggregationKind::Count, FlushPolicy::WINDOWED);
        agg.update(100.0);
        agg.update(0.5);

        assert!((flushed_value(&agg) - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn sum_and_last() {
        let agg = aggregator(AggregationKind::Sum, FlushPolicy::WINDOWED);
        agg.update(1.5);
        agg.update(2.5);
        assert!((flushed_value(&agg) - 4.0).abs() < f64::EPSILON);

        let agg = aggregator(AggregationKind::Last, FlushPolicy::WINDOWED);
        agg.update(1.5);
        agg.update(2.5);
        assert!((flushed_value(&agg) - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn cumulative_state_survives_flushes() {
        let agg = aggregator(AggregationKind::Sum, FlushPolicy::CUMULATIVE);
        agg.update(3.0);
        assert!((flushed_value(&agg) - 3.0).abs() < f64::EPSILON);

        assert!(agg.flush().is_none());

        agg.update(4.0);
        assert!((flushed_value(&agg) - 7.0).abs() < f64::EPSILON);
    }

    #[test]
    fn windowed_state_resets_after_flush() {
        let agg = aggregator(AggregationKind::Average, FlushPolicy::WINDOWED);
        agg.update(10.0);
        flushed_value(&agg);

        agg.update(2.0);
        assert!((flushed_value(&agg) - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn raw_mode_emits_every_sample() {
        let agg = aggregator(AggregationKind::Average, FlushPolicy::RAW);

        let first = agg.update(10.0).unwrap();
        let second = agg.update(30.0).unwrap();

        assert!((first.value - 10.0).abs() < f64::EPSILON);
        assert!((second.value - 30.0).abs() < f64::EPSILON);
        assert!(agg.flush().is_none());
    }

    #[test]
    fn flushed_tags_merge_defaults_without_overriding_identity() {
        let tags = Tags::from([
            (IDENTITY_TAG.to_string(), "other".to_string()),
            ("host".to_string(), "override".to_string()),
            ("method".to_string(), "GET".to_string()),
        ]);
        let agg = Aggregator::new(
            MetricKey::new("request.count", tags),
            AggregationKind::Count,
            "@every 1m".parse().unwrap(),
            FlushPolicy::WINDOWED,
            &defaults(),
        );
        agg.update(1.0);
        let message = agg.flush().unwrap();

        assert_eq!(message.metric, "request.count");
        assert_eq!(message.tags[IDENTITY_TAG], "svc");
        assert_eq!(message.tags["host"], "override");
        assert_eq!(message.tags["method"], "GET");
        assert!(message.timestamp > 0);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let agg = Arc::new(aggregator(AggregationKind::Count, FlushPolicy::WINDOWED));

        thread::scope(|scope| {
            for _ in 0..8 {
                let agg = Arc::clone(&agg);
                scope.spawn(move || {
                    for _ in 0..1_000 {
                        agg.update(1.0);
                    }
                });
            }
        });

        assert!((flushed_value(&agg) - 8_000.0).abs() < f64::EPSILON);
        assert!(agg.flush().is_none());
    }

    #[test]
    fn fire_flushes_on_the_schedule_period() {
        let agg = aggregator(AggregationKind::Sum, FlushPolicy::WINDOWED);
        agg.update(2.0);

        assert_eq!(Schedulable::period(&agg), Duration::from_secs(60));
        assert!((agg.fire().unwrap().value - 2.0).abs() < f64::EPSILON);
    }
}
