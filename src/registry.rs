use crate::{
    aggregator::{Aggregator, FlushPolicy},
    events::{AggregationKind, MetricKey, Tags},
    schedule::Schedule,
};
use dashmap::{DashMap, mapref::entry::Entry};
use std::sync::Arc;

/// Maps each metric identity to its single live aggregator.
#[derive(Debug)]
pub struct Registry {
    defaults: Arc<Tags>,
    aggregators: DashMap<MetricKey, Arc<Aggregator>>,
}

impl Registry {
    pub fn new(defaults: Arc<Tags>) -> Self {
        Self {
            defaults,
            aggregators: DashMap::new(),
        }
    }

    /// Returns the aggregator for `key`, creating it on first use.
    ///
    /// The first caller for an identity decides its kind, schedule and
    /// policy; later callers get that same aggregator whatever they asked
    /// for. The flag is `true` only for the call that created it.
    pub fn get_or_create(
        &self,
        key: MetricKey,
        kind: AggregationKind,
        schedule: Schedule,
        policy: FlushPolicy,
    ) -> (Arc<Aggregator>, bool) {
        if let Some(existing) = self.aggregators.get(&key) {
            return (Arc::clone(existing.value()), false);
        }

        match self.aggregators.entry(key) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                log::debug!("registering aggregator for {} ({kind})", entry.key());
                let aggregator = Arc::new(Aggregator::new(
                    entry.key().clone(),
                    kind,
                    schedule,
                    policy,
                    &self.defaults,
                ));
                entry.insert(Arc::clone(&aggregator));
                (aggregator, true)
            }
        }
    }

    pub fn get(&self, key: &MetricKey) -> Option<Arc<Aggregator>> {
        self.aggregators.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every registered aggregator.
    pub fn aggregators(&self) -> Vec<Arc<Aggregator>> {
        self.aggregators
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.aggregators.len()
    }
}
