use crate::aggregator::Aggregator;
use std::{sync::Arc, time::Duration};
use tokio::{
    runtime::Handle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// Metric carrying the number of live tokio tasks.
pub const RUNTIME_TASKS_METRIC: &str = "runtime.tasks.count";

/// Periodically samples the number of live tasks into a `max` aggregator.
///
/// Samples land halfway through each period so that every flush of the
/// aggregator, which fires on the same period, sees exactly one of them.
#[derive(Debug)]
pub struct RuntimeMonitor {
    aggregator: Arc<Aggregator>,
    period: Duration,
}

impl RuntimeMonitor {
    pub const fn new(aggregator: Arc<Aggregator>, period: Duration) -> Self {
        Self { aggregator, period }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval_at(Instant::now() + self.period / 2, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let tasks = Handle::current().metrics().num_alive_tasks();
                    #[allow(clippy::cast_precision_loss)]
                    self.aggregator.update(tasks as f64);
                }
            }
        }

        log::info!("terminating the runtime loop");
    }
}
