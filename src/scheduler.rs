use crate::{
    aggregator::Schedulable,
    events::{Message, MetricKey},
};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{
    runtime::Handle,
    sync::mpsc::Sender,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Everything a running scheduler needs to spawn jobs.
#[derive(Debug, Clone)]
pub struct SchedulerContext {
    pub runtime: Handle,
    pub sender: Sender<Message>,
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
}

#[derive(Debug)]
struct Active {
    context: SchedulerContext,
    scheduled: HashSet<MetricKey>,
}

/// Fires every registered job on its own period.
///
/// Each job gets a dedicated task, so a job never overlaps with itself and
/// jobs never wait on each other. Jobs offered before [`Scheduler::start`]
/// are ignored; the caller seeds them at start.
#[derive(Debug, Default)]
pub struct Scheduler {
    active: Mutex<Option<Active>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the scheduler and spawns the jobs returned by `seed`.
    ///
    /// `seed` runs under the scheduler lock, so a job registered concurrently
    /// is either part of the seed or scheduled right after.
    pub fn start<F, I>(&self, context: SchedulerContext, seed: F)
    where
        F: FnOnce() -> I,
        I: IntoIterator<Item = (MetricKey, Arc<dyn Schedulable>)>,
    {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let active = active.insert(Active {
            context,
            scheduled: HashSet::new(),
        });
        for (key, job) in seed() {
            active.spawn(key, job);
        }
    }

    /// Schedules `job` if the scheduler is running and `key` has no job yet.
    ///
    /// Returns `true` when a new task was spawned.
    pub fn schedule(&self, key: MetricKey, job: Arc<dyn Schedulable>) -> bool {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.as_mut() {
            Some(active) if !active.context.cancel.is_cancelled() => active.spawn(key, job),
            _ => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|active| !active.context.cancel.is_cancelled())
    }
}

impl Active {
    fn spawn(&mut self, key: MetricKey, job: Arc<dyn Schedulable>) -> bool {
        if !self.scheduled.insert(key.clone()) {
            return false;
        }
        log::trace!("scheduling {key} every {:?}", job.period());

        let SchedulerContext {
            runtime,
            sender,
            cancel,
            tracker,
        } = self.context.clone();
        tracker.spawn_on(run_job(job, sender, cancel), &runtime);
        true
    }
}

async fn run_job(job: Arc<dyn Schedulable>, sender: Sender<Message>, cancel: CancellationToken) {
    let period = job.period();
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(message) = job.fire() else {
                    continue;
                };
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    sent = sender.send(message) => {
                        if sent.is_err() {
                            log::debug!("message channel closed, stopping scheduled job");
                            break;
                        }
                    }
                }
            }
        }
    }
}
