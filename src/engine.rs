use crate::{
    aggregator::{Aggregator, FlushPolicy, Schedulable},
    error::MetricsError,
    events::{AggregationKind, Message, MetricKey, Tags},
    monitor::{RUNTIME_TASKS_METRIC, RuntimeMonitor},
    registry::Registry,
    schedule::Schedule,
    scheduler::{Scheduler, SchedulerContext},
    settings::{Config, Settings},
    transport::Transport,
};
use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU8, Ordering},
    },
};
use tokio::{
    runtime::Handle,
    sync::mpsc::{self, Receiver, Sender, error::TrySendError},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// The narrow capability handed to code that records metrics.
pub trait StatsSink: Send + Sync {
    /// Counts one occurrence of `metric`.
    ///
    /// # Errors
    /// Fails when `schedule` is malformed or the sink is closed.
    fn increment(
        &self,
        metric: &str,
        tags: &Tags,
        schedule: &str,
        policy: FlushPolicy,
    ) -> Result<(), MetricsError>;

    /// Records one `value` sample of `metric`, combined according to `kind`.
    ///
    /// # Errors
    /// Fails when `schedule` is malformed or the sink is closed.
    fn record_value(
        &self,
        metric: &str,
        tags: &Tags,
        kind: AggregationKind,
        schedule: &str,
        policy: FlushPolicy,
        value: f64,
    ) -> Result<(), MetricsError>;
}

/// Lifecycle of a [`MetricsEngine`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Unstarted = 0,
    Running = 1,
    Terminated = 2,
}

impl EngineState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unstarted,
            1 => Self::Running,
            _ => Self::Terminated,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unstarted => f.write_str("unstarted"),
            Self::Running => f.write_str("running"),
            Self::Terminated => f.write_str("terminated"),
        }
    }
}

/// Pre-aggregates metrics locally and ships them to the backend.
///
/// Updates are accepted as soon as the engine is built; nothing leaves the
/// process until [`MetricsEngine::start`] runs.
///
/// # Example
/// ```no_run
/// use metrics_dispatch::{FlushPolicy, MetricsEngine, Settings, StatsSink, Tags};
///
/// # async fn run() -> Result<(), metrics_dispatch::MetricsError> {
/// let engine = MetricsEngine::new(
///     Settings::new("127.0.0.1", 8123, "udp").tag("ksid", "my-service"),
/// )?;
/// engine.start()?;
/// engine.increment("request.count", &Tags::new(), "@every 1m", FlushPolicy::WINDOWED)?;
/// engine.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct MetricsEngine {
    config: Config,
    registry: Registry,
    scheduler: Scheduler,
    sender: Sender<Message>,
    pending_start: Mutex<Option<(Transport, Receiver<Message>)>>,
    state: AtomicU8,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl fmt::Debug for MetricsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsEngine")
            .field("address", &self.config.socket_address())
            .field("protocol", &self.config.protocol)
            .field("state", &self.state())
            .field("aggregators", &self.registry.count())
            .field("scheduling", &self.scheduler.is_running())
            .finish_non_exhaustive()
    }
}

impl MetricsEngine {
    /// Validates `settings` and builds an unstarted engine.
    ///
    /// # Errors
    /// Returns [`MetricsError::Configuration`] for invalid settings, see
    /// [`Settings::validate`].
    pub fn new(settings: Settings) -> Result<Self, MetricsError> {
        let config = settings.validate()?;
        let transport = Transport::from_config(&config)?;
        let (sender, receiver) = mpsc::channel(config.channel_capacity);

        Ok(Self {
            registry: Registry::new(Arc::new(config.tags.clone())),
            scheduler: Scheduler::new(),
            sender,
            pending_start: Mutex::new(Some((transport, receiver))),
            state: AtomicU8::new(EngineState::Unstarted as u8),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            config,
        })
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Default tags merged into every point.
    pub const fn default_tags(&self) -> &Tags {
        &self.config.tags
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Number of live aggregators.
    pub fn aggregators(&self) -> usize {
        self.registry.count()
    }

    /// The aggregator bound to `key`, if one was registered.
    pub fn aggregator(&self, key: &MetricKey) -> Option<Arc<Aggregator>> {
        self.registry.get(key)
    }

    /// Starts shipping: the transport loop, the scheduler with every
    /// aggregator registered so far and, when enabled, the runtime monitor.
    ///
    /// Must be called from within a tokio runtime. Does not block.
    ///
    /// # Errors
    /// Fails outside a tokio runtime, on a second call, or once terminated.
    pub fn start(&self) -> Result<(), MetricsError> {
        let runtime = Handle::try_current()?;
        let monitor_schedule = self.config.runtime.map(Schedule::every).transpose()?;
        self.state
            .compare_exchange(
                EngineState::Unstarted as u8,
                EngineState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|current| match EngineState::from_u8(current) {
                EngineState::Terminated => MetricsError::Terminated,
                _ => MetricsError::AlreadyStarted,
            })?;

        let Some((transport, receiver)) = self
            .pending_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Err(MetricsError::AlreadyStarted);
        };

        log::info!(
            "starting metrics engine, shipping to {} over {}",
            self.config.socket_address(),
            self.config.protocol
        );
        self.tracker
            .spawn_on(transport.run(receiver, self.cancel.clone()), &runtime);

        let monitor = monitor_schedule.map(|schedule| {
            let (aggregator, _) = self.registry.get_or_create(
                MetricKey::new(RUNTIME_TASKS_METRIC, Tags::new()),
                AggregationKind::Max,
                schedule,
                FlushPolicy::WINDOWED,
            );
            RuntimeMonitor::new(aggregator, schedule.period())
        });

        self.scheduler.start(
            SchedulerContext {
                runtime: runtime.clone(),
                sender: self.sender.clone(),
                cancel: self.cancel.clone(),
                tracker: self.tracker.clone(),
            },
            || {
                self.registry
                    .aggregators()
                    .into_iter()
                    .map(|aggregator| {
                        let key = aggregator.key().clone();
                        (key, aggregator as Arc<dyn Schedulable>)
                    })
                    .collect::<Vec<_>>()
            },
        );

        if let Some(monitor) = monitor {
            self.tracker
                .spawn_on(monitor.run(self.cancel.clone()), &runtime);
        }
        Ok(())
    }

    /// Stops every background task. Unflushed aggregates and pending
    /// batches are dropped, and later updates fail with
    /// [`MetricsError::Terminated`].
    pub fn terminate(&self) {
        let previous = self
            .state
            .swap(EngineState::Terminated as u8, Ordering::AcqRel);
        if EngineState::from_u8(previous) != EngineState::Terminated {
            log::info!("terminating metrics engine");
        }
        self.cancel.cancel();
        self.tracker.close();
    }

    /// Terminates the engine and waits for its background tasks to exit.
    pub async fn shutdown(&self) {
        self.terminate();
        self.tracker.wait().await;
    }

    fn update(
        &self,
        metric: &str,
        tags: &Tags,
        kind: AggregationKind,
        schedule: &str,
        policy: FlushPolicy,
        value: f64,
    ) -> Result<(), MetricsError> {
        if self.state() == EngineState::Terminated {
            return Err(MetricsError::Terminated);
        }
        let schedule: Schedule = schedule.parse()?;

        let (aggregator, created) = self.registry.get_or_create(
            MetricKey::new(metric, tags.clone()),
            kind,
            schedule,
            policy,
        );
        if created {
            self.schedule(&aggregator);
        }

        if let Some(message) = aggregator.update(value) {
            self.forward(message);
        }
        Ok(())
    }

    fn schedule(&self, aggregator: &Arc<Aggregator>) {
        let key = aggregator.key().clone();
        self.scheduler
            .schedule(key, Arc::clone(aggregator) as Arc<dyn Schedulable>);
    }

    /// Hands a raw point to the transport without waiting.
    fn forward(&self, message: Message) {
        match self.sender.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                log::warn!("message channel full, dropping point {}", message.metric);
            }
            Err(TrySendError::Closed(message)) => {
                log::debug!("message channel closed, dropping point {}", message.metric);
            }
        }
    }
}

impl StatsSink for MetricsEngine {
    fn increment(
        &self,
        metric: &str,
        tags: &Tags,
        schedule: &str,
        policy: FlushPolicy,
    ) -> Result<(), MetricsError> {
        self.update(metric, tags, AggregationKind::Count, schedule, policy, 1.0)
    }

    fn record_value(
        &self,
        metric: &str,
        tags: &Tags,
        kind: AggregationKind,
        schedule: &str,
        policy: FlushPolicy,
        value: f64,
    ) -> Result<(), MetricsError> {
        self.update(metric, tags, kind, schedule, policy, value)
    }
}

impl Drop for MetricsEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
