#![warn(clippy::pedantic, clippy::nursery, clippy::cargo, clippy::perf)]

//! # `metrics_dispatch`
//!
//! Client-side metrics pre-aggregation. Applications record named, tagged
//! measurements; the engine folds them into one aggregator per metric
//! identity, flushes each aggregator on its own `@every` schedule and ships
//! the resulting points to a time-series backend.
//!
//! ## Transports
//!
//! - `udp`: every point is sent as one JSON datagram as soon as it is flushed.
//! - `http`: points are buffered and posted as a JSON array to `/api/put` on
//!   a fixed period; the backend answers `204 No Content` on success.
//!
//! Both deliver at most once. Failed sends are logged and the points dropped.
//!
//! ```no_run
//! use metrics_dispatch::{AggregationKind, FlushPolicy, MetricsEngine, Settings, StatsSink, Tags};
//!
//! # async fn run() -> Result<(), metrics_dispatch::MetricsError> {
//! let engine = MetricsEngine::new(
//!     Settings::new("tsdb.local", 8123, "udp").tag("ksid", "checkout"),
//! )?;
//! engine.start()?;
//!
//! let tags = Tags::from([("method".to_string(), "GET".to_string())]);
//! engine.increment("request.count", &tags, "@every 1m", FlushPolicy::WINDOWED)?;
//! engine.record_value(
//!     "request.duration",
//!     &tags,
//!     AggregationKind::Average,
//!     "@every 1m",
//!     FlushPolicy::WINDOWED,
//!     12.5,
//! )?;
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! A tokio runtime is required to start the engine. Updates themselves are
//! synchronous and never touch the network.

mod aggregator;
mod engine;
mod error;
mod events;
mod monitor;
mod recorder;
mod registry;
mod schedule;
mod scheduler;
mod settings;
mod transport;

pub use aggregator::{Aggregator, FlushPolicy, Schedulable};
pub use engine::{EngineState, MetricsEngine, StatsSink};
pub use error::MetricsError;
pub use events::{AggregationKind, HOST_TAG, IDENTITY_TAG, Message, MetricKey, Tags};
pub use monitor::RUNTIME_TASKS_METRIC;
pub use recorder::StatsRecorder;
pub use schedule::{Schedule, parse_duration};
pub use settings::{Config, HttpConfig, INGEST_PATH, Protocol, Settings};
