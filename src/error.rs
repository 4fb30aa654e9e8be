use crate::recorder::StatsRecorder;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("invalid schedule expression '{expression}': {reason}")]
    Schedule { expression: String, reason: String },
    #[error("IO error talking to the metrics backend {0}")]
    Io(#[from] std::io::Error),
    #[error("http request to the metrics backend failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("couldnt serialize point: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("no tokio runtime to start the engine on: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),
    #[error("engine has already been started")]
    AlreadyStarted,
    #[error("engine has been terminated")]
    Terminated,
    #[error("failed to set StatsRecorder: {0}")]
    Recorder(#[from] metrics::SetRecorderError<StatsRecorder>),
}

impl MetricsError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }
}
