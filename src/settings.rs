use crate::{
    error::MetricsError,
    events::{HOST_TAG, IDENTITY_TAG, Tags},
    schedule::parse_duration,
};
use serde::Deserialize;
use std::{fmt, str::FromStr, time::Duration};

const DEFAULT_CHANNEL_CAPACITY: usize = 512;
const DEFAULT_RUNTIME_INTERVAL: Duration = Duration::from_secs(30);

/// Ingest path the HTTP strategy posts batches to.
pub const INGEST_PATH: &str = "/api/put";

/// How points travel to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// One datagram per point, sent as soon as it is flushed.
    Udp,
    /// Points are buffered and posted as a JSON array on a fixed period.
    Http,
}

impl FromStr for Protocol {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Ok(Self::Udp),
            "http" => Ok(Self::Http),
            _ => Err(MetricsError::config("protocol supported: udp and http")),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => f.write_str("udp"),
            Self::Http => f.write_str("http"),
        }
    }
}

/// Raw engine settings, as read from a config file or built in code.
///
/// Durations are strings like `"5s"` or `"1m30s"`. Nothing is checked until
/// [`Settings::validate`] runs.
///
/// # Example
/// ```
/// use metrics_dispatch::Settings;
/// let config = Settings::new("127.0.0.1", 8123, "udp")
///     .tag("ksid", "my-service")
///     .validate()
///     .unwrap();
/// assert_eq!(config.port, 8123);
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub address: String,
    pub port: u16,
    pub protocol: String,
    pub http_timeout: Option<String>,
    pub http_post_interval: Option<String>,
    pub tags: Tags,
    pub raise_debug_verbosity: bool,
    pub runtime: bool,
    pub runtime_interval: Option<String>,
    pub tls: bool,
    pub insecure_skip_verify: bool,
    pub channel_capacity: Option<usize>,
}

impl Settings {
    pub fn new(address: impl Into<String>, port: u16, protocol: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port,
            protocol: protocol.into(),
            ..Self::default()
        }
    }

    /// Adds a default tag carried by every point.
    #[must_use]
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn http_timeout(mut self, timeout: &str) -> Self {
        self.http_timeout = Some(timeout.to_string());
        self
    }

    #[must_use]
    pub fn http_post_interval(mut self, interval: &str) -> Self {
        self.http_post_interval = Some(interval.to_string());
        self
    }

    #[must_use]
    pub const fn raise_debug_verbosity(mut self, enabled: bool) -> Self {
        self.raise_debug_verbosity = enabled;
        self
    }

    /// Enables the runtime monitor.
    #[must_use]
    pub const fn runtime(mut self, enabled: bool) -> Self {
        self.runtime = enabled;
        self
    }

    #[must_use]
    pub fn runtime_interval(mut self, interval: &str) -> Self {
        self.runtime_interval = Some(interval.to_string());
        self
    }

    /// Posts batches over `https` instead of `http`.
    #[must_use]
    pub const fn tls(mut self, enabled: bool) -> Self {
        self.tls = enabled;
        self
    }

    #[must_use]
    pub const fn insecure_skip_verify(mut self, enabled: bool) -> Self {
        self.insecure_skip_verify = enabled;
        self
    }

    #[must_use]
    pub const fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = Some(capacity);
        self
    }

    /// Checks the settings and resolves them into an immutable [`Config`].
    ///
    /// The local host name is added to the default tags under `host`.
    ///
    /// # Errors
    /// Returns [`MetricsError::Configuration`] when the address, port,
    /// protocol, HTTP durations or the `ksid` tag are missing or invalid, and
    /// [`MetricsError::Io`] when the host name cannot be read.
    pub fn validate(self) -> Result<Config, MetricsError> {
        if self.address.trim().is_empty() {
            return Err(MetricsError::config("address is required"));
        }
        if self.port == 0 {
            return Err(MetricsError::config("port is required"));
        }
        let protocol: Protocol = self.protocol.parse()?;

        let http = match protocol {
            Protocol::Udp => None,
            Protocol::Http => Some(HttpConfig {
                timeout: required_duration("http_timeout", self.http_timeout.as_deref())?,
                post_interval: required_duration(
                    "http_post_interval",
                    self.http_post_interval.as_deref(),
                )?,
                tls: self.tls,
                insecure_skip_verify: self.insecure_skip_verify,
            }),
        };

        if self.tags.get(IDENTITY_TAG).is_none_or(String::is_empty) {
            return Err(MetricsError::config(format!(
                "tag {IDENTITY_TAG} is mandatory"
            )));
        }

        let channel_capacity = self.channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY);
        if channel_capacity == 0 {
            return Err(MetricsError::config("channel_capacity must be positive"));
        }

        let runtime = if self.runtime {
            let interval = match self.runtime_interval.as_deref() {
                Some(raw) => required_duration("runtime_interval", Some(raw))?,
                None => DEFAULT_RUNTIME_INTERVAL,
            };
            Some(interval)
        } else {
            None
        };

        let mut tags = self.tags;
        let host = hostname::get()?;
        tags.insert(HOST_TAG.into(), host.to_string_lossy().into_owned());

        Ok(Config {
            address: self.address,
            port: self.port,
            protocol,
            http,
            tags,
            raise_debug_verbosity: self.raise_debug_verbosity,
            runtime,
            channel_capacity,
        })
    }
}

fn required_duration(name: &str, raw: Option<&str>) -> Result<Duration, MetricsError> {
    let raw = raw.ok_or_else(|| MetricsError::config(format!("{name} is required")))?;
    let duration = parse_duration(raw)
        .map_err(|reason| MetricsError::config(format!("{name}: {reason}")))?;
    if duration.is_zero() {
        return Err(MetricsError::config(format!("{name} must be positive")));
    }
    Ok(duration)
}

/// Validated engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub address: String,
    pub port: u16,
    pub protocol: Protocol,
    /// Present exactly when `protocol` is [`Protocol::Http`].
    pub http: Option<HttpConfig>,
    /// Default tags, including `ksid` and `host`.
    pub tags: Tags,
    pub raise_debug_verbosity: bool,
    /// Runtime monitor period, `None` when the monitor is disabled.
    pub runtime: Option<Duration>,
    pub channel_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub post_interval: Duration,
    pub tls: bool,
    pub insecure_skip_verify: bool,
}

impl Config {
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Full URL of the ingest endpoint.
    pub fn ingest_url(&self) -> String {
        let scheme = match &self.http {
            Some(http) if http.tls => "https",
            _ => "http",
        };
        format!("{scheme}://{}:{}{INGEST_PATH}", self.address, self.port)
    }
}
