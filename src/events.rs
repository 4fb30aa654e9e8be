use crate::error::MetricsError;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

/// A set of tags attached to a point.
///
/// Ordered so identities compare by value and payloads serialize deterministically.
pub type Tags = BTreeMap<String, String>;

/// Tag every outgoing point must carry; point tags can never override it.
pub const IDENTITY_TAG: &str = "ksid";

/// Tag holding the host name of the reporting process.
pub const HOST_TAG: &str = "host";

/// Identity of one aggregator: a metric name plus its own tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    pub name: String,
    pub tags: Tags,
}

impl MetricKey {
    pub fn new(name: impl Into<String>, tags: Tags) -> Self {
        Self {
            name: name.into(),
            tags,
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (k, v) in &self.tags {
            write!(f, " {k}={v}")?;
        }
        Ok(())
    }
}

/// How repeated samples of one metric combine into the flushed value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AggregationKind {
    /// Number of updates, the sample value is ignored.
    Count,
    Sum,
    /// Arithmetic mean of the samples.
    #[serde(alias = "avg")]
    Average,
    Max,
    Min,
    /// Most recent sample.
    Last,
}

impl AggregationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Average => "average",
            Self::Max => "max",
            Self::Min => "min",
            Self::Last => "last",
        }
    }
}

impl fmt::Display for AggregationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationKind {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "count" => Ok(Self::Count),
            "sum" => Ok(Self::Sum),
            "avg" | "average" => Ok(Self::Average),
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            "last" => Ok(Self::Last),
            other => Err(MetricsError::config(format!(
                "unknown aggregation kind '{other}'"
            ))),
        }
    }
}

/// A finalized point ready to ship to the backend.
///
/// Tags are already merged with the process defaults. The timestamp is in
/// seconds since the unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub metric: String,
    pub tags: Tags,
    pub value: f64,
    pub timestamp: i64,
}

impl Message {
    /// Builds a point stamped with the current time.
    pub fn now(metric: impl Into<String>, tags: Tags, value: f64) -> Self {
        Self {
            metric: metric.into(),
            tags,
            value,
            timestamp: unix_now(),
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

impl TryFrom<&Message> for Vec<u8> {
    type Error = MetricsError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        serde_json::to_vec(message).map_err(MetricsError::from)
    }
}

/// Encodes a batch of points as one JSON array.
pub fn encode_batch(messages: &[Message]) -> Result<Vec<u8>, MetricsError> {
    serde_json::to_vec(messages).map_err(MetricsError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn identity_ignores_tag_insertion_order() {
        let mut first = Tags::new();
        first.insert("b".into(), "2".into());
        first.insert("a".into(), "1".into());
        let second = tags(&[("a", "1"), ("b", "2")]);

        assert_eq!(
            MetricKey::new("request.count", first),
            MetricKey::new("request.count", second)
        );
    }

    #[test]
    fn message_serializes_with_wire_field_names() {
        let message = Message {
            metric: "request.count".into(),
            tags: tags(&[("ksid", "app"), ("host", "web-1")]),
            value: 3.0,
            timestamp: 1_700_000_000,
        };
        let bytes: Vec<u8> = (&message).try_into().unwrap();

        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"metric":"request.count","tags":{"host":"web-1","ksid":"app"},"value":3.0,"timestamp":1700000000}"#
        );
    }

    #[test]
    fn batch_is_a_json_array() {
        let message = Message::now("a", Tags::new(), 1.0);
        let bytes = encode_batch(&[message.clone(), message]).unwrap();
        let decoded: Vec<Message> = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(decoded.len(), 2);
        assert_eq!(encode_batch(&[]).unwrap(), b"[]");
    }

    #[test]
    fn aggregation_kind_parses_aliases() {
        assert_eq!("avg".parse::<AggregationKind>().unwrap(), AggregationKind::Average);
        assert_eq!("MAX".parse::<AggregationKind>().unwrap(), AggregationKind::Max);
        assert!(matches!(
            "median".parse::<AggregationKind>(),
            Err(MetricsError::Configuration(_))
        ));
    }
}
