use crate::error::MetricsError;
use std::{fmt, str::FromStr, time::Duration};

const EVERY_PREFIX: &str = "@every";

/// A fixed-period firing schedule, written as `@every <duration>`.
///
/// Durations use the `1h30m`, `10s`, `500ms` notation. Fractional seconds
/// are truncated and anything shorter than a second fires once a second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Schedule {
    period: Duration,
}

impl Schedule {
    /// A schedule firing every `period`, taken as is.
    ///
    /// # Errors
    /// Fails when `period` is zero.
    pub fn every(period: Duration) -> Result<Self, MetricsError> {
        if period.is_zero() {
            return Err(MetricsError::Schedule {
                expression: format!("{EVERY_PREFIX} 0s"),
                reason: "period must be positive".into(),
            });
        }
        Ok(Self { period })
    }

    pub const fn period(&self) -> Duration {
        self.period
    }
}

impl FromStr for Schedule {
    type Err = MetricsError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| MetricsError::Schedule {
            expression: expression.to_string(),
            reason,
        };

        let rest = expression
            .trim()
            .strip_prefix(EVERY_PREFIX)
            .ok_or_else(|| invalid(format!("expected '{EVERY_PREFIX} <duration>'")))?;
        if !rest.starts_with(char::is_whitespace) {
            return Err(invalid(format!("expected '{EVERY_PREFIX} <duration>'")));
        }

        let period = parse_duration(rest.trim()).map_err(invalid)?;
        if period.is_zero() {
            return Err(invalid("period must be positive".into()));
        }

        let whole = Duration::from_secs(period.as_secs());
        Ok(Self {
            period: whole.max(Duration::from_secs(1)),
        })
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{EVERY_PREFIX} {:?}", self.period)
    }
}

/// Parses a duration such as `300ms`, `1.5h` or `2h45m`.
///
/// # Errors
/// Returns a human readable reason when the input is malformed.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".into());
    }
    if input == "0" {
        return Ok(Duration::ZERO);
    }

    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut rest = input;
    let mut nanos = 0f64;

    while !rest.is_empty() {
        let number_end = rest.find(|c: char| !is_number(c)).unwrap_or(rest.len());
        if number_end == 0 {
            return Err(format!("expected a number in '{input}'"));
        }
        let number: f64 = rest[..number_end]
            .parse()
            .map_err(|_| format!("invalid number '{}' in '{input}'", &rest[..number_end]))?;
        rest = &rest[number_end..];

        let unit_end = rest.find(is_number).unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(format!("missing unit in '{input}'")),
            unit => return Err(format!("unknown unit '{unit}' in '{input}'")),
        };
        rest = &rest[unit_end..];

        nanos += number * scale;
    }

    if !nanos.is_finite() || nanos > u64::MAX as f64 {
        return Err(format!("'{input}' is out of range"));
    }
    Ok(Duration::from_nanos(nanos as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_expressions() {
        let schedule: Schedule = "@every 1m".parse().unwrap();
        assert_eq!(schedule.period(), Duration::from_secs(60));

        let schedule: Schedule = "  @every 1m30s ".parse().unwrap();
        assert_eq!(schedule.period(), Duration::from_secs(90));

        let schedule: Schedule = "@every 10s".parse().unwrap();
        assert_eq!(schedule.period(), Duration::from_secs(10));
    }

    #[test]
    fn sub_second_periods_round_to_whole_seconds() {
        let schedule: Schedule = "@every 200ms".parse().unwrap();
        assert_eq!(schedule.period(), Duration::from_secs(1));

        let schedule: Schedule = "@every 2.7s".parse().unwrap();
        assert_eq!(schedule.period(), Duration::from_secs(2));
    }

    #[test]
    fn rejects_malformed_expressions() {
        for expression in [
            "",
            "1m",
            "@every",
            "@every1m",
            "@every 0s",
            "@every ten seconds",
            "@every 5",
            "@every 5d",
            "* * * * *",
        ] {
            let err = expression.parse::<Schedule>().unwrap_err();
            assert!(
                matches!(err, MetricsError::Schedule { .. }),
                "{expression}: {err}"
            );
        }
    }

    #[test]
    fn every_keeps_sub_second_periods() {
        let schedule = Schedule::every(Duration::from_millis(250)).unwrap();
        assert_eq!(schedule.period(), Duration::from_millis(250));
        assert!(Schedule::every(Duration::ZERO).is_err());
    }

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("2h45m").unwrap(), Duration::from_secs(9900));
        assert_eq!(parse_duration("10us").unwrap(), Duration::from_micros(10));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("1..5s").is_err());
        assert!(parse_duration("s").is_err());
    }
}
