//! Parsing of human-readable duration strings such as `"500ms"` or `"1.5 s"`.
//!
//! The broker pushes the rate-limit interval in this form and the
//! configuration accepts it for `stream.skip_interval`.

use std::time::Duration;

use thiserror::Error;

/// Errors produced while parsing a duration string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntervalParseError {
    #[error("interval is empty")]
    Empty,

    #[error("invalid number in interval '{0}'")]
    InvalidNumber(String),

    #[error("unknown unit '{unit}' in interval '{input}'")]
    UnknownUnit { input: String, unit: String },

    #[error("interval '{0}' is negative or too large")]
    OutOfRange(String),
}

/// Parses a duration string: a decimal number followed by a unit.
///
/// Accepted units are `ns`, `us`/`μs`, `ms`, `s`, `min`, `h` and `d` plus the
/// long English forms. A bare `0` is accepted without a unit.
pub fn parse_interval(input: &str) -> Result<Duration, IntervalParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(IntervalParseError::Empty);
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let unit = unit.trim();

    let value: f64 = number
        .parse()
        .map_err(|_| IntervalParseError::InvalidNumber(input.to_string()))?;

    if unit.is_empty() {
        return if value == 0.0 {
            Ok(Duration::ZERO)
        } else {
            Err(IntervalParseError::UnknownUnit {
                input: input.to_string(),
                unit: String::new(),
            })
        };
    }

    let nanos_per_unit: f64 = match unit {
        "ns" | "nanosecond" | "nanoseconds" => 1.0,
        "us" | "μs" | "microsecond" | "microseconds" => 1e3,
        "ms" | "millisecond" | "milliseconds" => 1e6,
        "s" | "sec" | "second" | "seconds" => 1e9,
        "min" | "minute" | "minutes" => 60e9,
        "h" | "hour" | "hours" => 3_600e9,
        "d" | "day" | "days" => 86_400e9,
        other => {
            return Err(IntervalParseError::UnknownUnit {
                input: input.to_string(),
                unit: other.to_string(),
            })
        }
    };

    let nanos = value * nanos_per_unit;
    if !nanos.is_finite() || nanos < 0.0 || nanos > u64::MAX as f64 {
        return Err(IntervalParseError::OutOfRange(input.to_string()));
    }

    Ok(Duration::from_nanos(nanos.round() as u64))
}
