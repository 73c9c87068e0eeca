//! Go-style duration strings.
//!
//! Pipeline configuration writes intervals and timeouts the way operators
//! are used to typing them: `"30s"`, `"1h30m"`, `"1.5h"`, `"250ms"`. This
//! module parses and renders that syntax.

use std::fmt::Write as _;
use std::time::Duration;

/// Errors produced while parsing a duration string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DurationError {
    /// The string is not a duration at all
    #[error("invalid duration {input:?}")]
    Invalid {
        /// The rejected input
        input: String,
    },

    /// A number was not followed by a unit
    #[error("missing unit in duration {input:?}")]
    MissingUnit {
        /// The rejected input
        input: String,
    },

    /// A unit was not one of `ns`, `us`, `µs`, `ms`, `s`, `m`, `h`
    #[error("unknown unit {unit:?} in duration {input:?}")]
    UnknownUnit {
        /// The unrecognized unit
        unit: String,
        /// The rejected input
        input: String,
    },

    /// The value does not fit in a `Duration`
    #[error("duration {input:?} overflows")]
    Overflow {
        /// The rejected input
        input: String,
    },
}

fn unit_nanos(unit: &str) -> Option<u128> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" | "μs" => Some(1_000),
        "ms" => Some(1_000_000),
        "s" => Some(1_000_000_000),
        "m" => Some(60 * 1_000_000_000),
        "h" => Some(3_600 * 1_000_000_000),
        _ => None,
    }
}

fn split_digits(s: &str) -> (&str, &str) {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(end)
}

/// Parses a Go-style duration such as `"1h30m"` or `"1.5s"`.
///
/// A bare `"0"` is accepted without a unit. Negative durations are
/// rejected.
///
/// # Errors
///
/// Returns a [`DurationError`] describing the first malformed segment.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let trimmed = input.trim();
    let invalid = || DurationError::Invalid {
        input: input.to_string(),
    };
    let overflow = || DurationError::Overflow {
        input: input.to_string(),
    };

    let mut rest = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let (whole, after) = split_digits(rest);
        let (fraction, after) = match after.strip_prefix('.') {
            Some(tail) => split_digits(tail),
            None => ("", after),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }

        let unit_end = after
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after.len());
        let (unit, tail) = after.split_at(unit_end);
        let scale = match unit_nanos(unit) {
            Some(scale) => scale,
            None if unit.is_empty() => {
                return Err(DurationError::MissingUnit {
                    input: input.to_string(),
                });
            }
            None => {
                return Err(DurationError::UnknownUnit {
                    unit: unit.to_string(),
                    input: input.to_string(),
                });
            }
        };

        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| overflow())?
        };
        let mut value = whole.checked_mul(scale).ok_or_else(overflow)?;

        if !fraction.is_empty() {
            // digits past nanosecond precision cannot change the result
            let digits = &fraction[..fraction.len().min(18)];
            let numerator: u128 = digits.parse().map_err(|_| invalid())?;
            let denominator = 10u128.pow(u32::try_from(digits.len()).map_err(|_| invalid())?);
            value = value
                .checked_add(numerator * scale / denominator)
                .ok_or_else(overflow)?;
        }

        total = total.checked_add(value).ok_or_else(overflow)?;
        rest = tail;
    }

    let nanos = u64::try_from(total).map_err(|_| overflow())?;
    Ok(Duration::from_nanos(nanos))
}

/// Renders a duration in the same syntax [`parse_duration`] accepts.
///
/// Whole hours and minutes are always spelled out once a larger unit is
/// present, so one hour renders as `"1h0m0s"`.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let nanos = duration.subsec_nanos();

    if secs == 0 {
        return match nanos {
            0 => "0s".to_string(),
            n if n % 1_000_000 == 0 => format!("{}ms", n / 1_000_000),
            n if n % 1_000 == 0 => format!("{}us", n / 1_000),
            n => format!("{n}ns"),
        };
    }

    let mut out = String::new();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        let _ = write!(out, "{hours}h");
    }
    if hours > 0 || minutes > 0 {
        let _ = write!(out, "{minutes}m");
    }
    if nanos == 0 {
        let _ = write!(out, "{seconds}s");
    } else {
        let fraction = format!("{nanos:09}");
        let _ = write!(out, "{seconds}.{}s", fraction.trim_end_matches('0'));
    }
    out
}

/// Serde adapter for `Duration` fields written as Go-style strings.
///
/// ```rust,ignore
/// #[serde(with = "stepwise_core::duration::go_format")]
/// pub check_interval: Duration,
/// ```
pub mod go_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serializes a duration as a Go-style string
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    /// Deserializes a Go-style duration string
    ///
    /// # Errors
    ///
    /// Fails when the string is not a valid duration.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("0", Duration::ZERO)]
    #[case("30s", Duration::from_secs(30))]
    #[case("1h30m", Duration::from_secs(5400))]
    #[case("1.5h", Duration::from_secs(5400))]
    #[case("250ms", Duration::from_millis(250))]
    #[case("2m3.5s", Duration::from_millis(123_500))]
    #[case("10us", Duration::from_micros(10))]
    #[case("7ns", Duration::from_nanos(7))]
    #[case(" 1m ", Duration::from_secs(60))]
    fn parses_go_durations(#[case] input: &str, #[case] expected: Duration) {
        assert_eq!(parse_duration(input), Ok(expected));
    }

    #[rstest]
    #[case("")]
    #[case("not-a-duration")]
    #[case("-5s")]
    #[case(".s")]
    fn rejects_malformed_input(#[case] input: &str) {
        assert!(parse_duration(input).is_err());
    }

    #[test]
    fn reports_missing_and_unknown_units() {
        assert_eq!(
            parse_duration("10"),
            Err(DurationError::MissingUnit {
                input: "10".to_string()
            })
        );
        assert_eq!(
            parse_duration("3d"),
            Err(DurationError::UnknownUnit {
                unit: "d".to_string(),
                input: "3d".to_string()
            })
        );
    }

    #[rstest]
    #[case(Duration::ZERO, "0s")]
    #[case(Duration::from_millis(1500), "1.5s")]
    #[case(Duration::from_secs(3600), "1h0m0s")]
    #[case(Duration::from_secs(90), "1m30s")]
    #[case(Duration::from_millis(250), "250ms")]
    fn formats_like_go(#[case] duration: Duration, #[case] expected: &str) {
        assert_eq!(format_duration(duration), expected);
        assert_eq!(parse_duration(expected), Ok(duration));
    }
}
