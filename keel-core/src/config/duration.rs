//! Go-style duration strings (`"300ms"`, `"1h30m"`, `"2h45m10s"`).
//!
//! Used by flag defaults, `ProviderValues::get_duration`, and the scheduler's
//! `@every` descriptor. A bare `"0"` is accepted; any other value needs a unit.

use std::time::Duration;

/// Error raised for a malformed duration string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurationParseError {
    pub input: String,
}

impl std::fmt::Display for DurationParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid duration: {:?}", self.input)
    }
}

impl std::error::Error for DurationParseError {}

/// Parse a duration of the form `[0-9]+(ns|us|µs|ms|s|m|h)`, repeated
/// (`"1h30m"`), with an optional fractional component (`"1.5h"`).
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let err = || DurationParseError {
        input: input.to_string(),
    };
    let s = input.trim();
    if s.is_empty() {
        return Err(err());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_nanos: u128 = 0;
    let mut rest = s;
    let mut matched = false;

    while !rest.is_empty() {
        // number part, with optional fraction
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        let number = &rest[..digits_end];
        if number.is_empty() {
            return Err(err());
        }
        let value: f64 = number.parse().map_err(|_| err())?;
        rest = &rest[digits_end..];

        // unit part
        let unit_nanos: u128 = if let Some(r) = rest.strip_prefix("ns") {
            rest = r;
            1
        } else if let Some(r) = rest.strip_prefix("us") {
            rest = r;
            1_000
        } else if let Some(r) = rest.strip_prefix("µs") {
            rest = r;
            1_000
        } else if let Some(r) = rest.strip_prefix("ms") {
            rest = r;
            1_000_000
        } else if let Some(r) = rest.strip_prefix('s') {
            rest = r;
            1_000_000_000
        } else if let Some(r) = rest.strip_prefix('m') {
            rest = r;
            60 * 1_000_000_000
        } else if let Some(r) = rest.strip_prefix('h') {
            rest = r;
            3_600 * 1_000_000_000
        } else {
            return Err(err());
        };

        total_nanos = total_nanos
            .checked_add((value * unit_nanos as f64) as u128)
            .ok_or_else(err)?;
        matched = true;
    }

    if !matched {
        return Err(err());
    }
    Ok(Duration::new(
        (total_nanos / 1_000_000_000) as u64,
        (total_nanos % 1_000_000_000) as u32,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_units() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("100ns").unwrap(), Duration::from_nanos(100));
    }

    #[test]
    fn compound() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(
            parse_duration("2h45m10s").unwrap(),
            Duration::from_secs(9910)
        );
    }

    #[test]
    fn fractional() {
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("0.5s").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn bare_zero() {
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn rejects_missing_unit() {
        assert!(parse_duration("15").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("10x").is_err());
    }
}
