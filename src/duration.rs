//! Human-readable duration strings.
//!
//! Accepts an integer followed by optional whitespace and a single unit
//! letter (`s`, `m`, `h` or `d`, case-insensitive), e.g. `"60s"` or `"5 m"`.

use crate::error::ConfigError;

const SECOND_MS: u64 = 1000;
const MINUTE_MS: u64 = 60 * SECOND_MS;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

/// Longest span a limiter accepts. Leaves headroom for `now + 2 * span`.
pub(crate) const MAX_SPAN_MS: u64 = u64::MAX / 4;

/// Parse a duration string into milliseconds.
pub fn parse_duration_ms(input: &str) -> Result<u64, ConfigError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Missing);
    }

    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, rest) = trimmed.split_at(digits_end);
    let unit = rest.trim_start();

    let mut unit_chars = unit.chars();
    let (Some(letter), None) = (unit_chars.next(), unit_chars.next()) else {
        return Err(ConfigError::InvalidFormat(input.to_string()));
    };
    if digits.is_empty() || !letter.is_ascii_alphabetic() {
        return Err(ConfigError::InvalidFormat(input.to_string()));
    }

    let multiplier = match letter.to_ascii_lowercase() {
        's' => SECOND_MS,
        'm' => MINUTE_MS,
        'h' => HOUR_MS,
        'd' => DAY_MS,
        other => return Err(ConfigError::UnsupportedUnit(other.to_string())),
    };

    digits
        .parse::<u64>()
        .ok()
        .and_then(|value| value.checked_mul(multiplier))
        .ok_or_else(|| ConfigError::InvalidFormat(input.to_string()))
}

/// Parse a duration string that must describe a non-empty, bounded span.
pub(crate) fn parse_positive_ms(field: &'static str, input: &str) -> Result<u64, ConfigError> {
    match parse_duration_ms(input)? {
        0 => Err(ConfigError::InvalidValue {
            field,
            reason: "duration must be greater than zero".to_string(),
        }),
        ms if ms > MAX_SPAN_MS => Err(ConfigError::InvalidValue {
            field,
            reason: format!("duration must not exceed {MAX_SPAN_MS}ms"),
        }),
        ms => Ok(ms),
    }
}
