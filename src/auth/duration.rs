//! Admin duration strings
//!
//! Accepts `<number><unit>` sequences with units `ns`, `us`, `µs`, `ms`, `s`,
//! `m`, `h` (e.g. `"90m"`, `"1h30m"`, `"1.5h"`). A trailing `d` means the
//! preceding number is a count of days: `"7d"` is `168h`.

use super::AuthError;
use std::time::Duration;

const NANOS_PER_DAY: f64 = 86_400.0 * 1e9;

/// Parse an admin-supplied validity duration
pub fn parse_duration(input: &str) -> Result<Duration, AuthError> {
    let s = input.trim();
    let invalid = || AuthError::InvalidDuration(input.to_string());

    if let Some(days) = s.strip_suffix('d') {
        let days: f64 = days.parse().map_err(|_| invalid())?;
        if !days.is_finite() || days < 0.0 || days * NANOS_PER_DAY > u64::MAX as f64 {
            return Err(invalid());
        }
        return Ok(Duration::from_nanos((days * NANOS_PER_DAY) as u64));
    }

    if s.is_empty() {
        return Err(invalid());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if num_end == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..num_end].parse().map_err(|_| invalid())?;
        rest = &rest[num_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_nanos: f64 = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_end..];

        let nanos = value * unit_nanos;
        if !nanos.is_finite() || nanos > u64::MAX as f64 {
            return Err(invalid());
        }
        total = total.checked_add(nanos as u128).ok_or_else(invalid)?;
    }

    let nanos = u64::try_from(total).map_err(|_| invalid())?;
    Ok(Duration::from_nanos(nanos))
}
