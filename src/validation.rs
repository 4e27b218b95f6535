//! # Declaration Validation
//!
//! Parsing and validating duration strings and resource names on declarative
//! input. All of this runs once at load time; a failure here is a
//! [`ConfigurationError`](crate::reconciler::ConfigurationError) and the
//! engine refuses to start.

use anyhow::Result;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<number>\d+)(?P<unit>[smhd])$").expect("duration regex is valid")
});

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9.]*[a-z0-9])?$").expect("name regex is valid")
});

/// Parse a Kubernetes-style duration string into `std::time::Duration`.
/// Supports formats: "30s", "1m", "5m", "1h", "2h", "1d"
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let duration_trimmed = duration_str.trim();

    if duration_trimmed.is_empty() {
        return Err(anyhow::anyhow!("Duration string cannot be empty"));
    }

    let interval_lower = duration_trimmed.to_lowercase();

    let captures = DURATION_RE.captures(&interval_lower).ok_or_else(|| {
        anyhow::anyhow!(
            "Invalid duration format '{}'. Expected format: <number><unit> (e.g., '1m', '5m', '1h')",
            duration_trimmed
        )
    })?;

    let number_str = captures
        .name("number")
        .ok_or_else(|| {
            anyhow::anyhow!("Failed to extract number from duration '{}'", duration_trimmed)
        })?
        .as_str();

    let unit = captures
        .name("unit")
        .ok_or_else(|| {
            anyhow::anyhow!("Failed to extract unit from duration '{}'", duration_trimmed)
        })?
        .as_str();

    let number: u64 = number_str.parse().map_err(|e| {
        anyhow::anyhow!(
            "Invalid duration number '{}' in '{}': {}",
            number_str,
            duration_trimmed,
            e
        )
    })?;

    if number == 0 {
        return Err(anyhow::anyhow!(
            "Duration number must be greater than 0, got '{}'",
            duration_trimmed
        ));
    }

    let seconds = match unit {
        "s" => number,
        "m" => number * 60,
        "h" => number * 3600,
        "d" => number * 86400,
        _ => {
            return Err(anyhow::anyhow!(
                "Invalid unit '{}' in duration '{}'. Expected: s, m, h, or d",
                unit,
                duration_trimmed
            ));
        }
    };

    Ok(Duration::from_secs(seconds))
}

/// Validate a duration string against a minimum value.
///
/// # Arguments
/// * `interval` - The duration string to validate
/// * `field_name` - The name of the field being validated (for error messages)
/// * `min_seconds` - Minimum duration in seconds
pub fn validate_duration_interval(
    interval: &str,
    field_name: &str,
    min_seconds: u64,
) -> Result<()> {
    let interval_trimmed = interval.trim();

    if interval_trimmed.is_empty() {
        return Err(anyhow::anyhow!("{field_name} cannot be empty"));
    }

    let duration = parse_duration(interval_trimmed)?;

    if duration.as_secs() < min_seconds {
        return Err(anyhow::anyhow!(
            "{field_name} '{}' must be at least {} seconds (got {} seconds)",
            interval_trimmed,
            min_seconds,
            duration.as_secs()
        ));
    }

    Ok(())
}

/// Validate a DNS-1123 style resource name (also used for namespaces).
/// Lowercase alphanumerics, '-' and '.', must start and end alphanumeric,
/// at most 253 characters.
pub fn validate_name(name: &str, field_name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow::anyhow!("{field_name} cannot be empty"));
    }

    if name.len() > 253 {
        return Err(anyhow::anyhow!(
            "{field_name} '{}' exceeds 253 characters ({})",
            name,
            name.len()
        ));
    }

    if !NAME_RE.is_match(name) {
        return Err(anyhow::anyhow!(
            "{field_name} '{}' must consist of lowercase alphanumerics, '-' or '.', and start and end with an alphanumeric",
            name
        ));
    }

    Ok(())
}
