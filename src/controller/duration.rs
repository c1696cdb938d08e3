//! # Duration Parsing
//!
//! Parses the Kubernetes duration strings used by credential rotation policies.

use anyhow::Result;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static DURATION_REGEX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(?P<number>\d+)(?P<unit>[smhd])$").ok());

/// Parse a Kubernetes duration string into `std::time::Duration`
///
/// Supports formats: "30s", "1m", "5m", "1h", "720h", "7d".
pub fn parse_kubernetes_duration(duration_str: &str) -> Result<Duration> {
    let duration_trimmed = duration_str.trim();

    if duration_trimmed.is_empty() {
        return Err(anyhow::anyhow!("Duration string cannot be empty"));
    }

    let duration_regex = DURATION_REGEX
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("Failed to compile duration regex"))?;

    let interval_lower = duration_trimmed.to_lowercase();

    let captures = duration_regex.captures(&interval_lower).ok_or_else(|| {
        anyhow::anyhow!(
            "Invalid duration format '{}'. Expected format: <number><unit> (e.g., '30m', '24h', '7d')",
            duration_trimmed
        )
    })?;

    let number: u64 = captures
        .name("number")
        .map(|m| m.as_str())
        .unwrap_or_default()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid duration number in '{}': {}", duration_trimmed, e))?;

    if number == 0 {
        return Err(anyhow::anyhow!(
            "Duration number must be greater than 0, got '{}'",
            duration_trimmed
        ));
    }

    let seconds = match captures.name("unit").map(|m| m.as_str()) {
        Some("s") => number,
        Some("m") => number.saturating_mul(60),
        Some("h") => number.saturating_mul(3600),
        Some("d") => number.saturating_mul(86400),
        other => {
            return Err(anyhow::anyhow!(
                "Invalid unit '{}' in duration '{}'. Expected: s, m, h, or d",
                other.unwrap_or_default(),
                duration_trimmed
            ));
        }
    };

    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(
            parse_kubernetes_duration("30s").unwrap(),
            Duration::from_secs(30)
        );
        assert_eq!(
            parse_kubernetes_duration("5m").unwrap(),
            Duration::from_secs(300)
        );
        assert_eq!(
            parse_kubernetes_duration(" 720H ").unwrap(),
            Duration::from_secs(720 * 3600)
        );
        assert_eq!(
            parse_kubernetes_duration("7d").unwrap(),
            Duration::from_secs(7 * 86400)
        );
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(parse_kubernetes_duration("").is_err());
        assert!(parse_kubernetes_duration("0m").is_err());
        assert!(parse_kubernetes_duration("1w").is_err());
        assert!(parse_kubernetes_duration("1h30m").is_err());
    }
}
