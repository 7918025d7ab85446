use std::time::Duration;

use crate::registry::ConfigError;

/// Retry policy attached to a handler: after a failure the task is
/// re-dispatched every `interval` while the failure streak is younger than
/// `window`; past the window the task transitions to `fallback_status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub window: Duration,
    pub fallback_status: String,
}

impl RetryPolicy {
    /// Parse a spec like `"every 2m during 10m"`. Units are `s`, `m`, `h`.
    pub fn parse(spec: &str, fallback_status: impl Into<String>) -> Result<Self, ConfigError> {
        let mut words = spec.split_whitespace();
        let parsed = match (
            words.next(),
            words.next(),
            words.next(),
            words.next(),
            words.next(),
        ) {
            (Some("every"), Some(interval), Some("during"), Some(window), None) => Some(Self {
                interval: parse_duration(spec, interval)?,
                window: parse_duration(spec, window)?,
                fallback_status: fallback_status.into(),
            }),
            _ => None,
        };
        parsed.ok_or_else(|| ConfigError::InvalidRetrySpec {
            spec: spec.to_string(),
            reason: "expected \"every <duration> during <duration>\"".to_string(),
        })
    }
}

fn parse_duration(spec: &str, word: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidRetrySpec {
        spec: spec.to_string(),
        reason,
    };

    let Some(unit) = word.chars().last() else {
        return Err(invalid("empty duration".to_string()));
    };
    let value = &word[..word.len() - unit.len_utf8()];
    let value: u32 = value
        .parse()
        .map_err(|_| invalid(format!("'{word}' is not <integer><unit>")))?;

    let seconds = match unit {
        's' => u64::from(value),
        'm' => u64::from(value) * 60,
        'h' => u64::from(value) * 3600,
        other => return Err(invalid(format!("unknown unit '{other}' in '{word}'"))),
    };
    Ok(Duration::from_secs(seconds))
}
