//! Common helper functions for Anaglyph.

use std::time::Duration;

/// Reads a boolean flag from the environment.
///
/// `1`, `true`, `yes` and `on` (any case) are truthy; any other value is false.
/// Falls back to `default` when the variable is unset.
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => parse_bool(&value),
        Err(_) => default,
    }
}

/// Reads a millisecond duration from the environment.
///
/// Unset or unparsable values fall back to `default`.
pub fn env_duration_ms(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_truthy() {
        assert!(parse_bool("1"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool(" yes "));
        assert!(parse_bool("On"));
    }

    #[test]
    fn test_parse_bool_falsy() {
        assert!(!parse_bool("0"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool(""));
        assert!(!parse_bool("enabled"));
    }

    #[test]
    fn test_env_defaults_when_unset() {
        assert!(env_bool("ANAGLYPH_TEST_UNSET_FLAG_91F2", true));
        assert!(!env_bool("ANAGLYPH_TEST_UNSET_FLAG_91F2", false));
        assert_eq!(
            env_duration_ms("ANAGLYPH_TEST_UNSET_DURATION_91F2", Duration::from_secs(3)),
            Duration::from_secs(3)
        );
    }
}
