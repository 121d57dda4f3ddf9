//! Common helper functions for Ferry.

use std::time::Duration;

pub fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

pub fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

pub fn env_secs(name: &str, default: Duration) -> Duration {
    Duration::from_secs(env_u64(name, default.as_secs()))
}

pub fn env_millis(name: &str, default: Duration) -> Duration {
    Duration::from_millis(env_u64(name, default.as_millis() as u64))
}

/// Short, log-friendly preview of a session description.
pub fn sdp_preview(sdp: &str) -> String {
    const MAX: usize = 48;
    let first = sdp.lines().next().unwrap_or_default();
    let mut preview: String = first.chars().take(MAX).collect();
    if first.chars().count() > MAX || sdp.lines().nth(1).is_some() {
        preview.push_str("...");
    }
    format!("{preview} ({} bytes)", sdp.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_fallbacks() {
        assert_eq!(env_u64("FERRY_TEST_SURELY_UNSET_U64", 7), 7);
        assert_eq!(env_usize("FERRY_TEST_SURELY_UNSET_USIZE", 9), 9);
        assert_eq!(
            env_secs("FERRY_TEST_SURELY_UNSET_SECS", Duration::from_secs(3)),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_sdp_preview() {
        assert_eq!(sdp_preview("v=0"), "v=0 (3 bytes)");
        assert_eq!(sdp_preview("v=0\r\ns=-\r\n"), "v=0... (10 bytes)");
    }
}
