//! Engine timing configuration.

use std::time::Duration;

use padlink_common::helpers::env_u64;

pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(10);
pub const DEFAULT_REGISTER_RETRY: Duration = Duration::from_secs(1);
pub const DEFAULT_LOOKUP_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(16);

/// Lookup polling is kept between these bounds.
const LOOKUP_MIN_SECS: u64 = 2;
const LOOKUP_MAX_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Interval of the `ping` sent on each open channel.
    pub keepalive: Duration,
    /// How often registration re-checks the ready flag.
    pub register_retry: Duration,
    /// Directory polling interval for roles that browse peers.
    pub lookup_interval: Duration,
    /// Input sampling interval while the control relay is enabled.
    pub sample_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            keepalive: DEFAULT_KEEPALIVE,
            register_retry: DEFAULT_REGISTER_RETRY,
            lookup_interval: DEFAULT_LOOKUP_INTERVAL,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `PADLINK_KEEPALIVE_SECS`, `PADLINK_REGISTER_RETRY_MS`,
    /// `PADLINK_LOOKUP_SECS` and `PADLINK_SAMPLE_MS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            keepalive: Duration::from_secs(
                env_u64("PADLINK_KEEPALIVE_SECS", defaults.keepalive.as_secs()).max(1),
            ),
            register_retry: Duration::from_millis(
                env_u64(
                    "PADLINK_REGISTER_RETRY_MS",
                    defaults.register_retry.as_millis() as u64,
                )
                .max(1),
            ),
            lookup_interval: Duration::from_secs(
                env_u64("PADLINK_LOOKUP_SECS", defaults.lookup_interval.as_secs())
                    .clamp(LOOKUP_MIN_SECS, LOOKUP_MAX_SECS),
            ),
            sample_interval: Duration::from_millis(
                env_u64(
                    "PADLINK_SAMPLE_MS",
                    defaults.sample_interval.as_millis() as u64,
                )
                .max(1),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_relay_expectations() {
        let config = EngineConfig::default();
        assert_eq!(config.keepalive, Duration::from_secs(10));
        assert_eq!(config.register_retry, Duration::from_secs(1));
        assert_eq!(config.lookup_interval, Duration::from_secs(3));
        assert_eq!(config.sample_interval, Duration::from_millis(16));
    }

    #[test]
    fn env_overrides_are_bounded() {
        std::env::set_var("PADLINK_LOOKUP_SECS", "30");
        std::env::set_var("PADLINK_SAMPLE_MS", "0");
        std::env::set_var("PADLINK_REGISTER_RETRY_MS", "250");
        let config = EngineConfig::from_env();
        std::env::remove_var("PADLINK_LOOKUP_SECS");
        std::env::remove_var("PADLINK_SAMPLE_MS");
        std::env::remove_var("PADLINK_REGISTER_RETRY_MS");

        assert_eq!(config.lookup_interval, Duration::from_secs(5));
        assert_eq!(config.sample_interval, Duration::from_millis(1));
        assert_eq!(config.register_retry, Duration::from_millis(250));
        assert_eq!(config.keepalive, DEFAULT_KEEPALIVE);
    }
}
