//! Timing knobs for the polling loop and the drivers.
//!
//! Defaults match the behaviour of real controller modules; a TOML document
//! only needs to name the values it overrides.
//!
//! ```
//! use usb_register_sync::link::LinkConfig;
//!
//! let config = LinkConfig::from_toml_str("mode_wait_count_max = 8").unwrap();
//! assert_eq!(config.mode_wait_count_max, 8);
//! assert_eq!(config.reset_resend_interval_ms, 100);
//! ```

use core::time::Duration;

use serde::Deserialize;

use crate::link::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Pause between polling cycles, on top of the time the link itself takes.
    pub poll_interval_ms: u64,
    /// Read cycles a mode switch may stay unconfirmed before the mode byte is resent.
    pub mode_wait_count_max: u32,
    /// Resend interval while waiting for an encoder reset to reach zero.
    pub reset_resend_interval_ms: u64,
    /// Freshness window for last-known register caches.
    pub value_freshness_ms: u64,
    /// Simulated time per transaction on a pretend link.
    pub pretend_transaction_delay_us: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 0,
            mode_wait_count_max: 4,
            reset_resend_interval_ms: 100,
            value_freshness_ms: 500,
            pretend_transaction_delay_us: 3_500,
        }
    }
}

impl LinkConfig {
    /// Parses and validates a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: LinkConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode_wait_count_max == 0 {
            return Err(ConfigError::InvalidValue(
                "mode_wait_count_max must be at least 1".into(),
            ));
        }
        if self.reset_resend_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "reset_resend_interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reset_resend_interval(&self) -> Duration {
        Duration::from_millis(self.reset_resend_interval_ms)
    }

    pub fn value_freshness(&self) -> Duration {
        Duration::from_millis(self.value_freshness_ms)
    }

    pub fn pretend_transaction_delay(&self) -> Duration {
        Duration::from_micros(self.pretend_transaction_delay_us)
    }
}
