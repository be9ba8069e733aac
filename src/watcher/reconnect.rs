use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay between reconnect attempts.
///
/// Neither strategy has a retry limit: the watcher keeps reconnecting until
/// it is stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Same delay before every attempt.
    Fixed {
        /// Delay (unit: milliseconds)
        #[serde(default = "default_delay_ms")]
        delay_ms: u64,
    },

    /// Delay doubles with each consecutive failure, up to a ceiling.
    Exponential {
        /// First delay (unit: milliseconds)
        #[serde(default = "default_base_delay_ms")]
        base_delay_ms: u64,

        /// Maximum delay (unit: milliseconds)
        #[serde(default = "default_max_delay_ms")]
        max_delay_ms: u64,
    },
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        ReconnectPolicy::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        ReconnectPolicy::Exponential {
            base_delay_ms: base.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based count of consecutive
    /// failures).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            ReconnectPolicy::Exponential {
                base_delay_ms,
                max_delay_ms,
            } => {
                let shift = attempt.saturating_sub(1).min(63);
                let factor = 1u64 << shift;
                Duration::from_millis(base_delay_ms.saturating_mul(factor).min(max_delay_ms))
            }
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed {
            delay_ms: default_delay_ms(),
        }
    }
}

fn default_delay_ms() -> u64 {
    5000
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30000
}
