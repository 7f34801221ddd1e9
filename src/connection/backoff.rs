use crate::config::ReconnectConfig;
use std::time::Duration;

pub const DEFAULT_DELAYS_SECS: [u64; 5] = [1, 3, 5, 8, 30];
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Fixed reconnect schedule. The last delay repeats until the attempt
/// ceiling is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    delays: Vec<Duration>,
    max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_DELAYS_SECS.iter().map(|s| Duration::from_secs(*s)).collect(),
            DEFAULT_MAX_ATTEMPTS,
        )
    }
}

impl ReconnectPolicy {
    pub fn new(delays: Vec<Duration>, max_attempts: u32) -> Self {
        Self {
            delays,
            max_attempts,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            config.delays_secs.iter().map(|s| Duration::from_secs(*s)).collect(),
            config.max_attempts,
        )
    }

    /// Delay before attempt `attempts + 1`, where `attempts` counts reconnects
    /// since the last open. `None` once the ceiling is reached.
    pub fn delay_for(&self, attempts: u32) -> Option<Duration> {
        if attempts >= self.max_attempts {
            return None;
        }
        let last = self.delays.len().checked_sub(1)?;
        let idx = (attempts as usize).min(last);
        self.delays.get(idx).copied()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
