//! Configuration for the call subsystem.

use std::time::Duration;

/// Tuning for the signaling channel adapter.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Attempts per publish before the failure is surfaced as a channel
    /// error. Minimum 1.
    pub publish_attempts: u32,
    /// Delay between publish attempts.
    pub retry_delay: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            publish_attempts: 3,
            retry_delay: Duration::from_millis(250),
        }
    }
}

/// Configuration for the call manager.
#[derive(Debug, Clone)]
pub struct CallManagerConfig {
    pub signaling: SignalingConfig,
    /// How long after a call terminates its signaling data is deleted. The
    /// grace period lets the slower side observe the terminal status before
    /// the record disappears.
    pub signaling_cleanup_delay: Duration,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            signaling_cleanup_delay: Duration::from_secs(5),
        }
    }
}
