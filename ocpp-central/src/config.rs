//! Configuration for the central system engine
//!
//! Timeouts, frame limits and validation switches shared by the dispatcher
//! and the outbound coordinator.

use std::time::Duration;

/// Complete central system configuration
#[derive(Debug, Clone)]
pub struct CentralConfig {
    /// Default wait for an outbound call's reply
    pub call_timeout: Duration,

    /// Heartbeat interval (seconds) returned in BootNotification replies
    pub heartbeat_interval: i32,

    /// Inbound frames larger than this are dropped undecoded
    pub max_frame_bytes: usize,

    /// Check inbound CALL payloads against the action's request shape
    pub validate_inbound: bool,

    /// Check outbound CALL payloads against the action's request shape
    pub validate_outbound: bool,

    /// Correlation ids generated before giving up on a collision
    pub correlation_attempts: u32,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            heartbeat_interval: 10,
            max_frame_bytes: 64 * 1024,
            validate_inbound: false,
            validate_outbound: true,
            correlation_attempts: 4,
        }
    }
}

impl CentralConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default outbound call timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the heartbeat interval handed to booting charge points
    pub fn with_heartbeat_interval(mut self, seconds: i32) -> Self {
        self.heartbeat_interval = seconds;
        self
    }

    pub fn with_max_frame_bytes(mut self, limit: usize) -> Self {
        self.max_frame_bytes = limit;
        self
    }

    /// Enable request shape checks before inbound handlers run
    pub fn with_inbound_validation(mut self, enabled: bool) -> Self {
        self.validate_inbound = enabled;
        self
    }

    pub fn with_outbound_validation(mut self, enabled: bool) -> Self {
        self.validate_outbound = enabled;
        self
    }

    pub fn with_correlation_attempts(mut self, attempts: u32) -> Self {
        self.correlation_attempts = attempts.max(1);
        self
    }
}
