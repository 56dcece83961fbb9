use std::time::Duration;
use tlr_core::{Result, TillerError};

/// Timing and channel-sizing parameters for one engine instance.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Follower election threshold T: a follower whose last valid leader
    /// contact is older than this becomes a candidate. The election timer
    /// itself is re-armed with a fresh random duration in [T, 2T).
    pub heartbeat_timeout: Duration,
    /// Leader tick interval H. Must satisfy H <= T / 2.
    pub heartbeat_interval: Duration,
    /// Capacity of the inbound event channel (RPCs, client submits, status).
    pub rpc_channel_capacity: usize,
    /// Capacity of the committed-entry apply stream. The apply loop blocks
    /// when the host falls behind; entries are never skipped or reordered.
    pub apply_channel_capacity: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_millis(150),
            heartbeat_interval: Duration::from_millis(50),
            rpc_channel_capacity: 64,
            apply_channel_capacity: 64,
        }
    }
}

impl RaftConfig {
    /// Validate the configuration before the engine starts.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_timeout.is_zero() {
            return Err(TillerError::Config(
                "heartbeat_timeout must be non-zero".into(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(TillerError::Config(
                "heartbeat_interval must be non-zero".into(),
            ));
        }
        // A leader that ticks slower than half the election threshold risks
        // spurious elections under scheduling jitter.
        if self.heartbeat_interval > self.heartbeat_timeout / 2 {
            return Err(TillerError::Config(format!(
                "heartbeat_interval {:?} must be at most half of heartbeat_timeout {:?}",
                self.heartbeat_interval, self.heartbeat_timeout
            )));
        }
        if self.rpc_channel_capacity == 0 || self.apply_channel_capacity == 0 {
            return Err(TillerError::Config(
                "channel capacities must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
