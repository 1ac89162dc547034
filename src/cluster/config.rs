//! Configuration for the coordinator.
//!
//! Config *files* are the embedding process's concern; this struct is the
//! programmatic surface, with defaults tuned for LAN clusters and
//! environment-variable overrides for the knobs operators actually turn.

use std::time::Duration;

use crate::constants::{
    DEFAULT_CHECK_INTERVAL_MS, DEFAULT_FAILURE_THRESHOLD, DEFAULT_HANDOFF_DEADLINE_MS,
    DEFAULT_HANDOFF_SWEEP_INTERVAL_MS, DEFAULT_HANDSHAKE_TIMEOUT_SECS,
    DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_JITTER_TOLERANCE_MS, DEFAULT_LOSS_COOLDOWN_SECS,
    DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_MAX_TOTAL_CONNECTIONS,
    DEFAULT_OUTBOUND_QUEUE_DEPTH, DEFAULT_RECONNECT_MAX_DELAY_SECS,
    DEFAULT_RECONNECT_MIN_DELAY_MS, DEFAULT_STARTUP_GRACE_SECS, DEFAULT_SUSPICION_THRESHOLD,
    ENV_FAILURE_THRESHOLD, ENV_HANDOFF_DEADLINE_MS, ENV_HEARTBEAT_INTERVAL_MS, ENV_MAX_FRAME_SIZE,
    ENV_MAX_TOTAL_CONNECTIONS,
};

/// Outbound reconnect tuning.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry; doubles per attempt with jitter.
    pub min_delay: Duration,
    /// Ceiling on the backoff.
    pub max_delay: Duration,
    /// Attempts before the link escalates to PermanentLoss.
    pub max_attempts: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(DEFAULT_RECONNECT_MIN_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_RECONNECT_MAX_DELAY_SECS),
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Top-level coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Interval between Heartbeat frames on every live connection.
    pub heartbeat_interval: Duration,
    /// Missed heartbeats before a member is suspected.
    pub suspicion_threshold: u32,
    /// Missed heartbeats before a member is declared lost.
    pub failure_threshold: u32,
    /// Failure-detector scan interval.
    pub check_interval: Duration,
    /// Heartbeat arrival slack before a beat counts as missed.
    pub jitter_tolerance: Duration,
    /// Grace period after registration before missed beats count.
    pub startup_grace: Duration,
    /// Window suppressing repeat loss events for a flapping identity.
    pub loss_cooldown: Duration,
    /// How long the previous owner has to acknowledge a handoff.
    pub handoff_deadline: Duration,
    /// Interval of the arbiter's expired-handoff sweep.
    pub handoff_sweep_interval: Duration,
    /// Maximum accepted frame size, length prefix included.
    pub max_frame_size: usize,
    /// How long a fresh socket has to present its Join frame.
    pub handshake_timeout: Duration,
    /// Depth of each session's outbound frame queue.
    pub outbound_queue_depth: usize,
    /// Maximum simultaneous peer connections (0 = unlimited).
    pub max_total_connections: usize,
    /// Outbound reconnect tuning.
    pub reconnect: ReconnectConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            suspicion_threshold: DEFAULT_SUSPICION_THRESHOLD,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            check_interval: Duration::from_millis(DEFAULT_CHECK_INTERVAL_MS),
            jitter_tolerance: Duration::from_millis(DEFAULT_JITTER_TOLERANCE_MS),
            startup_grace: Duration::from_secs(DEFAULT_STARTUP_GRACE_SECS),
            loss_cooldown: Duration::from_secs(DEFAULT_LOSS_COOLDOWN_SECS),
            handoff_deadline: Duration::from_millis(DEFAULT_HANDOFF_DEADLINE_MS),
            handoff_sweep_interval: Duration::from_millis(DEFAULT_HANDOFF_SWEEP_INTERVAL_MS),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            outbound_queue_depth: DEFAULT_OUTBOUND_QUEUE_DEPTH,
            max_total_connections: DEFAULT_MAX_TOTAL_CONNECTIONS,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Defaults overlaid with environment-variable overrides.
    ///
    /// Unparseable values fall back to the default for that knob.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_parse::<u64>(ENV_HEARTBEAT_INTERVAL_MS) {
            config.heartbeat_interval = Duration::from_millis(ms);
            config.check_interval = config.heartbeat_interval / 2;
        }
        if let Some(threshold) = env_parse::<u32>(ENV_FAILURE_THRESHOLD) {
            config.failure_threshold = threshold;
        }
        if let Some(ms) = env_parse::<u64>(ENV_HANDOFF_DEADLINE_MS) {
            config.handoff_deadline = Duration::from_millis(ms);
        }
        if let Some(size) = env_parse::<usize>(ENV_MAX_FRAME_SIZE) {
            config.max_frame_size = size;
        }
        if let Some(max) = env_parse::<usize>(ENV_MAX_TOTAL_CONNECTIONS) {
            config.max_total_connections = max;
        }

        config
    }

    /// Time with no frames after which a member is declared lost.
    pub fn detection_time(&self) -> Duration {
        self.heartbeat_interval * self.failure_threshold
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_detection_time() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.detection_time(), Duration::from_millis(2_500));
    }
}
