//! Heartbeat-based failure detection for cluster members.
//!
//! Every received frame counts as liveness evidence. A periodic scan
//! compares each session's last-frame timestamp against the heartbeat
//! interval; missing enough beats walks the member through:
//!
//! 1. **Healthy** - frames arriving on time
//! 2. **Suspected** - some beats missed (potential network blip)
//! 3. **Lost** - enough beats missed to declare the member gone
//!
//! The suspicion state reduces false positives from transient jitter.
//! A loss is reported exactly once per session: both the scan and the
//! disconnect path funnel through the same epoch-checked dedup, and a
//! repeat report for the same session inside the cooldown window is
//! suppressed so a flapping connection cannot trigger a reassignment
//! storm.
//!
//! Timing uses `tokio::time::Instant` throughout so the logic can be
//! exercised under paused test time.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::CoordinatorConfig;
use crate::types::{ServerId, SessionEpoch};

/// Configuration for the failure detector.
#[derive(Debug, Clone)]
pub struct FailureDetectorConfig {
    /// How often peers send heartbeats.
    pub heartbeat_interval: Duration,
    /// Missed beats before a member is suspected.
    pub suspicion_threshold: u32,
    /// Missed beats before a member is declared lost.
    pub failure_threshold: u32,
    /// How often to run the check loop.
    pub check_interval: Duration,
    /// Arrival slack before a beat counts as missed.
    pub jitter_tolerance: Duration,
    /// Time after registration before missed beats are counted.
    pub startup_grace: Duration,
    /// Window suppressing duplicate loss reports for one session.
    pub loss_cooldown: Duration,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self::from_coordinator(&CoordinatorConfig::default())
    }
}

impl FailureDetectorConfig {
    /// Derive the detector's knobs from the top-level config.
    pub fn from_coordinator(config: &CoordinatorConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            suspicion_threshold: config.suspicion_threshold,
            failure_threshold: config.failure_threshold,
            check_interval: config.check_interval,
            jitter_tolerance: config.jitter_tolerance,
            startup_grace: config.startup_grace,
            loss_cooldown: config.loss_cooldown,
        }
    }

    /// Time to declare a silent member lost.
    pub fn detection_time(&self) -> Duration {
        self.heartbeat_interval * self.failure_threshold
    }
}

/// Health of a member from the detector's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Suspected,
    Lost,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Suspected => write!(f, "suspected"),
            HealthState::Lost => write!(f, "lost"),
        }
    }
}

#[derive(Debug)]
struct SessionHealth {
    epoch: SessionEpoch,
    last_frame: Instant,
    registered_at: Instant,
    missed_count: u32,
    state: HealthState,
}

impl SessionHealth {
    fn new(epoch: SessionEpoch) -> Self {
        let now = Instant::now();
        Self {
            epoch,
            last_frame: now,
            registered_at: now,
            missed_count: 0,
            state: HealthState::Healthy,
        }
    }
}

/// Emitted when a member is declared lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LossEvent {
    pub identity: ServerId,
    pub epoch: SessionEpoch,
    pub missed_heartbeats: u32,
}

/// Heartbeat liveness monitor over all registered sessions.
pub struct FailureDetector {
    config: FailureDetectorConfig,
    sessions: DashMap<ServerId, SessionHealth>,
    /// Sessions whose loss was already reported, for cooldown dedup.
    recently_lost: DashMap<ServerId, (SessionEpoch, Instant)>,
    losses_detected: AtomicU64,
    false_positives_avoided: AtomicU64,
}

impl FailureDetector {
    pub fn new(config: FailureDetectorConfig) -> Self {
        info!(
            heartbeat_interval_ms = config.heartbeat_interval.as_millis(),
            suspicion_threshold = config.suspicion_threshold,
            failure_threshold = config.failure_threshold,
            detection_time_ms = config.detection_time().as_millis(),
            "Creating failure detector"
        );

        Self {
            config,
            sessions: DashMap::new(),
            recently_lost: DashMap::new(),
            losses_detected: AtomicU64::new(0),
            false_positives_avoided: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(FailureDetectorConfig::default())
    }

    pub fn config(&self) -> &FailureDetectorConfig {
        &self.config
    }

    /// Start tracking a freshly admitted session.
    pub fn register(&self, identity: &ServerId, epoch: SessionEpoch) {
        debug!(%identity, %epoch, "Registering session for failure detection");
        self.sessions
            .insert(identity.clone(), SessionHealth::new(epoch));
    }

    /// Stop tracking a session without reporting a loss (graceful leave).
    ///
    /// Ignored when a newer session has already replaced the epoch.
    pub fn unregister(&self, identity: &ServerId, epoch: SessionEpoch) {
        self.sessions
            .remove_if(identity, |_, health| health.epoch == epoch);
    }

    /// Record a received frame as liveness evidence.
    pub fn record_frame(&self, identity: &ServerId) {
        let now = Instant::now();

        if let Some(mut health) = self.sessions.get_mut(identity) {
            let was_suspected = health.state == HealthState::Suspected;
            health.last_frame = now;
            health.missed_count = 0;
            health.state = HealthState::Healthy;

            if was_suspected {
                debug!(%identity, "Member recovered from suspected state");
                self.false_positives_avoided.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Immediate loss path for a torn-down connection.
    ///
    /// Returns the loss event to deliver, or `None` when the session was
    /// already superseded or its loss was already reported.
    pub fn report_disconnect(&self, identity: &ServerId, epoch: SessionEpoch) -> Option<LossEvent> {
        let removed = self
            .sessions
            .remove_if(identity, |_, health| health.epoch == epoch);
        if removed.is_none() && !self.was_reported(identity, epoch) {
            // Never registered with this epoch; nothing to report.
            return None;
        }
        self.emit_loss(identity, epoch, 0)
    }

    /// Scan all sessions and return members newly declared lost.
    ///
    /// Call periodically (every `check_interval`). Lost sessions are
    /// removed from tracking; delivering the event is the caller's job.
    pub fn check(&self) -> Vec<LossEvent> {
        let now = Instant::now();
        let mut lost = Vec::new();

        for mut entry in self.sessions.iter_mut() {
            let identity = entry.key().clone();
            let health = entry.value_mut();

            // Startup grace period.
            if now.duration_since(health.registered_at) < self.config.startup_grace {
                continue;
            }

            let elapsed = now.duration_since(health.last_frame);
            let effective = elapsed.saturating_sub(self.config.jitter_tolerance);
            let missed = if self.config.heartbeat_interval.as_nanos() > 0 {
                (effective.as_nanos() / self.config.heartbeat_interval.as_nanos()) as u32
            } else {
                0
            };
            health.missed_count = missed;

            let previous = health.state;
            let next = if missed >= self.config.failure_threshold {
                HealthState::Lost
            } else if missed >= self.config.suspicion_threshold {
                HealthState::Suspected
            } else {
                HealthState::Healthy
            };

            if next != previous {
                health.state = next;
                match next {
                    HealthState::Lost => {
                        warn!(
                            identity = %identity,
                            missed_heartbeats = missed,
                            silent_for_ms = elapsed.as_millis(),
                            "Member declared LOST"
                        );
                    }
                    HealthState::Suspected => {
                        info!(
                            identity = %identity,
                            missed_heartbeats = missed,
                            silent_for_ms = elapsed.as_millis(),
                            "Member suspected of failure"
                        );
                    }
                    HealthState::Healthy => {
                        debug!(identity = %identity, "Member returned to healthy state");
                    }
                }
            }

            if health.state == HealthState::Lost {
                lost.push((identity.clone(), health.epoch, missed));
            }
        }

        let mut events = Vec::new();
        for (identity, epoch, missed) in lost {
            self.sessions
                .remove_if(&identity, |_, health| health.epoch == epoch);
            if let Some(event) = self.emit_loss(&identity, epoch, missed) {
                events.push(event);
            }
        }
        events
    }

    fn was_reported(&self, identity: &ServerId, epoch: SessionEpoch) -> bool {
        self.recently_lost
            .get(identity)
            .map(|e| e.value().0 == epoch)
            .unwrap_or(false)
    }

    /// Epoch-checked, cooldown-deduplicated loss emission.
    fn emit_loss(
        &self,
        identity: &ServerId,
        epoch: SessionEpoch,
        missed: u32,
    ) -> Option<LossEvent> {
        let now = Instant::now();

        if let Some(previous) = self.recently_lost.get(identity) {
            let (reported_epoch, reported_at) = *previous.value();
            let within_cooldown = now.duration_since(reported_at) < self.config.loss_cooldown;
            if reported_epoch == epoch && within_cooldown {
                debug!(%identity, %epoch, "Suppressing duplicate loss report");
                return None;
            }
        }

        self.recently_lost.insert(identity.clone(), (epoch, now));
        self.losses_detected.fetch_add(1, Ordering::Relaxed);
        Some(LossEvent {
            identity: identity.clone(),
            epoch,
            missed_heartbeats: missed,
        })
    }

    pub fn state_of(&self, identity: &ServerId) -> Option<HealthState> {
        self.sessions.get(identity).map(|h| h.state)
    }

    pub fn tracked_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn losses_detected(&self) -> u64 {
        self.losses_detected.load(Ordering::Relaxed)
    }

    pub fn false_positives_avoided(&self) -> u64 {
        self.false_positives_avoided.load(Ordering::Relaxed)
    }
}
