//! Centralized protocol and configuration constants.
//!
//! This module consolidates the magic numbers used throughout the
//! coordinator. Having them in one place makes it easier to:
//!
//! - Understand the protocol constraints
//! - Update values consistently
//! - Document the rationale for each constant
//!
//! # Categories
//!
//! - **Wire Protocol**: frame layout sizes and limits
//! - **Connection**: handshake, heartbeat, and queue tuning
//! - **Coordination**: handoff and failure-detection timing

// =============================================================================
// Wire Protocol
// =============================================================================

/// Size of the u32 length prefix that precedes every frame.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Fixed frame header past the length prefix: kind (u8) + generation (u64).
///
/// The length prefix counts these nine bytes plus the payload.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Default maximum frame size (1 MiB), counted from the length prefix.
///
/// Coordination frames are tiny; application payloads (entity transfers)
/// dominate. Anything larger than this is treated as a corrupt or
/// malicious peer and the connection is closed.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Number of tick-time samples kept in the per-server rolling window.
pub const TICK_WINDOW_SIZE: usize = 60;

// =============================================================================
// Connection
// =============================================================================

/// How long a freshly accepted socket has to present its Join frame.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Interval between Heartbeat frames emitted on every live connection.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 500;

/// Depth of the per-session outbound frame queue.
///
/// A session that cannot drain this many frames is considered stalled and
/// is torn down rather than letting it backpressure the coordinator.
pub const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Maximum simultaneous peer connections (0 = unlimited).
pub const DEFAULT_MAX_TOTAL_CONNECTIONS: usize = 1024;

/// Minimum delay before the first outbound reconnect attempt.
pub const DEFAULT_RECONNECT_MIN_DELAY_MS: u64 = 100;

/// Ceiling on the exponential reconnect backoff.
pub const DEFAULT_RECONNECT_MAX_DELAY_SECS: u64 = 10;

/// Reconnect attempts before a link is declared permanently lost.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: usize = 10;

// =============================================================================
// Coordination
// =============================================================================

/// Missed heartbeats before a member is suspected.
pub const DEFAULT_SUSPICION_THRESHOLD: u32 = 2;

/// Missed heartbeats before a member is declared lost.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Interval of the failure-detector scan loop.
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 250;

/// Heartbeat arrival slack before a beat counts as missed.
pub const DEFAULT_JITTER_TOLERANCE_MS: u64 = 50;

/// Grace period after registration before missed beats are counted.
pub const DEFAULT_STARTUP_GRACE_SECS: u64 = 5;

/// Window in which repeated losses of the same identity are suppressed,
/// so a flapping connection cannot trigger a reassignment storm.
pub const DEFAULT_LOSS_COOLDOWN_SECS: u64 = 30;

/// How long the previous owner has to acknowledge a handoff before the
/// arbiter rolls the region back.
pub const DEFAULT_HANDOFF_DEADLINE_MS: u64 = 5_000;

/// Interval of the arbiter's expired-handoff sweep.
pub const DEFAULT_HANDOFF_SWEEP_INTERVAL_MS: u64 = 100;

// =============================================================================
// Environment variables
// =============================================================================

/// Overrides [`DEFAULT_HEARTBEAT_INTERVAL_MS`].
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "GRIDMASTER_HEARTBEAT_INTERVAL_MS";

/// Overrides [`DEFAULT_FAILURE_THRESHOLD`].
pub const ENV_FAILURE_THRESHOLD: &str = "GRIDMASTER_FAILURE_THRESHOLD";

/// Overrides [`DEFAULT_HANDOFF_DEADLINE_MS`].
pub const ENV_HANDOFF_DEADLINE_MS: &str = "GRIDMASTER_HANDOFF_DEADLINE_MS";

/// Overrides [`DEFAULT_MAX_FRAME_SIZE`].
pub const ENV_MAX_FRAME_SIZE: &str = "GRIDMASTER_MAX_FRAME_SIZE";

/// Overrides [`DEFAULT_MAX_TOTAL_CONNECTIONS`].
pub const ENV_MAX_TOTAL_CONNECTIONS: &str = "GRIDMASTER_MAX_TOTAL_CONNECTIONS";
