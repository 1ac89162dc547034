//! Error types for the coordination layer.
//!
//! # Error Handling Patterns
//!
//! Two patterns apply, based on operation criticality:
//!
//! ## Fail-Fast (Propagate Errors)
//!
//! Used where failure indicates a real coordination problem the caller
//! must react to: region assignment, handoff arbitration, handshake
//! admission. These surface as typed [`ClusterError`] values at the call
//! boundary and are never silently ignored.
//!
//! ## Best-Effort (Log and Continue)
//!
//! Used where partial failure is acceptable: pushing ownership
//! notifications to peers that may have just disconnected, metric
//! updates, broadcast fan-out. These log a warning and continue.
//!
//! No error path terminates the coordinator process. Losing every peer
//! degrades to "no live members," not to a crash.

use thiserror::Error;

use crate::types::{Generation, RegionPos, ServerId};

/// Result type for coordination operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors surfaced by the registry, arbiter, and router.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    /// A live session already exists for the identity. The new connection
    /// is rejected; the existing session is untouched.
    #[error("identity {identity} already has a live session")]
    HandshakeError { identity: ServerId },

    /// The request was issued against an outdated owner. The caller must
    /// re-read the table and retry against the fresh owner.
    #[error("stale ownership for region {region}: expected owner {expected}, found {found}")]
    StaleOwnership {
        region: RegionPos,
        expected: ServerId,
        found: ServerId,
    },

    /// A generation-fenced message referenced an outdated generation.
    #[error("stale generation for region {region}: message has {message}, table has {current}")]
    StaleGeneration {
        region: RegionPos,
        message: Generation,
        current: Generation,
    },

    /// Initial assignment attempted on a region that is not Unassigned.
    /// A logic error by the caller; not retried automatically.
    #[error("region {region} is already assigned to {owner}")]
    AlreadyAssigned { region: RegionPos, owner: ServerId },

    /// A handoff or acknowledgment referenced a region with no current
    /// owner.
    #[error("region {region} has no current owner")]
    NotAssigned { region: RegionPos },

    /// The transfer never committed: the previous owner did not
    /// acknowledge before the deadline (ownership rolled back unchanged)
    /// or was lost mid-transfer. Retryable.
    #[error("handoff for region {region} did not commit")]
    HandoffTimeout { region: RegionPos },

    /// An outbound link exhausted its reconnect budget. A membership
    /// event, not a crash.
    #[error("connection to {identity} permanently lost after {attempts} attempts")]
    PermanentLoss { identity: ServerId, attempts: usize },

    /// The identity is not a live cluster member.
    #[error("{identity} is not a live cluster member")]
    UnknownMember { identity: ServerId },

    /// Promotion was attempted on a region with no placement candidate
    /// (the region is Unassigned, so there is no orphan to promote).
    #[error("region {region} has no placement candidate")]
    NoPlacementCandidate { region: RegionPos },

    /// The arbiter task has shut down and can no longer accept commands.
    #[error("coordinator is shutting down")]
    Shutdown,
}
