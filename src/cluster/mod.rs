//! Cluster coordination: membership, ownership, handoff, routing.
//!
//! # Architecture
//!
//! ```text
//!   sim server A ──┐                        ┌── sim server C
//!                  │                        │
//!   sim server B ──┼──► MasterServer ◄──────┘
//!                  │        │
//!          frames  │        ▼
//!                  │   ┌─────────┐   commands   ┌──────────┐
//!                  └──►│ Router  │─────────────►│ Arbiter  │ (single writer)
//!                      └─────────┘              └────┬─────┘
//!                           │  reads                 │ mutates
//!                           ▼                        ▼
//!                      ┌───────────────────────────────┐
//!                      │       OwnershipTable          │
//!                      │  region -> (owner, generation)│
//!                      └───────────────────────────────┘
//! ```
//!
//! Connection tasks decode frames and hand them to the [`Router`]; the
//! router reads the shared tables and submits state-changing commands to
//! the [`Arbiter`] mailbox. The arbiter is the only writer of the
//! [`OwnershipTable`], which is what upholds the global invariant: at
//! every observable instant, at most one live member owns any region.
//!
//! The [`FailureDetector`] turns silence into `MemberLost` commands, and
//! [`Placement`] decides where orphaned regions land next.

mod arbiter;
mod config;
mod error;
pub mod failure_detector;
mod load;
mod ownership;
mod placement;
mod router;

pub use arbiter::{Arbiter, ArbiterHandle};
pub use config::{CoordinatorConfig, ReconnectConfig};
pub use error::{ClusterError, ClusterResult};
pub use failure_detector::{FailureDetector, FailureDetectorConfig, HealthState, LossEvent};
pub use load::{LoadTable, TickWindow};
pub use ownership::{CommittedTransfer, OwnershipRecord, OwnershipTable, RegionState};
pub use placement::{LeastLoadedPlacement, Placement};
pub use router::Router;
