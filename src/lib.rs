//! # Gridmaster
//! Master coordinator for region-sharded simulation server clusters.
//!
//! A cluster of independent simulation servers presents one seamless world
//! to players. The world is partitioned into fixed-size regions, and at any
//! instant each assigned region is owned by exactly one live server, which
//! alone may mutate that region's state. Gridmaster is the process that
//! makes this true: it tracks cluster membership, assigns and reassigns
//! region ownership as servers join, leave, or fail, arbitrates ownership
//! handoff when an entity crosses a region boundary, and relays a compact
//! binary protocol between servers so they can coordinate without a full
//! mesh of direct connections.
//!
//! Gridmaster never simulates anything itself. Simulation, world storage,
//! and player-facing proxies are external collaborators that speak the
//! wire protocol in [`protocol`].
//!
//! # Goals
//! - Exactly one owner per region under concurrent joins, leaves, and failures
//! - Atomic ownership handoff with generation fencing against stale writers
//! - Easy to understand code built on [Tokio](https://tokio.rs/) and
//!   [Nom](https://docs.rs/nom/latest/nom/)
//!
//! ## Running a master
//!
//! ```rust,no_run
//! use gridmaster::cluster::CoordinatorConfig;
//! use gridmaster::server::MasterServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = MasterServer::bind("127.0.0.1:35565", CoordinatorConfig::default()).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Assigning regions
//!
//! Initial placement is driven by the embedding process through the
//! arbiter handle; ongoing reassignment (handoff, failover) is automatic.
//!
//! ```rust,no_run
//! use gridmaster::cluster::CoordinatorConfig;
//! use gridmaster::server::MasterServer;
//! use gridmaster::types::{RegionPos, ServerId};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = MasterServer::bind("127.0.0.1:35565", CoordinatorConfig::default()).await?;
//! let arbiter = server.arbiter();
//! arbiter
//!     .assign_initial(RegionPos::new(0, 0), ServerId::from("alpha"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

mod encode;
pub mod error;
mod parser;
pub mod protocol;
pub mod types;

pub mod cluster;
pub mod constants;
pub mod metrics;
pub mod server;
pub mod telemetry;

pub mod prelude {
    //! Main exports for building on the coordinator.

    pub use crate::cluster::{
        ArbiterHandle, ClusterError, ClusterResult, CoordinatorConfig, FailureDetector,
        LeastLoadedPlacement, OwnershipTable, Placement, RegionState, Router,
    };
    pub use crate::error::{Error, FramingError, Result};
    pub use crate::protocol::{Frame, Message, MessageKind};
    pub use crate::server::{ConnectionRegistry, Connector, MasterServer};
    pub use crate::types::{Generation, LoadReport, RegionPos, ServerId, SessionEpoch};
}
