//! The placement collaborator interface.
//!
//! Placement decides *where* a region should live; the arbiter decides
//! *how* ownership moves there. The arbiter calls into the collaborator
//! during initial assignment of orphaned regions and on member loss, and
//! treats its answer as authoritative.

use std::sync::Arc;

use async_trait::async_trait;

use super::load::LoadTable;
use super::ownership::OwnershipTable;
use crate::types::{RegionPos, ServerId};

/// Chooses an owner for a region from the live candidate set.
#[async_trait]
pub trait Placement: Send + Sync {
    /// Pick an owner for `region` from `candidates`, or `None` when no
    /// candidate is acceptable (the region then stays orphaned until the
    /// next membership change).
    ///
    /// `candidates` is the current live member set, already excluding any
    /// member being removed.
    async fn select_owner(&self, region: RegionPos, candidates: &[ServerId]) -> Option<ServerId>;
}

/// Default placement: pick the member with the lowest average tick time.
///
/// Ties break toward the member owning fewer regions, then toward the
/// lexically smaller identity so the choice is deterministic.
pub struct LeastLoadedPlacement {
    loads: Arc<LoadTable>,
    table: Arc<OwnershipTable>,
}

impl LeastLoadedPlacement {
    pub fn new(loads: Arc<LoadTable>, table: Arc<OwnershipTable>) -> Self {
        Self { loads, table }
    }

    fn score(&self, identity: &ServerId) -> (f64, usize) {
        let tick = self.loads.average_tick_millis(identity).unwrap_or(0.0);
        let owned = self.table.assigned_count(identity);
        (tick, owned)
    }
}

#[async_trait]
impl Placement for LeastLoadedPlacement {
    async fn select_owner(&self, _region: RegionPos, candidates: &[ServerId]) -> Option<ServerId> {
        candidates
            .iter()
            .min_by(|a, b| {
                let (tick_a, owned_a) = self.score(a);
                let (tick_b, owned_b) = self.score(b);
                tick_a
                    .partial_cmp(&tick_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(owned_a.cmp(&owned_b))
                    .then(a.cmp(b))
            })
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LoadReport;

    #[tokio::test]
    async fn test_picks_idle_member() {
        let loads = Arc::new(LoadTable::new());
        let table = Arc::new(OwnershipTable::new());
        let placement = LeastLoadedPlacement::new(loads.clone(), table);

        let busy = ServerId::from("busy");
        let idle = ServerId::from("idle");
        loads.record(&busy, LoadReport::new(48.0, 19.0, 10));
        loads.record(&idle, LoadReport::new(5.0, 20.0, 1));

        let picked = placement
            .select_owner(RegionPos::new(0, 0), &[busy.clone(), idle.clone()])
            .await;
        assert_eq!(picked, Some(idle));
    }

    #[tokio::test]
    async fn test_empty_candidates_yield_none() {
        let loads = Arc::new(LoadTable::new());
        let table = Arc::new(OwnershipTable::new());
        let placement = LeastLoadedPlacement::new(loads, table);

        let picked = placement.select_owner(RegionPos::new(0, 0), &[]).await;
        assert_eq!(picked, None);
    }

    #[tokio::test]
    async fn test_tie_breaks_lexically() {
        let loads = Arc::new(LoadTable::new());
        let table = Arc::new(OwnershipTable::new());
        let placement = LeastLoadedPlacement::new(loads, table);

        let picked = placement
            .select_owner(
                RegionPos::new(0, 0),
                &[ServerId::from("beta"), ServerId::from("alpha")],
            )
            .await;
        assert_eq!(picked, Some(ServerId::from("alpha")));
    }
}
