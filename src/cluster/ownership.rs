//! Region ownership table and state machine.
//!
//! The table is the authoritative partition state: which server owns
//! which region, at which generation. States per region:
//!
//! ```text
//! Unassigned -> Assigned(owner, gen) -> Transferring(from, to, gen) -> Assigned(to, gen+1)
//!                        |                       |
//!                        |                       +--(deadline)--> Assigned(from, gen)
//!                        v
//!                   Orphaned(gen) -> Assigned(new owner, gen+1)
//! ```
//!
//! `Unassigned` is initial; there is no terminal state. Ownership reads
//! always return the pre-transfer owner until an Ack commits, so a
//! handoff is never observable half-applied.
//!
//! # Single-writer discipline
//!
//! The table is backed by a `DashMap` so lookups are served concurrently
//! and never block on a pending handoff. All mutators are `pub(crate)`
//! and called only from the arbiter task; every other component reads.

use dashmap::DashMap;
use tokio::time::Instant;

use super::error::{ClusterError, ClusterResult};
use crate::types::{Generation, RegionPos, ServerId};

/// Current assignment of one region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipRecord {
    pub region: RegionPos,
    pub owner: ServerId,
    pub generation: Generation,
}

/// Lifecycle state of one region.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RegionState {
    /// Never assigned; the initial state of every coordinate.
    #[default]
    Unassigned,

    /// Owned and simulated by `owner`.
    Assigned {
        owner: ServerId,
        generation: Generation,
    },

    /// A handoff is pending: `from` still owns the region until the Ack
    /// commits or the deadline rolls it back.
    Transferring {
        from: ServerId,
        to: ServerId,
        generation: Generation,
        deadline: Instant,
    },

    /// The owner was lost; awaiting reassignment.
    Orphaned {
        generation: Generation,
        last_owner: ServerId,
    },
}

impl RegionState {
    /// The owner an external observer sees right now.
    ///
    /// During a transfer this is the pre-transfer owner; an orphaned or
    /// unassigned region has none.
    pub fn current_owner(&self) -> Option<&ServerId> {
        match self {
            RegionState::Assigned { owner, .. } => Some(owner),
            RegionState::Transferring { from, .. } => Some(from),
            _ => None,
        }
    }

    /// The region's current generation, if it was ever assigned.
    pub fn generation(&self) -> Option<Generation> {
        match self {
            RegionState::Assigned { generation, .. }
            | RegionState::Transferring { generation, .. }
            | RegionState::Orphaned { generation, .. } => Some(*generation),
            RegionState::Unassigned => None,
        }
    }

    fn involves(&self, identity: &ServerId) -> bool {
        match self {
            RegionState::Assigned { owner, .. } => owner == identity,
            RegionState::Transferring { from, to, .. } => from == identity || to == identity,
            _ => false,
        }
    }
}

/// Result of a committed handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTransfer {
    pub region: RegionPos,
    pub from: ServerId,
    pub to: ServerId,
    /// Generation of the new assignment (previous + 1).
    pub generation: Generation,
}

/// The authoritative region -> owner mapping.
#[derive(Debug, Default)]
pub struct OwnershipTable {
    regions: DashMap<RegionPos, RegionState>,
}

impl OwnershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the state of one region. Never blocks on a transfer.
    pub fn lookup(&self, region: RegionPos) -> RegionState {
        self.regions
            .get(&region)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// The externally observable owner of `region`, if any.
    pub fn current_owner(&self, region: RegionPos) -> Option<ServerId> {
        self.regions
            .get(&region)
            .and_then(|s| s.current_owner().cloned())
    }

    /// The region's current generation, if it was ever assigned.
    pub fn generation_of(&self, region: RegionPos) -> Option<Generation> {
        self.regions.get(&region).and_then(|s| s.generation())
    }

    /// Whether a message stamped `generation` is behind the table.
    pub fn is_stale(&self, region: RegionPos, generation: Generation) -> bool {
        match self.generation_of(region) {
            Some(current) => generation < current,
            None => false,
        }
    }

    /// Number of regions currently assigned to (or transferring from)
    /// `identity`.
    pub fn assigned_count(&self, identity: &ServerId) -> usize {
        self.regions
            .iter()
            .filter(|entry| entry.value().current_owner() == Some(identity))
            .count()
    }

    /// All current assignments.
    pub fn records(&self) -> Vec<OwnershipRecord> {
        self.regions
            .iter()
            .filter_map(|entry| {
                let owner = entry.value().current_owner()?.clone();
                let generation = entry.value().generation()?;
                Some(OwnershipRecord {
                    region: *entry.key(),
                    owner,
                    generation,
                })
            })
            .collect()
    }

    /// Regions awaiting reassignment.
    pub fn orphaned_regions(&self) -> Vec<RegionPos> {
        self.regions
            .iter()
            .filter(|entry| matches!(entry.value(), RegionState::Orphaned { .. }))
            .map(|entry| *entry.key())
            .collect()
    }

    /// `Unassigned -> Assigned(owner, 0)`.
    ///
    /// Fails with `AlreadyAssigned` for any other current state; retries
    /// must re-check state first.
    pub(crate) fn assign_initial(
        &self,
        region: RegionPos,
        owner: &ServerId,
    ) -> ClusterResult<Generation> {
        let mut entry = self.regions.entry(region).or_default();
        match entry.value().clone() {
            RegionState::Unassigned => {
                *entry.value_mut() = RegionState::Assigned {
                    owner: owner.clone(),
                    generation: Generation::INITIAL,
                };
                Ok(Generation::INITIAL)
            }
            RegionState::Assigned { owner, .. } | RegionState::Transferring { from: owner, .. } => {
                Err(ClusterError::AlreadyAssigned { region, owner })
            }
            RegionState::Orphaned { last_owner, .. } => Err(ClusterError::AlreadyAssigned {
                region,
                owner: last_owner,
            }),
        }
    }

    /// `Assigned(from, gen) -> Transferring(from, to, gen)`.
    ///
    /// The tie-break for concurrent requests: only the request whose
    /// `from` matches the recorded owner at arbitration time is accepted;
    /// any other fails with `StaleOwnership`.
    pub(crate) fn begin_transfer(
        &self,
        region: RegionPos,
        from: &ServerId,
        to: &ServerId,
        deadline: Instant,
    ) -> ClusterResult<Generation> {
        let mut entry = self
            .regions
            .get_mut(&region)
            .ok_or(ClusterError::NotAssigned { region })?;

        match entry.value().clone() {
            RegionState::Assigned { owner, generation } if owner == *from => {
                *entry.value_mut() = RegionState::Transferring {
                    from: from.clone(),
                    to: to.clone(),
                    generation,
                    deadline,
                };
                Ok(generation)
            }
            other => match other.current_owner() {
                Some(found) => Err(ClusterError::StaleOwnership {
                    region,
                    expected: from.clone(),
                    found: found.clone(),
                }),
                None => Err(ClusterError::NotAssigned { region }),
            },
        }
    }

    /// `Transferring(from, to, gen) + Ack(gen) -> Assigned(to, gen + 1)`.
    ///
    /// The Ack must come from the releasing owner and carry the exact
    /// pre-transfer generation; anything else is stale and rejected.
    pub(crate) fn commit_transfer(
        &self,
        region: RegionPos,
        acker: &ServerId,
        ack_generation: Generation,
    ) -> ClusterResult<CommittedTransfer> {
        let mut entry = self
            .regions
            .get_mut(&region)
            .ok_or(ClusterError::NotAssigned { region })?;

        match entry.value().clone() {
            RegionState::Transferring {
                from,
                to,
                generation,
                ..
            } if from == *acker && generation == ack_generation => {
                let committed = CommittedTransfer {
                    region,
                    from,
                    to,
                    generation: generation.next(),
                };
                *entry.value_mut() = RegionState::Assigned {
                    owner: committed.to.clone(),
                    generation: committed.generation,
                };
                Ok(committed)
            }
            other => Err(ClusterError::StaleGeneration {
                region,
                message: ack_generation,
                current: other.generation().unwrap_or(Generation::INITIAL),
            }),
        }
    }

    /// Roll back every transfer whose deadline has passed.
    ///
    /// Each expired region returns to `Assigned(from, gen)` unchanged, so
    /// rollback is idempotent from an observer's perspective.
    pub(crate) fn rollback_expired(&self, now: Instant) -> Vec<CommittedTransfer> {
        let mut rolled_back = Vec::new();
        for mut entry in self.regions.iter_mut() {
            let expired = match entry.value() {
                RegionState::Transferring {
                    from,
                    to,
                    generation,
                    deadline,
                } if *deadline <= now => Some(CommittedTransfer {
                    region: *entry.key(),
                    from: from.clone(),
                    to: to.clone(),
                    generation: *generation,
                }),
                _ => None,
            };
            if let Some(transfer) = expired {
                *entry.value_mut() = RegionState::Assigned {
                    owner: transfer.from.clone(),
                    generation: transfer.generation,
                };
                rolled_back.push(transfer);
            }
        }
        rolled_back
    }

    /// Orphan every region assigned to `identity` or transferring with it
    /// as either endpoint. Returns the orphaned coordinates.
    pub(crate) fn orphan_member(&self, identity: &ServerId) -> Vec<RegionPos> {
        let mut orphaned = Vec::new();
        for mut entry in self.regions.iter_mut() {
            let state = entry.value().clone();
            if state.involves(identity) {
                let generation = state.generation().unwrap_or(Generation::INITIAL);
                let last_owner = state
                    .current_owner()
                    .cloned()
                    .unwrap_or_else(|| identity.clone());
                orphaned.push(*entry.key());
                *entry.value_mut() = RegionState::Orphaned {
                    generation,
                    last_owner,
                };
            }
        }
        orphaned
    }

    /// `Orphaned(gen) -> Assigned(owner, gen + 1)`.
    ///
    /// The bump fences any message still in flight from the lost owner.
    pub(crate) fn promote_orphan(
        &self,
        region: RegionPos,
        owner: &ServerId,
    ) -> ClusterResult<Generation> {
        let mut entry = self
            .regions
            .get_mut(&region)
            .ok_or(ClusterError::NotAssigned { region })?;

        match entry.value().clone() {
            RegionState::Orphaned { generation, .. } => {
                let generation = generation.next();
                *entry.value_mut() = RegionState::Assigned {
                    owner: owner.clone(),
                    generation,
                };
                Ok(generation)
            }
            RegionState::Assigned { owner, .. } | RegionState::Transferring { from: owner, .. } => {
                Err(ClusterError::AlreadyAssigned { region, owner })
            }
            RegionState::Unassigned => Err(ClusterError::NoPlacementCandidate { region }),
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn test_lookup_defaults_to_unassigned() {
        let table = OwnershipTable::new();
        assert_eq!(table.lookup(RegionPos::new(5, 5)), RegionState::Unassigned);
        assert_eq!(table.current_owner(RegionPos::new(5, 5)), None);
    }

    #[test]
    fn test_transferring_reads_pre_transfer_owner() {
        let table = OwnershipTable::new();
        let region = RegionPos::new(0, 0);
        let alpha = ServerId::from("alpha");
        let beta = ServerId::from("beta");

        table.assign_initial(region, &alpha).unwrap();
        table
            .begin_transfer(region, &alpha, &beta, far_deadline())
            .unwrap();

        assert_eq!(table.current_owner(region), Some(alpha));
    }

    #[test]
    fn test_commit_bumps_generation_by_one() {
        let table = OwnershipTable::new();
        let region = RegionPos::new(2, -1);
        let alpha = ServerId::from("alpha");
        let beta = ServerId::from("beta");

        let initial = table.assign_initial(region, &alpha).unwrap();
        table
            .begin_transfer(region, &alpha, &beta, far_deadline())
            .unwrap();
        let committed = table.commit_transfer(region, &alpha, initial).unwrap();

        assert_eq!(committed.generation, initial.next());
        assert_eq!(table.current_owner(region), Some(beta));
    }

    #[test]
    fn test_stale_ack_rejected_after_commit() {
        let table = OwnershipTable::new();
        let region = RegionPos::new(2, -1);
        let alpha = ServerId::from("alpha");
        let beta = ServerId::from("beta");

        let initial = table.assign_initial(region, &alpha).unwrap();
        table
            .begin_transfer(region, &alpha, &beta, far_deadline())
            .unwrap();
        table.commit_transfer(region, &alpha, initial).unwrap();

        // A duplicate Ack for the old generation must not double-commit.
        let err = table.commit_transfer(region, &alpha, initial).unwrap_err();
        assert!(matches!(err, ClusterError::StaleGeneration { .. }));
    }

    #[test]
    fn test_orphan_covers_transfers_in_flight() {
        let table = OwnershipTable::new();
        let alpha = ServerId::from("alpha");
        let beta = ServerId::from("beta");
        let r1 = RegionPos::new(0, 0);
        let r2 = RegionPos::new(0, 1);

        table.assign_initial(r1, &alpha).unwrap();
        table.assign_initial(r2, &beta).unwrap();
        table
            .begin_transfer(r2, &beta, &alpha, far_deadline())
            .unwrap();

        // Losing alpha orphans both its assignment and the transfer it
        // was the destination of.
        let mut orphaned = table.orphan_member(&alpha);
        orphaned.sort();
        assert_eq!(orphaned, vec![r1, r2]);
    }
}
