//! The ownership arbiter.
//!
//! The arbiter is the single authority that mutates the ownership table.
//! It runs as one dedicated task; every other component submits commands
//! through its mailbox and awaits a typed reply. This single-writer
//! funnel is what makes the one-owner-per-region invariant hold without
//! torn reads: lookups read the shared table concurrently, mutations are
//! serialized here.
//!
//! Per-region transitions are independent. The arbiter never awaits a
//! peer inside command processing - a handoff's wait-for-Ack is just the
//! region sitting in `Transferring` until the Ack command arrives or the
//! deadline sweep rolls it back - so a pending handoff on region A never
//! delays operations on region B.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::CoordinatorConfig;
use super::error::{ClusterError, ClusterResult};
use super::load::LoadTable;
use super::ownership::OwnershipTable;
use super::placement::Placement;
use crate::metrics;
use crate::protocol::{Frame, Message};
use crate::server::ConnectionRegistry;
use crate::types::{Generation, RegionPos, ServerId, SessionEpoch};

/// Mailbox depth for arbiter commands.
const COMMAND_QUEUE_DEPTH: usize = 1024;

enum Command {
    Admit {
        identity: ServerId,
        reply: oneshot::Sender<ClusterResult<()>>,
    },
    AssignInitial {
        region: RegionPos,
        identity: ServerId,
        reply: oneshot::Sender<ClusterResult<Generation>>,
    },
    RequestHandoff {
        region: RegionPos,
        from: ServerId,
        to: ServerId,
        reply: oneshot::Sender<ClusterResult<Generation>>,
        /// Resolved when the transfer commits or is aborted.
        completion: Option<oneshot::Sender<ClusterResult<Generation>>>,
    },
    HandoffAck {
        region: RegionPos,
        acker: ServerId,
        generation: Generation,
        reply: oneshot::Sender<ClusterResult<Generation>>,
    },
    MemberLost {
        identity: ServerId,
        epoch: SessionEpoch,
    },
    MemberLeft {
        identity: ServerId,
    },
}

/// Cloneable handle submitting commands to the arbiter task.
#[derive(Clone)]
pub struct ArbiterHandle {
    tx: mpsc::Sender<Command>,
}

impl ArbiterHandle {
    async fn submit<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<ClusterResult<T>>) -> Command,
    ) -> ClusterResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| ClusterError::Shutdown)?;
        reply_rx.await.map_err(|_| ClusterError::Shutdown)?
    }

    /// Register a freshly handshaken member and retry any orphans.
    pub async fn admit(&self, identity: ServerId) -> ClusterResult<()> {
        self.submit(|reply| Command::Admit { identity, reply }).await
    }

    /// `Unassigned -> Assigned(identity, 0)`.
    pub async fn assign_initial(
        &self,
        region: RegionPos,
        identity: ServerId,
    ) -> ClusterResult<Generation> {
        self.submit(|reply| Command::AssignInitial {
            region,
            identity,
            reply,
        })
        .await
    }

    /// Begin a handoff; resolves once the transfer is initiated (the
    /// HandoffRequest is on its way to the current owner), not when it
    /// commits. Returns the pre-transfer generation.
    pub async fn request_handoff(
        &self,
        region: RegionPos,
        from: ServerId,
        to: ServerId,
    ) -> ClusterResult<Generation> {
        self.submit(|reply| Command::RequestHandoff {
            region,
            from,
            to,
            reply,
            completion: None,
        })
        .await
    }

    /// Begin a handoff and wait for its outcome.
    ///
    /// Returns the committed generation once the releasing owner acks,
    /// or `HandoffTimeout` when the transfer is rolled back or aborted
    /// by owner loss.
    pub async fn execute_handoff(
        &self,
        region: RegionPos,
        from: ServerId,
        to: ServerId,
    ) -> ClusterResult<Generation> {
        let (completion_tx, completion_rx) = oneshot::channel();
        self.submit(|reply| Command::RequestHandoff {
            region,
            from,
            to,
            reply,
            completion: Some(completion_tx),
        })
        .await?;
        completion_rx.await.map_err(|_| ClusterError::Shutdown)?
    }

    /// Commit a handoff acknowledged by the releasing owner. Returns the
    /// new generation.
    pub async fn handoff_ack(
        &self,
        region: RegionPos,
        acker: ServerId,
        generation: Generation,
    ) -> ClusterResult<Generation> {
        self.submit(|reply| Command::HandoffAck {
            region,
            acker,
            generation,
            reply,
        })
        .await
    }

    /// Deliver a failure-detector loss event. Fire-and-forget.
    pub async fn member_lost(&self, identity: ServerId, epoch: SessionEpoch) {
        let _ = self.tx.send(Command::MemberLost { identity, epoch }).await;
    }

    /// Deliver a graceful departure. Fire-and-forget.
    pub async fn member_left(&self, identity: ServerId) {
        let _ = self.tx.send(Command::MemberLeft { identity }).await;
    }
}

/// The single-writer coordination task.
pub struct Arbiter {
    rx: mpsc::Receiver<Command>,
    table: Arc<OwnershipTable>,
    registry: Arc<ConnectionRegistry>,
    loads: Arc<LoadTable>,
    placement: Arc<dyn Placement>,
    config: CoordinatorConfig,
    /// Waiters from `execute_handoff`, one per in-flight transfer.
    pending: std::collections::HashMap<RegionPos, oneshot::Sender<ClusterResult<Generation>>>,
}

impl Arbiter {
    /// Spawn the arbiter task. The task runs until every handle is
    /// dropped.
    pub fn spawn(
        table: Arc<OwnershipTable>,
        registry: Arc<ConnectionRegistry>,
        loads: Arc<LoadTable>,
        placement: Arc<dyn Placement>,
        config: CoordinatorConfig,
    ) -> (ArbiterHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let arbiter = Arbiter {
            rx,
            table,
            registry,
            loads,
            placement,
            config,
            pending: std::collections::HashMap::new(),
        };
        let task = tokio::spawn(arbiter.run());
        (ArbiterHandle { tx }, task)
    }

    async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.config.handoff_sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        info!("Arbiter mailbox closed, stopping");
                        break;
                    }
                },
                _ = sweep.tick() => self.sweep_deadlines(),
            }
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Admit { identity, reply } => {
                let _ = reply.send(self.admit(identity).await);
            }
            Command::AssignInitial {
                region,
                identity,
                reply,
            } => {
                let _ = reply.send(self.assign_initial(region, identity));
            }
            Command::RequestHandoff {
                region,
                from,
                to,
                reply,
                completion,
            } => {
                let result = self.request_handoff(region, from, to);
                if result.is_ok() {
                    if let Some(completion) = completion {
                        self.pending.insert(region, completion);
                    }
                } else if let (Some(completion), Err(e)) = (completion, &result) {
                    let _ = completion.send(Err(e.clone()));
                }
                let _ = reply.send(result);
            }
            Command::HandoffAck {
                region,
                acker,
                generation,
                reply,
            } => {
                let _ = reply.send(self.commit_handoff(region, acker, generation));
            }
            Command::MemberLost { identity, epoch } => {
                info!(%identity, %epoch, "Member lost, orphaning its regions");
                metrics::MEMBERS_LOST.inc();
                self.reassign_member_regions(&identity).await;
            }
            Command::MemberLeft { identity } => {
                info!(%identity, "Member left gracefully, draining its regions");
                self.reassign_member_regions(&identity).await;
            }
        }
    }

    async fn admit(&mut self, identity: ServerId) -> ClusterResult<()> {
        if !self.registry.contains(&identity) {
            return Err(ClusterError::UnknownMember { identity });
        }
        self.loads.register(&identity);
        info!(%identity, "Member admitted to the cluster");

        // A new member is a fresh placement candidate for anything that
        // could not be reassigned earlier.
        self.retry_orphans().await;
        Ok(())
    }

    fn assign_initial(&mut self, region: RegionPos, identity: ServerId) -> ClusterResult<Generation> {
        if !self.registry.contains(&identity) {
            return Err(ClusterError::UnknownMember { identity });
        }
        let generation = self.table.assign_initial(region, &identity)?;
        info!(%region, owner = %identity, %generation, "Region assigned");
        self.notify_grant(region, &identity, generation);
        Ok(generation)
    }

    fn request_handoff(
        &mut self,
        region: RegionPos,
        from: ServerId,
        to: ServerId,
    ) -> ClusterResult<Generation> {
        if !self.registry.contains(&to) {
            return Err(ClusterError::UnknownMember { identity: to });
        }

        let deadline = Instant::now() + self.config.handoff_deadline;
        let generation = self.table.begin_transfer(region, &from, &to, deadline)?;
        metrics::HANDOFFS.with_label_values(&["requested"]).inc();
        debug!(%region, %from, %to, %generation, "Handoff initiated");

        // The releasing owner must flush region-local effects and Ack
        // before the transfer commits.
        let request = Frame::new(
            generation,
            Message::HandoffRequest {
                region,
                from: from.clone(),
                to,
            },
        );
        if let Err(e) = self.registry.send_to(&from, request) {
            warn!(%region, %from, error = %e, "Failed to deliver HandoffRequest");
        }
        Ok(generation)
    }

    fn commit_handoff(
        &mut self,
        region: RegionPos,
        acker: ServerId,
        generation: Generation,
    ) -> ClusterResult<Generation> {
        match self.table.commit_transfer(region, &acker, generation) {
            Ok(committed) => {
                metrics::HANDOFFS.with_label_values(&["committed"]).inc();
                info!(
                    %region,
                    from = %committed.from,
                    to = %committed.to,
                    generation = %committed.generation,
                    "Handoff committed"
                );
                self.notify_grant(region, &committed.to, committed.generation);
                self.notify_revoke(region, &committed.from, committed.generation);
                if let Some(waiter) = self.pending.remove(&region) {
                    let _ = waiter.send(Ok(committed.generation));
                }
                Ok(committed.generation)
            }
            Err(e) => {
                metrics::HANDOFFS.with_label_values(&["rejected"]).inc();
                Err(e)
            }
        }
    }

    /// Roll back transfers whose Ack never arrived.
    fn sweep_deadlines(&mut self) {
        for expired in self.table.rollback_expired(Instant::now()) {
            metrics::HANDOFFS.with_label_values(&["timed_out"]).inc();
            warn!(
                region = %expired.region,
                from = %expired.from,
                to = %expired.to,
                generation = %expired.generation,
                "Handoff timed out, ownership rolled back"
            );
            if let Some(waiter) = self.pending.remove(&expired.region) {
                let _ = waiter.send(Err(ClusterError::HandoffTimeout {
                    region: expired.region,
                }));
            }
        }
    }

    /// Orphan and reassign everything a departed member owned.
    async fn reassign_member_regions(&mut self, identity: &ServerId) {
        self.loads.remove(identity);

        let orphaned = self.table.orphan_member(identity);
        if orphaned.is_empty() {
            return;
        }
        debug!(%identity, regions = orphaned.len(), "Orphaned regions pending reassignment");

        // Abort any transfer the departed member was part of.
        for region in &orphaned {
            if let Some(waiter) = self.pending.remove(region) {
                let _ = waiter.send(Err(ClusterError::HandoffTimeout { region: *region }));
            }
        }

        let candidates = self.registry.members_except(identity);
        for region in orphaned {
            self.place_orphan(region, &candidates).await;
        }
        metrics::ORPHANED_REGIONS.set(self.table.orphaned_regions().len() as i64);
    }

    /// Retry placement for regions still orphaned.
    async fn retry_orphans(&mut self) {
        let orphaned = self.table.orphaned_regions();
        if orphaned.is_empty() {
            return;
        }
        let candidates = self.registry.members();
        for region in orphaned {
            self.place_orphan(region, &candidates).await;
        }
        metrics::ORPHANED_REGIONS.set(self.table.orphaned_regions().len() as i64);
    }

    async fn place_orphan(&mut self, region: RegionPos, candidates: &[ServerId]) {
        let Some(replacement) = self.placement.select_owner(region, candidates).await else {
            warn!(%region, "No placement candidate, region stays orphaned");
            return;
        };

        match self.table.promote_orphan(region, &replacement) {
            Ok(generation) => {
                info!(%region, owner = %replacement, %generation, "Orphaned region reassigned");
                self.notify_grant(region, &replacement, generation);
            }
            Err(e) => warn!(%region, error = %e, "Orphan reassignment failed"),
        }
    }

    /// Best-effort ownership notification; a peer that just vanished
    /// will learn the assignment on its next session.
    fn notify_grant(&self, region: RegionPos, owner: &ServerId, generation: Generation) {
        let frame = Frame::new(
            generation,
            Message::OwnershipGrant {
                region,
                owner: owner.clone(),
            },
        );
        if let Err(e) = self.registry.send_to(owner, frame) {
            debug!(%region, %owner, error = %e, "Grant notification not delivered");
        }
    }

    fn notify_revoke(&self, region: RegionPos, previous: &ServerId, generation: Generation) {
        let frame = Frame::new(generation, Message::OwnershipRevoke { region });
        if let Err(e) = self.registry.send_to(previous, frame) {
            debug!(%region, %previous, error = %e, "Revoke notification not delivered");
        }
    }
}
