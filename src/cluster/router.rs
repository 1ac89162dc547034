//! Message dispatch between connections, the arbiter, and the detector.
//!
//! The router is stateless: it reads the shared tables but owns nothing.
//! Coordination kinds are handed to the arbiter or failure detector;
//! application payloads are forwarded verbatim to their destination (or
//! broadcast) without interpretation.
//!
//! Fencing happens here first: any region-referencing frame whose
//! generation is older than the ownership table's current one is dropped
//! and logged, never forwarded. The arbiter re-checks authoritatively
//! for state-changing commands, so a racing frame that slips past the
//! router's read still cannot corrupt the table.

use std::sync::Arc;

use tracing::{debug, warn};

use super::arbiter::ArbiterHandle;
use super::error::ClusterResult;
use super::failure_detector::FailureDetector;
use super::load::LoadTable;
use super::ownership::OwnershipTable;
use crate::metrics;
use crate::protocol::{Frame, Message};
use crate::server::ConnectionRegistry;
use crate::types::ServerId;

/// Stateless dispatch layer for decoded frames.
pub struct Router {
    table: Arc<OwnershipTable>,
    registry: Arc<ConnectionRegistry>,
    loads: Arc<LoadTable>,
    detector: Arc<FailureDetector>,
    arbiter: ArbiterHandle,
}

impl Router {
    pub fn new(
        table: Arc<OwnershipTable>,
        registry: Arc<ConnectionRegistry>,
        loads: Arc<LoadTable>,
        detector: Arc<FailureDetector>,
        arbiter: ArbiterHandle,
    ) -> Self {
        Self {
            table,
            registry,
            loads,
            detector,
            arbiter,
        }
    }

    /// Dispatch one decoded frame received from `source`.
    ///
    /// Routing problems (unknown destination, coordination rejections)
    /// are returned for the connection to log; none of them are fatal to
    /// the connection or the coordinator.
    pub async fn dispatch(&self, source: &ServerId, frame: Frame) -> ClusterResult<()> {
        // Every received frame is liveness evidence.
        self.detector.record_frame(source);

        // Generation fencing: a frame issued against an outdated
        // assignment must never be honored or forwarded.
        if let Some(region) = frame.message.region() {
            if self.table.is_stale(region, frame.generation) {
                metrics::STALE_FRAMES_DROPPED.inc();
                debug!(
                    %source,
                    %region,
                    kind = %frame.message.kind(),
                    generation = %frame.generation,
                    "Dropping stale frame"
                );
                return Ok(());
            }
        }

        match &frame.message {
            Message::Heartbeat { load } => {
                self.loads.record(source, *load);
                Ok(())
            }
            Message::Join { identity, .. } => {
                // The handshake already happened; a second Join on a live
                // session is a peer bug, not a routing event.
                warn!(%source, declared = %identity, "Ignoring Join on established session");
                Ok(())
            }
            Message::Leave => {
                // Graceful departure: stop liveness tracking first so the
                // ensuing disconnect is not reported as a failure.
                if let Some(handle) = self.registry.get(source) {
                    self.detector.unregister(source, handle.epoch());
                }
                self.arbiter.member_left(source.clone()).await;
                Ok(())
            }
            Message::HandoffRequest { region, from, to } => self
                .arbiter
                .request_handoff(*region, from.clone(), to.clone())
                .await
                .map(|_| ()),
            Message::HandoffAck { region } => self
                .arbiter
                .handoff_ack(*region, source.clone(), frame.generation)
                .await
                .map(|_| ()),
            Message::OwnershipGrant { .. } | Message::OwnershipRevoke { .. } => {
                // Master-to-server kinds; a peer echoing one back is noise.
                warn!(
                    %source,
                    kind = %frame.message.kind(),
                    "Ignoring server-bound kind echoed by a peer"
                );
                Ok(())
            }
            Message::ApplicationPayload {
                source: declared,
                dest,
                ..
            } => {
                if declared != source {
                    warn!(
                        session = %source,
                        declared = %declared,
                        "Payload source does not match session identity, dropping"
                    );
                    return Ok(());
                }
                match dest {
                    Some(target) => {
                        self.registry.send_to(target, frame.clone())?;
                        metrics::FRAMES_ROUTED.with_label_values(&["direct"]).inc();
                        Ok(())
                    }
                    None => {
                        let delivered = self.registry.broadcast_except(source, &frame);
                        metrics::FRAMES_ROUTED
                            .with_label_values(&["broadcast"])
                            .inc();
                        debug!(%source, delivered, "Broadcast payload forwarded");
                        Ok(())
                    }
                }
            }
        }
    }
}
