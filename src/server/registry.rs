//! Process-wide table of live peer sessions.
//!
//! The registry is the source of truth for cluster membership: an
//! identity is a member exactly while it has a session here. Admission
//! happens once per handshake and stamps the session with a fresh
//! [`SessionEpoch`]; removal is epoch-checked so a late teardown of a
//! superseded session cannot evict its replacement.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

use crate::cluster::{ClusterError, ClusterResult};
use crate::metrics;
use crate::protocol::Frame;
use crate::types::{ServerId, SessionEpoch};

/// Handle to one live session, shared between the registry, the
/// connection tasks, and the routing/arbitration layers.
#[derive(Debug)]
pub struct SessionHandle {
    identity: ServerId,
    epoch: SessionEpoch,
    /// Address the peer advertised in its Join frame.
    address: String,
    /// Actual socket address of the connection.
    remote_addr: SocketAddr,
    outbound: mpsc::Sender<Frame>,
    closed: Notify,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
}

impl SessionHandle {
    pub fn identity(&self) -> &ServerId {
        &self.identity
    }

    pub fn epoch(&self) -> SessionEpoch {
        self.epoch
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Queue a frame for the session's writer task.
    ///
    /// A session that cannot drain its queue is stalled; rather than let
    /// it backpressure the coordinator, the frame is dropped and the
    /// session is asked to close.
    pub fn try_send(&self, frame: Frame) -> ClusterResult<()> {
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    identity = %self.identity,
                    epoch = %self.epoch,
                    "Outbound queue full, closing stalled session"
                );
                self.closed.notify_one();
                Err(ClusterError::UnknownMember {
                    identity: self.identity.clone(),
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ClusterError::UnknownMember {
                identity: self.identity.clone(),
            }),
        }
    }

    /// Ask the connection tasks to shut the session down.
    pub fn close(&self) {
        self.closed.notify_one();
    }

    /// Resolves when [`close`](Self::close) is called.
    pub async fn closed(&self) {
        self.closed.notified().await
    }

    /// Frames written to this session so far.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Frames received from this session so far.
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub(crate) fn record_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }
}

/// Table of live sessions keyed by server identity.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<ServerId, Arc<SessionHandle>>,
    next_epoch: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a freshly handshaken peer.
    ///
    /// Exactly one live session may exist per identity; a second
    /// concurrent session is rejected with `HandshakeError` and the
    /// existing session is untouched.
    pub fn admit(
        &self,
        identity: ServerId,
        address: String,
        remote_addr: SocketAddr,
        outbound: mpsc::Sender<Frame>,
    ) -> ClusterResult<Arc<SessionHandle>> {
        use dashmap::mapref::entry::Entry;

        match self.sessions.entry(identity.clone()) {
            Entry::Occupied(_) => {
                metrics::HANDSHAKES_REJECTED.inc();
                Err(ClusterError::HandshakeError { identity })
            }
            Entry::Vacant(slot) => {
                let epoch = SessionEpoch::new(self.next_epoch.fetch_add(1, Ordering::SeqCst) + 1);
                let handle = Arc::new(SessionHandle {
                    identity: identity.clone(),
                    epoch,
                    address,
                    remote_addr,
                    outbound,
                    closed: Notify::new(),
                    frames_sent: AtomicU64::new(0),
                    frames_received: AtomicU64::new(0),
                });
                slot.insert(handle.clone());
                metrics::ACTIVE_SESSIONS.set(self.sessions.len() as i64);
                metrics::MEMBERS_ADMITTED.inc();
                debug!(%identity, %epoch, "Session admitted");
                Ok(handle)
            }
        }
    }

    /// Remove a session, but only if the epoch still matches.
    ///
    /// Returns whether a session was actually removed; a stale teardown
    /// of a superseded session is a no-op.
    pub fn remove(&self, identity: &ServerId, epoch: SessionEpoch) -> bool {
        let removed = self
            .sessions
            .remove_if(identity, |_, handle| handle.epoch() == epoch)
            .is_some();
        if removed {
            metrics::ACTIVE_SESSIONS.set(self.sessions.len() as i64);
            debug!(%identity, %epoch, "Session removed");
        }
        removed
    }

    pub fn get(&self, identity: &ServerId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(identity).map(|e| e.value().clone())
    }

    pub fn contains(&self, identity: &ServerId) -> bool {
        self.sessions.contains_key(identity)
    }

    /// Current live member set.
    pub fn members(&self) -> Vec<ServerId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Live members other than `excluded`.
    pub fn members_except(&self, excluded: &ServerId) -> Vec<ServerId> {
        self.sessions
            .iter()
            .map(|e| e.key().clone())
            .filter(|id| id != excluded)
            .collect()
    }

    /// Forward one frame to a single member.
    pub fn send_to(&self, identity: &ServerId, frame: Frame) -> ClusterResult<()> {
        match self.get(identity) {
            Some(handle) => handle.try_send(frame),
            None => Err(ClusterError::UnknownMember {
                identity: identity.clone(),
            }),
        }
    }

    /// Forward one frame to every member except `source`. Best-effort:
    /// sessions that fail to enqueue are skipped with a warning.
    pub fn broadcast_except(&self, source: &ServerId, frame: &Frame) -> usize {
        let mut delivered = 0;
        for entry in self.sessions.iter() {
            if entry.key() == source {
                continue;
            }
            match entry.value().try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(identity = %entry.key(), error = %e, "Broadcast delivery failed")
                }
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:0".parse().expect("valid addr")
    }

    fn admit(
        registry: &ConnectionRegistry,
        name: &str,
    ) -> (ClusterResult<Arc<SessionHandle>>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(8);
        let result = registry.admit(ServerId::from(name), format!("{name}:25565"), test_addr(), tx);
        (result, rx)
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = admit(&registry, "alpha");
        assert!(first.is_ok());

        let (second, _rx2) = admit(&registry, "alpha");
        assert_eq!(
            second.unwrap_err(),
            ClusterError::HandshakeError {
                identity: ServerId::from("alpha")
            }
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_readmission_after_removal() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = admit(&registry, "alpha");
        let first = first.unwrap();

        assert!(registry.remove(first.identity(), first.epoch()));

        let (second, _rx2) = admit(&registry, "alpha");
        let second = second.unwrap();
        assert!(second.epoch() > first.epoch());
    }

    #[test]
    fn test_stale_epoch_removal_is_noop() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = admit(&registry, "alpha");
        let first = first.unwrap();
        registry.remove(first.identity(), first.epoch());

        let (second, _rx2) = admit(&registry, "alpha");
        let second = second.unwrap();

        // Tearing down the old session again must not evict the new one.
        assert!(!registry.remove(first.identity(), first.epoch()));
        assert!(registry.contains(second.identity()));
    }
}
