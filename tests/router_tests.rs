//! Integration tests for the message router.
//!
//! The router is exercised with fake peer sessions registered directly
//! in the connection registry; their outbound queues stand in for the
//! writer tasks.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use gridmaster::cluster::{
    Arbiter, ArbiterHandle, CoordinatorConfig, FailureDetector, FailureDetectorConfig,
    LeastLoadedPlacement, LoadTable, OwnershipTable, Router,
};
use gridmaster::protocol::{Frame, Message};
use gridmaster::server::ConnectionRegistry;
use gridmaster::types::{Generation, LoadReport, RegionPos, ServerId};

struct Harness {
    table: Arc<OwnershipTable>,
    loads: Arc<LoadTable>,
    registry: Arc<ConnectionRegistry>,
    detector: Arc<FailureDetector>,
    arbiter: ArbiterHandle,
    router: Router,
}

fn harness() -> Harness {
    let config = CoordinatorConfig::default();
    let table = Arc::new(OwnershipTable::new());
    let loads = Arc::new(LoadTable::new());
    let registry = Arc::new(ConnectionRegistry::new());
    let detector = Arc::new(FailureDetector::new(FailureDetectorConfig::from_coordinator(
        &config,
    )));
    let placement = Arc::new(LeastLoadedPlacement::new(loads.clone(), table.clone()));
    let (arbiter, _task) = Arbiter::spawn(
        table.clone(),
        registry.clone(),
        loads.clone(),
        placement,
        config,
    );
    let router = Router::new(
        table.clone(),
        registry.clone(),
        loads.clone(),
        detector.clone(),
        arbiter.clone(),
    );
    Harness {
        table,
        loads,
        registry,
        detector,
        arbiter,
        router,
    }
}

fn fake_addr() -> SocketAddr {
    "127.0.0.1:0".parse().expect("valid addr")
}

async fn join(h: &Harness, name: &str) -> (ServerId, mpsc::Receiver<Frame>) {
    let id = ServerId::from(name);
    let (tx, rx) = mpsc::channel(64);
    let handle = h
        .registry
        .admit(id.clone(), format!("{name}:25565"), fake_addr(), tx)
        .expect("admission");
    h.detector.register(&id, handle.epoch());
    h.arbiter.admit(id.clone()).await.expect("arbiter admit");
    (id, rx)
}

fn payload(source: &ServerId, dest: Option<&ServerId>, data: &'static [u8]) -> Frame {
    Frame::new(
        Generation::INITIAL,
        Message::ApplicationPayload {
            source: source.clone(),
            dest: dest.cloned(),
            region: None,
            data: Bytes::from_static(data),
        },
    )
}

// ============================================================================
// Forwarding
// ============================================================================

#[tokio::test]
async fn test_directed_payload_forwarded_verbatim() {
    let h = harness();
    let (alpha, _rx_a) = join(&h, "alpha").await;
    let (beta, mut rx_b) = join(&h, "beta").await;

    let frame = payload(&alpha, Some(&beta), b"entity 99");
    h.router.dispatch(&alpha, frame.clone()).await.unwrap();

    assert_eq!(rx_b.recv().await.expect("frame"), frame);
}

#[tokio::test]
async fn test_broadcast_reaches_everyone_but_source() {
    let h = harness();
    let (alpha, mut rx_a) = join(&h, "alpha").await;
    let (_beta, mut rx_b) = join(&h, "beta").await;
    let (_gamma, mut rx_g) = join(&h, "gamma").await;

    let frame = payload(&alpha, None, b"weather update");
    h.router.dispatch(&alpha, frame.clone()).await.unwrap();

    assert_eq!(rx_b.recv().await.expect("frame"), frame);
    assert_eq!(rx_g.recv().await.expect("frame"), frame);
    assert!(rx_a.try_recv().is_err());
}

#[tokio::test]
async fn test_unknown_destination_is_reported() {
    let h = harness();
    let (alpha, _rx_a) = join(&h, "alpha").await;
    let ghost = ServerId::from("ghost");

    let err = h
        .router
        .dispatch(&alpha, payload(&alpha, Some(&ghost), b"lost"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        gridmaster::cluster::ClusterError::UnknownMember { identity: ghost }
    );
}

#[tokio::test]
async fn test_spoofed_source_dropped() {
    let h = harness();
    let (alpha, _rx_a) = join(&h, "alpha").await;
    let (beta, mut rx_b) = join(&h, "beta").await;
    let (gamma, _rx_g) = join(&h, "gamma").await;

    // gamma's session claims the payload came from alpha.
    let spoofed = payload(&alpha, Some(&beta), b"forged");
    h.router.dispatch(&gamma, spoofed).await.unwrap();
    assert!(rx_b.try_recv().is_err());
}

// ============================================================================
// Generation Fencing
// ============================================================================

#[tokio::test]
async fn test_stale_generation_dropped_regardless_of_order() {
    let h = harness();
    let (alpha, mut rx_a) = join(&h, "alpha").await;
    let (beta, mut rx_b) = join(&h, "beta").await;
    let region = RegionPos::new(0, 0);

    // Drive the region to generation 1 via a full handoff.
    h.arbiter
        .assign_initial(region, alpha.clone())
        .await
        .unwrap();
    h.arbiter
        .request_handoff(region, alpha.clone(), beta.clone())
        .await
        .unwrap();
    h.arbiter
        .handoff_ack(region, alpha.clone(), Generation::INITIAL)
        .await
        .unwrap();
    assert_eq!(h.table.generation_of(region), Some(Generation::new(1)));

    // Drain the coordination traffic the handoff produced.
    while rx_a.try_recv().is_ok() {}
    while rx_b.try_recv().is_ok() {}

    // A payload fenced at generation 0 arrives late: dropped.
    let stale = Frame::new(
        Generation::INITIAL,
        Message::ApplicationPayload {
            source: alpha.clone(),
            dest: Some(beta.clone()),
            region: Some(region),
            data: Bytes::from_static(b"from the old owner"),
        },
    );
    h.router.dispatch(&alpha, stale).await.unwrap();
    assert!(rx_b.try_recv().is_err());

    // The same payload at the current generation goes through.
    let fresh = Frame::new(
        Generation::new(1),
        Message::ApplicationPayload {
            source: alpha.clone(),
            dest: Some(beta.clone()),
            region: Some(region),
            data: Bytes::from_static(b"from the new world"),
        },
    );
    h.router.dispatch(&alpha, fresh.clone()).await.unwrap();
    assert_eq!(rx_b.recv().await.expect("frame"), fresh);
}

#[tokio::test]
async fn test_stale_handoff_ack_fenced_at_router() {
    let h = harness();
    let (alpha, _rx_a) = join(&h, "alpha").await;
    let (beta, _rx_b) = join(&h, "beta").await;
    let region = RegionPos::new(3, 3);

    h.arbiter
        .assign_initial(region, alpha.clone())
        .await
        .unwrap();
    h.arbiter
        .request_handoff(region, alpha.clone(), beta.clone())
        .await
        .unwrap();
    h.arbiter
        .handoff_ack(region, alpha.clone(), Generation::INITIAL)
        .await
        .unwrap();

    // A duplicate Ack still referencing generation 0 is silently fenced
    // (dropped at the router, never reaching the arbiter).
    let duplicate = Frame::new(
        Generation::INITIAL,
        Message::HandoffAck { region },
    );
    assert!(h.router.dispatch(&alpha, duplicate).await.is_ok());
    assert_eq!(h.table.generation_of(region), Some(Generation::new(1)));
    assert_eq!(h.table.current_owner(region), Some(beta));
}

// ============================================================================
// Coordination Kinds
// ============================================================================

#[tokio::test]
async fn test_heartbeat_feeds_load_table() {
    let h = harness();
    let (alpha, _rx_a) = join(&h, "alpha").await;

    let beat = Frame::heartbeat(LoadReport::new(42.0, 19.5, 7));
    h.router.dispatch(&alpha, beat).await.unwrap();

    assert_eq!(h.loads.average_tick_millis(&alpha), Some(42.0));
    assert_eq!(h.loads.latest(&alpha).expect("report").owned_regions, 7);
}

#[tokio::test]
async fn test_handoff_request_over_wire_initiates_transfer() {
    let h = harness();
    let (alpha, mut rx_a) = join(&h, "alpha").await;
    let (beta, _rx_b) = join(&h, "beta").await;
    let region = RegionPos::new(1, 0);

    h.arbiter
        .assign_initial(region, alpha.clone())
        .await
        .unwrap();
    while rx_a.try_recv().is_ok() {}

    // beta asks for the region as an entity crosses the boundary.
    let request = Frame::new(
        Generation::INITIAL,
        Message::HandoffRequest {
            region,
            from: alpha.clone(),
            to: beta.clone(),
        },
    );
    h.router.dispatch(&beta, request).await.unwrap();

    // The current owner received the relayed request; reads still see it
    // as owner until it acks.
    let relayed = rx_a.recv().await.expect("frame");
    assert!(matches!(relayed.message, Message::HandoffRequest { .. }));
    assert_eq!(h.table.current_owner(region), Some(alpha));
}

#[tokio::test]
async fn test_leave_drains_regions_gracefully() {
    let h = harness();
    let (alpha, _rx_a) = join(&h, "alpha").await;
    let (beta, _rx_b) = join(&h, "beta").await;
    let region = RegionPos::new(0, 2);

    h.arbiter
        .assign_initial(region, alpha.clone())
        .await
        .unwrap();

    let leave = Frame::new(Generation::INITIAL, Message::Leave);
    h.router.dispatch(&alpha, leave).await.unwrap();

    // The member-left command is asynchronous; give it a beat.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(h.table.current_owner(region), Some(beta));
    assert_eq!(h.table.generation_of(region), Some(Generation::new(1)));
    // No failure was recorded for the graceful departure.
    assert_eq!(h.detector.losses_detected(), 0);
}
