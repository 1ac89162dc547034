//! Integration tests for heartbeat failure detection.
//!
//! All timing runs under paused tokio time so the scans are
//! deterministic.

use std::time::Duration;

use gridmaster::cluster::failure_detector::{
    FailureDetector, FailureDetectorConfig, HealthState,
};
use gridmaster::types::{ServerId, SessionEpoch};

fn fast_config() -> FailureDetectorConfig {
    FailureDetectorConfig {
        heartbeat_interval: Duration::from_millis(100),
        suspicion_threshold: 2,
        failure_threshold: 5,
        check_interval: Duration::from_millis(50),
        jitter_tolerance: Duration::from_millis(10),
        startup_grace: Duration::ZERO,
        loss_cooldown: Duration::from_secs(30),
    }
}

#[tokio::test(start_paused = true)]
async fn test_silent_member_walks_to_lost() {
    let detector = FailureDetector::new(fast_config());
    let alpha = ServerId::from("alpha");
    detector.register(&alpha, SessionEpoch::new(1));

    // Two missed beats: suspected, not yet lost.
    tokio::time::advance(Duration::from_millis(250)).await;
    assert!(detector.check().is_empty());
    assert_eq!(detector.state_of(&alpha), Some(HealthState::Suspected));

    // Five missed beats: lost, exactly one event.
    tokio::time::advance(Duration::from_millis(400)).await;
    let events = detector.check();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].identity, alpha);
    assert_eq!(events[0].epoch, SessionEpoch::new(1));

    // The session is gone; further scans stay quiet.
    assert!(detector.check().is_empty());
    assert_eq!(detector.state_of(&alpha), None);
    assert_eq!(detector.losses_detected(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_frames_keep_member_healthy() {
    let detector = FailureDetector::new(fast_config());
    let alpha = ServerId::from("alpha");
    detector.register(&alpha, SessionEpoch::new(1));

    for _ in 0..20 {
        tokio::time::advance(Duration::from_millis(100)).await;
        detector.record_frame(&alpha);
        assert!(detector.check().is_empty());
    }
    assert_eq!(detector.state_of(&alpha), Some(HealthState::Healthy));
}

#[tokio::test(start_paused = true)]
async fn test_recovery_from_suspected_counts_false_positive() {
    let detector = FailureDetector::new(fast_config());
    let alpha = ServerId::from("alpha");
    detector.register(&alpha, SessionEpoch::new(1));

    tokio::time::advance(Duration::from_millis(300)).await;
    detector.check();
    assert_eq!(detector.state_of(&alpha), Some(HealthState::Suspected));

    detector.record_frame(&alpha);
    assert_eq!(detector.state_of(&alpha), Some(HealthState::Healthy));
    assert_eq!(detector.false_positives_avoided(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_startup_grace_defers_detection() {
    let config = FailureDetectorConfig {
        startup_grace: Duration::from_secs(5),
        ..fast_config()
    };
    let detector = FailureDetector::new(config);
    let alpha = ServerId::from("alpha");
    detector.register(&alpha, SessionEpoch::new(1));

    // Well past the detection time, but still inside the grace period.
    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(detector.check().is_empty());
    assert_eq!(detector.state_of(&alpha), Some(HealthState::Healthy));

    tokio::time::advance(Duration::from_secs(4)).await;
    assert_eq!(detector.check().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_reports_loss_once() {
    let detector = FailureDetector::new(fast_config());
    let alpha = ServerId::from("alpha");
    let epoch = SessionEpoch::new(7);
    detector.register(&alpha, epoch);

    let first = detector.report_disconnect(&alpha, epoch);
    assert!(first.is_some());

    // The scan racing the disconnect path must not double-report.
    assert!(detector.check().is_empty());
    assert_eq!(detector.report_disconnect(&alpha, epoch), None);
    assert_eq!(detector.losses_detected(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_graceful_unregister_reports_nothing() {
    let detector = FailureDetector::new(fast_config());
    let alpha = ServerId::from("alpha");
    let epoch = SessionEpoch::new(1);
    detector.register(&alpha, epoch);

    detector.unregister(&alpha, epoch);
    assert!(detector.check().is_empty());
    assert_eq!(detector.report_disconnect(&alpha, epoch), None);
    assert_eq!(detector.losses_detected(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_new_session_loss_not_suppressed_by_cooldown() {
    let detector = FailureDetector::new(fast_config());
    let alpha = ServerId::from("alpha");

    detector.register(&alpha, SessionEpoch::new(1));
    assert!(detector.report_disconnect(&alpha, SessionEpoch::new(1)).is_some());

    // A genuine new session failing inside the cooldown window is a new
    // loss: its regions must still be reassigned.
    detector.register(&alpha, SessionEpoch::new(2));
    let second = detector.report_disconnect(&alpha, SessionEpoch::new(2));
    assert!(second.is_some());
    assert_eq!(second.expect("event").epoch, SessionEpoch::new(2));
}

#[tokio::test(start_paused = true)]
async fn test_stale_epoch_unregister_keeps_new_session() {
    let detector = FailureDetector::new(fast_config());
    let alpha = ServerId::from("alpha");

    detector.register(&alpha, SessionEpoch::new(1));
    detector.register(&alpha, SessionEpoch::new(2));

    // A late teardown of the superseded session must not stop tracking
    // of its replacement.
    detector.unregister(&alpha, SessionEpoch::new(1));
    assert_eq!(detector.tracked_count(), 1);
    assert_eq!(detector.state_of(&alpha), Some(HealthState::Healthy));
}
