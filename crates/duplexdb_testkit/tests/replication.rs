//! Replication traffic between the two controllers.

use duplexdb_core::{DatabaseError, ObjectId, RecoveryAction, ServiceState, TransactionState};
use duplexdb_peer::PeerOperation;
use duplexdb_testkit::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn every_step_is_sent_in_order() {
    let array = DuplexArray::new();
    array.active.start(job(1)).unwrap();
    array.active.add_object_entry(object(100, 1)).unwrap();
    array.active.add_object_entry(object(101, 1)).unwrap();
    array.active.commit().unwrap();

    let expected = vec![
        PeerOperation::Start,
        PeerOperation::Stage,
        PeerOperation::Stage,
        PeerOperation::Commit,
        PeerOperation::Invalidate,
    ];
    assert_eq!(array.active_link.sent_operations(), expected);
    // One confirmation per request.
    assert_eq!(array.passive_link.sent_operations(), expected);
}

#[test]
fn passive_mirrors_staged_entries_before_commit() {
    let array = DuplexArray::new();
    let id = array.active.start(job(3)).unwrap();
    array.active.add_object_entry(object(100, 1)).unwrap();

    let mirrored = array.passive.snapshot().unwrap();
    assert_eq!(mirrored.id(), id);
    assert_eq!(mirrored.staged_count(), 1);
    assert_eq!(array.passive.current_id(), id);
    assert!(array.passive_topology.objects().contains_key(&ObjectId(100)));
    assert!(array.passive.tables().objects().is_empty());
}

#[test]
fn abort_releases_both_slots() {
    let array = DuplexArray::new();
    array.active.start(job(1)).unwrap();
    array.active.add_object_entry(object(100, 1)).unwrap();

    array.active.abort().unwrap();

    assert_eq!(array.active.state(), TransactionState::Inactive);
    assert_eq!(array.passive.state(), TransactionState::Inactive);
    assert!(array.passive_topology.objects().is_empty());
    assert_eq!(array.active_link.sent_operations().last(), Some(&PeerOperation::Abort));
}

#[test]
fn large_commit_uses_bulk_transfer() {
    let array = DuplexArray::with_configs(test_config().dma_threshold(0), test_config());
    array.seed(1, [object(100, 1), object(5, 1)]);

    let sent = array.active_link.sent_operations();
    assert!(sent.contains(&PeerOperation::CommitDma));
    assert!(!sent.contains(&PeerOperation::Commit));
    assert_eq!(TableImage::of(&array.passive), TableImage::of(&array.active));
    let active = array.active.tables().objects().get(&ObjectId(100)).unwrap();
    let passive = array.passive.tables().objects().get(&ObjectId(100)).unwrap();
    assert_eq!(passive.entry_id(), active.entry_id());
    assert_eq!(array.passive.state(), TransactionState::Inactive);
}

#[test]
fn bulk_transfer_falls_back_when_peer_cannot_map_it() {
    let array = DuplexArray::with_configs(test_config().dma_threshold(0), test_config());
    array.passive_link.set_dma_enabled(false);
    array.seed(1, [object(100, 1)]);

    let sent = array.active_link.sent_operations();
    assert!(sent.contains(&PeerOperation::Commit));
    assert!(!sent.contains(&PeerOperation::CommitDma));
    assert!(array.passive.tables().objects().contains(&ObjectId(100)));
}

#[test]
fn oversized_start_is_refused_and_slot_released() {
    let array = DuplexArray::with_configs(test_config(), test_config().max_message_size(8));

    let err = array.active.start(job(1)).unwrap_err();

    assert!(matches!(
        err,
        DatabaseError::VersionMismatch { supported: 8, .. }
    ));
    assert_eq!(array.active.state(), TransactionState::Inactive);
    assert_eq!(array.passive.state(), TransactionState::Inactive);
}

#[test]
fn unacknowledged_start_times_out() {
    let config = test_config().peer_timeouts(Duration::from_millis(50), Duration::from_millis(50));
    let array = DuplexArray::with_configs(config, test_config());
    array.active_link.set_unresponsive(true);

    let err = array.active.start(job(1)).unwrap_err();

    assert!(matches!(err, DatabaseError::Timeout { .. }));
    assert_eq!(array.active.state(), TransactionState::Inactive);
    array.active_link.set_unresponsive(false);
}

#[test]
fn peer_death_mid_wait_counts_as_success() {
    let array = DuplexArray::new();
    array.active_link.set_unresponsive(true);
    let starter = {
        let active = Arc::clone(&array.active);
        thread::spawn(move || active.start(job(1)))
    };
    assert!(wait_until(Duration::from_secs(5), || {
        array.passive.state() == TransactionState::Active
    }));
    array.kill_passive();

    starter.join().unwrap().unwrap();
    assert_eq!(array.active.state(), TransactionState::Active);
    assert!(!array.active.is_peer_alive());
}

#[test]
fn initializing_peer_acknowledges_without_mirroring() {
    let array = DuplexArray::new();
    array.passive.set_service_state(ServiceState::Initializing);

    array.seed(1, [object(100, 1)]);

    assert!(array.active.tables().objects().contains(&ObjectId(100)));
    assert!(array.passive.tables().objects().is_empty());
    assert_eq!(array.passive.state(), TransactionState::Inactive);
}

#[test]
fn rollback_is_replicated_as_abort() {
    let array = DuplexArray::new();
    array.active.start(job(1)).unwrap();
    array.active.add_object_entry(object(100, 1)).unwrap();

    array.active.rollback().unwrap();

    assert_eq!(array.passive.state(), TransactionState::Inactive);
    assert!(array.passive_topology.objects().is_empty());
    assert!(array.active_topology.objects().is_empty());
    assert_eq!(array.active_link.sent_operations().last(), Some(&PeerOperation::Abort));
}

#[test]
fn dropped_commit_is_folded_by_invalidate() {
    let config = test_config().peer_timeouts(Duration::from_secs(5), Duration::from_millis(500));
    let array = DuplexArray::with_configs(config, test_config());
    array.active.start(job(4)).unwrap();
    array.active.add_object_entry(object(100, 1)).unwrap();
    array.active_link.clear_sent();
    array.passive_link.set_silent(true);

    let unsilence = {
        let active_link = Arc::clone(&array.active_link);
        let passive_link = Arc::clone(&array.passive_link);
        thread::spawn(move || {
            let sent = wait_until(Duration::from_secs(5), || {
                active_link.sent_operations().contains(&PeerOperation::Commit)
            });
            thread::sleep(Duration::from_millis(100));
            passive_link.set_silent(false);
            sent
        })
    };
    let err = array.active.commit().unwrap_err();
    assert!(unsilence.join().unwrap());

    assert!(matches!(err, DatabaseError::Timeout { .. }));
    assert_eq!(
        array.active_link.sent_operations(),
        vec![PeerOperation::Commit, PeerOperation::Invalidate]
    );
    assert_eq!(array.active.state(), TransactionState::Inactive);
    assert_eq!(array.passive.state(), TransactionState::Inactive);
    let active = array.active.tables().objects().get(&ObjectId(100)).unwrap();
    let passive = array.passive.tables().objects().get(&ObjectId(100)).unwrap();
    assert_eq!(passive.entry_id(), active.entry_id());

    array.kill_active();
    let action = array.passive.recover_after_peer_death().unwrap();

    assert_eq!(action, RecoveryAction::Nothing);
    assert!(array.passive.tables().objects().contains(&ObjectId(100)));
    assert!(array.passive_topology.objects().contains_key(&ObjectId(100)));
}

#[test]
fn unacknowledged_commit_still_releases_both_slots() {
    let config = test_config().peer_timeouts(Duration::from_millis(100), Duration::from_secs(5));
    let array = DuplexArray::with_configs(config, test_config());
    array.active.start(job(2)).unwrap();
    array.active.add_object_entry(object(100, 1)).unwrap();
    array.active_link.set_unresponsive(true);

    let err = array.active.commit().unwrap_err();

    assert!(matches!(err, DatabaseError::Timeout { .. }));
    assert_eq!(array.active.state(), TransactionState::Inactive);
    assert!(wait_until(Duration::from_secs(5), || {
        array.passive.state() == TransactionState::Inactive
    }));
    assert!(array.active.tables().objects().contains(&ObjectId(100)));
    assert!(array.passive.tables().objects().contains(&ObjectId(100)));
    assert!(array.passive_topology.objects().contains_key(&ObjectId(100)));
    array.active_link.set_unresponsive(false);
}

#[test]
fn unacknowledged_stage_aborts_both_controllers() {
    let config = test_config().peer_timeouts(Duration::from_millis(100), Duration::from_secs(5));
    let array = DuplexArray::with_configs(config, test_config());
    array.active.start(job(6)).unwrap();
    array.active_link.set_unresponsive(true);

    let err = array.active.add_object_entry(object(100, 1)).unwrap_err();

    assert!(matches!(err, DatabaseError::Timeout { .. }));
    assert_eq!(array.active.state(), TransactionState::Inactive);
    assert!(wait_until(Duration::from_secs(5), || {
        array.passive.state() == TransactionState::Inactive
    }));
    assert!(array.active_topology.objects().is_empty());
    assert!(array.passive_topology.objects().is_empty());
    assert_eq!(array.active_link.sent_operations().last(), Some(&PeerOperation::Abort));
    array.active_link.set_unresponsive(false);
}
