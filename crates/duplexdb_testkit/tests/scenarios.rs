//! End-to-end transaction scenarios on a two-controller array.

use duplexdb_core::{
    ControllerRole, DatabaseError, EngineConfig, Entry, JobNumber, ObjectConfig, ObjectId,
    RecoveryAction, Topology, TransactionState,
};
use duplexdb_persist::EntryId;
use duplexdb_peer::{PeerMessage, PeerOperation, PeerRequest, TransactionSummary};
use duplexdb_testkit::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Delivers a Start for another job straight to the passive controller.
fn hijack_passive(array: &DuplexArray, transaction_id: u64, job_number: u64) {
    let request = PeerRequest {
        operation: PeerOperation::Start,
        summary: TransactionSummary {
            transaction_id,
            job_number,
            ..TransactionSummary::default()
        },
        staged: None,
    };
    let message = PeerMessage::request(request).unwrap();
    duplexdb_peer::InboundHandler::on_message(&*array.passive, &message.encode().unwrap());
}

#[test]
fn capacity_is_enforced_on_both_controllers() {
    let config = test_config().max_objects(4);
    let array = DuplexArray::with_configs(config.clone(), config);
    array.active.start(job(1)).unwrap();
    for id in 100..104 {
        array.active.add_object_entry(object(id, 1)).unwrap();
    }

    let err = array.active.add_object_entry(object(104, 1)).unwrap_err();

    assert!(matches!(err, DatabaseError::CapacityExceeded { .. }));
    assert_eq!(array.active.snapshot().unwrap().objects().occupied(), 4);
    assert_eq!(array.passive.snapshot().unwrap().objects().occupied(), 4);
    assert!(!array.active_topology.objects().contains_key(&ObjectId(104)));
    assert!(!array.passive_topology.objects().contains_key(&ObjectId(104)));
}

#[test]
fn dead_peer_does_not_block_a_transaction() {
    let array = DuplexArray::new();
    array.kill_passive();

    array.active.start(job(1)).unwrap();
    array.active.add_object_entry(object(100, 1)).unwrap();
    array.active.commit().unwrap();

    assert_eq!(array.active.state(), TransactionState::Inactive);
    assert!(array.active.tables().objects().contains(&ObjectId(100)));
    assert!(array.passive.tables().objects().is_empty());
    assert_eq!(array.passive.state(), TransactionState::Inactive);
}

#[test]
fn modify_of_unplaced_entry_gets_a_location_on_both_sides() {
    let array = DuplexArray::new();
    // Object 200 is known to both controllers but was never written.
    for (engine, topology) in [
        (&array.active, &array.active_topology),
        (&array.passive, &array.passive_topology),
    ] {
        topology.create_object(ObjectId(200), 3, b"boot").unwrap();
        engine
            .tables()
            .objects()
            .insert_valid(Entry::valid(
                ObjectId(200),
                EntryId::UNPLACED,
                ObjectConfig {
                    class_id: 3,
                    config: b"boot".to_vec(),
                },
            ))
            .unwrap();
    }

    array.active.start(job(1)).unwrap();
    array
        .active
        .add_object_entry(Entry::modify(
            ObjectId(200),
            ObjectConfig {
                class_id: 3,
                config: b"first write".to_vec(),
            },
        ))
        .unwrap();
    array.active.commit().unwrap();

    let active = array.active.tables().objects().get(&ObjectId(200)).unwrap();
    assert!(active.entry_id().is_placed());
    assert!(array.persist.inner().record(active.entry_id()).is_some());
    let passive = array.passive.tables().objects().get(&ObjectId(200)).unwrap();
    assert_eq!(passive.entry_id(), active.entry_id());
    assert_eq!(passive.payload.config, b"first write");
    assert_eq!(array.passive_topology.object(ObjectId(200)).unwrap().config, b"first write");
}

#[test]
fn stage_refused_by_peer_on_another_job_aborts() {
    let array = DuplexArray::new();
    let id = array.active.start(job(7)).unwrap();
    hijack_passive(&array, id.as_u64(), 8);

    let err = array.active.add_object_entry(object(100, 1)).unwrap_err();

    assert!(matches!(
        err,
        DatabaseError::ProtocolMismatch {
            operation: PeerOperation::Stage,
            local_job: 7,
            remote_job: 8,
        }
    ));
    assert_eq!(array.active.state(), TransactionState::Inactive);
    assert!(array.active_topology.objects().is_empty());
    let passive = array.passive.snapshot().unwrap();
    assert_eq!(passive.job_number(), JobNumber(8));
    assert_eq!(passive.staged_count(), 0);
    assert!(array.passive_topology.objects().is_empty());
}

#[test]
fn commit_refused_by_peer_on_another_job_leaves_peer_untouched() {
    let array = DuplexArray::new();
    let id = array.active.start(job(7)).unwrap();
    array.active.add_object_entry(object(100, 1)).unwrap();
    hijack_passive(&array, id.as_u64(), 8);

    let err = array.active.commit().unwrap_err();

    assert!(matches!(
        err,
        DatabaseError::ProtocolMismatch {
            operation: PeerOperation::Commit,
            ..
        }
    ));
    // The logs committed before the peer was asked.
    assert!(array.active.tables().objects().contains(&ObjectId(100)));
    assert_eq!(array.active.state(), TransactionState::Inactive);
    assert!(array.passive.tables().objects().is_empty());
    assert_eq!(array.passive.state(), TransactionState::Active);
}

#[test]
fn commit_confirmed_but_never_invalidated_is_finished_once() {
    let array = DuplexArray::new();
    array.active.start(job(5)).unwrap();
    array.active.add_object_entry(object(100, 1)).unwrap();
    array.active.add_object_entry(object(7, 2)).unwrap();

    // The active controller hears nothing back for its commit and dies
    // waiting.
    array.active_link.set_unresponsive(true);
    let committer = {
        let active = Arc::clone(&array.active);
        thread::spawn(move || active.commit())
    };
    assert!(wait_until(Duration::from_secs(5), || {
        array.passive.state() == TransactionState::Commit
    }));
    array.kill_active();
    committer.join().unwrap().unwrap();

    let action = array.passive.recover_after_peer_death().unwrap();

    assert_eq!(action, RecoveryAction::FinishedCommit);
    assert_eq!(array.passive_jobs.count_for(JobNumber(5)), 1);
    assert_eq!(array.passive.role(), ControllerRole::Active);
    assert_eq!(array.passive.state(), TransactionState::Inactive);
    assert_eq!(TableImage::of(&array.passive), TableImage::of(&array.active));
    let active = array.active.tables().objects().get(&ObjectId(100)).unwrap();
    let passive = array.passive.tables().objects().get(&ObjectId(100)).unwrap();
    assert_eq!(passive.entry_id(), active.entry_id());
    assert!(array.passive_topology.objects().contains_key(&ObjectId(7)));
}

#[test]
fn passive_controller_follows_a_full_lifecycle() {
    let array = DuplexArray::new();
    array.seed(1, [object(100, 1), object(101, 1)]);
    assert_eq!(TableImage::of(&array.passive), TableImage::of(&array.active));

    array.active.start(job(2)).unwrap();
    array
        .active
        .add_object_entry(Entry::destroy(ObjectId(101), ObjectConfig::default()))
        .unwrap();
    array.active.next_generation_id().unwrap();
    array.active.commit().unwrap();

    assert_eq!(TableImage::of(&array.passive), TableImage::of(&array.active));
    assert_eq!(
        TopologyImage::capture(&array.passive_topology),
        TopologyImage::capture(&array.active_topology)
    );
    assert_eq!(array.passive.state(), TransactionState::Inactive);
}

#[test]
fn larger_table_limits_still_replicate() {
    let config = EngineConfig::default()
        .max_objects(8)
        .peer_timeouts(Duration::from_secs(5), Duration::from_secs(5))
        .peer_poll_interval(Duration::from_millis(5));
    let array = DuplexArray::with_configs(config.clone(), config);
    array.seed(1, (100..108).map(|id| object(id, 1)));
    assert_eq!(array.passive.tables().objects().len(), 8);
}
