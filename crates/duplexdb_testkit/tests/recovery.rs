//! Controller crashes and takeover by the survivor.

use duplexdb_core::{
    DatabaseError, Entry, HookType, JobNumber, ObjectConfig, ObjectId, RecoveryAction,
    TransactionState,
};
use duplexdb_persist::{IntentDirection, IntentPhase, IntentStore};
use duplexdb_testkit::prelude::*;

fn reconfigure(id: u32, config: &[u8]) -> Entry<ObjectConfig> {
    Entry::modify(
        ObjectId(id),
        ObjectConfig {
            class_id: 1,
            config: config.to_vec(),
        },
    )
}

/// Seeds objects 100 and 10, then stages a mixed transaction of job 2.
fn in_flight(array: &DuplexArray) {
    array.seed(1, [object(100, 1), object(10, 1)]);
    array.active.start(job(2)).unwrap();
    array.active.add_object_entry(object(101, 1)).unwrap();
    array
        .active
        .add_object_entry(reconfigure(100, b"resized"))
        .unwrap();
    array
        .active
        .add_object_entry(Entry::destroy(ObjectId(10), ObjectConfig::default()))
        .unwrap();
}

#[test]
fn crash_entering_commit_rolls_back_on_survivor() {
    let array = DuplexArray::new();
    array.seed(1, [object(100, 1), object(10, 1)]);
    let tables = TableImage::of(&array.passive);
    let live = TopologyImage::capture(&array.passive_topology);
    let records = array.persist.len();

    array.active.start(job(2)).unwrap();
    array.active.add_object_entry(object(101, 1)).unwrap();
    array
        .active
        .add_object_entry(reconfigure(100, b"resized"))
        .unwrap();
    array
        .active
        .add_object_entry(Entry::destroy(ObjectId(10), ObjectConfig::default()))
        .unwrap();
    let crashed = crash_during(&array.active, HookType::PanicInUpdateTransaction, || {
        array.active.commit()
    })
    .unwrap_err();
    array.kill_active();
    assert_eq!(crashed.hook, HookType::PanicInUpdateTransaction);
    assert_eq!(array.passive.state(), TransactionState::Active);

    let action = array.passive.recover_after_peer_death().unwrap();

    assert_eq!(action, RecoveryAction::RolledBack);
    assert_eq!(TableImage::of(&array.passive), tables);
    assert_eq!(TopologyImage::capture(&array.passive_topology), live);
    assert_eq!(array.persist.len(), records);
    assert!(array.passive_jobs.done().is_empty());
    assert_eq!(array.intents.load().unwrap(), None);
}

#[test]
fn crash_before_log_commit_discards_the_open_log_transaction() {
    let array = DuplexArray::new();
    in_flight(&array);
    let records = array.persist.len();

    crash_during(&array.active, HookType::PanicBeforeTransactionPersist, || {
        array.active.commit()
    })
    .unwrap_err();
    array.kill_active();
    assert!(array.persist.inner().has_open_transaction());

    let action = array.passive.recover_after_peer_death().unwrap();

    assert_eq!(action, RecoveryAction::RolledBack);
    assert!(!array.persist.inner().has_open_transaction());
    assert_eq!(array.persist.len(), records);
    let restored = array.passive.tables().objects().get(&ObjectId(100)).unwrap();
    assert_eq!(restored.payload.config, b"class-1");
    assert!(array.passive.tables().objects().contains(&ObjectId(10)));
    assert!(!array.passive.tables().objects().contains(&ObjectId(101)));
    assert_eq!(array.passive_topology.object(ObjectId(100)).unwrap().config, b"class-1");
}

#[test]
fn crash_mid_rollback_leaves_survivor_clean() {
    let array = DuplexArray::new();
    in_flight(&array);
    let tables = TableImage::of(&array.passive);

    crash_during(&array.active, HookType::PanicBeforeRollbackTransactionPersist, || {
        array.active.rollback()
    })
    .unwrap_err();
    array.kill_active();

    let action = array.passive.recover_after_peer_death().unwrap();

    // The abort reached the survivor before the crash, so nothing is left.
    assert_eq!(action, RecoveryAction::Nothing);
    assert_eq!(TableImage::of(&array.passive), tables);
    assert!(!array.persist.inner().has_open_transaction());
}

#[test]
fn survivor_commits_on_its_own_after_takeover() {
    let array = DuplexArray::new();
    in_flight(&array);
    crash_during(&array.active, HookType::PanicInUpdateTransaction, || {
        array.active.commit()
    })
    .unwrap_err();
    array.kill_active();
    array.passive.recover_after_peer_death().unwrap();

    array.passive.start(job(3)).unwrap();
    array.passive.add_object_entry(object(102, 2)).unwrap();
    array.passive.commit().unwrap();

    assert!(array.passive.tables().objects().contains(&ObjectId(102)));
    assert_eq!(array.passive.state(), TransactionState::Inactive);
}

#[test]
fn failed_general_commit_aborts_on_both_controllers() {
    let array = DuplexArray::new();
    in_flight(&array);
    let tables = TableImage::of(&array.active);
    array.persist.fail_commits(1);

    let err = array.active.commit().unwrap_err();

    assert!(matches!(err, DatabaseError::Persist(_) | DatabaseError::PersistFailure { .. }));
    assert_eq!(array.active.state(), TransactionState::Inactive);
    assert_eq!(array.passive.state(), TransactionState::Inactive);
    assert_eq!(TableImage::of(&array.active), tables);
    assert_eq!(TableImage::of(&array.passive), tables);
    assert_eq!(
        TopologyImage::capture(&array.active_topology),
        TopologyImage::capture(&array.passive_topology)
    );
    assert_eq!(array.intents.load().unwrap(), None);
}

#[test]
fn busy_log_gives_up_after_retries() {
    let array = DuplexArray::new();
    array.active.start(job(1)).unwrap();
    array.active.add_object_entry(object(100, 1)).unwrap();
    array.persist.fail_starts_busy(u32::MAX);

    let err = array.active.commit().unwrap_err();

    assert!(matches!(err, DatabaseError::Busy { attempts: 3 }));
    assert_eq!(array.persist.start_attempts(), 3);
    assert_eq!(array.active.state(), TransactionState::Inactive);
    assert!(array.active_topology.objects().is_empty());
    assert_eq!(array.passive.state(), TransactionState::Inactive);
}

#[test]
fn busy_log_that_frees_up_is_retried() {
    let array = DuplexArray::new();
    array.active.start(job(1)).unwrap();
    array.active.add_object_entry(object(100, 1)).unwrap();
    array.persist.fail_starts_busy(2);

    array.active.commit().unwrap();

    assert!(array.active.tables().objects().contains(&ObjectId(100)));
}

#[test]
fn dead_active_with_nothing_in_flight() {
    let array = DuplexArray::new();
    array.seed(1, [object(100, 1)]);
    array.kill_active();

    assert_eq!(
        array.passive.recover_after_peer_death().unwrap(),
        RecoveryAction::Nothing
    );
    assert_eq!(array.passive_jobs.count_for(JobNumber(1)), 0);
}

#[test]
fn rollback_intent_on_disk_is_finished_after_restart() {
    let durable = DurableController::new();
    let id = durable.engine.start(job(4)).unwrap();
    durable.engine.add_object_entry(object(100, 1)).unwrap();
    durable.persist.fail_commits(1);

    durable.engine.rollback().unwrap_err();

    assert_eq!(durable.engine.state(), TransactionState::Rollback);
    let intent = durable.reopen_intents().load().unwrap().unwrap();
    assert_eq!(intent.transaction_id, id.as_u64());
    assert_eq!(intent.direction, IntentDirection::Rollback);
    assert_eq!(intent.phase, IntentPhase::Prepared);

    let action = durable.engine.recover_after_peer_death().unwrap();

    assert_eq!(action, RecoveryAction::RolledBack);
    assert_eq!(durable.engine.state(), TransactionState::Inactive);
    assert!(durable.engine.tables().objects().is_empty());
    assert_eq!(durable.reopen_intents().load().unwrap(), None);
    assert!(!durable.intent_path().exists());
}
