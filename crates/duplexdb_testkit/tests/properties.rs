//! Property tests over random object scripts.

use duplexdb_core::{Entry, ObjectConfig, ObjectId, TransactionState};
use duplexdb_testkit::prelude::*;
use proptest::prelude::*;

fn seeded_solo(seed: &[(ObjectId, ObjectConfig)]) -> SoloController {
    let solo = SoloController::new();
    solo.seed(1, seed.iter().map(|(id, config)| Entry::create(*id, config.clone())));
    solo
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn staged_transaction_never_holds_duplicate_keys(
        seed in seed_strategy(8),
        script in script_strategy(24),
    ) {
        let solo = seeded_solo(&seed);
        solo.engine.start(job(2)).unwrap();
        let accepted = stage_script(&solo.engine, &script);

        let txn = solo.engine.snapshot().unwrap();
        prop_assert!(!txn.has_duplicate_keys());
        prop_assert!(txn.staged_count() <= accepted);
    }

    #[test]
    fn abort_restores_tables_and_topology(
        seed in seed_strategy(8),
        script in script_strategy(16),
    ) {
        let solo = seeded_solo(&seed);
        let tables = TableImage::of(&solo.engine);
        let live = TopologyImage::capture(&solo.topology);

        solo.engine.start(job(2)).unwrap();
        stage_script(&solo.engine, &script);
        solo.engine.abort().unwrap();

        prop_assert_eq!(TableImage::of(&solo.engine), tables);
        prop_assert_eq!(TopologyImage::capture(&solo.topology), live);
        prop_assert_eq!(solo.engine.state(), TransactionState::Inactive);
    }

    #[test]
    fn rollback_restores_tables_and_log(
        seed in seed_strategy(8),
        script in script_strategy(16),
    ) {
        let solo = seeded_solo(&seed);
        let tables = TableImage::of(&solo.engine);
        let live = TopologyImage::capture(&solo.topology);
        let general = solo.persist.len();
        let system = solo.system.len();

        solo.engine.start(job(2)).unwrap();
        stage_script(&solo.engine, &script);
        solo.engine.rollback().unwrap();

        prop_assert_eq!(TableImage::of(&solo.engine), tables);
        prop_assert_eq!(TopologyImage::capture(&solo.topology), live);
        prop_assert_eq!(solo.persist.len(), general);
        prop_assert_eq!(solo.system.len(), system);
    }

    #[test]
    fn committed_tables_match_live_topology(
        seed in seed_strategy(8),
        script in script_strategy(16),
    ) {
        let solo = seeded_solo(&seed);
        solo.engine.start(job(2)).unwrap();
        stage_script(&solo.engine, &script);
        solo.engine.commit().unwrap();

        let objects = solo.engine.tables().objects().snapshot();
        let live = solo.topology.objects();
        prop_assert_eq!(objects.len(), live.len());
        for entry in objects {
            let object = live.get(&entry.header.object_id).unwrap();
            prop_assert_eq!(&object.config, &entry.payload.config);
            prop_assert!(entry.entry_id().is_placed());
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn passive_mirror_matches_active(
        seed in seed_strategy(6),
        script in script_strategy(12),
    ) {
        let array = DuplexArray::new();
        array.seed(
            1,
            seed.iter().map(|(id, config)| Entry::create(*id, config.clone())),
        );
        array.active.start(job(2)).unwrap();
        stage_script(&array.active, &script);
        array.active.commit().unwrap();

        prop_assert_eq!(TableImage::of(&array.passive), TableImage::of(&array.active));
        prop_assert_eq!(
            TopologyImage::capture(&array.passive_topology),
            TopologyImage::capture(&array.active_topology)
        );
        prop_assert_eq!(array.passive.state(), TransactionState::Inactive);
    }
}
