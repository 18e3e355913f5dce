//! Property-based test generators using proptest.
//!
//! Scripts are sequences of object operations over a small id space so that
//! creates, modifies and destroys collide often. Some ids fall in the system
//! range and some in the general range.

use duplexdb_core::{DatabaseResult, Engine, Entry, ObjectConfig, ObjectId};
use proptest::prelude::*;

/// Highest object id a script touches.
pub const SCRIPT_ID_SPACE: u32 = 48;

/// One staged object operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectOp {
    /// Create the object.
    Create(ObjectId, ObjectConfig),
    /// Reconfigure the object.
    Modify(ObjectId, ObjectConfig),
    /// Destroy the object.
    Destroy(ObjectId),
}

impl ObjectOp {
    /// Stages the operation on `engine`.
    ///
    /// # Errors
    ///
    /// Returns whatever staging returns; scripts routinely contain
    /// operations the engine refuses.
    pub fn stage(&self, engine: &Engine) -> DatabaseResult<usize> {
        let entry = match self {
            Self::Create(id, config) => Entry::create(*id, config.clone()),
            Self::Modify(id, config) => Entry::modify(*id, config.clone()),
            Self::Destroy(id) => Entry::destroy(*id, ObjectConfig::default()),
        };
        engine.add_object_entry(entry)
    }
}

/// Stages every operation of `script`, ignoring refusals.
///
/// Returns how many were accepted.
pub fn stage_script(engine: &Engine, script: &[ObjectOp]) -> usize {
    script.iter().filter(|op| op.stage(engine).is_ok()).count()
}

/// Strategy for object ids across both log ranges.
pub fn object_id_strategy() -> impl Strategy<Value = ObjectId> {
    (1..=SCRIPT_ID_SPACE).prop_map(ObjectId)
}

/// Strategy for object configurations.
pub fn object_config_strategy() -> impl Strategy<Value = ObjectConfig> {
    (1u32..4, prop::collection::vec(any::<u8>(), 0..32))
        .prop_map(|(class_id, config)| ObjectConfig { class_id, config })
}

/// Strategy for a single object operation.
pub fn object_op_strategy() -> impl Strategy<Value = ObjectOp> {
    prop_oneof![
        (object_id_strategy(), object_config_strategy())
            .prop_map(|(id, config)| ObjectOp::Create(id, config)),
        (object_id_strategy(), object_config_strategy())
            .prop_map(|(id, config)| ObjectOp::Modify(id, config)),
        object_id_strategy().prop_map(ObjectOp::Destroy),
    ]
}

/// Strategy for a script of up to `max_len` operations.
pub fn script_strategy(max_len: usize) -> impl Strategy<Value = Vec<ObjectOp>> {
    prop::collection::vec(object_op_strategy(), 0..=max_len)
}

/// Strategy for a set of distinct objects to seed the tables with.
pub fn seed_strategy(max_len: usize) -> impl Strategy<Value = Vec<(ObjectId, ObjectConfig)>> {
    prop::collection::btree_map(object_id_strategy(), object_config_strategy(), 0..=max_len)
        .prop_map(|objects| objects.into_iter().collect())
}
