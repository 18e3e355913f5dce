//! Controller crashes at named checkpoints.
//!
//! The built-in panic hooks abort the process, which a test harness cannot
//! observe. [`arm_crash`] replaces the hook's action with an unwinding panic
//! carrying a [`Crashed`] payload, and [`crash_during`] runs an operation and
//! catches it. After the unwind the engine is left as a dead controller
//! would leave it: slot state as of the checkpoint, log transactions open.

use duplexdb_core::{Engine, HookBehavior, HookContext, HookType, TransactionId};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Panic payload of a simulated crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crashed {
    /// Checkpoint that fired.
    pub hook: HookType,
    /// Transaction in flight at the checkpoint.
    pub transaction_id: TransactionId,
}

/// Arms `hook` on `engine` so that reaching it unwinds with [`Crashed`].
pub fn arm_crash(engine: &Engine, hook: HookType) {
    let behavior: HookBehavior = Arc::new(|ctx: &HookContext<'_>| {
        panic::panic_any(Crashed {
            hook: ctx.hook,
            transaction_id: ctx.transaction_id,
        })
    });
    engine.hooks().register(hook, behavior);
    engine.hooks().set_hook(hook);
}

/// Runs `op` with `hook` armed to crash.
///
/// Returns `Err(Crashed)` if the checkpoint fired, or the operation's own
/// result if it completed. Any other panic is propagated.
pub fn crash_during<T>(
    engine: &Engine,
    hook: HookType,
    op: impl FnOnce() -> T,
) -> Result<T, Crashed> {
    arm_crash(engine, hook);
    let outcome = panic::catch_unwind(AssertUnwindSafe(op));
    engine.hooks().remove_hook(hook);
    engine.hooks().unregister(hook);
    match outcome {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<Crashed>() {
            Ok(crashed) => Err(*crashed),
            Err(other) => panic::resume_unwind(other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{job, object, SoloController};
    use duplexdb_core::TransactionState;

    #[test]
    fn crash_leaves_slot_in_commit() {
        let c = SoloController::new();
        let id = c.engine.start(job(1)).unwrap();
        c.engine.add_object_entry(object(100, 1)).unwrap();

        let crashed = crash_during(&c.engine, HookType::PanicBeforeTransactionPersist, || {
            c.engine.commit()
        })
        .unwrap_err();

        assert_eq!(crashed.hook, HookType::PanicBeforeTransactionPersist);
        assert_eq!(crashed.transaction_id, id);
        assert_eq!(c.engine.state(), TransactionState::Commit);
        assert!(c.persist.inner().has_open_transaction());
        assert!(!c.engine.hooks().get_hook_state(crashed.hook).is_set);
    }

    #[test]
    fn unreached_checkpoint_returns_result() {
        let c = SoloController::new();
        let result = crash_during(&c.engine, HookType::PanicInUpdateRollbackTransaction, || {
            c.engine.start(job(1))
        });
        assert!(matches!(result, Ok(Ok(_))));
    }
}
