//! Fault-injection hooks.
//!
//! Each [`HookType`] names a checkpoint inside commit or rollback. A hook is
//! inert until armed; an armed hook counts a trigger on every pass through its
//! checkpoint and runs its behavior. Wait hooks spin until disarmed, panic
//! hooks take the process down. Tests replace either behavior with a closure
//! through [`HookRegistry::register`].

use crate::error::{DatabaseError, DatabaseResult};
use crate::types::TransactionId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// A fault-injection checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum HookType {
    /// Entering commit.
    WaitInUpdateTransaction = 1,
    /// Before commit's log commit.
    WaitBeforeTransactionPersist = 2,
    /// Entering commit.
    PanicInUpdateTransaction = 3,
    /// Before commit's log commit.
    PanicBeforeTransactionPersist = 4,
    /// Entering rollback.
    WaitInUpdateRollbackTransaction = 5,
    /// Entering rollback.
    PanicInUpdateRollbackTransaction = 6,
    /// Before rollback's log commit.
    WaitBeforeRollbackTransactionPersist = 7,
    /// Before rollback's log commit.
    PanicBeforeRollbackTransactionPersist = 8,
}

impl HookType {
    /// Every checkpoint in code order.
    pub const ALL: [Self; 8] = [
        Self::WaitInUpdateTransaction,
        Self::WaitBeforeTransactionPersist,
        Self::PanicInUpdateTransaction,
        Self::PanicBeforeTransactionPersist,
        Self::WaitInUpdateRollbackTransaction,
        Self::PanicInUpdateRollbackTransaction,
        Self::WaitBeforeRollbackTransactionPersist,
        Self::PanicBeforeRollbackTransactionPersist,
    ];

    /// Converts a control-surface code to a checkpoint.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|hook| hook.code() == code)
    }

    /// Returns the control-surface code.
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Returns the checkpoint name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::WaitInUpdateTransaction => "WAIT_IN_UPDATE_TRANSACTION",
            Self::WaitBeforeTransactionPersist => "WAIT_BEFORE_TRANSACTION_PERSIST",
            Self::PanicInUpdateTransaction => "PANIC_IN_UPDATE_TRANSACTION",
            Self::PanicBeforeTransactionPersist => "PANIC_BEFORE_TRANSACTION_PERSIST",
            Self::WaitInUpdateRollbackTransaction => "WAIT_IN_UPDATE_ROLLBACK_TRANSACTION",
            Self::PanicInUpdateRollbackTransaction => "PANIC_IN_UPDATE_ROLLBACK_TRANSACTION",
            Self::WaitBeforeRollbackTransactionPersist => {
                "WAIT_BEFORE_ROLLBACK_TRANSACTION_PERSIST"
            }
            Self::PanicBeforeRollbackTransactionPersist => {
                "PANIC_BEFORE_ROLLBACK_TRANSACTION_PERSIST"
            }
        }
    }

    /// Returns the built-in behavior of the checkpoint.
    #[must_use]
    pub const fn action(self) -> HookAction {
        match self {
            Self::WaitInUpdateTransaction
            | Self::WaitBeforeTransactionPersist
            | Self::WaitInUpdateRollbackTransaction
            | Self::WaitBeforeRollbackTransactionPersist => HookAction::Wait,
            Self::PanicInUpdateTransaction
            | Self::PanicBeforeTransactionPersist
            | Self::PanicInUpdateRollbackTransaction
            | Self::PanicBeforeRollbackTransactionPersist => HookAction::Panic,
        }
    }
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Built-in behavior of an armed checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    /// Spin until disarmed.
    Wait,
    /// Abort the process.
    Panic,
}

/// Observable state of one hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookState {
    /// The hook is armed.
    pub is_set: bool,
    /// The hook has fired at least once.
    pub is_triggered: bool,
    /// Times armed since last disarm.
    pub set_count: u32,
    /// Times fired.
    pub triggered_count: u32,
}

/// Passed to a hook behavior when its checkpoint fires.
pub struct HookContext<'a> {
    /// The checkpoint that fired.
    pub hook: HookType,
    /// Transaction passing through it.
    pub transaction_id: TransactionId,
    registry: &'a HookRegistry,
}

impl HookContext<'_> {
    /// Returns true while the hook stays armed.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.registry.get_hook_state(self.hook).is_set
    }

    /// Returns the registry's poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.registry.poll_interval
    }
}

/// A replacement behavior for a checkpoint.
pub type HookBehavior = Arc<dyn Fn(&HookContext<'_>) + Send + Sync>;

#[derive(Debug, Default)]
struct HookCounters {
    set: AtomicU32,
    triggered: AtomicU32,
}

/// The fixed table of checkpoints.
///
/// Arming and querying are lock-free, so a hook can be released from another
/// thread while a committer spins inside it.
pub struct HookRegistry {
    counters: [HookCounters; 8],
    behaviors: RwLock<HashMap<HookType, HookBehavior>>,
    poll_interval: Duration,
}

impl HookRegistry {
    /// Creates a registry with every hook disarmed.
    #[must_use]
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            counters: Default::default(),
            behaviors: RwLock::new(HashMap::new()),
            poll_interval,
        }
    }

    fn counters(&self, hook: HookType) -> &HookCounters {
        // Codes are 1..=8.
        &self.counters[(hook.code() - 1) as usize]
    }

    /// Arms a hook. Arming twice counts twice.
    pub fn set_hook(&self, hook: HookType) {
        let count = self.counters(hook).set.fetch_add(1, Ordering::SeqCst) + 1;
        info!(%hook, count, "hook armed");
    }

    /// Disarms a hook. Disarming a disarmed hook is a no-op.
    pub fn remove_hook(&self, hook: HookType) {
        if self.counters(hook).set.swap(0, Ordering::SeqCst) > 0 {
            info!(%hook, "hook disarmed");
        }
    }

    /// Returns a hook's counters.
    #[must_use]
    pub fn get_hook_state(&self, hook: HookType) -> HookState {
        let counters = self.counters(hook);
        let set_count = counters.set.load(Ordering::SeqCst);
        let triggered_count = counters.triggered.load(Ordering::SeqCst);
        HookState {
            is_set: set_count > 0,
            is_triggered: triggered_count > 0,
            set_count,
            triggered_count,
        }
    }

    /// Arms a hook by code.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown code.
    pub fn set_hook_by_code(&self, code: u32) -> DatabaseResult<()> {
        self.set_hook(Self::lookup(code)?);
        Ok(())
    }

    /// Disarms a hook by code.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown code.
    pub fn remove_hook_by_code(&self, code: u32) -> DatabaseResult<()> {
        self.remove_hook(Self::lookup(code)?);
        Ok(())
    }

    /// Returns a hook's counters by code.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown code.
    pub fn get_hook_state_by_code(&self, code: u32) -> DatabaseResult<HookState> {
        Ok(self.get_hook_state(Self::lookup(code)?))
    }

    fn lookup(code: u32) -> DatabaseResult<HookType> {
        HookType::from_code(code).ok_or_else(|| DatabaseError::not_found(format!("hook {code}")))
    }

    /// Replaces the behavior of a checkpoint.
    pub fn register(&self, hook: HookType, behavior: HookBehavior) {
        self.behaviors.write().insert(hook, behavior);
    }

    /// Restores the built-in behavior of a checkpoint.
    pub fn unregister(&self, hook: HookType) {
        self.behaviors.write().remove(&hook);
    }

    /// Runs a checkpoint.
    ///
    /// Does nothing unless the hook is armed. When armed, counts a trigger
    /// and runs the registered or built-in behavior.
    pub fn check_and_run(&self, hook: HookType, transaction_id: TransactionId) {
        let counters = self.counters(hook);
        if counters.set.load(Ordering::SeqCst) == 0 {
            return;
        }
        let triggered = counters.triggered.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(%hook, txn = %transaction_id, triggered, "hook triggered");

        let context = HookContext {
            hook,
            transaction_id,
            registry: self,
        };
        let behavior = self.behaviors.read().get(&hook).cloned();
        match behavior {
            Some(behavior) => behavior(&context),
            None => Self::run_builtin(&context),
        }
    }

    fn run_builtin(context: &HookContext<'_>) {
        match context.hook.action() {
            HookAction::Wait => {
                while context.is_armed() {
                    std::thread::sleep(context.poll_interval());
                }
                info!(hook = %context.hook, txn = %context.transaction_id, "hook released");
            }
            HookAction::Panic => {
                error!(hook = %context.hook, txn = %context.transaction_id, "panic hook fired");
                std::process::abort();
            }
        }
    }

    /// Clears every counter. Registered behaviors stay.
    pub fn reset(&self) {
        for counters in &self.counters {
            counters.set.store(0, Ordering::SeqCst);
            counters.triggered.store(0, Ordering::SeqCst);
        }
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let armed: Vec<HookType> = HookType::ALL
            .into_iter()
            .filter(|hook| self.get_hook_state(*hook).is_set)
            .collect();
        f.debug_struct("HookRegistry")
            .field("armed", &armed)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}
