//! The transaction engine.
//!
//! [`Engine`] owns the transaction slot of one controller and everything a
//! transaction touches: the committed tables, the two logs, the intent
//! store, the live topology and the link to the peer controller.
//!
//! # Roles
//!
//! The active controller drives transactions: it stages, persists and
//! replicates every step to the passive controller. The passive controller
//! mirrors those steps in memory through its inbound handler and never
//! writes the logs. When the active controller dies, the passive one calls
//! [`Engine::recover_after_peer_death`], which promotes it and finishes or
//! reverts whatever transaction was in flight.
//!
//! # Example
//!
//! ```rust,ignore
//! use duplexdb_core::{EngineBuilder, EngineConfig, Entry, ObjectConfig, ObjectId};
//! use duplexdb_core::{JobNumber, TransactionInfo};
//!
//! let engine = EngineBuilder::new(EngineConfig::default()).build();
//! engine.start(TransactionInfo::new(JobNumber(1)))?;
//! engine.add_object_entry(Entry::create(ObjectId(100), ObjectConfig::default()))?;
//! engine.commit()?;
//! ```

mod handler;
mod lifecycle;
mod maintenance;
mod peer;
mod recovery;

pub use recovery::RecoveryAction;

use crate::config::EngineConfig;
use crate::error::{DatabaseError, DatabaseResult};
use crate::hooks::HookRegistry;
use crate::jobs::{JobNotifier, NullJobNotifier};
use crate::table::EntryTables;
use crate::topology::{InMemoryTopology, Topology};
use crate::transaction::apply::{self, ApplyContext};
use crate::transaction::session::{BusyRetry, LogSession};
use crate::transaction::{Direction, Transaction, TransactionManager, WalkReport};
use crate::types::{ControllerRole, ServiceState, TransactionId, TransactionState};
use duplexdb_peer::{PeerChannel, TransactionBackup};
use duplexdb_persist::{
    InMemoryIntentStore, InMemoryPersistLog, InMemorySystemLog, IntentRecord, IntentStore,
    PersistLog, SystemLog,
};
use parking_lot::{Mutex, RwLock};
use peer::PeerLink;
use std::sync::Arc;
use tracing::{info, warn};

/// The configuration transaction engine of one controller.
pub struct Engine {
    config: EngineConfig,
    role: RwLock<ControllerRole>,
    service: RwLock<ServiceState>,
    manager: TransactionManager,
    tables: EntryTables,
    hooks: Arc<HookRegistry>,
    topology: Arc<dyn Topology>,
    persist: Arc<dyn PersistLog>,
    system: Arc<dyn SystemLog>,
    intents: Arc<dyn IntentStore>,
    jobs: Arc<dyn JobNotifier>,
    peer: PeerLink,
    /// Entry ids last received by bulk transfer.
    backup: Mutex<Option<TransactionBackup>>,
}

/// Assembles an [`Engine`].
///
/// Every collaborator defaults to an in-memory implementation, and the
/// engine starts as the active controller with no peer.
pub struct EngineBuilder {
    config: EngineConfig,
    role: ControllerRole,
    service: ServiceState,
    hooks: Option<Arc<HookRegistry>>,
    topology: Option<Arc<dyn Topology>>,
    persist: Option<Arc<dyn PersistLog>>,
    system: Option<Arc<dyn SystemLog>>,
    intents: Option<Arc<dyn IntentStore>>,
    jobs: Option<Arc<dyn JobNotifier>>,
    peer: Option<Arc<dyn PeerChannel>>,
}

impl EngineBuilder {
    /// Starts a builder with `config`.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            role: ControllerRole::Active,
            service: ServiceState::Ready,
            hooks: None,
            topology: None,
            persist: None,
            system: None,
            intents: None,
            jobs: None,
            peer: None,
        }
    }

    /// Uses `persist` as the general-objects log.
    #[must_use]
    pub fn with_persist_log(mut self, persist: Arc<dyn PersistLog>) -> Self {
        self.persist = Some(persist);
        self
    }

    /// Uses `system` as the system-objects log.
    #[must_use]
    pub fn with_system_log(mut self, system: Arc<dyn SystemLog>) -> Self {
        self.system = Some(system);
        self
    }

    /// Uses `intents` to record commit intent.
    #[must_use]
    pub fn with_intent_store(mut self, intents: Arc<dyn IntentStore>) -> Self {
        self.intents = Some(intents);
        self
    }

    /// Uses `topology` as the live object graph.
    #[must_use]
    pub fn with_topology(mut self, topology: Arc<dyn Topology>) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Uses `jobs` to report recovered jobs.
    #[must_use]
    pub fn with_job_notifier(mut self, jobs: Arc<dyn JobNotifier>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Shares `hooks` with the engine.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Connects the engine to its peer controller.
    ///
    /// The caller still has to attach the built engine as the channel's
    /// inbound handler.
    #[must_use]
    pub fn with_peer(mut self, peer: Arc<dyn PeerChannel>) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Sets the controller role.
    #[must_use]
    pub fn role(mut self, role: ControllerRole) -> Self {
        self.role = role;
        self
    }

    /// Sets the initial service state.
    #[must_use]
    pub fn service_state(mut self, service: ServiceState) -> Self {
        self.service = service;
        self
    }

    /// Builds the engine.
    #[must_use]
    pub fn build(self) -> Arc<Engine> {
        let config = self.config;
        let hooks = self
            .hooks
            .unwrap_or_else(|| Arc::new(HookRegistry::new(config.hook_poll_interval)));
        Arc::new(Engine {
            role: RwLock::new(self.role),
            service: RwLock::new(self.service),
            manager: TransactionManager::new(config.slot_limits()),
            tables: EntryTables::new(&config),
            hooks,
            topology: self
                .topology
                .unwrap_or_else(|| Arc::new(InMemoryTopology::new())),
            persist: self
                .persist
                .unwrap_or_else(|| Arc::new(InMemoryPersistLog::new())),
            system: self
                .system
                .unwrap_or_else(|| Arc::new(InMemorySystemLog::new())),
            intents: self
                .intents
                .unwrap_or_else(|| Arc::new(InMemoryIntentStore::new())),
            jobs: self.jobs.unwrap_or_else(|| Arc::new(NullJobNotifier)),
            peer: PeerLink::new(self.peer, &config),
            backup: Mutex::new(None),
            config,
        })
    }
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("role", &self.role)
            .field("peer", &self.peer.is_some())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Returns the engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the committed tables.
    #[must_use]
    pub fn tables(&self) -> &EntryTables {
        &self.tables
    }

    /// Returns the hook registry.
    #[must_use]
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    /// Returns the live topology.
    #[must_use]
    pub fn topology(&self) -> &Arc<dyn Topology> {
        &self.topology
    }

    /// Returns the state of the transaction slot.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.manager.state()
    }

    /// Returns the id of the in-flight transaction, or the invalid id.
    #[must_use]
    pub fn current_id(&self) -> TransactionId {
        self.manager.current_id()
    }

    /// Returns a copy of the in-flight transaction.
    #[must_use]
    pub fn snapshot(&self) -> Option<Transaction> {
        self.manager.snapshot()
    }

    /// Puts a transaction restored from elsewhere into the empty slot.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyActive` if the slot is occupied.
    pub fn install_transaction(&self, txn: Transaction) -> DatabaseResult<()> {
        info!(txn = %txn.id(), state = %txn.state(), "transaction installed");
        self.manager.install(txn)
    }

    /// Returns this controller's role.
    #[must_use]
    pub fn role(&self) -> ControllerRole {
        *self.role.read()
    }

    /// Makes this controller the active one.
    pub fn promote(&self) {
        let mut role = self.role.write();
        if *role != ControllerRole::Active {
            info!("controller promoted to active");
            *role = ControllerRole::Active;
        }
    }

    /// Returns the service state.
    #[must_use]
    pub fn service_state(&self) -> ServiceState {
        *self.service.read()
    }

    /// Sets the service state.
    pub fn set_service_state(&self, state: ServiceState) {
        *self.service.write() = state;
    }

    /// Returns true if a peer controller is connected and alive.
    #[must_use]
    pub fn is_peer_alive(&self) -> bool {
        self.peer.is_peer_alive()
    }

    fn is_active(&self) -> bool {
        self.role() == ControllerRole::Active
    }

    fn ensure_active_role(&self) -> DatabaseResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(DatabaseError::WrongRole)
        }
    }

    fn busy_retry(&self) -> BusyRetry {
        BusyRetry {
            attempts: self.config.persist_busy_retries,
            delay: self.config.persist_busy_delay,
        }
    }

    fn open_session(&self) -> DatabaseResult<LogSession<'_>> {
        LogSession::open(&*self.persist, &*self.system, self.busy_retry())
    }

    fn walk(
        &self,
        txn: &mut Transaction,
        direction: Direction,
        session: Option<&LogSession<'_>>,
    ) -> WalkReport {
        let ctx = ApplyContext {
            tables: &self.tables,
            topology: &*self.topology,
            session,
            last_system_object_id: self.config.last_system_object_id,
            transaction_id: txn.id(),
        };
        apply::walk(txn, direction, &ctx)
    }

    fn record_intent(&self, intent: &IntentRecord) -> DatabaseResult<()> {
        self.intents.record(intent)?;
        Ok(())
    }

    fn clear_intent(&self) {
        if let Err(e) = self.intents.clear() {
            warn!(error = %e, "intent record not cleared");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("role", &self.role())
            .field("service", &self.service_state())
            .field("manager", &self.manager)
            .field("tables", &self.tables.total_len())
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}
