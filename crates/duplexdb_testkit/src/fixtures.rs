//! Controller fixtures.
//!
//! [`SoloController`] is one engine with inspectable collaborators.
//! [`DuplexArray`] is an active and a passive engine joined by a loopback
//! link, sharing the persistence logs and intent store the way both
//! controllers of an array share the same disks.

use crate::faults::FaultyPersistLog;
use duplexdb_core::{
    ControllerRole, EdgeEntry, Engine, EngineBuilder, EngineConfig, Entry, EntryTables,
    GlobalInfoEntry, InMemoryTopology, JobNotifier, JobNumber, LiveObject, ObjectConfig,
    ObjectEntry, ObjectId, RecordingJobNotifier, Topology, TransactionInfo, UserEntry,
};
use duplexdb_peer::{InboundHandler, LoopbackEndpoint, LoopbackLink, PeerChannel};
use duplexdb_persist::{
    EntryId, FileIntentStore, InMemoryIntentStore, InMemorySystemLog, IntentStore, PersistLog,
    SystemLog,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Engine configuration with short waits, for tests.
#[must_use]
pub fn test_config() -> EngineConfig {
    EngineConfig::default()
        .persist_busy_retry(3, Duration::from_millis(1))
        .peer_timeouts(Duration::from_secs(5), Duration::from_secs(5))
        .peer_poll_interval(Duration::from_millis(5))
        .hook_poll_interval(Duration::from_millis(2))
        .destroy_poll_interval(Duration::from_millis(2))
        .auxiliary_persist_timeout(Duration::from_secs(5))
}

/// Shorthand for a transaction of job `n`.
#[must_use]
pub fn job(n: u64) -> TransactionInfo {
    TransactionInfo::new(JobNumber(n))
}

/// An object create of class `class_id` with a small config blob.
#[must_use]
pub fn object(id: u32, class_id: u32) -> ObjectEntry {
    Entry::create(
        ObjectId(id),
        ObjectConfig {
            class_id,
            config: format!("class-{class_id}").into_bytes(),
        },
    )
}

/// Polls `condition` until it holds or `timeout` elapses.
///
/// Returns the last value of `condition`.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// One engine with its logs, topology and job notifier exposed.
pub struct SoloController {
    /// The engine.
    pub engine: Arc<Engine>,
    /// The general log.
    pub persist: Arc<FaultyPersistLog>,
    /// The system log.
    pub system: Arc<InMemorySystemLog>,
    /// The intent store.
    pub intents: Arc<InMemoryIntentStore>,
    /// The live topology.
    pub topology: Arc<InMemoryTopology>,
    /// Jobs reported done by recovery.
    pub jobs: Arc<RecordingJobNotifier>,
}

impl SoloController {
    /// Creates a controller with [`test_config`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Creates a controller with `config`.
    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        let persist = Arc::new(FaultyPersistLog::new());
        let system = Arc::new(InMemorySystemLog::new());
        let intents = Arc::new(InMemoryIntentStore::new());
        let topology = Arc::new(InMemoryTopology::new());
        let jobs = Arc::new(RecordingJobNotifier::new());
        let engine = EngineBuilder::new(config)
            .with_persist_log(Arc::clone(&persist) as Arc<dyn PersistLog>)
            .with_system_log(Arc::clone(&system) as Arc<dyn SystemLog>)
            .with_intent_store(Arc::clone(&intents) as Arc<dyn IntentStore>)
            .with_topology(Arc::clone(&topology) as Arc<dyn Topology>)
            .with_job_notifier(Arc::clone(&jobs) as Arc<dyn JobNotifier>)
            .build();
        Self {
            engine,
            persist,
            system,
            intents,
            topology,
            jobs,
        }
    }

    /// Commits `entries` as one transaction of job `n`.
    pub fn seed(&self, n: u64, entries: impl IntoIterator<Item = ObjectEntry>) {
        self.engine.start(job(n)).expect("seed start");
        for entry in entries {
            self.engine.add_object_entry(entry).expect("seed stage");
        }
        self.engine.commit().expect("seed commit");
    }
}

impl Default for SoloController {
    fn default() -> Self {
        Self::new()
    }
}

/// One engine whose intent record lives in a file under a temporary
/// directory.
pub struct DurableController {
    /// The engine.
    pub engine: Arc<Engine>,
    /// The general log.
    pub persist: Arc<FaultyPersistLog>,
    /// The file-backed intent store.
    pub intents: Arc<FileIntentStore>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: TempDir,
}

impl DurableController {
    /// Creates a controller with [`test_config`].
    #[must_use]
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let intents = Arc::new(
            FileIntentStore::open(&temp_dir.path().join("intent").join("record"))
                .expect("Failed to open intent store"),
        );
        let persist = Arc::new(FaultyPersistLog::new());
        let engine = EngineBuilder::new(test_config())
            .with_persist_log(Arc::clone(&persist) as Arc<dyn PersistLog>)
            .with_intent_store(Arc::clone(&intents) as Arc<dyn IntentStore>)
            .build();
        Self {
            engine,
            persist,
            intents,
            _temp_dir: temp_dir,
        }
    }

    /// Returns the path of the intent record file.
    #[must_use]
    pub fn intent_path(&self) -> &Path {
        self.intents.path()
    }

    /// Opens a second store over the same file, as a restarted controller
    /// would.
    #[must_use]
    pub fn reopen_intents(&self) -> FileIntentStore {
        FileIntentStore::open(self.intent_path()).expect("Failed to reopen intent store")
    }
}

impl Default for DurableController {
    fn default() -> Self {
        Self::new()
    }
}

/// Two controllers joined by a loopback link.
///
/// Both engines write the same general log, system log and intent store.
/// Each keeps its own committed tables and live topology.
pub struct DuplexArray {
    /// The controller that drives transactions.
    pub active: Arc<Engine>,
    /// The controller that mirrors them.
    pub passive: Arc<Engine>,
    /// The active controller's end of the link.
    pub active_link: Arc<LoopbackEndpoint>,
    /// The passive controller's end of the link.
    pub passive_link: Arc<LoopbackEndpoint>,
    /// The shared general log.
    pub persist: Arc<FaultyPersistLog>,
    /// The shared system log.
    pub system: Arc<InMemorySystemLog>,
    /// The shared intent store.
    pub intents: Arc<InMemoryIntentStore>,
    /// The active controller's live topology.
    pub active_topology: Arc<InMemoryTopology>,
    /// The passive controller's live topology.
    pub passive_topology: Arc<InMemoryTopology>,
    /// Jobs the passive controller reported done during recovery.
    pub passive_jobs: Arc<RecordingJobNotifier>,
}

impl DuplexArray {
    /// Creates an array with [`test_config`] on both sides.
    #[must_use]
    pub fn new() -> Self {
        Self::with_configs(test_config(), test_config())
    }

    /// Creates an array with a separate configuration per controller.
    #[must_use]
    pub fn with_configs(active: EngineConfig, passive: EngineConfig) -> Self {
        let persist = Arc::new(FaultyPersistLog::new());
        let system = Arc::new(InMemorySystemLog::new());
        let intents = Arc::new(InMemoryIntentStore::new());
        let (a, b) = LoopbackLink::pair();
        let active_link = Arc::new(a);
        let passive_link = Arc::new(b);
        let active_topology = Arc::new(InMemoryTopology::new());
        let passive_topology = Arc::new(InMemoryTopology::new());
        let passive_jobs = Arc::new(RecordingJobNotifier::new());

        let shared = |builder: EngineBuilder| {
            builder
                .with_persist_log(Arc::clone(&persist) as Arc<dyn PersistLog>)
                .with_system_log(Arc::clone(&system) as Arc<dyn SystemLog>)
                .with_intent_store(Arc::clone(&intents) as Arc<dyn IntentStore>)
        };
        let active_engine = shared(EngineBuilder::new(active))
            .role(ControllerRole::Active)
            .with_topology(Arc::clone(&active_topology) as Arc<dyn Topology>)
            .with_peer(Arc::clone(&active_link) as Arc<dyn PeerChannel>)
            .build();
        let passive_engine = shared(EngineBuilder::new(passive))
            .role(ControllerRole::Passive)
            .with_topology(Arc::clone(&passive_topology) as Arc<dyn Topology>)
            .with_peer(Arc::clone(&passive_link) as Arc<dyn PeerChannel>)
            .with_job_notifier(Arc::clone(&passive_jobs) as Arc<dyn JobNotifier>)
            .build();

        let weak: Weak<dyn InboundHandler> =
            Arc::downgrade(&(Arc::clone(&active_engine) as Arc<dyn InboundHandler>));
        active_link.attach(weak);
        let weak: Weak<dyn InboundHandler> =
            Arc::downgrade(&(Arc::clone(&passive_engine) as Arc<dyn InboundHandler>));
        passive_link.attach(weak);

        Self {
            active: active_engine,
            passive: passive_engine,
            active_link,
            passive_link,
            persist,
            system,
            intents,
            active_topology,
            passive_topology,
            passive_jobs,
        }
    }

    /// Marks the active controller dead.
    ///
    /// Parked sends from it complete as if the transport gave up.
    pub fn kill_active(&self) {
        self.active_link.set_alive(false);
    }

    /// Marks the passive controller dead.
    pub fn kill_passive(&self) {
        self.passive_link.set_alive(false);
    }

    /// Commits `entries` as one transaction of job `n` through the active
    /// controller.
    pub fn seed(&self, n: u64, entries: impl IntoIterator<Item = ObjectEntry>) {
        self.active.start(job(n)).expect("seed start");
        for entry in entries {
            self.active.add_object_entry(entry).expect("seed stage");
        }
        self.active.commit().expect("seed commit");
    }
}

impl Default for DuplexArray {
    fn default() -> Self {
        Self::new()
    }
}

/// A comparable copy of an engine's committed tables.
///
/// Entry ids are left out: an entry restored by rollback is rewritten and
/// lands at a fresh location in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableImage {
    /// Committed objects.
    pub objects: Vec<ObjectEntry>,
    /// Committed users.
    pub users: Vec<UserEntry>,
    /// Committed edges.
    pub edges: Vec<EdgeEntry>,
    /// Committed global info.
    pub global_infos: Vec<GlobalInfoEntry>,
}

impl TableImage {
    /// Captures the committed tables.
    #[must_use]
    pub fn capture(tables: &EntryTables) -> Self {
        Self {
            objects: unplaced(tables.objects().snapshot()),
            users: unplaced(tables.users().snapshot()),
            edges: unplaced(tables.edges().snapshot()),
            global_infos: unplaced(tables.global_infos().snapshot()),
        }
    }

    /// Captures the committed tables of `engine`.
    #[must_use]
    pub fn of(engine: &Engine) -> Self {
        Self::capture(engine.tables())
    }
}

fn unplaced<P>(entries: Vec<Entry<P>>) -> Vec<Entry<P>> {
    entries
        .into_iter()
        .map(|mut entry| {
            entry.header.entry_id = EntryId::UNPLACED;
            entry
        })
        .collect()
}

/// A copy of a live topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyImage {
    /// Live objects.
    pub objects: BTreeMap<ObjectId, LiveObject>,
    /// Live edges, client and index to server.
    pub edges: BTreeMap<(ObjectId, u16), ObjectId>,
}

impl TopologyImage {
    /// Captures `topology`.
    #[must_use]
    pub fn capture(topology: &InMemoryTopology) -> Self {
        Self {
            objects: topology.objects(),
            edges: topology.edges(),
        }
    }
}
