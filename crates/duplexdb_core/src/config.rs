//! Engine configuration.

use crate::types::ObjectId;
use duplexdb_peer::MAX_MESSAGE_SIZE;
use std::time::Duration;

/// Configuration for a transaction engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Object slots per transaction.
    pub max_objects: usize,

    /// User slots per transaction.
    pub max_users: usize,

    /// Edge slots per transaction.
    pub max_edges: usize,

    /// Global-info slots per transaction.
    pub max_global_infos: usize,

    /// Capacity of each committed table.
    pub table_capacity: usize,

    /// Highest object id persisted through the system log.
    pub last_system_object_id: ObjectId,

    /// Attempts to open a busy log before giving up.
    pub persist_busy_retries: u32,

    /// Sleep between busy retries.
    pub persist_busy_delay: Duration,

    /// Wait for the transport to acknowledge a peer send.
    pub peer_ack_timeout: Duration,

    /// Wait for the peer to confirm a request.
    pub peer_confirm_timeout: Duration,

    /// How often a peer wait re-checks that the peer is alive.
    pub peer_poll_interval: Duration,

    /// Wait for a log commit on the auxiliary persist path.
    pub auxiliary_persist_timeout: Duration,

    /// How often an armed wait hook re-checks its counter.
    pub hook_poll_interval: Duration,

    /// How often `transaction_destroy` re-checks the slot.
    pub destroy_poll_interval: Duration,

    /// Commit messages larger than this use bulk transfer when available.
    pub dma_threshold: usize,

    /// Largest inbound request body this engine accepts.
    pub max_message_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_objects: 64,
            max_users: 64,
            max_edges: 128,
            max_global_infos: 16,
            table_capacity: 4096,
            last_system_object_id: ObjectId(31),
            persist_busy_retries: 10,
            persist_busy_delay: Duration::from_millis(3000),
            peer_ack_timeout: Duration::from_secs(30),
            peer_confirm_timeout: Duration::from_secs(30),
            peer_poll_interval: Duration::from_millis(100),
            auxiliary_persist_timeout: Duration::from_secs(180),
            hook_poll_interval: Duration::from_millis(100),
            destroy_poll_interval: Duration::from_millis(100),
            dma_threshold: 2048,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets object slots per transaction.
    #[must_use]
    pub const fn max_objects(mut self, value: usize) -> Self {
        self.max_objects = value;
        self
    }

    /// Sets user slots per transaction.
    #[must_use]
    pub const fn max_users(mut self, value: usize) -> Self {
        self.max_users = value;
        self
    }

    /// Sets edge slots per transaction.
    #[must_use]
    pub const fn max_edges(mut self, value: usize) -> Self {
        self.max_edges = value;
        self
    }

    /// Sets global-info slots per transaction.
    #[must_use]
    pub const fn max_global_infos(mut self, value: usize) -> Self {
        self.max_global_infos = value;
        self
    }

    /// Sets the capacity of each committed table.
    #[must_use]
    pub const fn table_capacity(mut self, value: usize) -> Self {
        self.table_capacity = value;
        self
    }

    /// Sets the system-log boundary.
    #[must_use]
    pub const fn last_system_object_id(mut self, id: ObjectId) -> Self {
        self.last_system_object_id = id;
        self
    }

    /// Sets busy retry count and delay.
    #[must_use]
    pub const fn persist_busy_retry(mut self, retries: u32, delay: Duration) -> Self {
        self.persist_busy_retries = retries;
        self.persist_busy_delay = delay;
        self
    }

    /// Sets both peer waits.
    #[must_use]
    pub const fn peer_timeouts(mut self, ack: Duration, confirm: Duration) -> Self {
        self.peer_ack_timeout = ack;
        self.peer_confirm_timeout = confirm;
        self
    }

    /// Sets the peer liveness poll interval.
    #[must_use]
    pub const fn peer_poll_interval(mut self, interval: Duration) -> Self {
        self.peer_poll_interval = interval;
        self
    }

    /// Sets the auxiliary persist wait.
    #[must_use]
    pub const fn auxiliary_persist_timeout(mut self, timeout: Duration) -> Self {
        self.auxiliary_persist_timeout = timeout;
        self
    }

    /// Sets the wait-hook poll interval.
    #[must_use]
    pub const fn hook_poll_interval(mut self, interval: Duration) -> Self {
        self.hook_poll_interval = interval;
        self
    }

    /// Sets the destroy poll interval.
    #[must_use]
    pub const fn destroy_poll_interval(mut self, interval: Duration) -> Self {
        self.destroy_poll_interval = interval;
        self
    }

    /// Sets the bulk-transfer threshold.
    #[must_use]
    pub const fn dma_threshold(mut self, bytes: usize) -> Self {
        self.dma_threshold = bytes;
        self
    }

    /// Sets the largest accepted inbound body.
    #[must_use]
    pub const fn max_message_size(mut self, bytes: u32) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Returns per-table slot limits for a new transaction.
    #[must_use]
    pub const fn slot_limits(&self) -> SlotLimits {
        SlotLimits {
            objects: self.max_objects,
            users: self.max_users,
            edges: self.max_edges,
            global_infos: self.max_global_infos,
        }
    }
}

/// Slot counts of a transaction's four tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLimits {
    /// Object slots.
    pub objects: usize,
    /// User slots.
    pub users: usize,
    /// Edge slots.
    pub edges: usize,
    /// Global-info slots.
    pub global_infos: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.persist_busy_retries, 10);
        assert_eq!(config.persist_busy_delay, Duration::from_millis(3000));
        assert_eq!(config.peer_ack_timeout, Duration::from_secs(30));
        assert_eq!(config.auxiliary_persist_timeout, Duration::from_secs(180));
        assert_eq!(config.max_message_size, MAX_MESSAGE_SIZE);
    }

    #[test]
    fn builder_pattern() {
        let config = EngineConfig::new()
            .max_objects(4)
            .last_system_object_id(ObjectId(9))
            .persist_busy_retry(3, Duration::from_millis(1))
            .dma_threshold(64);

        assert_eq!(config.slot_limits().objects, 4);
        assert_eq!(config.last_system_object_id, ObjectId(9));
        assert_eq!(config.persist_busy_retries, 3);
        assert_eq!(config.dma_threshold, 64);
    }
}
