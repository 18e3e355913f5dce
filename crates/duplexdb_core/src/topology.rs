//! Live object topology.
//!
//! Configuration jobs instantiate, reconfigure and tear down live objects as
//! they stage entries. The engine reaches the live side only through
//! [`Topology`], so reverting a transaction can undo those effects.

use crate::error::{DatabaseError, DatabaseResult};
use crate::types::ObjectId;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// The live objects and connections of one controller.
///
/// # Implementors
///
/// - [`InMemoryTopology`] - For testing and simulation
pub trait Topology: Send + Sync {
    /// Returns true if the object is instantiated.
    fn object_exists(&self, id: ObjectId) -> bool;

    /// Instantiates an object.
    ///
    /// # Errors
    ///
    /// Returns `ObjectExists` if the id is taken.
    fn create_object(&self, id: ObjectId, class_id: u32, config: &[u8]) -> DatabaseResult<()>;

    /// Pushes a new configuration into a live object.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` if the object is not instantiated.
    fn reconfigure_object(&self, id: ObjectId, config: &[u8]) -> DatabaseResult<()>;

    /// Tears down an object and every connection it is the client of.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` if the object is not instantiated.
    fn destroy_object(&self, id: ObjectId) -> DatabaseResult<()>;

    /// Connects `client` at `index` to `server`, replacing any connection there.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` if the client is not instantiated.
    fn connect_edge(&self, client: ObjectId, index: u16, server: ObjectId) -> DatabaseResult<()>;

    /// Drops the connection at `client`/`index`. Missing connections are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the topology refuses the change.
    fn disconnect_edge(&self, client: ObjectId, index: u16) -> DatabaseResult<()>;
}

/// A live object as seen by [`InMemoryTopology`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveObject {
    /// Class tag.
    pub class_id: u32,
    /// Current configuration.
    pub config: Vec<u8>,
}

#[derive(Debug, Default)]
struct TopologyState {
    objects: BTreeMap<ObjectId, LiveObject>,
    edges: BTreeMap<(ObjectId, u16), ObjectId>,
}

/// An in-memory topology.
#[derive(Debug, Default)]
pub struct InMemoryTopology {
    state: RwLock<TopologyState>,
}

impl InMemoryTopology {
    /// Creates an empty topology.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of a live object.
    #[must_use]
    pub fn object(&self, id: ObjectId) -> Option<LiveObject> {
        self.state.read().objects.get(&id).cloned()
    }

    /// Returns a copy of every live object.
    #[must_use]
    pub fn objects(&self) -> BTreeMap<ObjectId, LiveObject> {
        self.state.read().objects.clone()
    }

    /// Returns a copy of every connection, keyed by client and index.
    #[must_use]
    pub fn edges(&self) -> BTreeMap<(ObjectId, u16), ObjectId> {
        self.state.read().edges.clone()
    }
}

impl Topology for InMemoryTopology {
    fn object_exists(&self, id: ObjectId) -> bool {
        self.state.read().objects.contains_key(&id)
    }

    fn create_object(&self, id: ObjectId, class_id: u32, config: &[u8]) -> DatabaseResult<()> {
        let mut state = self.state.write();
        if state.objects.contains_key(&id) {
            return Err(DatabaseError::ObjectExists { id });
        }
        state.objects.insert(
            id,
            LiveObject {
                class_id,
                config: config.to_vec(),
            },
        );
        Ok(())
    }

    fn reconfigure_object(&self, id: ObjectId, config: &[u8]) -> DatabaseResult<()> {
        let mut state = self.state.write();
        let object = state
            .objects
            .get_mut(&id)
            .ok_or(DatabaseError::ObjectNotFound { id })?;
        object.config = config.to_vec();
        Ok(())
    }

    fn destroy_object(&self, id: ObjectId) -> DatabaseResult<()> {
        let mut state = self.state.write();
        if state.objects.remove(&id).is_none() {
            return Err(DatabaseError::ObjectNotFound { id });
        }
        state.edges.retain(|(client, _), _| *client != id);
        Ok(())
    }

    fn connect_edge(&self, client: ObjectId, index: u16, server: ObjectId) -> DatabaseResult<()> {
        let mut state = self.state.write();
        if !state.objects.contains_key(&client) {
            return Err(DatabaseError::ObjectNotFound { id: client });
        }
        state.edges.insert((client, index), server);
        Ok(())
    }

    fn disconnect_edge(&self, client: ObjectId, index: u16) -> DatabaseResult<()> {
        self.state.write().edges.remove(&(client, index));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_create_reconfigure_destroy() {
        let topology = InMemoryTopology::new();
        topology.create_object(ObjectId(5), 2, b"a").unwrap();
        assert!(matches!(
            topology.create_object(ObjectId(5), 2, b"a"),
            Err(DatabaseError::ObjectExists { .. })
        ));

        topology.reconfigure_object(ObjectId(5), b"b").unwrap();
        assert_eq!(topology.object(ObjectId(5)).unwrap().config, b"b");

        topology.destroy_object(ObjectId(5)).unwrap();
        assert!(!topology.object_exists(ObjectId(5)));
        assert!(matches!(
            topology.destroy_object(ObjectId(5)),
            Err(DatabaseError::ObjectNotFound { .. })
        ));
    }

    #[test]
    fn memory_destroy_drops_client_edges() {
        let topology = InMemoryTopology::new();
        topology.create_object(ObjectId(1), 1, b"").unwrap();
        topology.create_object(ObjectId(2), 1, b"").unwrap();
        topology.connect_edge(ObjectId(1), 0, ObjectId(2)).unwrap();
        topology.connect_edge(ObjectId(2), 0, ObjectId(1)).unwrap();

        topology.destroy_object(ObjectId(1)).unwrap();
        let edges = topology.edges();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges.get(&(ObjectId(2), 0)), Some(&ObjectId(1)));
    }

    #[test]
    fn memory_connect_requires_client() {
        let topology = InMemoryTopology::new();
        assert!(topology.connect_edge(ObjectId(3), 0, ObjectId(4)).is_err());
        topology.disconnect_edge(ObjectId(3), 0).unwrap();
    }
}
