//! Process-wide server registry

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::server::Server;

#[derive(Default)]
pub struct ServerRegistry {
    servers: RwLock<HashMap<String, Arc<Server>>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Server>> {
        self.servers.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.servers.read().contains_key(id)
    }

    /// Insert a server, returning the one it replaced
    pub fn insert(&self, server: Arc<Server>) -> Option<Arc<Server>> {
        self.servers.write().insert(server.id().to_string(), server)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Server>> {
        self.servers.write().remove(id)
    }

    /// All servers, ordered by id
    pub fn all(&self) -> Vec<Arc<Server>> {
        let mut servers: Vec<_> = self.servers.read().values().cloned().collect();
        servers.sort_by(|a, b| a.id().cmp(b.id()));
        servers
    }

    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.read().is_empty()
    }
}
