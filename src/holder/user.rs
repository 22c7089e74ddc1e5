//! Users

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::cache::PermissionCache;
use crate::node::Node;

use super::{HolderError, HolderKind, NodeStore, PermissionHolder};

/// A user identified by UUID, with a mutable username and primary group
#[derive(Debug)]
pub struct User {
    uuid: Uuid,
    username: RwLock<Option<String>>,
    primary_group: RwLock<String>,
    online: AtomicBool,
    nodes: NodeStore,
    cache: PermissionCache,
}

impl User {
    pub fn new(uuid: Uuid, username: Option<&str>, primary_group: &str) -> Self {
        Self {
            uuid,
            username: RwLock::new(username.map(str::to_string)),
            primary_group: RwLock::new(primary_group.to_lowercase()),
            online: AtomicBool::new(false),
            nodes: NodeStore::default(),
            cache: PermissionCache::new(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn username(&self) -> Option<String> {
        self.username.read().clone()
    }

    /// Update the username, returning true if it changed
    pub fn set_username(&self, username: &str) -> bool {
        let mut current = self.username.write();
        if current.as_deref() == Some(username) {
            return false;
        }
        *current = Some(username.to_string());
        true
    }

    pub fn primary_group(&self) -> String {
        self.primary_group.read().clone()
    }

    /// Switch the primary group. The user must already inherit it.
    pub fn set_primary_group(&self, group: &str) -> Result<(), HolderError> {
        let group = group.to_lowercase();
        if !self.inherits_group(&group) {
            return Err(HolderError::NotInherited(self.friendly_name(), group));
        }
        *self.primary_group.write() = group;
        self.cache.invalidate();
        Ok(())
    }

    /// Set the primary group without the inheritance check (storage loads, scrubs)
    pub fn force_primary_group(&self, group: &str) {
        *self.primary_group.write() = group.to_lowercase();
        self.cache.invalidate();
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    /// Replace raw nodes and primary group in one step, as after a storage load
    pub fn load_data(&self, nodes: Vec<Node>, primary_group: &str) {
        *self.primary_group.write() = primary_group.to_lowercase();
        self.replace_nodes(nodes);
    }
}

impl PermissionHolder for User {
    fn object_name(&self) -> String {
        self.uuid.to_string()
    }

    fn friendly_name(&self) -> String {
        match self.username() {
            Some(name) => name,
            None => self.uuid.to_string(),
        }
    }

    fn kind(&self) -> HolderKind {
        HolderKind::User
    }

    fn node_store(&self) -> &NodeStore {
        &self.nodes
    }

    fn cache(&self) -> &PermissionCache {
        &self.cache
    }

    fn implicit_parent(&self) -> Option<String> {
        Some(self.primary_group())
    }
}
