//! Group registry

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::holder::{Group, PermissionHolder};
use crate::storage::GroupData;

/// Live groups keyed by lowercase name
#[derive(Debug, Default)]
pub struct GroupManager {
    groups: RwLock<HashMap<String, Arc<Group>>>,
}

impl GroupManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.read().get(&name.to_lowercase()).cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.groups.read().contains_key(&name.to_lowercase())
    }

    /// Return the named group, registering an empty one if absent
    pub fn get_or_make(&self, name: &str) -> Arc<Group> {
        let key = name.to_lowercase();
        if let Some(group) = self.groups.read().get(&key) {
            return group.clone();
        }
        self.groups
            .write()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Group::new(&key)))
            .clone()
    }

    /// Register a new empty group; `None` if the name is taken
    pub fn create(&self, name: &str) -> Option<Arc<Group>> {
        let key = name.to_lowercase();
        let mut groups = self.groups.write();
        if groups.contains_key(&key) {
            return None;
        }
        let group = Arc::new(Group::new(&key));
        groups.insert(key, group.clone());
        Some(group)
    }

    /// Apply a full storage read: loaded groups keep their identity (and so
    /// any outstanding references) but take the stored nodes, and groups that
    /// storage no longer has are dropped.
    pub fn load_all(&self, stored: Vec<GroupData>) {
        let names: Vec<String> = stored.iter().map(|g| g.name.to_lowercase()).collect();
        for data in stored {
            self.get_or_make(&data.name).replace_nodes(data.nodes);
        }
        self.groups.write().retain(|name, _| names.contains(name));
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.write().remove(&name.to_lowercase())
    }

    /// Snapshot of every loaded group, sorted by name
    pub fn all(&self) -> Vec<Arc<Group>> {
        let mut groups: Vec<Arc<Group>> = self.groups.read().values().cloned().collect();
        groups.sort_by(|a, b| a.name().cmp(b.name()));
        groups
    }

    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let manager = GroupManager::new();
        let made = manager.get_or_make("Admin");
        let again = manager.get_or_make("ADMIN");

        assert!(Arc::ptr_eq(&made, &again));
        assert!(manager.exists("admin"));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_create_refuses_existing() {
        let manager = GroupManager::new();
        assert!(manager.create("vip").is_some());
        assert!(manager.create("VIP").is_none());
    }

    #[test]
    fn test_load_all_replaces_and_drops() {
        let manager = GroupManager::new();
        let kept = manager.get_or_make("admin");
        kept.set_node("stale.node".parse().unwrap());
        manager.get_or_make("gone");

        manager.load_all(vec![GroupData {
            name: "admin".into(),
            nodes: vec!["fresh.node".parse().unwrap()],
        }]);

        assert!(Arc::ptr_eq(&kept, &manager.get("admin").unwrap()));
        assert_eq!(kept.nodes(), vec!["fresh.node".parse::<crate::node::Node>().unwrap()]);
        assert!(!manager.exists("gone"));
    }

    #[test]
    fn test_all_is_sorted_snapshot() {
        let manager = GroupManager::new();
        for name in ["vip", "admin", "default"] {
            manager.get_or_make(name);
        }
        let snapshot = manager.all();
        manager.remove("vip");

        let names: Vec<&str> = snapshot.iter().map(|g| g.name()).collect();
        assert_eq!(names, vec!["admin", "default", "vip"]);
        assert_eq!(manager.len(), 2);
    }
}
