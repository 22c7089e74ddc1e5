//! Groups

use crate::cache::PermissionCache;
use crate::node::{unix_now, Node};

use super::{HolderKind, NodeStore, PermissionHolder};

/// A named group. Names are case-insensitive and stored lowercase.
#[derive(Debug)]
pub struct Group {
    name: String,
    nodes: NodeStore,
    cache: PermissionCache,
}

impl Group {
    pub fn new(name: &str) -> Self {
        Self::with_nodes(name, Vec::new())
    }

    pub fn with_nodes(name: &str, nodes: Vec<Node>) -> Self {
        Self {
            name: name.to_lowercase(),
            nodes: NodeStore::new(nodes),
            cache: PermissionCache::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The highest live `weight.<n>` node, or 0
    pub fn weight(&self) -> i32 {
        let now = unix_now();
        self.nodes
            .snapshot()
            .iter()
            .filter(|n| n.value() && !n.has_expired(now))
            .filter_map(Node::weight)
            .max()
            .unwrap_or(0)
    }
}

impl PermissionHolder for Group {
    fn object_name(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> HolderKind {
        HolderKind::Group
    }

    fn node_store(&self) -> &NodeStore {
        &self.nodes
    }

    fn cache(&self) -> &PermissionCache {
        &self.cache
    }
}
