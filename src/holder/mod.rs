//! Permission holders
//!
//! Users and groups share one capability surface: a set of raw nodes and a
//! lazily rebuilt permission cache. Inheritance traversal, merging and the
//! cascading invalidation only ever talk to [`PermissionHolder`].

mod group;
mod user;

pub use group::Group;
pub use user::User;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::cache::{CalculatedData, PermissionCache, Tristate};
use crate::inheritance::InheritanceResolver;
use crate::node::{EquivalenceKey, Node, QueryContext};

/// Which kind of holder this is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HolderKind {
    User,
    Group,
}

impl fmt::Display for HolderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HolderKind::User => f.write_str("user"),
            HolderKind::Group => f.write_str("group"),
        }
    }
}

/// Outcome of a single raw-node mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataMutateResult {
    /// The raw node set changed
    Success,
    /// An identical node was already present
    AlreadyHas,
    /// No equivalent node was present to remove
    LacksNode,
}

impl DataMutateResult {
    pub fn changed(&self) -> bool {
        matches!(self, DataMutateResult::Success)
    }
}

/// Validation failures raised at the mutation boundary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HolderError {
    #[error("{0} does not inherit group '{1}'")]
    NotInherited(String, String),

    #[error("group '{0}' cannot inherit itself")]
    SelfInheritance(String),

    #[error("invalid weight '{0}'")]
    InvalidWeight(String),

    #[error("invalid group name '{0}'")]
    InvalidGroupName(String),
}

/// Reject nodes whose key claims a meaning its value cannot carry. A
/// `weight.<n>` node must name an `i32`.
pub fn validate_node(node: &Node) -> Result<(), HolderError> {
    if let Some(weight) = node.key().strip_prefix("weight.") {
        if node.weight().is_none() {
            return Err(HolderError::InvalidWeight(weight.to_string()));
        }
    }
    Ok(())
}

/// Raw nodes of one holder, at most one per equivalence class
#[derive(Debug, Default)]
pub struct NodeStore {
    nodes: RwLock<BTreeMap<EquivalenceKey, Node>>,
}

impl NodeStore {
    pub fn new(nodes: Vec<Node>) -> Self {
        let store = Self::default();
        store.replace_all(nodes);
        store
    }

    /// Copy of the current raw nodes, in equivalence-key order
    pub fn snapshot(&self) -> Vec<Node> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Insert a node, replacing any equivalent node
    pub fn set(&self, node: Node) -> DataMutateResult {
        let mut nodes = self.nodes.write();
        let key = node.equivalence_key();
        if nodes.get(&key) == Some(&node) {
            return DataMutateResult::AlreadyHas;
        }
        nodes.insert(key, node);
        DataMutateResult::Success
    }

    /// Remove the node equivalent to `node`
    pub fn unset(&self, node: &Node) -> DataMutateResult {
        match self.nodes.write().remove(&node.equivalence_key()) {
            Some(_) => DataMutateResult::Success,
            None => DataMutateResult::LacksNode,
        }
    }

    /// Remove every node matching `filter`, returning how many were removed
    pub fn clear(&self, filter: &dyn Fn(&Node) -> bool) -> usize {
        let mut nodes = self.nodes.write();
        let before = nodes.len();
        nodes.retain(|_, n| !filter(n));
        before - nodes.len()
    }

    pub fn replace_all(&self, new_nodes: Vec<Node>) {
        let mut nodes = self.nodes.write();
        nodes.clear();
        for node in new_nodes {
            nodes.insert(node.equivalence_key(), node);
        }
    }

    /// The stored node equivalent to `node`, if any
    pub fn get_equivalent(&self, node: &Node) -> Option<Node> {
        self.nodes.read().get(&node.equivalence_key()).cloned()
    }

    /// Drop nodes whose expiry has passed, returning them
    pub fn remove_expired(&self, now: i64) -> Vec<Node> {
        let mut nodes = self.nodes.write();
        let expired: Vec<EquivalenceKey> = nodes
            .iter()
            .filter(|(_, n)| n.has_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|k| nodes.remove(&k))
            .collect()
    }
}

/// Common surface of users and groups
pub trait PermissionHolder: Send + Sync {
    /// Stable identity: the group name or the user's UUID
    fn object_name(&self) -> String;

    /// Human-readable name for messages and logs
    fn friendly_name(&self) -> String {
        self.object_name()
    }

    fn kind(&self) -> HolderKind;

    fn node_store(&self) -> &NodeStore;

    fn cache(&self) -> &PermissionCache;

    /// Group inherited without an explicit node (a user's primary group)
    fn implicit_parent(&self) -> Option<String> {
        None
    }

    fn nodes(&self) -> Vec<Node> {
        self.node_store().snapshot()
    }

    fn set_node(&self, node: Node) -> DataMutateResult {
        let result = self.node_store().set(node);
        self.cache().invalidate();
        result
    }

    fn unset_node(&self, node: &Node) -> DataMutateResult {
        let result = self.node_store().unset(node);
        self.cache().invalidate();
        result
    }

    fn clear_nodes(&self, filter: &dyn Fn(&Node) -> bool) -> usize {
        let removed = self.node_store().clear(filter);
        self.cache().invalidate();
        removed
    }

    fn replace_nodes(&self, nodes: Vec<Node>) {
        self.node_store().replace_all(nodes);
        self.cache().invalidate();
    }

    /// Remove expired nodes; the cache is only touched when something changed
    fn audit_expired(&self, now: i64) -> Vec<Node> {
        let removed = self.node_store().remove_expired(now);
        if !removed.is_empty() {
            self.cache().invalidate();
        }
        removed
    }

    /// Add an inheritance edge to the group named by `parent`, a `group.<name>`
    /// node carrying any scope. A group may not inherit itself.
    fn set_inherit_group(&self, parent: &Node) -> Result<DataMutateResult, HolderError> {
        let Some(name) = parent.group_name() else {
            return Err(HolderError::InvalidGroupName(parent.key().to_string()));
        };
        if self.kind() == HolderKind::Group && name == self.object_name() {
            return Err(HolderError::SelfInheritance(name.to_string()));
        }
        Ok(self.set_node(parent.with_value(true)))
    }

    fn unset_inherit_group(&self, parent: &Node) -> Result<DataMutateResult, HolderError> {
        if !parent.is_group_node() {
            return Err(HolderError::InvalidGroupName(parent.key().to_string()));
        }
        Ok(self.unset_node(parent))
    }

    fn has_node(&self, node: &Node) -> Option<Node> {
        self.node_store().get_equivalent(node)
    }

    /// Names of every group this holder references with a true group node,
    /// in any context, plus the implicit parent. Used for reverse-edge
    /// computation, so it errs on the side of including edges.
    fn parent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .nodes()
            .iter()
            .filter(|n| n.value())
            .filter_map(|n| n.group_name().map(str::to_string))
            .collect();
        if let Some(implicit) = self.implicit_parent() {
            names.push(implicit);
        }
        names.sort();
        names.dedup();
        names
    }

    /// Whether the holder has a global, permanent, true `group.<name>` node
    fn inherits_group(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.nodes().iter().any(|n| {
            n.value()
                && n.server().is_none()
                && n.world().is_none()
                && n.contexts().is_empty()
                && n.group_name() == Some(name.as_str())
        })
    }

    /// The resolved view for `ctx`, rebuilt on demand
    fn calculated(
        &self,
        resolver: &InheritanceResolver<'_>,
        ctx: &QueryContext,
    ) -> Arc<CalculatedData> {
        self.cache()
            .get_or_calculate(ctx, || resolver.calculate(self, ctx))
    }

    fn has_permission(
        &self,
        resolver: &InheritanceResolver<'_>,
        key: &str,
        ctx: &QueryContext,
    ) -> Tristate {
        self.calculated(resolver, ctx).permission_value(key)
    }

    fn get_meta(
        &self,
        resolver: &InheritanceResolver<'_>,
        key: &str,
        ctx: &QueryContext,
    ) -> Option<String> {
        self.calculated(resolver, ctx).meta(key).map(str::to_string)
    }
}

/// A loaded holder of either kind
#[derive(Debug, Clone)]
pub enum HolderRef {
    User(Arc<User>),
    Group(Arc<Group>),
}

impl HolderRef {
    pub fn as_holder(&self) -> &dyn PermissionHolder {
        match self {
            HolderRef::User(user) => user.as_ref(),
            HolderRef::Group(group) => group.as_ref(),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, HolderRef::Group(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(s: &str) -> Node {
        s.parse().unwrap()
    }

    #[test]
    fn test_set_replaces_equivalent_node() {
        let store = NodeStore::default();
        assert_eq!(store.set(node("a.b")), DataMutateResult::Success);
        assert_eq!(store.set(node("a.b")), DataMutateResult::AlreadyHas);
        assert_eq!(store.set(node("-a.b")), DataMutateResult::Success);

        assert_eq!(store.len(), 1);
        assert!(!store.snapshot()[0].value());
    }

    #[test]
    fn test_unset_and_clear() {
        let store = NodeStore::new(vec![node("a.b"), node("survival/a.b"), node("c.d")]);
        assert_eq!(store.unset(&node("-a.b")), DataMutateResult::Success);
        assert_eq!(store.unset(&node("a.b")), DataMutateResult::LacksNode);

        let removed = store.clear(&|n: &Node| n.server() == Some("survival"));
        assert_eq!(removed, 1);
        assert_eq!(store.snapshot(), vec![node("c.d")]);
    }

    #[test]
    fn test_remove_expired() {
        let store = NodeStore::new(vec![node("a.b$100"), node("c.d"), node("e.f$9000000000")]);
        let removed = store.remove_expired(1_000);
        assert_eq!(removed, vec![node("a.b$100")]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_parent_names_and_inherits() {
        let group = Group::new("mod");
        group.set_node(node("group.default"));
        group.set_node(node("survival/group.builder"));
        group.set_node(node("-group.banned"));

        assert_eq!(group.parent_names(), vec!["builder", "default"]);
        assert!(group.inherits_group("DEFAULT"));
        assert!(!group.inherits_group("builder"));
        assert!(!group.inherits_group("banned"));
    }

    #[test]
    fn test_inherit_group_helpers() {
        let group = Group::new("mod");
        assert_eq!(
            group.set_inherit_group(&node("group.mod")),
            Err(HolderError::SelfInheritance("mod".to_string()))
        );
        assert_eq!(
            group.set_inherit_group(&node("a.b")),
            Err(HolderError::InvalidGroupName("a.b".to_string()))
        );

        assert_eq!(
            group.set_inherit_group(&node("-group.default")),
            Ok(DataMutateResult::Success)
        );
        assert!(group.inherits_group("default"));
        assert_eq!(
            group.unset_inherit_group(&node("group.default")),
            Ok(DataMutateResult::Success)
        );
        assert!(group.nodes().is_empty());
    }

    #[test]
    fn test_weight_nodes_must_carry_an_i32() {
        assert_eq!(validate_node(&node("weight.10")), Ok(()));
        assert_eq!(validate_node(&node("-weight.5")), Ok(()));
        assert_eq!(validate_node(&node("weightless.perm")), Ok(()));
        assert_eq!(
            validate_node(&node("weight.abc")),
            Err(HolderError::InvalidWeight("abc".to_string()))
        );
        assert_eq!(
            validate_node(&node("weight.99999999999")),
            Err(HolderError::InvalidWeight("99999999999".to_string()))
        );
    }
}
