//! Permission nodes
//!
//! A node is one immutable assertion held by a user or group:
//! - a permission (`essentials.home`, wildcards like `essentials.*`)
//! - a group reference (`group.admin`)
//! - a group weight (`weight.10`)
//! - meta (`meta.rank.3`), prefix (`prefix.100.[Admin]`) or suffix
//!
//! Every node carries a value, an optional server/world scope, optional
//! extra context predicates and an optional absolute expiry (Unix seconds).

mod context;
mod factory;

pub use context::{normalize_scope, QueryContext, GLOBAL};
pub use factory::{
    group_node, meta_node, prefix_node, specificity_cmp, suffix_node, to_command, weight_node,
    NodeParseError,
};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Current time in Unix seconds, the clock all expiry checks use
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Identity used when deciding which of two nodes overrides the other.
/// Value and expiry are deliberately not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EquivalenceKey {
    pub key: String,
    pub server: Option<String>,
    pub world: Option<String>,
    pub contexts: BTreeMap<String, String>,
}

/// A single permission or meta assertion
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    key: String,
    value: bool,
    server: Option<String>,
    world: Option<String>,
    expiry: Option<i64>,
    contexts: BTreeMap<String, String>,
}

impl Node {
    /// Start building a node for the given key (value defaults to true)
    pub fn builder(key: &str) -> NodeBuilder {
        NodeBuilder {
            key: key.trim().to_string(),
            value: true,
            server: None,
            world: None,
            expiry: None,
            contexts: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> bool {
        self.value
    }

    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    pub fn world(&self) -> Option<&str> {
        self.world.as_deref()
    }

    pub fn expiry(&self) -> Option<i64> {
        self.expiry
    }

    pub fn contexts(&self) -> &BTreeMap<String, String> {
        &self.contexts
    }

    /// Whether the node has an expiry at all
    pub fn is_temporary(&self) -> bool {
        self.expiry.is_some()
    }

    /// Whether the node's expiry is at or before `now`
    pub fn has_expired(&self, now: i64) -> bool {
        matches!(self.expiry, Some(at) if at <= now)
    }

    /// Copy of this node with a different value
    pub fn with_value(&self, value: bool) -> Node {
        Node {
            value,
            ..self.clone()
        }
    }

    pub fn equivalence_key(&self) -> EquivalenceKey {
        EquivalenceKey {
            key: self.key.clone(),
            server: self.server.clone(),
            world: self.world.clone(),
            contexts: self.contexts.clone(),
        }
    }

    /// Same key and scope, ignoring value and expiry
    pub fn equivalent(&self, other: &Node) -> bool {
        self.key == other.key
            && self.server == other.server
            && self.world == other.world
            && self.contexts == other.contexts
    }

    /// Whether the node applies to the query context at time `now`
    pub fn matches(&self, ctx: &QueryContext, now: i64) -> bool {
        if self.has_expired(now) {
            return false;
        }
        if let Some(server) = &self.server {
            if ctx.server.as_ref() != Some(server) {
                return false;
            }
        }
        if let Some(world) = &self.world {
            if ctx.world.as_ref() != Some(world) {
                return false;
            }
        }
        self.contexts
            .iter()
            .all(|(k, v)| ctx.extra.get(k) == Some(v))
    }

    /// How narrowly scoped the node is: one point per server, world and extra predicate
    pub fn specificity(&self) -> usize {
        usize::from(self.server.is_some())
            + usize::from(self.world.is_some())
            + self.contexts.len()
    }

    /// Target group name if this is a `group.<name>` node
    pub fn group_name(&self) -> Option<&str> {
        self.key
            .strip_prefix("group.")
            .filter(|name| !name.is_empty())
    }

    pub fn is_group_node(&self) -> bool {
        self.group_name().is_some()
    }

    /// Weight if this is a `weight.<n>` node
    pub fn weight(&self) -> Option<i32> {
        self.key.strip_prefix("weight.")?.parse().ok()
    }

    /// (key, value) if this is a `meta.<key>.<value>` node
    pub fn meta(&self) -> Option<(&str, &str)> {
        let rest = self.key.strip_prefix("meta.")?;
        let (k, v) = rest.split_once('.')?;
        if k.is_empty() {
            return None;
        }
        Some((k, v))
    }

    /// (priority, text) if this is a `prefix.<priority>.<text>` node
    pub fn prefix(&self) -> Option<(i32, &str)> {
        Self::chat_meta(&self.key, "prefix.")
    }

    /// (priority, text) if this is a `suffix.<priority>.<text>` node
    pub fn suffix(&self) -> Option<(i32, &str)> {
        Self::chat_meta(&self.key, "suffix.")
    }

    fn chat_meta<'a>(key: &'a str, marker: &str) -> Option<(i32, &'a str)> {
        let rest = key.strip_prefix(marker)?;
        let (priority, text) = rest.split_once('.')?;
        Some((priority.parse().ok()?, text))
    }

    pub fn is_wildcard(&self) -> bool {
        self.key == "*" || self.key.ends_with(".*")
    }

    /// The dot-segment prefix a wildcard covers: `a.b.*` -> `a.b`, `*` -> ``
    pub fn wildcard_root(&self) -> Option<&str> {
        if self.key == "*" {
            Some("")
        } else {
            self.key.strip_suffix(".*")
        }
    }
}

/// Builder validating every component before producing a [`Node`]
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    key: String,
    value: bool,
    server: Option<String>,
    world: Option<String>,
    expiry: Option<i64>,
    contexts: BTreeMap<String, String>,
}

impl NodeBuilder {
    pub fn value(mut self, value: bool) -> Self {
        self.value = value;
        self
    }

    pub fn server(mut self, server: &str) -> Self {
        self.server = normalize_scope(server);
        self
    }

    pub fn world(mut self, world: &str) -> Self {
        self.world = normalize_scope(world);
        self
    }

    pub fn maybe_server(self, server: Option<&str>) -> Self {
        match server {
            Some(s) => self.server(s),
            None => self,
        }
    }

    pub fn maybe_world(self, world: Option<&str>) -> Self {
        match world {
            Some(w) => self.world(w),
            None => self,
        }
    }

    pub fn expiry(mut self, unix_secs: i64) -> Self {
        self.expiry = Some(unix_secs);
        self
    }

    pub fn context(mut self, key: &str, value: &str) -> Self {
        self.contexts
            .insert(key.trim().to_lowercase(), value.trim().to_string());
        self
    }

    pub fn build(self) -> Result<Node, NodeParseError> {
        factory::validate_key(&self.key)?;
        for scope in self.server.iter().chain(self.world.iter()) {
            factory::validate_scope(scope)?;
        }
        for (k, v) in &self.contexts {
            factory::validate_context(k, v)?;
        }
        if matches!(self.expiry, Some(at) if at <= 0) {
            return Err(NodeParseError::InvalidExpiry(
                self.expiry.unwrap_or_default().to_string(),
            ));
        }

        // group references are case-insensitive
        let key = match self.key.strip_prefix("group.") {
            Some(name) => format!("group.{}", name.to_lowercase()),
            None => self.key,
        };

        Ok(Node {
            key,
            value: self.value,
            server: self.server,
            world: self.world,
            expiry: self.expiry,
            contexts: self.contexts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(key: &str) -> Node {
        Node::builder(key).build().unwrap()
    }

    #[test]
    fn test_equivalence_ignores_value_and_expiry() {
        let a = Node::builder("a.b").server("survival").build().unwrap();
        let b = Node::builder("a.b")
            .server("survival")
            .value(false)
            .expiry(unix_now() + 100)
            .build()
            .unwrap();
        let c = Node::builder("a.b").server("creative").build().unwrap();

        assert!(a.equivalent(&b));
        assert_eq!(a.equivalence_key(), b.equivalence_key());
        assert!(!a.equivalent(&c));
    }

    #[test]
    fn test_server_scoping() {
        let scoped = Node::builder("a.b").server("survival").build().unwrap();
        let global = node("a.b");

        let survival = QueryContext::server("survival");
        let creative = QueryContext::server("creative");

        assert!(scoped.matches(&survival, unix_now()));
        assert!(!scoped.matches(&creative, unix_now()));
        assert!(global.matches(&survival, unix_now()));
        assert!(global.matches(&creative, unix_now()));
    }

    #[test]
    fn test_world_and_extra_contexts() {
        let n = Node::builder("a.b")
            .world("nether")
            .context("gamemode", "hardcore")
            .build()
            .unwrap();

        let partial = QueryContext::server("x").with_world("nether");
        let full = partial.clone().with_context("gamemode", "hardcore");

        assert!(!n.matches(&partial, unix_now()));
        assert!(n.matches(&full, unix_now()));
        assert_eq!(n.specificity(), 2);
    }

    #[test]
    fn test_expired_node_never_matches() {
        let now = unix_now();
        let n = Node::builder("a.b").expiry(now - 10).build().unwrap();
        assert!(n.has_expired(now));
        assert!(!n.matches(&QueryContext::global(), now));

        let live = Node::builder("a.b").expiry(now + 3600).build().unwrap();
        assert!(live.matches(&QueryContext::global(), now));
    }

    #[test]
    fn test_special_keys() {
        assert_eq!(node("group.Admin").group_name(), Some("admin"));
        assert_eq!(node("weight.10").weight(), Some(10));
        assert_eq!(node("weight.x").weight(), None);
        assert_eq!(node("meta.rank.3").meta(), Some(("rank", "3")));
        assert_eq!(node("meta.title.Sir.Knight").meta(), Some(("title", "Sir.Knight")));
        assert_eq!(node("prefix.100.[Admin]").prefix(), Some((100, "[Admin]")));
        assert_eq!(node("suffix.5.!").suffix(), Some((5, "!")));
    }

    #[test]
    fn test_wildcard_root() {
        assert_eq!(node("*").wildcard_root(), Some(""));
        assert_eq!(node("a.b.*").wildcard_root(), Some("a.b"));
        assert_eq!(node("a.b").wildcard_root(), None);
    }

    #[test]
    fn test_builder_rejects_bad_input() {
        assert!(Node::builder("").build().is_err());
        assert!(Node::builder("has space").build().is_err());
        assert!(Node::builder("a.b").server("bad-server").build().is_err());
        assert!(Node::builder("a.b").expiry(0).build().is_err());
    }
}
