//! Node string forms
//!
//! Canonical form: `[(k=v,k2=v2)][server[-world]/][-]key[$expiry]`
//!
//! - contexts are written in sorted key order
//! - a `global` server is omitted unless a world is present (`global-nether/a.b`)
//! - a leading `-` on the key means the node is negated (value false)
//! - expiry is an absolute Unix timestamp in seconds
//!
//! `Display` and `FromStr` are exact inverses on canonical strings.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use super::{Node, GLOBAL};

static SCOPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("static regex"));

static CONTEXT_VALUE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s,=()]+$").expect("static regex"));

/// Errors produced when parsing or building a node
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeParseError {
    #[error("node key cannot be empty")]
    EmptyKey,

    #[error("invalid node key '{0}'")]
    InvalidKey(String),

    #[error("invalid server or world name '{0}'")]
    InvalidScope(String),

    #[error("invalid context '{0}'")]
    InvalidContext(String),

    #[error("invalid expiry '{0}'")]
    InvalidExpiry(String),

    #[error("unterminated context block in '{0}'")]
    UnterminatedContext(String),
}

pub(super) fn validate_key(key: &str) -> Result<(), NodeParseError> {
    if key.is_empty() {
        return Err(NodeParseError::EmptyKey);
    }
    let bad_char = key
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '/' | '$' | '(' | ')'));
    if bad_char || key.starts_with('-') {
        return Err(NodeParseError::InvalidKey(key.to_string()));
    }
    Ok(())
}

pub(super) fn validate_scope(scope: &str) -> Result<(), NodeParseError> {
    if SCOPE_RE.is_match(scope) {
        Ok(())
    } else {
        Err(NodeParseError::InvalidScope(scope.to_string()))
    }
}

pub(super) fn validate_context(key: &str, value: &str) -> Result<(), NodeParseError> {
    if SCOPE_RE.is_match(key) && CONTEXT_VALUE_RE.is_match(value) {
        Ok(())
    } else {
        Err(NodeParseError::InvalidContext(format!("{}={}", key, value)))
    }
}

impl FromStr for Node {
    type Err = NodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rest = s.trim();
        let mut contexts = BTreeMap::new();

        if let Some(inner) = rest.strip_prefix('(') {
            let (block, after) = inner
                .split_once(')')
                .ok_or_else(|| NodeParseError::UnterminatedContext(s.to_string()))?;
            for pair in block.split(',').filter(|p| !p.is_empty()) {
                let (k, v) = pair
                    .split_once('=')
                    .ok_or_else(|| NodeParseError::InvalidContext(pair.to_string()))?;
                contexts.insert(k.to_string(), v.to_string());
            }
            rest = after;
        }

        let (scope, key_part) = match rest.split_once('/') {
            Some((scope, key_part)) => (Some(scope), key_part),
            None => (None, rest),
        };

        let (key_part, expiry) = match key_part.rsplit_once('$') {
            Some((k, e)) => {
                let at = e
                    .parse::<i64>()
                    .map_err(|_| NodeParseError::InvalidExpiry(e.to_string()))?;
                (k, Some(at))
            }
            None => (key_part, None),
        };

        let (key, value) = match key_part.strip_prefix('-') {
            Some(k) => (k, false),
            None => (key_part, true),
        };

        let mut builder = Node::builder(key).value(value);
        if let Some(scope) = scope {
            let (server, world) = match scope.split_once('-') {
                Some((server, world)) => (server, Some(world)),
                None => (scope, None),
            };
            builder = builder.server(server);
            if let Some(world) = world {
                builder = builder.world(world);
            }
        }
        if let Some(at) = expiry {
            builder = builder.expiry(at);
        }
        for (k, v) in &contexts {
            builder = builder.context(k, v);
        }
        builder.build()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.contexts.is_empty() {
            let pairs: Vec<String> = self
                .contexts
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, "({})", pairs.join(","))?;
        }
        match (&self.server, &self.world) {
            (None, None) => {}
            (server, None) => write!(f, "{}/", server.as_deref().unwrap_or(GLOBAL))?,
            (server, Some(world)) => {
                write!(f, "{}-{}/", server.as_deref().unwrap_or(GLOBAL), world)?
            }
        }
        if !self.value {
            f.write_str("-")?;
        }
        f.write_str(&self.key)?;
        if let Some(at) = self.expiry {
            write!(f, "${}", at)?;
        }
        Ok(())
    }
}

/// Render a node as the command line that would recreate it on a holder.
///
/// `holder` is the group name or user UUID; `is_group` picks the scope word.
pub fn to_command(node: &Node, holder: &str, is_group: bool) -> String {
    let scope = if is_group { "group" } else { "user" };
    let mut line = match node.expiry() {
        Some(at) => format!(
            "{} {} permission settemp {} {} {}",
            scope,
            holder,
            node.key(),
            node.value(),
            at
        ),
        None => format!(
            "{} {} permission set {} {}",
            scope,
            holder,
            node.key(),
            node.value()
        ),
    };

    if node.server().is_some() || node.world().is_some() || !node.contexts().is_empty() {
        line.push(' ');
        line.push_str(node.server().unwrap_or(GLOBAL));
    }
    if let Some(world) = node.world() {
        line.push(' ');
        line.push_str(world);
    }
    for (k, v) in node.contexts() {
        line.push_str(&format!(" {}={}", k, v));
    }
    line
}

/// Orders two nodes by context specificity (more specific first), falling back
/// to their canonical string so the order is total and reproducible.
pub fn specificity_cmp(a: &Node, b: &Node) -> Ordering {
    b.specificity()
        .cmp(&a.specificity())
        .then_with(|| a.to_string().cmp(&b.to_string()))
}

/// `group.<name>`
pub fn group_node(name: &str) -> Result<Node, NodeParseError> {
    Node::builder(&format!("group.{}", name.to_lowercase())).build()
}

/// `weight.<n>`
pub fn weight_node(weight: i32) -> Result<Node, NodeParseError> {
    Node::builder(&format!("weight.{}", weight)).build()
}

/// `meta.<key>.<value>`
pub fn meta_node(key: &str, value: &str) -> Result<Node, NodeParseError> {
    if key.contains('.') {
        return Err(NodeParseError::InvalidKey(key.to_string()));
    }
    Node::builder(&format!("meta.{}.{}", key, value)).build()
}

/// `prefix.<priority>.<text>`
pub fn prefix_node(priority: i32, text: &str) -> Result<Node, NodeParseError> {
    Node::builder(&format!("prefix.{}.{}", priority, text)).build()
}

/// `suffix.<priority>.<text>`
pub fn suffix_node(priority: i32, text: &str) -> Result<Node, NodeParseError> {
    Node::builder(&format!("suffix.{}.{}", priority, text)).build()
}
