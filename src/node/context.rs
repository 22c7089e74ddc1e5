//! Query contexts
//!
//! A permission check is always evaluated against a context: the server and
//! world the subject is on, plus any extra key=value pairs the host supplies
//! (e.g. `dimension=nether`). `None` for server or world means "global".

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved server/world name meaning "applies everywhere"
pub const GLOBAL: &str = "global";

/// The (server, world, extra) tuple a permission query is evaluated against
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct QueryContext {
    pub server: Option<String>,
    pub world: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl QueryContext {
    /// A context with no server, world or extra constraints
    pub fn global() -> Self {
        Self::default()
    }

    /// A context for the given server. `"global"` is treated as no server.
    pub fn server(server: &str) -> Self {
        Self {
            server: normalize_scope(server),
            ..Self::default()
        }
    }

    /// Set the world
    pub fn with_world(mut self, world: &str) -> Self {
        self.world = normalize_scope(world);
        self
    }

    /// Add an extra key=value pair
    pub fn with_context(mut self, key: &str, value: &str) -> Self {
        self.extra.insert(key.to_lowercase(), value.to_string());
        self
    }

    /// Build from optional server/world arguments, as given on a command line
    pub fn from_args(server: Option<&str>, world: Option<&str>) -> Self {
        Self {
            server: server.and_then(normalize_scope),
            world: world.and_then(normalize_scope),
            extra: BTreeMap::new(),
        }
    }
}

impl fmt::Display for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "server={} world={}",
            self.server.as_deref().unwrap_or(GLOBAL),
            self.world.as_deref().unwrap_or(GLOBAL)
        )?;
        for (k, v) in &self.extra {
            write!(f, " {}={}", k, v)?;
        }
        Ok(())
    }
}

/// Lowercase a server/world name, mapping empty and `"global"` to `None`
pub fn normalize_scope(name: &str) -> Option<String> {
    let name = name.trim().to_lowercase();
    if name.is_empty() || name == GLOBAL {
        None
    } else {
        Some(name)
    }
}
