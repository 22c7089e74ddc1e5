//! Per-holder permission cache
//!
//! Each holder keeps one immutable [`CalculatedData`] per query context, up
//! to [`CONTEXT_CAPACITY`] contexts; the least recently used one is evicted
//! past that. Rebuilds happen off to the side and are published by inserting
//! an `Arc` under a short lock, so readers never see a half-built view.
//!
//! Invalidation bumps an epoch and drops every entry. A rebuild that started
//! under an older epoch still answers the query that triggered it, but is not
//! published, so a cache that has been invalidated stays dirty until a rebuild
//! that began after the invalidation completes.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::inheritance::ResolvedNode;
use crate::node::{unix_now, QueryContext};

/// Three-valued permission answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tristate {
    True,
    False,
    Undefined,
}

impl Tristate {
    /// Collapse to a boolean, treating undefined as `default`
    pub fn as_bool_or(self, default: bool) -> bool {
        match self {
            Tristate::True => true,
            Tristate::False => false,
            Tristate::Undefined => default,
        }
    }

    pub fn is_defined(self) -> bool {
        self != Tristate::Undefined
    }
}

impl From<bool> for Tristate {
    fn from(value: bool) -> Self {
        if value {
            Tristate::True
        } else {
            Tristate::False
        }
    }
}

impl fmt::Display for Tristate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tristate::True => f.write_str("true"),
            Tristate::False => f.write_str("false"),
            Tristate::Undefined => f.write_str("undefined"),
        }
    }
}

/// Resolved view of a holder for a single query context
#[derive(Debug, Clone)]
pub struct CalculatedData {
    context: QueryContext,
    nodes: Vec<ResolvedNode>,
    permissions: HashMap<String, bool>,
    wildcards: HashMap<String, bool>,
    meta: HashMap<String, String>,
    prefix: Option<(i32, String)>,
    suffix: Option<(i32, String)>,
    apply_wildcards: bool,
    expires_at: Option<i64>,
}

impl CalculatedData {
    /// Build lookup structures from merged nodes in priority order.
    ///
    /// `expires_at` is the earliest expiry of anything that contributed to
    /// the traversal; once it passes, the view must be rebuilt.
    pub fn build(
        context: QueryContext,
        nodes: Vec<ResolvedNode>,
        apply_wildcards: bool,
        expires_at: Option<i64>,
    ) -> Self {
        let mut permissions = HashMap::new();
        let mut wildcards = HashMap::new();
        let mut meta = HashMap::new();
        let mut prefix: Option<(i32, String)> = None;
        let mut suffix: Option<(i32, String)> = None;

        for resolved in &nodes {
            let node = &resolved.node;
            permissions
                .entry(node.key().to_string())
                .or_insert(node.value());
            if let Some(root) = node.wildcard_root() {
                wildcards.entry(root.to_string()).or_insert(node.value());
            }
            if !node.value() {
                continue;
            }
            if let Some((k, v)) = node.meta() {
                meta.entry(k.to_string()).or_insert_with(|| v.to_string());
            }
            if let Some((priority, text)) = node.prefix() {
                if prefix.as_ref().map_or(true, |(p, _)| priority > *p) {
                    prefix = Some((priority, text.to_string()));
                }
            }
            if let Some((priority, text)) = node.suffix() {
                if suffix.as_ref().map_or(true, |(p, _)| priority > *p) {
                    suffix = Some((priority, text.to_string()));
                }
            }
        }

        Self {
            context,
            nodes,
            permissions,
            wildcards,
            meta,
            prefix,
            suffix,
            apply_wildcards,
            expires_at,
        }
    }

    pub fn context(&self) -> &QueryContext {
        &self.context
    }

    /// Merged nodes, highest priority first
    pub fn nodes(&self) -> &[ResolvedNode] {
        &self.nodes
    }

    /// Answer a permission query.
    ///
    /// An exact node for `key` always wins. Otherwise the closest covering
    /// wildcard decides (`a.b.*` before `a.*` before `*`).
    pub fn permission_value(&self, key: &str) -> Tristate {
        if let Some(value) = self.permissions.get(key) {
            return Tristate::from(*value);
        }
        if !self.apply_wildcards {
            return Tristate::Undefined;
        }

        let mut root = key;
        while let Some((parent, _)) = root.rsplit_once('.') {
            if let Some(value) = self.wildcards.get(parent) {
                return Tristate::from(*value);
            }
            root = parent;
        }
        match self.wildcards.get("") {
            Some(value) => Tristate::from(*value),
            None => Tristate::Undefined,
        }
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    pub fn all_meta(&self) -> &HashMap<String, String> {
        &self.meta
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_ref().map(|(_, text)| text.as_str())
    }

    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_ref().map(|(_, text)| text.as_str())
    }

    /// Whether a contributing node has expired since the view was built
    pub fn is_stale(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Contexts a single holder keeps views for
pub const CONTEXT_CAPACITY: usize = 64;

/// Lazily populated, bounded map of query context to resolved view
pub struct PermissionCache {
    epoch: AtomicU64,
    entries: Mutex<LruCache<QueryContext, Arc<CalculatedData>>>,
}

impl fmt::Debug for PermissionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        f.debug_struct("PermissionCache")
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .field("len", &entries.len())
            .field("cap", &entries.cap())
            .finish()
    }
}

impl Default for PermissionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionCache {
    pub fn new() -> Self {
        Self::with_capacity(CONTEXT_CAPACITY)
    }

    /// A cache holding at most `capacity` contexts (at least one)
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            epoch: AtomicU64::new(0),
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Mark everything dirty
    pub fn invalidate(&self) {
        let mut entries = self.entries.lock();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        entries.clear();
    }

    /// Number of published views
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Return the cached view for `ctx`, building it with `calculate` if
    /// missing or stale
    pub fn get_or_calculate<F>(&self, ctx: &QueryContext, calculate: F) -> Arc<CalculatedData>
    where
        F: FnOnce() -> CalculatedData,
    {
        let epoch = self.epoch.load(Ordering::Acquire);
        let cached = self.entries.lock().get(ctx).cloned();
        if let Some(data) = cached {
            if !data.is_stale(unix_now()) {
                return data;
            }
        }

        let data = Arc::new(calculate());

        let mut entries = self.entries.lock();
        if self.epoch.load(Ordering::Acquire) == epoch {
            entries.put(ctx.clone(), data.clone());
        }
        data
    }
}
