//! Inheritance resolution
//!
//! Flattens a holder and every group it (transitively) inherits into one
//! priority-ordered node list:
//!
//! 1. the holder's own nodes (rank 0)
//! 2. its direct parents: the primary group first for users, then explicit
//!    parents by descending weight, then by the specificity of the node
//!    that references them, then by name
//! 3. those groups' parents, breadth first, and so on
//!
//! Each visited group gets the next rank. A group is visited at most once per
//! traversal, which makes cyclic inheritance terminate. Groups that are
//! referenced but not loaded are skipped.
//!
//! The merge step keeps one node per equivalence class: lowest rank first,
//! then the more specific context, then the canonical string.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use crate::cache::CalculatedData;
use crate::holder::{HolderKind, PermissionHolder};
use crate::managers::GroupManager;
use crate::node::{specificity_cmp, unix_now, Node, QueryContext};

/// A node together with where it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNode {
    pub node: Node,
    /// Object name of the holder that owns the node
    pub origin: String,
    /// Traversal position of the owning holder; 0 is the root
    pub rank: usize,
}

/// Result of one traversal, before lookup structures are built
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub nodes: Vec<ResolvedNode>,
    pub expires_at: Option<i64>,
    pub missing_groups: Vec<String>,
}

/// Walks the group graph through an explicit reference to the group registry
pub struct InheritanceResolver<'a> {
    groups: &'a GroupManager,
    apply_wildcards: bool,
}

impl<'a> InheritanceResolver<'a> {
    pub fn new(groups: &'a GroupManager, apply_wildcards: bool) -> Self {
        Self {
            groups,
            apply_wildcards,
        }
    }

    /// Resolve and build the lookup view for `ctx`
    pub fn calculate<H>(&self, root: &H, ctx: &QueryContext) -> CalculatedData
    where
        H: PermissionHolder + ?Sized,
    {
        let resolution = self.resolve(root, ctx);
        CalculatedData::build(
            ctx.clone(),
            resolution.nodes,
            self.apply_wildcards,
            resolution.expires_at,
        )
    }

    pub(crate) fn resolve<H>(&self, root: &H, ctx: &QueryContext) -> Resolution
    where
        H: PermissionHolder + ?Sized,
    {
        let now = unix_now();
        let root_name = root.object_name();
        let mut resolution = Resolution::default();
        let mut collected = Vec::new();
        let mut visited = HashSet::new();

        if root.kind() == HolderKind::Group {
            visited.insert(root_name.clone());
        }

        let own = root.nodes();
        let parents = collect_applicable(
            &own,
            &root_name,
            0,
            ctx,
            now,
            &mut collected,
            &mut resolution,
        );
        let mut queue: VecDeque<String> = self
            .order_parents(parents, root.implicit_parent(), &own, ctx, now)
            .into();

        let mut rank = 0;
        while let Some(name) = queue.pop_front() {
            if !visited.insert(name.clone()) {
                continue;
            }
            let Some(group) = self.groups.get(&name) else {
                warn!(
                    "{} {} inherits missing group '{}', skipping",
                    root.kind(),
                    root.friendly_name(),
                    name
                );
                resolution.missing_groups.push(name);
                continue;
            };

            rank += 1;
            let nodes = group.nodes();
            let parents = collect_applicable(
                &nodes,
                group.name(),
                rank,
                ctx,
                now,
                &mut collected,
                &mut resolution,
            );
            queue.extend(self.order_parents(parents, None, &nodes, ctx, now));
        }

        resolution.nodes = merge(collected);
        debug!(
            "Resolved {} nodes across {} holders for {} ({})",
            resolution.nodes.len(),
            rank + 1,
            root.friendly_name(),
            ctx
        );
        resolution
    }

    /// Order direct parents: the implicit parent first (unless negated by an
    /// applicable node), then by descending group weight, then by the most
    /// specific reference, then by name.
    fn order_parents(
        &self,
        mut explicit: Vec<ParentRef>,
        implicit: Option<String>,
        own: &[Node],
        ctx: &QueryContext,
        now: i64,
    ) -> Vec<String> {
        let mut ordered = Vec::with_capacity(explicit.len() + 1);

        if let Some(primary) = implicit {
            let negated = own.iter().any(|n| {
                !n.value() && n.group_name() == Some(primary.as_str()) && n.matches(ctx, now)
            });
            if !negated {
                explicit.retain(|parent| parent.name != primary);
                ordered.push(primary);
            }
        }

        // a group referenced twice ranks by its most specific reference
        let mut specificity: HashMap<String, usize> = HashMap::new();
        for parent in explicit {
            let best = specificity.entry(parent.name).or_default();
            *best = (*best).max(parent.specificity);
        }

        let mut weighted: Vec<(i32, usize, String)> = specificity
            .into_iter()
            .map(|(name, specificity)| {
                let weight = self.groups.get(&name).map(|g| g.weight()).unwrap_or(0);
                (weight, specificity, name)
            })
            .collect();
        weighted.sort_by_key(|(weight, specificity, name)| {
            (Reverse(*weight), Reverse(*specificity), name.clone())
        });

        ordered.extend(weighted.into_iter().map(|(_, _, name)| name));
        ordered
    }
}

/// A group inherited through an applicable node
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParentRef {
    name: String,
    /// Context specificity of the referencing node
    specificity: usize,
}

/// Push the applicable nodes of one holder and return the groups it inherits
fn collect_applicable(
    nodes: &[Node],
    origin: &str,
    rank: usize,
    ctx: &QueryContext,
    now: i64,
    collected: &mut Vec<ResolvedNode>,
    resolution: &mut Resolution,
) -> Vec<ParentRef> {
    let mut parents = Vec::new();
    for node in nodes {
        if !node.matches(ctx, now) {
            continue;
        }
        if let Some(at) = node.expiry() {
            resolution.expires_at = Some(resolution.expires_at.map_or(at, |cur| cur.min(at)));
        }
        if node.value() {
            if let Some(group) = node.group_name() {
                parents.push(ParentRef {
                    name: group.to_string(),
                    specificity: node.specificity(),
                });
            }
        }
        collected.push(ResolvedNode {
            node: node.clone(),
            origin: origin.to_string(),
            rank,
        });
    }
    parents
}

/// Keep the highest-priority node of each equivalence class.
///
/// The result does not depend on the input order.
pub fn merge(mut nodes: Vec<ResolvedNode>) -> Vec<ResolvedNode> {
    nodes.sort_by(|a, b| {
        a.rank
            .cmp(&b.rank)
            .then_with(|| specificity_cmp(&a.node, &b.node))
            .then_with(|| a.origin.cmp(&b.origin))
            .then_with(|| a.node.value().cmp(&b.node.value()))
    });

    let mut seen = HashSet::new();
    nodes.retain(|r| seen.insert(r.node.equivalence_key()));
    nodes
}
