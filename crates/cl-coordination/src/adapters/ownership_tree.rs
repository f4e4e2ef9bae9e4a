//! In-memory replica of the ownership DAG.
//!
//! A region is the set of contexts reachable from a single source node; that
//! source is the region's dominator. Every edit bumps the per-node versions
//! of the touched contexts and the replica version, so peers can detect
//! staleness before acting on structural operations.

use crate::ports::outbound::{StructureEdit, StructureView};
use shared_types::ContextName;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct TreeInner {
    root: ContextName,
    parents: BTreeMap<ContextName, BTreeSet<ContextName>>,
    children: BTreeMap<ContextName, BTreeSet<ContextName>>,
    node_versions: BTreeMap<ContextName, u64>,
    version: u64,
}

impl TreeInner {
    fn ensure_node(&mut self, ctx: &str) {
        if !self.node_versions.contains_key(ctx) {
            self.node_versions.insert(ctx.to_string(), self.version);
            self.parents.entry(ctx.to_string()).or_default();
            self.children.entry(ctx.to_string()).or_default();
        }
    }

    fn ancestors_of(&self, ctx: &str) -> BTreeSet<ContextName> {
        let mut seen = BTreeSet::new();
        let mut frontier = VecDeque::from([ctx.to_string()]);
        while let Some(current) = frontier.pop_front() {
            if let Some(parents) = self.parents.get(&current) {
                for p in parents {
                    if seen.insert(p.clone()) {
                        frontier.push_back(p.clone());
                    }
                }
            }
        }
        seen
    }

    fn descendants_of(&self, ctx: &str) -> BTreeSet<ContextName> {
        let mut seen = BTreeSet::new();
        let mut frontier = VecDeque::from([ctx.to_string()]);
        while let Some(current) = frontier.pop_front() {
            if let Some(children) = self.children.get(&current) {
                for c in children {
                    if seen.insert(c.clone()) {
                        frontier.push_back(c.clone());
                    }
                }
            }
        }
        seen
    }

    /// The source of the region containing `ctx`: the parentless ancestor.
    /// With several sources (a transient multi-parent state) the smallest
    /// name wins, deterministically on every node.
    fn source_of(&self, ctx: &str) -> Option<ContextName> {
        self.node_versions.get(ctx)?;
        let mut sources: BTreeSet<ContextName> = self
            .ancestors_of(ctx)
            .into_iter()
            .filter(|a| self.parents.get(a).is_none_or(BTreeSet::is_empty))
            .collect();
        if self.parents.get(ctx).is_none_or(BTreeSet::is_empty) {
            sources.insert(ctx.to_string());
        }
        sources.into_iter().next()
    }
}

#[derive(Debug)]
pub struct OwnershipTree {
    inner: RwLock<TreeInner>,
}

impl OwnershipTree {
    pub fn new(root: impl Into<ContextName>) -> Self {
        let root = root.into();
        let mut inner = TreeInner {
            root: root.clone(),
            version: 1,
            ..TreeInner::default()
        };
        inner.ensure_node(&root);
        Self {
            inner: RwLock::new(inner),
        }
    }

    pub fn root(&self) -> ContextName {
        self.inner.read().unwrap().root.clone()
    }

    pub fn add_child(&self, parent: &str, child: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.version += 1;
        let version = inner.version;
        inner.ensure_node(parent);
        inner.ensure_node(child);
        inner
            .parents
            .get_mut(child)
            .unwrap()
            .insert(parent.to_string());
        inner
            .children
            .get_mut(parent)
            .unwrap()
            .insert(child.to_string());
        inner.node_versions.insert(parent.to_string(), version);
        inner.node_versions.insert(child.to_string(), version);
        debug!(parent, child, version, "ownership edge added");
    }

    pub fn detach_child(&self, parent: &str, child: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.version += 1;
        let version = inner.version;
        if let Some(parents) = inner.parents.get_mut(child) {
            parents.remove(parent);
        }
        if let Some(children) = inner.children.get_mut(parent) {
            children.remove(child);
        }
        inner.node_versions.insert(parent.to_string(), version);
        inner.node_versions.insert(child.to_string(), version);
        debug!(parent, child, version, "ownership edge removed");
    }
}

impl StructureView for OwnershipTree {
    fn dominator_of(&self, ctx: &str) -> Option<ContextName> {
        self.inner.read().unwrap().source_of(ctx)
    }

    fn dominated_set_of(&self, ctx: &str) -> Vec<ContextName> {
        let inner = self.inner.read().unwrap();
        if inner.source_of(ctx).as_deref() != Some(ctx) {
            return Vec::new();
        }
        let mut dominated = vec![ctx.to_string()];
        dominated.extend(inner.descendants_of(ctx));
        dominated
    }

    fn is_elder_context(&self, ancestor: &str, junior: &str) -> bool {
        if ancestor == junior {
            return false;
        }
        self.inner.read().unwrap().ancestors_of(junior).contains(ancestor)
    }

    fn connects_to_root(&self, ctx: &str) -> bool {
        let inner = self.inner.read().unwrap();
        ctx == inner.root || inner.ancestors_of(ctx).contains(&inner.root)
    }

    fn dag_version(&self, ctx: &str) -> u64 {
        self.inner
            .read()
            .unwrap()
            .node_versions
            .get(ctx)
            .copied()
            .unwrap_or(0)
    }

    fn current_version(&self) -> u64 {
        self.inner.read().unwrap().version
    }

    fn ownership_pairs_of(
        &self,
        contexts: &BTreeSet<ContextName>,
    ) -> Vec<(ContextName, ContextName)> {
        let inner = self.inner.read().unwrap();
        let mut pairs = Vec::new();
        for (parent, children) in &inner.children {
            for child in children {
                if contexts.contains(parent) || contexts.contains(child) {
                    pairs.push((parent.clone(), child.clone()));
                }
            }
        }
        pairs
    }
}

impl StructureEdit for OwnershipTree {
    fn as_view(&self) -> &dyn StructureView {
        self
    }

    fn apply_ownership_changes(
        &self,
        changes: &[(bool, ContextName, ContextName)],
    ) -> BTreeSet<ContextName> {
        let mut affected = BTreeSet::new();
        for (add, parent, child) in changes {
            if *add {
                self.add_child(parent, child);
            } else {
                self.detach_child(parent, child);
            }
            affected.insert(parent.clone());
            affected.insert(child.clone());
            affected.extend(self.inner.read().unwrap().descendants_of(child));
        }
        affected
    }

    fn update_ownership_pairs(
        &self,
        pairs: &[(ContextName, ContextName)],
        versions: &BTreeMap<ContextName, u64>,
    ) {
        let mut inner = self.inner.write().unwrap();
        for (parent, child) in pairs {
            inner.ensure_node(parent);
            inner.ensure_node(child);
            inner
                .parents
                .get_mut(child.as_str())
                .unwrap()
                .insert(parent.clone());
            inner
                .children
                .get_mut(parent.as_str())
                .unwrap()
                .insert(child.clone());
        }
        for (ctx, version) in versions {
            inner.ensure_node(ctx);
            let known = inner.node_versions.get_mut(ctx.as_str()).unwrap();
            if *version > *known {
                *known = *version;
            }
            if *version > inner.version {
                inner.version = *version;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> OwnershipTree {
        let tree = OwnershipTree::new("Root");
        tree.add_child("Root", "A");
        tree.add_child("Root", "B");
        tree.add_child("A", "A.x");
        tree
    }

    #[test]
    fn test_root_dominates_its_region() {
        let tree = sample();
        assert_eq!(tree.dominator_of("A.x").as_deref(), Some("Root"));
        assert_eq!(tree.dominator_of("Root").as_deref(), Some("Root"));

        let dominated = tree.dominated_set_of("Root");
        assert!(dominated.contains(&"Root".to_string()));
        assert!(dominated.contains(&"A".to_string()));
        assert!(dominated.contains(&"A.x".to_string()));
        // Non-dominators govern nothing.
        assert!(tree.dominated_set_of("A").is_empty());
    }

    #[test]
    fn test_detached_subtree_becomes_own_region() {
        let tree = sample();
        tree.detach_child("Root", "A");
        assert_eq!(tree.dominator_of("A").as_deref(), Some("A"));
        assert_eq!(tree.dominator_of("A.x").as_deref(), Some("A"));
        assert!(!tree.connects_to_root("A.x"));
        assert!(tree.connects_to_root("B"));
    }

    #[test]
    fn test_elder_relation() {
        let tree = sample();
        assert!(tree.is_elder_context("Root", "A.x"));
        assert!(tree.is_elder_context("A", "A.x"));
        assert!(!tree.is_elder_context("A.x", "A"));
        assert!(!tree.is_elder_context("A", "A"));
        assert!(!tree.is_elder_context("B", "A.x"));
    }

    #[test]
    fn test_versions_bump_on_edit() {
        let tree = sample();
        let v0 = tree.current_version();
        let a0 = tree.dag_version("A");
        tree.add_child("A", "A.y");
        assert!(tree.current_version() > v0);
        assert!(tree.dag_version("A") > a0);
        assert_eq!(tree.dag_version("nope"), 0);
    }

    #[test]
    fn test_apply_changes_reports_affected_subtree() {
        let tree = sample();
        let affected =
            tree.apply_ownership_changes(&[(false, "Root".to_string(), "A".to_string())]);
        assert!(affected.contains("A"));
        assert!(affected.contains("A.x"));
        assert!(affected.contains("Root"));
    }

    #[test]
    fn test_update_pairs_keeps_fresher_versions() {
        let tree = OwnershipTree::new("Root");
        let pairs = vec![("Root".to_string(), "C".to_string())];
        let versions: BTreeMap<_, _> = [("C".to_string(), 9u64)].into_iter().collect();
        tree.update_ownership_pairs(&pairs, &versions);
        assert_eq!(tree.dag_version("C"), 9);
        assert!(tree.is_elder_context("Root", "C"));
    }
}
