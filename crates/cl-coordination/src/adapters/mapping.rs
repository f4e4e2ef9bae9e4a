//! In-memory context-to-node placement map.

use crate::ports::outbound::MappingStore;
use shared_types::{ContextName, MappingSnapshot, NodeAddr};
use std::collections::BTreeMap;
use std::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct MappingInner {
    head: NodeAddr,
    entries: BTreeMap<ContextName, (u32, NodeAddr)>,
    next_id: u32,
    version: u64,
}

#[derive(Debug)]
pub struct InMemoryMapping {
    inner: RwLock<MappingInner>,
}

impl InMemoryMapping {
    pub fn new(head: NodeAddr) -> Self {
        Self {
            inner: RwLock::new(MappingInner {
                head,
                entries: BTreeMap::new(),
                next_id: 1,
                version: 1,
            }),
        }
    }

    /// Place a context on `node`, allocating its numeric id.
    pub fn place(&self, ctx: impl Into<ContextName>, node: NodeAddr) -> u32 {
        let ctx = ctx.into();
        {
            let inner = self.inner.read().unwrap();
            if let Some((id, existing)) = inner.entries.get(&ctx) {
                assert_eq!(existing, &node, "context {ctx} already placed on {existing}");
                return *id;
            }
        }
        let id = self.allocate_id();
        self.place_at(&ctx, id, node);
        id
    }
}

impl MappingStore for InMemoryMapping {
    fn resolve(&self, ctx: &str) -> Option<NodeAddr> {
        self.inner
            .read()
            .unwrap()
            .entries
            .get(ctx)
            .map(|(_, node)| node.clone())
    }

    fn head(&self) -> NodeAddr {
        self.inner.read().unwrap().head.clone()
    }

    fn has_context(&self, ctx: &str) -> bool {
        self.inner.read().unwrap().entries.contains_key(ctx)
    }

    fn current_version(&self) -> u64 {
        self.inner.read().unwrap().version
    }

    fn allocate_id(&self) -> u32 {
        let mut inner = self.inner.write().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }

    fn place_at(&self, ctx: &str, id: u32, node: NodeAddr) {
        let mut inner = self.inner.write().unwrap();
        inner.version += 1;
        inner.entries.insert(ctx.to_string(), (id, node.clone()));
        debug!(context = %ctx, id, node = %node, "context placed");
    }

    fn context_id_of(&self, ctx: &str) -> Option<u32> {
        self.inner.read().unwrap().entries.get(ctx).map(|(id, _)| *id)
    }

    fn relocate(&self, ctx: &str, node: NodeAddr) {
        let mut inner = self.inner.write().unwrap();
        inner.version += 1;
        let version = inner.version;
        if let Some(entry) = inner.entries.get_mut(ctx) {
            entry.1 = node.clone();
        }
        debug!(context = %ctx, node = %node, version, "context relocated");
    }

    fn snapshot(&self) -> MappingSnapshot {
        let inner = self.inner.read().unwrap();
        MappingSnapshot {
            version: inner.version,
            head: inner.head.clone(),
            entries: inner.entries.clone(),
        }
    }

    fn update_to(&self, snapshot: &MappingSnapshot) {
        let mut inner = self.inner.write().unwrap();
        if snapshot.version <= inner.version {
            return;
        }
        inner.version = snapshot.version;
        inner.entries = snapshot.entries.clone();
        inner.next_id = inner
            .entries
            .values()
            .map(|(id, _)| id + 1)
            .max()
            .max(Some(inner.next_id))
            .unwrap_or(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_place_and_resolve() {
        let mapping = InMemoryMapping::new(NodeAddr::new("head"));
        let id = mapping.place("Root", NodeAddr::new("n1"));
        assert_eq!(mapping.resolve("Root"), Some(NodeAddr::new("n1")));
        assert_eq!(mapping.context_id_of("Root"), Some(id));
        assert!(!mapping.has_context("Other"));
    }

    #[test]
    fn test_relocate_bumps_version() {
        let mapping = InMemoryMapping::new(NodeAddr::new("head"));
        mapping.place("Root", NodeAddr::new("n1"));
        let v = mapping.current_version();
        mapping.relocate("Root", NodeAddr::new("n2"));
        assert_eq!(mapping.resolve("Root"), Some(NodeAddr::new("n2")));
        assert!(mapping.current_version() > v);
    }

    #[test]
    fn test_stale_snapshot_ignored() {
        let mapping = InMemoryMapping::new(NodeAddr::new("head"));
        mapping.place("Root", NodeAddr::new("n1"));
        let fresh = mapping.snapshot();
        mapping.relocate("Root", NodeAddr::new("n2"));
        mapping.update_to(&fresh);
        assert_eq!(mapping.resolve("Root"), Some(NodeAddr::new("n2")));
    }
}
