//! `UriToWorkspaceCache`: a weak mapping `DocumentId → Workspace`.
//!
//! Invariant: a cache entry, if present and still alive (i.e. its `Weak`
//! upgrades), must be the workspace that currently claims the document.
//! Reads go through this cache lock-free; only the Workspace Router's
//! serial context ever inserts or clears entries, per §4.4.

use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::ids::DocumentId;
use crate::workspace::Workspace;

#[derive(Default)]
pub struct UriToWorkspaceCache {
    entries: DashMap<DocumentId, Weak<Workspace>>,
}

impl UriToWorkspaceCache {
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    /// Lock-free read; `None` on a cache miss or a stale (dropped) entry.
    pub fn get(&self, doc: &DocumentId) -> Option<Arc<Workspace>> {
        let weak = self.entries.get(doc)?;
        weak.upgrade()
    }

    pub fn insert(&self, doc: DocumentId, workspace: &Arc<Workspace>) {
        self.entries.insert(doc, Arc::downgrade(workspace));
    }

    pub fn remove(&self, doc: &DocumentId) {
        self.entries.remove(doc);
    }

    /// Invalidates every entry. Called whenever the workspace list mutates
    /// or a workspace's file-handling capability changes.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::NullBuildServerManager;
    use url::Url;

    fn doc(n: &str) -> DocumentId {
        DocumentId::from_url(Url::parse(&format!("file:///{n}")).unwrap())
    }

    #[test]
    fn stale_entry_upgrades_to_none_once_workspace_is_dropped() {
        let cache = UriToWorkspaceCache::new();
        let d = doc("a.rs");
        {
            let ws = Arc::new(Workspace::new(None, Arc::new(NullBuildServerManager), false));
            cache.insert(d.clone(), &ws);
            assert!(cache.get(&d).is_some());
        }
        assert!(cache.get(&d).is_none(), "dropped workspace must not be returned");
    }

    #[test]
    fn clear_invalidates_every_entry() {
        let cache = UriToWorkspaceCache::new();
        let ws = Arc::new(Workspace::new(None, Arc::new(NullBuildServerManager), false));
        cache.insert(doc("a.rs"), &ws);
        cache.insert(doc("b.rs"), &ws);
        cache.clear();
        assert!(cache.is_empty());
    }
}
