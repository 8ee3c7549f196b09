//! Workspace Router (§4.4): owns the mutable workspace list and the weak
//! `UriToWorkspaceCache`. All list mutation happens inside one dedicated
//! Tokio task (the "serial context" of §9), reached only through an mpsc
//! command channel; resolution reads try the cache first, lock-free, and
//! only fall through to the serial context on a miss.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use url::Url;

use crate::build::BuildSystemDetector;
use crate::classify::{BuildSettingsKeyer, IdentityKeyer};
use crate::ids::{DocumentId, DocumentUri};
use crate::workspace::cache::UriToWorkspaceCache;
use crate::workspace::{Workspace, WorkspaceFactory};

/// Emitted by a resolution that changed which workspace owns an already-open
/// document, so the caller can close it in the old workspace and reopen it
/// in the new one (§4.4 "Re-open pass").
pub struct ReopenInstruction {
    pub doc: DocumentId,
    pub uri: DocumentUri,
    pub old_workspace: Option<Arc<Workspace>>,
    pub new_workspace: Arc<Workspace>,
}

enum Command {
    Resolve {
        uri: DocumentUri,
        reply: oneshot::Sender<Arc<Workspace>>,
    },
    FoldersChanged {
        added: Vec<Url>,
        removed: Vec<Url>,
        reply: oneshot::Sender<Vec<ReopenInstruction>>,
    },
    MarkOpen {
        doc: DocumentId,
        uri: DocumentUri,
    },
    MarkClosed {
        doc: DocumentId,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<Arc<Workspace>>>,
    },
}

struct RouterState {
    workspaces: Vec<(Arc<Workspace>, bool)>,
    cache: Arc<UriToWorkspaceCache>,
    factory: Arc<dyn WorkspaceFactory>,
    detector: Arc<dyn BuildSystemDetector>,
    keyer: Arc<dyn BuildSettingsKeyer>,
    open_documents: HashMap<DocumentId, DocumentUri>,
}

impl RouterState {
    /// Steps 3-5 of the resolution algorithm, run inside the serial
    /// context. Mutates `self.workspaces` and `self.cache` when an implicit
    /// workspace is discovered.
    async fn resolve_uncached(&mut self, uri: &DocumentUri) -> Arc<Workspace> {
        for (ws, _) in &self.workspaces {
            if ws.build_server_manager.claims(uri).await {
                return ws.clone();
            }
        }

        if let Some(implicit) = self.discover_implicit_workspace(uri).await {
            return implicit;
        }

        if let Some((first, _)) = self.workspaces.first() {
            return first.clone();
        }

        // No workspace at all: this only happens before the lifecycle
        // orchestrator has installed its placeholder workspace. Callers
        // should not observe this in practice.
        let placeholder = Arc::new(Workspace::new(
            None,
            Arc::new(crate::build::NullBuildServerManager),
            true,
        ));
        self.workspaces.push((placeholder.clone(), true));
        placeholder
    }

    async fn discover_implicit_workspace(&mut self, uri: &DocumentUri) -> Option<Arc<Workspace>> {
        let explicit_roots: Vec<PathBuf> = self
            .workspaces
            .iter()
            .filter(|(ws, _)| !ws.is_implicit)
            .filter_map(|(ws, _)| ws.root_uri.as_ref())
            .filter_map(|u| u.to_file_path().ok())
            .collect();

        let mut dir = uri.parent_dir()?;
        loop {
            if !explicit_roots.is_empty() && !within_any(&dir, &explicit_roots) {
                return None; // walked past the bound of every explicit root
            }

            if let Some(config_path) = self.detector.detect(&dir).await {
                let already_present = self.workspaces.iter().any(|(ws, _)| {
                    ws.root_uri
                        .as_ref()
                        .and_then(|u| u.to_file_path().ok())
                        .map(|root| root.join(config_path.file_name().unwrap_or_default()) == config_path || root == dir)
                        .unwrap_or(false)
                });
                if already_present {
                    return None;
                }
                let root_url = Url::from_file_path(&dir).ok()?;
                let bsm = self.factory.build_server_manager_for(&root_url);
                let semantic_index = self.factory.semantic_index_for(&root_url);
                let workspace = Arc::new(Workspace::with_semantic_index(Some(root_url), bsm, true, semantic_index));
                info!(root = %dir.display(), "discovered implicit workspace");
                self.workspaces.push((workspace.clone(), true));
                self.cache.clear();
                return Some(workspace);
            }

            match dir.parent() {
                Some(parent) => dir = parent.to_path_buf(),
                None => return None,
            }
        }
    }
}

fn within_any(dir: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| dir.starts_with(root) || root.starts_with(dir))
}

/// Handle to the router. Cheaply cloneable; every clone shares the cache and
/// talks to the same serial task.
#[derive(Clone)]
pub struct WorkspaceRouter {
    cache: Arc<UriToWorkspaceCache>,
    keyer: Arc<dyn BuildSettingsKeyer>,
    tx: mpsc::Sender<Command>,
}

impl WorkspaceRouter {
    pub fn new(
        initial_roots: Vec<Url>,
        factory: Arc<dyn WorkspaceFactory>,
        detector: Arc<dyn BuildSystemDetector>,
    ) -> Self {
        Self::with_keyer(initial_roots, factory, detector, Arc::new(IdentityKeyer))
    }

    pub fn with_keyer(
        initial_roots: Vec<Url>,
        factory: Arc<dyn WorkspaceFactory>,
        detector: Arc<dyn BuildSystemDetector>,
        keyer: Arc<dyn BuildSettingsKeyer>,
    ) -> Self {
        let cache = Arc::new(UriToWorkspaceCache::new());
        let workspaces = initial_roots
            .into_iter()
            .map(|root| {
                let bsm = factory.build_server_manager_for(&root);
                let semantic_index = factory.semantic_index_for(&root);
                (Arc::new(Workspace::with_semantic_index(Some(root), bsm, false, semantic_index)), false)
            })
            .collect();

        let mut state = RouterState {
            workspaces,
            cache: cache.clone(),
            factory,
            detector,
            keyer: keyer.clone(),
            open_documents: HashMap::new(),
        };

        let (tx, mut rx) = mpsc::channel::<Command>(256);
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Resolve { uri, reply } => {
                        let key = state.keyer.build_settings_key(&uri);
                        let ws = match state.cache.get(&key) {
                            Some(ws) => ws,
                            None => {
                                let ws = state.resolve_uncached(&uri).await;
                                state.cache.insert(key, &ws);
                                ws
                            }
                        };
                        let _ = reply.send(ws);
                    }
                    Command::FoldersChanged { added, removed, reply } => {
                        let instructions = handle_folders_changed(&mut state, added, removed).await;
                        let _ = reply.send(instructions);
                    }
                    Command::MarkOpen { doc, uri } => {
                        state.open_documents.insert(doc, uri);
                    }
                    Command::MarkClosed { doc } => {
                        state.open_documents.remove(&doc);
                        state.cache.remove(&doc);
                    }
                    Command::Snapshot { reply } => {
                        let snapshot = state.workspaces.iter().map(|(ws, _)| ws.clone()).collect();
                        let _ = reply.send(snapshot);
                    }
                }
            }
        });

        Self { cache, keyer, tx }
    }

    /// Resolution algorithm entry point (§4.4). Tries the cache first,
    /// lock-free; falls through to the serial context on a miss.
    pub async fn resolve(&self, uri: &DocumentUri) -> Arc<Workspace> {
        let key = self.keyer.build_settings_key(uri);
        if let Some(ws) = self.cache.get(&key) {
            return ws;
        }
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Resolve { uri: uri.clone(), reply: tx }).await.is_err() {
            unreachable!("router task must outlive its handles");
        }
        rx.await.expect("router task does not drop replies")
    }

    pub async fn folders_changed(&self, added: Vec<Url>, removed: Vec<Url>) -> Vec<ReopenInstruction> {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(Command::FoldersChanged { added, removed, reply: tx }).await;
        rx.await.unwrap_or_default()
    }

    pub async fn mark_open(&self, doc: DocumentId, uri: DocumentUri) {
        let _ = self.tx.send(Command::MarkOpen { doc, uri }).await;
    }

    pub async fn mark_closed(&self, doc: DocumentId) {
        let _ = self.tx.send(Command::MarkClosed { doc }).await;
    }

    pub async fn workspaces(&self) -> Vec<Arc<Workspace>> {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Snapshot { reply: tx }).await;
        rx.await.unwrap_or_default()
    }

    pub fn cache(&self) -> &Arc<UriToWorkspaceCache> {
        &self.cache
    }
}

async fn handle_folders_changed(
    state: &mut RouterState,
    added: Vec<Url>,
    removed: Vec<Url>,
) -> Vec<ReopenInstruction> {
    let previously_open: Vec<(DocumentId, DocumentUri)> =
        state.open_documents.iter().map(|(id, uri)| (id.clone(), uri.clone())).collect();
    let old_resolutions: HashMap<DocumentId, Arc<Workspace>> = previously_open
        .iter()
        .filter_map(|(id, _)| state.cache.get(id).map(|ws| (id.clone(), ws)))
        .collect();

    // On removal: drop matching explicit workspaces *and* every implicit
    // one, since the new explicit set may subsume them (§4.4).
    state.workspaces.retain(|(ws, _)| {
        if ws.is_implicit {
            return false;
        }
        match &ws.root_uri {
            Some(root) => !removed.contains(root),
            None => true,
        }
    });

    for folder in added {
        let bsm = state.factory.build_server_manager_for(&folder);
        let semantic_index = state.factory.semantic_index_for(&folder);
        state
            .workspaces
            .push((Arc::new(Workspace::with_semantic_index(Some(folder), bsm, false, semantic_index)), false));
    }

    state.cache.clear();
    debug!(remaining = state.workspaces.len(), "workspace list mutated by folder change");

    let mut instructions = Vec::new();
    for (id, uri) in previously_open {
        let new_ws = state.resolve_uncached(&uri).await;
        state.cache.insert(id.clone(), &new_ws);
        let old_ws = old_resolutions.get(&id).cloned();
        let changed = match &old_ws {
            Some(old) => !Arc::ptr_eq(old, &new_ws),
            None => true,
        };
        if changed {
            instructions.push(ReopenInstruction {
                doc: id,
                uri,
                old_workspace: old_ws,
                new_workspace: new_ws,
            });
        }
    }
    instructions
}
