pub mod cache;
pub mod router;

use dashmap::DashMap;
use lsp_types::ClientCapabilities;
use url::Url;

use crate::build::BuildServerManager;
use crate::ids::DocumentId;
use crate::semantic_index::{NullSemanticIndexManager, SemanticIndexManager};
use crate::services::LanguageServiceRef;

/// One workspace: an explicit client-declared root, or one discovered by the
/// router (§4.4). See `GLOSSARY: Implicit workspace`.
pub struct Workspace {
    pub root_uri: Option<Url>,
    pub build_server_manager: std::sync::Arc<dyn BuildServerManager>,
    pub semantic_index: std::sync::Arc<dyn SemanticIndexManager>,
    pub language_service_bindings: DashMap<DocumentId, Vec<LanguageServiceRef>>,
    pub capabilities: ClientCapabilities,
    pub is_implicit: bool,
}

impl Workspace {
    /// Builds a workspace with no semantic index wired (the placeholder
    /// workspace, and any caller that has no factory to ask). Use
    /// [`Workspace::with_semantic_index`] when one is available.
    pub fn new(root_uri: Option<Url>, build_server_manager: std::sync::Arc<dyn BuildServerManager>, is_implicit: bool) -> Self {
        Self::with_semantic_index(root_uri, build_server_manager, is_implicit, std::sync::Arc::new(NullSemanticIndexManager))
    }

    pub fn with_semantic_index(
        root_uri: Option<Url>,
        build_server_manager: std::sync::Arc<dyn BuildServerManager>,
        is_implicit: bool,
        semantic_index: std::sync::Arc<dyn SemanticIndexManager>,
    ) -> Self {
        Self {
            root_uri,
            build_server_manager,
            semantic_index,
            language_service_bindings: DashMap::new(),
            capabilities: ClientCapabilities::default(),
            is_implicit,
        }
    }

    pub fn bind_services(&self, doc: DocumentId, services: Vec<LanguageServiceRef>) {
        self.language_service_bindings.insert(doc, services);
    }

    pub fn services_for(&self, doc: &DocumentId) -> Option<Vec<LanguageServiceRef>> {
        self.language_service_bindings.get(doc).map(|entry| entry.value().clone())
    }

    pub fn unbind(&self, doc: &DocumentId) {
        self.language_service_bindings.remove(doc);
    }
}

/// Constructs the collaborator(s) a new workspace needs. Supplied by the
/// composition root; test code supplies a factory that builds fakes.
pub trait WorkspaceFactory: Send + Sync {
    fn build_server_manager_for(&self, root_uri: &Url) -> std::sync::Arc<dyn BuildServerManager>;

    /// Defaults to no semantic index; a deployment wiring a real one
    /// overrides this alongside `build_server_manager_for`.
    fn semantic_index_for(&self, _root_uri: &Url) -> std::sync::Arc<dyn SemanticIndexManager> {
        std::sync::Arc::new(NullSemanticIndexManager)
    }
}

/// Hands every workspace a [`crate::build::NullBuildServerManager`]. The
/// default wired in `main.rs` until a deployment supplies a factory for its
/// real build system; claims nothing, so routing still works but no
/// document resolves a toolchain until one is configured.
#[derive(Debug, Default)]
pub struct DefaultWorkspaceFactory;

impl WorkspaceFactory for DefaultWorkspaceFactory {
    fn build_server_manager_for(&self, _root_uri: &Url) -> std::sync::Arc<dyn BuildServerManager> {
        std::sync::Arc::new(crate::build::NullBuildServerManager)
    }
}
