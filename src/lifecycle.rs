//! Lifecycle Orchestrator (§4.7): initialize/shutdown/exit sequencing,
//! explicit-workspace setup from client-declared roots, and the
//! `initialized` gate concurrent requests must wait behind.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lsp_types::{
    ClientCapabilities, InitializeParams, OneOf, ServerCapabilities, TextDocumentSyncCapability,
    TextDocumentSyncKind, WorkspaceFoldersServerCapabilities, WorkspaceServerCapabilities,
};
use tokio::time::sleep;
use tracing::{info, warn};
use url::Url;

use crate::services::directory::LanguageServiceDirectory;
use crate::workspace::router::WorkspaceRouter;

/// Invoked by `exit` to actually terminate the process. Injectable so tests
/// never call `std::process::exit`; grounded in the teacher's `main.rs`,
/// which performs the exit itself rather than through the LSP trait.
pub trait ProcessExitHook: Send + Sync {
    fn exit(&self, code: i32);
}

pub struct StdProcessExitHook;

impl ProcessExitHook for StdProcessExitHook {
    fn exit(&self, code: i32) {
        std::process::exit(code);
    }
}

pub struct LifecycleOrchestrator {
    router: WorkspaceRouter,
    directory: Arc<LanguageServiceDirectory>,
    initialized: Arc<AtomicBool>,
    shutdown_received: AtomicBool,
    exit_hook: Arc<dyn ProcessExitHook>,
    backend_shutdown_timeout: Duration,
}

impl LifecycleOrchestrator {
    pub fn new(
        router: WorkspaceRouter,
        directory: Arc<LanguageServiceDirectory>,
        exit_hook: Arc<dyn ProcessExitHook>,
    ) -> Self {
        Self {
            router,
            directory,
            initialized: Arc::new(AtomicBool::new(false)),
            shutdown_received: AtomicBool::new(false),
            exit_hook,
            backend_shutdown_timeout: Duration::from_secs(5),
        }
    }

    pub fn initialized_flag(&self) -> Arc<AtomicBool> {
        self.initialized.clone()
    }

    /// Poll-based wait, per §4.7: concurrent requests that require
    /// initialization await this flag rather than blocking on the
    /// `initialize` reply itself.
    pub async fn wait_until_initialized(&self) {
        while !self.initialized.load(Ordering::Acquire) {
            sleep(Duration::from_millis(5)).await;
        }
    }

    /// Installs explicit workspaces from `workspaceFolders`, else `rootUri`,
    /// else the deprecated `rootPath`, and computes declared capabilities.
    /// If none resolve, no explicit workspace is installed; the router's own
    /// resolution fallback synthesizes the placeholder workspace lazily on
    /// first use, satisfying "construct one placeholder workspace" without
    /// this orchestrator needing to special-case it.
    pub async fn initialize(&self, params: &InitializeParams) -> ServerCapabilities {
        let roots = explicit_roots_from(params);
        if roots.is_empty() {
            warn!("no workspace folders, rootUri, or rootPath supplied; requests will resolve to a placeholder workspace");
        } else {
            self.router.folders_changed(roots, Vec::new()).await;
        }

        declared_capabilities(&params.capabilities)
    }

    /// Called only after the `initialize` reply has gone out on the wire.
    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
        info!("server initialized");
    }

    pub async fn shutdown(&self) {
        self.shutdown_received.store(true, Ordering::SeqCst);
        let timeout = self.backend_shutdown_timeout;

        let workspaces = self.router.workspaces().await;
        let bsm_shutdowns = workspaces.into_iter().map(move |ws| async move {
            if tokio::time::timeout(timeout, ws.build_server_manager.shutdown()).await.is_err() {
                warn!("build server manager shutdown timed out");
            }
        });

        let directory = self.directory.clone();
        let service_shutdown = async move {
            if tokio::time::timeout(timeout, directory.shutdown_all()).await.is_err() {
                warn!("language service shutdown timed out");
            }
        };

        futures::future::join(futures::future::join_all(bsm_shutdowns), service_shutdown).await;
        info!("shutdown complete");
    }

    /// Safe to call twice (§4.7 "Exit"): a second call just re-invokes the
    /// hook, which for the real process-exit hook never returns anyway.
    pub fn exit(&self, had_shutdown_error: bool) {
        let code = if !self.shutdown_received.load(Ordering::SeqCst) || had_shutdown_error {
            1
        } else {
            0
        };
        self.exit_hook.exit(code);
    }
}

fn explicit_roots_from(params: &InitializeParams) -> Vec<Url> {
    if let Some(folders) = &params.workspace_folders {
        if !folders.is_empty() {
            return folders.iter().map(|f| f.uri.clone()).collect();
        }
    }
    if let Some(root_uri) = &params.root_uri {
        return vec![root_uri.clone()];
    }
    #[allow(deprecated)]
    if let Some(root_path) = &params.root_path {
        if let Ok(url) = Url::from_file_path(PathBuf::from(root_path)) {
            return vec![url];
        }
    }
    Vec::new()
}

fn declared_capabilities(client: &ClientCapabilities) -> ServerCapabilities {
    let workspace_folders_support = client
        .workspace
        .as_ref()
        .and_then(|w| w.workspace_folders)
        .unwrap_or(false);

    ServerCapabilities {
        // Backends are required to declare incremental sync (§4.5 step 3);
        // the core advertises the same to the client.
        text_document_sync: Some(TextDocumentSyncCapability::Kind(TextDocumentSyncKind::INCREMENTAL)),
        workspace: workspace_folders_support.then(|| WorkspaceServerCapabilities {
            workspace_folders: Some(WorkspaceFoldersServerCapabilities {
                supported: Some(true),
                change_notifications: Some(OneOf::Left(true)),
            }),
            file_operations: None,
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{BuildServerManager, BuildSystemDetector, NullBuildServerManager, Toolchain};
    use crate::ids::DocumentUri;
    use crate::services::directory::{NullCapabilityRegistrar, ServiceFactory};
    use crate::services::{LanguageService, ServiceKind, ServiceKindRegistry};
    use crate::workspace::WorkspaceFactory;
    use async_trait::async_trait;
    use lsp_types::WorkspaceFolder;
    use std::sync::atomic::AtomicUsize;

    struct NullWorkspaceFactory;
    impl WorkspaceFactory for NullWorkspaceFactory {
        fn build_server_manager_for(&self, _root_uri: &Url) -> Arc<dyn BuildServerManager> {
            Arc::new(NullBuildServerManager)
        }
    }

    struct NeverDetector;
    #[async_trait]
    impl BuildSystemDetector for NeverDetector {
        async fn detect(&self, _dir: &std::path::Path) -> Option<PathBuf> {
            None
        }
    }

    struct PanicServiceFactory;
    #[async_trait]
    impl ServiceFactory for PanicServiceFactory {
        async fn start(
            &self,
            _kind: ServiceKind,
            _toolchain: &Toolchain,
            _workspace_root: Option<&str>,
        ) -> anyhow::Result<Arc<dyn LanguageService>> {
            unreachable!("no service kinds are registered in these tests")
        }
    }

    struct CountingExitHook(Arc<AtomicUsize>);
    impl ProcessExitHook for CountingExitHook {
        fn exit(&self, _code: i32) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn orchestrator() -> LifecycleOrchestrator {
        let router = WorkspaceRouter::new(Vec::new(), Arc::new(NullWorkspaceFactory), Arc::new(NeverDetector));
        let (directory, _crash_rx) = LanguageServiceDirectory::new(ServiceKindRegistry::new(), Arc::new(PanicServiceFactory), Arc::new(NullCapabilityRegistrar));
        LifecycleOrchestrator::new(
            router,
            Arc::new(directory),
            Arc::new(CountingExitHook(Arc::new(AtomicUsize::new(0)))),
        )
    }

    #[tokio::test]
    async fn initialize_with_workspace_folders_installs_explicit_workspace() {
        let router = WorkspaceRouter::new(Vec::new(), Arc::new(NullWorkspaceFactory), Arc::new(NeverDetector));
        let (directory, _crash_rx) = LanguageServiceDirectory::new(ServiceKindRegistry::new(), Arc::new(PanicServiceFactory), Arc::new(NullCapabilityRegistrar));
        let orchestrator = LifecycleOrchestrator::new(
            router.clone(),
            Arc::new(directory),
            Arc::new(CountingExitHook(Arc::new(AtomicUsize::new(0)))),
        );

        let root = Url::from_file_path("/ws").unwrap();
        let params = InitializeParams {
            workspace_folders: Some(vec![WorkspaceFolder { uri: root.clone(), name: "ws".into() }]),
            ..Default::default()
        };
        orchestrator.initialize(&params).await;

        let doc_uri = DocumentUri::new(Url::from_file_path("/ws/foo.rs").unwrap());
        let ws = router.resolve(&doc_uri).await;
        assert_eq!(ws.root_uri.as_ref(), Some(&root));
    }

    #[tokio::test]
    async fn wait_until_initialized_blocks_until_marked() {
        let orchestrator = Arc::new(orchestrator());
        let waiter = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.wait_until_initialized().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        orchestrator.mark_initialized();
        tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("wait_until_initialized should return promptly once marked")
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_completes_with_no_workspaces_or_services() {
        orchestrator().shutdown().await;
    }

    #[tokio::test]
    async fn exit_is_safe_to_call_twice() {
        let calls = Arc::new(AtomicUsize::new(0));
        let router = WorkspaceRouter::new(Vec::new(), Arc::new(NullWorkspaceFactory), Arc::new(NeverDetector));
        let (directory, _crash_rx) = LanguageServiceDirectory::new(ServiceKindRegistry::new(), Arc::new(PanicServiceFactory), Arc::new(NullCapabilityRegistrar));
        let orchestrator =
            LifecycleOrchestrator::new(router, Arc::new(directory), Arc::new(CountingExitHook(calls.clone())));

        orchestrator.exit(false);
        orchestrator.exit(false);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
