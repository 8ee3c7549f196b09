//! Request Dispatcher (§4.6): given a classified, scheduled message,
//! resolves its workspace and language service(s) and forwards the call.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::build::Language;
use crate::error::DispatchError;
use crate::ids::DocumentUri;
use crate::semantic_index::{LanguageDetector, SemanticIndexManager};
use crate::services::directory::LanguageServiceDirectory;
use crate::services::traits::ServiceRequestError;
use crate::settings::SharedSettings;
use crate::workspace::router::WorkspaceRouter;
use crate::workspace::Workspace;

pub struct RequestDispatcher {
    router: WorkspaceRouter,
    directory: Arc<LanguageServiceDirectory>,
    language_detector: Arc<dyn LanguageDetector>,
    settings: Arc<SharedSettings>,
    client_capabilities: lsp_types::ClientCapabilities,
}

impl RequestDispatcher {
    pub fn new(
        router: WorkspaceRouter,
        directory: Arc<LanguageServiceDirectory>,
        language_detector: Arc<dyn LanguageDetector>,
        settings: Arc<SharedSettings>,
        client_capabilities: lsp_types::ClientCapabilities,
    ) -> Self {
        Self {
            router,
            directory,
            language_detector,
            settings,
            client_capabilities,
        }
    }

    /// Dispatches a request that targets exactly one document (§4.6 steps
    /// 1-5).
    pub async fn dispatch_document_request(
        &self,
        method: &str,
        uri: &DocumentUri,
        params: Value,
        active_document_tracking: bool,
    ) -> Result<Value, DispatchError> {
        if active_document_tracking {
            self.poke_active_document(uri).await;
        }

        let workspace = self.router.resolve(uri).await;
        let language = self.language_detector.detect(uri);

        let target = workspace.build_server_manager.canonical_target(uri).await;
        let toolchain = match target {
            Some(t) => workspace.build_server_manager.toolchain(&t, &Language(language.clone())).await,
            None => None,
        };
        let Some(toolchain) = toolchain else {
            return Err(DispatchError::NoLanguageServiceForDocument(uri.to_string()));
        };

        let services = self
            .directory
            .ensure_services(
                &language,
                &toolchain,
                workspace.root_uri.as_ref().map(|u| u.as_str()),
                &self.client_capabilities,
            )
            .await?;
        if services.is_empty() {
            return Err(DispatchError::NoLanguageServiceForDocument(uri.to_string()));
        }
        let key = workspace.build_server_manager.build_settings_key(uri);
        workspace.bind_services(key.clone(), services.clone());
        for service_ref in &services {
            self.directory.bind_document(service_ref.kind, workspace.root_uri.as_ref().map(|u| u.as_str()), &service_ref.toolchain, key.clone());
        }

        for service_ref in &services {
            match service_ref.service().handle_request(method, params.clone()).await {
                Ok(value) => return Ok(value),
                Err(ServiceRequestError::NotImplemented) => continue,
                Err(ServiceRequestError::Failed(msg)) => {
                    warn!(method, service = service_ref.service().name(), error = %msg, "language service request failed");
                    return Err(DispatchError::InternalError(msg));
                }
            }
        }
        Err(DispatchError::NoLanguageServiceImplementsMethod(method.to_string()))
    }

    /// Dispatches a workspace-wide request (§4.6, last paragraph): iterate
    /// every workspace, merge and sort deterministically.
    pub async fn dispatch_workspace_request(
        &self,
        method: &str,
        params: Value,
        merge: impl Fn(Vec<Value>) -> Value,
    ) -> Result<Value, DispatchError> {
        let workspaces = self.router.workspaces().await;
        if workspaces.is_empty() {
            return Err(DispatchError::WorkspaceNotOpen("<no workspace open>".to_string()));
        }

        let mut results = Vec::new();
        for workspace in &workspaces {
            if let Some(value) = self.dispatch_to_any_bound_service(workspace, method, params.clone()).await {
                results.push(value);
            }
        }
        Ok(merge(results))
    }

    /// Forwards a freshly opened document to the bound service stack,
    /// starting it if this is the first interaction with the document's
    /// language/toolchain pair (§4.5 "ensure-service").
    pub async fn document_opened(&self, uri: &DocumentUri, text: &str, version: i32) {
        let workspace = self.router.resolve(uri).await;
        let language = self.language_detector.detect(uri);

        let target = workspace.build_server_manager.canonical_target(uri).await;
        let toolchain = match target {
            Some(t) => workspace.build_server_manager.toolchain(&t, &Language(language.clone())).await,
            None => None,
        };
        let Some(toolchain) = toolchain else {
            warn!(uri = %uri, "no toolchain resolved for opened document");
            return;
        };

        workspace
            .build_server_manager
            .register_for_change_notifications(uri, &Language(language.clone()))
            .await;

        let key = workspace.build_server_manager.build_settings_key(uri);
        match self
            .directory
            .ensure_services(
                &language,
                &toolchain,
                workspace.root_uri.as_ref().map(|u| u.as_str()),
                &self.client_capabilities,
            )
            .await
        {
            Ok(services) if !services.is_empty() => {
                workspace.bind_services(key.clone(), services.clone());
                for service_ref in &services {
                    self.directory.bind_document(service_ref.kind, workspace.root_uri.as_ref().map(|u| u.as_str()), &service_ref.toolchain, key.clone());
                    service_ref.service().open_document(uri, text, version).await;
                }
            }
            Ok(_) => {}
            Err(err) => warn!(uri = %uri, error = %err, "failed to start language service for opened document"),
        }
    }

    pub async fn document_changed(&self, uri: &DocumentUri, text: &str, version: i32) {
        let workspace = self.router.resolve(uri).await;
        let key = workspace.build_server_manager.build_settings_key(uri);
        if let Some(services) = workspace.services_for(&key) {
            for service_ref in &services {
                service_ref.service().change_document(uri, text, version).await;
            }
        }
    }

    pub async fn document_closed(&self, uri: &DocumentUri) {
        let workspace = self.router.resolve(uri).await;
        let key = workspace.build_server_manager.build_settings_key(uri);
        if let Some(services) = workspace.services_for(&key) {
            for service_ref in &services {
                service_ref.service().close_document(uri).await;
            }
        }
        workspace.unbind(&key);
        self.directory.unbind_document(&key);
        workspace.build_server_manager.unregister_for_change_notifications(uri).await;
    }

    /// Shuts down every backend instance no longer referenced by an open
    /// document (§4.5 "Orphan collection"). Called after a workspace-folder
    /// change reassigns documents to new workspaces.
    pub fn collect_orphan_services(&self) {
        self.directory.collect_orphan_services();
    }

    pub async fn document_saved(&self, uri: &DocumentUri, text: Option<&str>) {
        let workspace = self.router.resolve(uri).await;
        let key = workspace.build_server_manager.build_settings_key(uri);
        if let Some(services) = workspace.services_for(&key) {
            for service_ref in &services {
                service_ref.service().did_save_document(uri, text).await;
            }
        }
    }

    /// Resolved design decision (b): call/type-hierarchy "prepare" handlers
    /// return only the first resolved item across workspaces, rather than
    /// truncating within each handler. Callers route `prepareCallHierarchy`
    /// and `prepareTypeHierarchy` through this instead of the general
    /// merge path.
    pub async fn dispatch_prepare_hierarchy(&self, method: &str, params: Value) -> Result<Value, DispatchError> {
        let workspaces = self.router.workspaces().await;
        for workspace in &workspaces {
            if let Some(value) = self.dispatch_to_any_bound_service(workspace, method, params.clone()).await {
                return Ok(value);
            }
        }
        Err(DispatchError::NoLanguageServiceImplementsMethod(method.to_string()))
    }

    async fn dispatch_to_any_bound_service(&self, workspace: &Workspace, method: &str, params: Value) -> Option<Value> {
        for entry in workspace.language_service_bindings.iter() {
            for service_ref in entry.value() {
                if let Ok(value) = service_ref.service().handle_request(method, params.clone()).await {
                    return Some(value);
                }
            }
        }
        None
    }

    async fn poke_active_document(&self, active: &DocumentUri) {
        let workspaces = self.router.workspaces().await;
        let owning = self.router.resolve(active).await;
        for workspace in &workspaces {
            let index = self.semantic_index_for(workspace);
            if Arc::ptr_eq(workspace, &owning) {
                index.did_change_active_document(active).await;
            } else {
                index.mark_preparation_irrelevant(active).await;
            }
        }
    }

    fn semantic_index_for(&self, workspace: &Arc<Workspace>) -> Arc<dyn SemanticIndexManager> {
        workspace.semantic_index.clone()
    }
}

pub fn workspace_symbol_query_too_short(query: &str, min_len: usize) -> bool {
    query.chars().count() < min_len
}

impl RequestDispatcher {
    /// Testable Property 9: queries shorter than the configured minimum
    /// return the empty list without touching the index.
    pub async fn workspace_symbol_min_query_len(&self) -> usize {
        self.settings.get().await.workspace_symbol_min_query_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_queries_are_rejected_before_touching_the_index() {
        assert!(workspace_symbol_query_too_short("ab", 3));
        assert!(!workspace_symbol_query_too_short("abc", 3));
    }
}
