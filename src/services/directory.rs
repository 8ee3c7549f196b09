//! Language-Service Directory (§4.5): lazily starts, memoizes, reopens, and
//! shuts down backend language services keyed by service-kind × workspace ×
//! toolchain.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as DashEntry;
use dashmap::DashMap;
use lsp_types::{ClientCapabilities, ServerCapabilities, TextDocumentSyncKind};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::build::Toolchain;
use crate::error::DispatchError;
use crate::ids::DocumentId;
use crate::services::{LanguageService, LanguageServiceRef, ServiceKind, ServiceKindRegistry, ServiceState};

/// Constructs new backend service instances. Supplied by the composition
/// root (`src/host.rs`); test code supplies a fake that constructs in-memory
/// stub services instead of spawning real sub-processes.
#[async_trait]
pub trait ServiceFactory: Send + Sync {
    async fn start(
        &self,
        kind: ServiceKind,
        toolchain: &Toolchain,
        workspace_root: Option<&str>,
    ) -> anyhow::Result<Arc<dyn LanguageService>>;
}

/// Starts nothing; every kind fails to start. The default wired in
/// `main.rs` until a deployment supplies a real backend-spawning factory —
/// mirrors `NullBuildServerManager` (`crate::build`) and
/// `NullSemanticIndexManager` (`crate::semantic_index`) as the out-of-scope
/// collaborator's no-op stand-in.
#[derive(Debug, Default)]
pub struct NullServiceFactory;

#[async_trait]
impl ServiceFactory for NullServiceFactory {
    async fn start(&self, kind: ServiceKind, _toolchain: &Toolchain, _workspace_root: Option<&str>) -> anyhow::Result<Arc<dyn LanguageService>> {
        anyhow::bail!("no backend service factory configured for {kind:?}")
    }
}

/// Registers the dynamic capabilities (and built-in commands) a backend
/// service declares in its `initialize` response. Supplied by the
/// composition root; test code supplies a fake that records what it was
/// handed.
#[async_trait]
pub trait CapabilityRegistrar: Send + Sync {
    async fn register(&self, service_name: &str, capabilities: &ServerCapabilities, commands: &std::collections::HashSet<String>);
}

/// Registers nothing. The default wired in `main.rs` until a deployment
/// supplies a registrar that forwards these onto the client connection(s)
/// actually serving the affected workspace — mirrors `NullServiceFactory`/
/// `NullBuildServerManager`/`NullSemanticIndexManager` as the out-of-scope
/// collaborator's no-op stand-in.
#[derive(Debug, Default)]
pub struct NullCapabilityRegistrar;

#[async_trait]
impl CapabilityRegistrar for NullCapabilityRegistrar {
    async fn register(&self, _service_name: &str, _capabilities: &ServerCapabilities, _commands: &std::collections::HashSet<String>) {}
}

#[derive(Clone, Debug)]
pub struct CrashEvent {
    pub kind: ServiceKind,
    pub toolchain: Toolchain,
    pub workspace_root: Option<String>,
    /// Documents bound to the crashed instance at the moment it crashed,
    /// for the crash consumer to close and reopen against the rebuilt one.
    pub documents: Vec<DocumentId>,
}

type InstanceKey = (ServiceKind, Option<String>, Toolchain);

pub struct LanguageServiceDirectory {
    registry: ServiceKindRegistry,
    factory: Arc<dyn ServiceFactory>,
    registrar: Arc<dyn CapabilityRegistrar>,
    instances: DashMap<InstanceKey, LanguageServiceRef>,
    bindings: Arc<Mutex<ServiceBindings>>,
    crash_tx: mpsc::UnboundedSender<CrashEvent>,
}

impl LanguageServiceDirectory {
    pub fn new(
        registry: ServiceKindRegistry,
        factory: Arc<dyn ServiceFactory>,
        registrar: Arc<dyn CapabilityRegistrar>,
    ) -> (Self, mpsc::UnboundedReceiver<CrashEvent>) {
        let (crash_tx, crash_rx) = mpsc::unbounded_channel();
        (
            Self {
                registry,
                factory,
                registrar,
                instances: DashMap::new(),
                bindings: Arc::new(Mutex::new(ServiceBindings::default())),
                crash_tx,
            },
            crash_rx,
        )
    }

    /// Records that `doc` is now served by the `(kind, workspace_root,
    /// toolchain)` instance, so a later crash knows to reopen it.
    pub fn bind_document(&self, kind: ServiceKind, workspace_root: Option<&str>, toolchain: &Toolchain, doc: DocumentId) {
        let key: InstanceKey = (kind, workspace_root.map(str::to_owned), toolchain.clone());
        self.bindings.lock().bind(key, doc);
    }

    /// Forgets `doc`'s binding to whichever instance(s) it was serviced by.
    pub fn unbind_document(&self, doc: &DocumentId) {
        self.bindings.lock().unbind(doc);
    }

    /// Shuts down every tracked instance no longer referenced by an open
    /// document (§4.5 "Orphan collection"), using this directory's own
    /// document-binding ledger.
    pub fn collect_orphan_services(&self) {
        let still_referenced = self.bindings.lock().referenced_instances();
        self.collect_orphans(&still_referenced);
    }

    /// Ensure-service procedure (§4.5). Returns the ordered list of service
    /// references bound for `language` in `toolchain`, in declared
    /// precedence order, or an error if the highest-precedence kind that was
    /// attempted failed to start.
    pub async fn ensure_services(
        &self,
        language: &str,
        toolchain: &Toolchain,
        workspace_root: Option<&str>,
        client_capabilities: &ClientCapabilities,
    ) -> Result<Vec<LanguageServiceRef>, DispatchError> {
        let kinds = self.registry.kinds_for(language).to_vec();
        if kinds.is_empty() {
            return Err(DispatchError::NoLanguageServiceForDocument(format!(
                "no service kinds registered for language '{language}'"
            )));
        }

        let mut resolved = Vec::new();
        for kind in kinds {
            let key: InstanceKey = (kind, workspace_root.map(str::to_owned), toolchain.clone());

            if let Some(existing) = self.instances.get(&key) {
                if existing.can_handle(toolchain) {
                    resolved.push(existing.clone());
                    continue;
                }
            }

            match self.start_one(kind, toolchain, workspace_root, client_capabilities, &key).await {
                Ok(service_ref) => resolved.push(service_ref),
                Err(err) => {
                    // §4.5 step 3: if starting fails, stop trying
                    // lower-precedence kinds — a partial stack is worse than
                    // none, since e.g. a documentation-only service would
                    // silently answer completion requests incorrectly.
                    error!(?kind, error = %err, "language service failed to start; aborting remaining kinds");
                    if resolved.is_empty() {
                        return Err(DispatchError::NoLanguageServiceForDocument(err.to_string()));
                    }
                    break;
                }
            }
        }
        Ok(resolved)
    }

    async fn start_one(
        &self,
        kind: ServiceKind,
        toolchain: &Toolchain,
        workspace_root: Option<&str>,
        client_capabilities: &ClientCapabilities,
        key: &InstanceKey,
    ) -> anyhow::Result<LanguageServiceRef> {
        let service = self.factory.start(kind, toolchain, workspace_root).await?;
        let service_ref = LanguageServiceRef::new(kind, toolchain.clone(), workspace_root.map(str::to_owned), service.clone());

        let server_capabilities = service.initialize(client_capabilities).await?;
        let commands = service.built_in_commands();
        debug!(service = service.name(), ?server_capabilities, ?commands, "language service initialized; registering its capabilities");
        self.registrar.register(service.name(), &server_capabilities, &commands).await;

        if service.declared_text_sync_kind() != TextDocumentSyncKind::INCREMENTAL {
            anyhow::bail!(
                "service '{}' declared non-incremental text sync; refusing to use it",
                service.name()
            );
        }
        service_ref.set_state(ServiceState::Initialized);
        service.client_initialized().await;
        service_ref.set_state(ServiceState::Running);

        // Race-recovery (§4.5 step 3): another concurrent ensure_services
        // call may have won the race to populate this key while we were
        // awaiting initialize/clientInitialized above. DashMap's entry API
        // lets us check-and-insert without an await in between, so there is
        // no further race once we reach this point.
        let winner = match self.instances.entry(key.clone()) {
            DashEntry::Occupied(existing) => {
                let existing = existing.get().clone();
                info!(?kind, "lost the race to start this service; adopting the existing instance");
                existing
            }
            DashEntry::Vacant(vacant) => {
                vacant.insert(service_ref.clone());
                service_ref.clone()
            }
        };

        if winner.service().name() != service_ref.service().name() {
            // We lost; shut down the one we just built.
            service_ref.set_state(ServiceState::ShuttingDown);
            service.shutdown().await;
            service_ref.set_state(ServiceState::Terminated);
        } else {
            self.spawn_crash_watcher(key.clone(), service_ref.clone());
        }
        Ok(winner)
    }

    fn spawn_crash_watcher(&self, key: InstanceKey, service_ref: LanguageServiceRef) {
        let crash_tx = self.crash_tx.clone();
        let bindings = self.bindings.clone();
        let service = service_ref.service().clone();
        tokio::spawn(async move {
            service.crashed().await;
            service_ref.set_state(ServiceState::Crashed);
            warn!(kind = ?key.0, "language service crashed");
            let documents = bindings.lock().documents_for(&key).to_vec();
            let _ = crash_tx.send(CrashEvent {
                kind: key.0,
                toolchain: key.2,
                workspace_root: key.1,
                documents,
            });
        });
    }

    /// Removes a crashed instance so the next `ensure_services` call starts
    /// a fresh one. Called by the lifecycle orchestrator after it has
    /// synthesized close/open against the old instance's bound documents.
    pub fn evict(&self, kind: ServiceKind, toolchain: &Toolchain, workspace_root: Option<&str>) {
        self.instances.remove(&(kind, workspace_root.map(str::to_owned), toolchain.clone()));
    }

    /// Concurrently shuts down every tracked instance. Idempotent: a second
    /// call finds an empty map and does nothing.
    pub async fn shutdown_all(&self) {
        let refs: Vec<_> = self.instances.iter().map(|e| e.value().clone()).collect();
        self.instances.clear();
        let shutdowns = refs.into_iter().map(|r| async move {
            r.set_state(ServiceState::ShuttingDown);
            r.service().shutdown().await;
            r.set_state(ServiceState::Terminated);
        });
        futures::future::join_all(shutdowns).await;
    }

    /// Shuts down, in the background, every tracked instance whose
    /// `(kind, workspace_root)` no longer appears in `still_referenced`,
    /// unless it declares itself immortal (§4.5 "Orphan collection").
    pub fn collect_orphans(&self, still_referenced: &[(ServiceKind, Option<String>)]) {
        let mut doomed = Vec::new();
        for entry in self.instances.iter() {
            let (kind, root, _) = entry.key();
            if entry.value().service().is_immortal() {
                continue;
            }
            if !still_referenced.iter().any(|(k, r)| k == kind && r == root) {
                doomed.push((entry.key().clone(), entry.value().clone()));
            }
        }
        for (key, service_ref) in doomed {
            self.instances.remove(&key);
            tokio::spawn(async move {
                service_ref.set_state(ServiceState::ShuttingDown);
                service_ref.service().shutdown().await;
                service_ref.set_state(ServiceState::Terminated);
            });
        }
    }
}

/// Tracks which documents are bound to which `(kind, workspace_root,
/// toolchain)` instance, so crash recovery and orphan collection know what
/// they affect. Owned by the directory itself, guarded by a plain `Mutex`
/// since every access is synchronous and brief.
#[derive(Default)]
pub struct ServiceBindings {
    by_instance: HashMap<InstanceKey, Vec<DocumentId>>,
}

impl ServiceBindings {
    pub fn bind(&mut self, key: InstanceKey, doc: DocumentId) {
        let docs = self.by_instance.entry(key).or_default();
        if !docs.contains(&doc) {
            docs.push(doc);
        }
    }

    pub fn unbind(&mut self, doc: &DocumentId) {
        for docs in self.by_instance.values_mut() {
            docs.retain(|d| d != doc);
        }
    }

    pub fn documents_for(&self, key: &InstanceKey) -> &[DocumentId] {
        match self.by_instance.get(key) {
            Some(docs) => docs.as_slice(),
            None => &[],
        }
    }

    pub fn referenced_instances(&self) -> Vec<(ServiceKind, Option<String>)> {
        self.by_instance
            .iter()
            .filter(|(_, docs)| !docs.is_empty())
            .map(|((kind, root, _), _)| (*kind, root.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::traits::ServiceRequestError;
    use lsp_types::ServerCapabilities;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct FakeService {
        name: String,
        crash: Arc<Notify>,
    }

    #[async_trait]
    impl LanguageService for FakeService {
        fn name(&self) -> &str {
            &self.name
        }
        fn can_handle(&self, _toolchain: &Toolchain) -> bool {
            true
        }
        fn declared_text_sync_kind(&self) -> TextDocumentSyncKind {
            TextDocumentSyncKind::INCREMENTAL
        }
        async fn initialize(&self, _caps: &ClientCapabilities) -> anyhow::Result<ServerCapabilities> {
            Ok(ServerCapabilities::default())
        }
        async fn client_initialized(&self) {}
        async fn open_document(&self, _uri: &crate::ids::DocumentUri, _text: &str, _version: i32) {}
        async fn change_document(&self, _uri: &crate::ids::DocumentUri, _text: &str, _version: i32) {}
        async fn close_document(&self, _uri: &crate::ids::DocumentUri) {}
        async fn reopen_document(&self, _uri: &crate::ids::DocumentUri, _text: &str, _version: i32) {}
        async fn will_save_document(&self, _uri: &crate::ids::DocumentUri) {}
        async fn did_save_document(&self, _uri: &crate::ids::DocumentUri, _text: Option<&str>) {}
        async fn handle_request(&self, _method: &str, _params: Value) -> Result<Value, ServiceRequestError> {
            Err(ServiceRequestError::NotImplemented)
        }
        async fn shutdown(&self) {}
        async fn crashed(&self) {
            self.crash.notified().await;
        }
    }

    struct FakeFactory {
        starts: Arc<AtomicUsize>,
        crash: Arc<Notify>,
    }

    #[async_trait]
    impl ServiceFactory for FakeFactory {
        async fn start(
            &self,
            kind: ServiceKind,
            _toolchain: &Toolchain,
            _workspace_root: Option<&str>,
        ) -> anyhow::Result<Arc<dyn LanguageService>> {
            let n = self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeService {
                name: format!("{kind:?}-{n}"),
                crash: self.crash.clone(),
            }))
        }
    }

    fn registry() -> ServiceKindRegistry {
        let mut r = ServiceKindRegistry::new();
        r.register("primary", vec![ServiceKind::PrimaryToolchain]);
        r
    }

    #[tokio::test]
    async fn ensure_services_starts_once_and_memoizes() {
        let starts = Arc::new(AtomicUsize::new(0));
        let crash = Arc::new(Notify::new());
        let factory = Arc::new(FakeFactory { starts: starts.clone(), crash });
        let (dir, _crash_rx) = LanguageServiceDirectory::new(registry(), factory, Arc::new(NullCapabilityRegistrar));

        let toolchain = Toolchain("stable".into());
        let caps = ClientCapabilities::default();
        let first = dir.ensure_services("primary", &toolchain, Some("/ws"), &caps).await.unwrap();
        let second = dir.ensure_services("primary", &toolchain, Some("/ws"), &caps).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(starts.load(Ordering::SeqCst), 1, "second call should reuse the running instance");
    }

    #[tokio::test]
    async fn different_toolchains_get_different_instances() {
        let starts = Arc::new(AtomicUsize::new(0));
        let crash = Arc::new(Notify::new());
        let factory = Arc::new(FakeFactory { starts: starts.clone(), crash });
        let (dir, _crash_rx) = LanguageServiceDirectory::new(registry(), factory, Arc::new(NullCapabilityRegistrar));
        let caps = ClientCapabilities::default();

        dir.ensure_services("primary", &Toolchain("stable".into()), Some("/ws"), &caps).await.unwrap();
        dir.ensure_services("primary", &Toolchain("nightly".into()), Some("/ws"), &caps).await.unwrap();

        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_language_is_no_language_service_error() {
        let starts = Arc::new(AtomicUsize::new(0));
        let crash = Arc::new(Notify::new());
        let factory = Arc::new(FakeFactory { starts, crash });
        let (dir, _crash_rx) = LanguageServiceDirectory::new(registry(), factory, Arc::new(NullCapabilityRegistrar));
        let caps = ClientCapabilities::default();

        let result = dir.ensure_services("nonexistent", &Toolchain("stable".into()), None, &caps).await;
        assert!(matches!(result, Err(DispatchError::NoLanguageServiceForDocument(_))));
    }

    #[tokio::test]
    async fn crash_emits_event_with_bound_documents_and_eviction_allows_restart() {
        let starts = Arc::new(AtomicUsize::new(0));
        let crash = Arc::new(Notify::new());
        let factory = Arc::new(FakeFactory { starts: starts.clone(), crash: crash.clone() });
        let (dir, mut crash_rx) = LanguageServiceDirectory::new(registry(), factory, Arc::new(NullCapabilityRegistrar));
        let caps = ClientCapabilities::default();
        let toolchain = Toolchain("stable".into());

        dir.ensure_services("primary", &toolchain, None, &caps).await.unwrap();
        let doc = DocumentId::from_url(url::Url::parse("file:///a.rs").unwrap());
        dir.bind_document(ServiceKind::PrimaryToolchain, None, &toolchain, doc.clone());
        crash.notify_waiters();

        let event = tokio::time::timeout(std::time::Duration::from_millis(200), crash_rx.recv())
            .await
            .expect("crash event should arrive")
            .expect("channel open");
        assert_eq!(event.kind, ServiceKind::PrimaryToolchain);
        assert_eq!(event.documents, vec![doc]);

        dir.evict(ServiceKind::PrimaryToolchain, &toolchain, None);
        dir.ensure_services("primary", &toolchain, None, &caps).await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 2, "eviction should allow a fresh start");
    }

    #[tokio::test]
    async fn start_one_registers_the_initialize_response() {
        struct RecordingRegistrar {
            calls: Arc<Mutex<Vec<String>>>,
        }

        #[async_trait]
        impl CapabilityRegistrar for RecordingRegistrar {
            async fn register(&self, service_name: &str, _capabilities: &ServerCapabilities, _commands: &std::collections::HashSet<String>) {
                self.calls.lock().push(service_name.to_string());
            }
        }

        let starts = Arc::new(AtomicUsize::new(0));
        let crash = Arc::new(Notify::new());
        let factory = Arc::new(FakeFactory { starts, crash });
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registrar = Arc::new(RecordingRegistrar { calls: calls.clone() });
        let (dir, _crash_rx) = LanguageServiceDirectory::new(registry(), factory, registrar);
        let caps = ClientCapabilities::default();

        dir.ensure_services("primary", &Toolchain("stable".into()), None, &caps).await.unwrap();
        assert_eq!(calls.lock().len(), 1, "the registrar should see exactly one registration for the started service");
    }

    #[test]
    fn orphan_collection_uses_only_still_bound_instances() {
        let mut bindings = ServiceBindings::default();
        let doc_a = DocumentId::from_url(url::Url::parse("file:///a.rs").unwrap());
        let key: InstanceKey = (ServiceKind::PrimaryToolchain, Some("/ws".to_string()), Toolchain("stable".into()));
        bindings.bind(key.clone(), doc_a.clone());
        assert_eq!(bindings.referenced_instances(), vec![(ServiceKind::PrimaryToolchain, Some("/ws".to_string()))]);

        bindings.unbind(&doc_a);
        assert!(bindings.referenced_instances().is_empty());
    }
}
