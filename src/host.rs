//! `LspHost`: the composition root. Wires the Dependency Classifier,
//! Dependency Queue, Cancellation Registry, Workspace Router,
//! Language-Service Directory, Request Dispatcher, and Lifecycle
//! Orchestrator into one `lsp_server::Message` handling entry point,
//! playing the same role the teacher's `RholangBackend` plays for its
//! (much smaller) set of collaborators.

use std::sync::Arc;

use lsp_server::{Message, Notification, Request, RequestId, Response};
use lsp_types::notification::Notification as _;
use lsp_types::request::Request as _;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::cancel::CancellationRegistry;
use crate::classify::{classify, extract_document_uri, BuildSettingsKeyer, DependencyClass, IdentityKeyer};
use crate::content::DocumentContentStore;
use crate::dispatch::RequestDispatcher;
use crate::error::DispatchError;
use crate::ids::DocumentUri;
use crate::lifecycle::LifecycleOrchestrator;
use crate::queue::{DependencyQueue, Priority};
use crate::settings::SharedSettings;
use crate::workspace::router::WorkspaceRouter;

/// One client session. Constructed fresh per accepted `lsp_server::Connection`
/// (see `src/transport.rs`); everything it owns is per-connection except the
/// collaborators passed in, which may be shared when a deployment wants one
/// backend-service fleet serving several connections.
pub struct LspHost {
    keyer: Arc<dyn BuildSettingsKeyer>,
    queue: DependencyQueue,
    cancel: CancellationRegistry,
    router: WorkspaceRouter,
    dispatcher: Arc<RequestDispatcher>,
    lifecycle: Arc<LifecycleOrchestrator>,
    settings: Arc<SharedSettings>,
    content_store: Arc<dyn DocumentContentStore>,
    out: crossbeam_channel::Sender<Message>,
}

impl LspHost {
    pub fn new(
        router: WorkspaceRouter,
        dispatcher: Arc<RequestDispatcher>,
        lifecycle: Arc<LifecycleOrchestrator>,
        settings: Arc<SharedSettings>,
        content_store: Arc<dyn DocumentContentStore>,
        out: crossbeam_channel::Sender<Message>,
    ) -> Arc<Self> {
        let cancel = CancellationRegistry::new(settings.implicit_cancellation_flag());
        Arc::new(Self {
            keyer: Arc::new(IdentityKeyer),
            queue: DependencyQueue::with_concurrency_limit(None),
            cancel,
            router,
            dispatcher,
            lifecycle,
            settings,
            content_store,
            out,
        })
    }

    /// Classifies, schedules, and (once runnable) executes one inbound
    /// message. Spawned as its own task by the transport pump so the pump
    /// loop itself never blocks on a handler body (§5 "suspension points").
    pub async fn handle(self: Arc<Self>, message: Message) {
        match message {
            Message::Request(req) => self.handle_request(req).await,
            Message::Notification(note) => self.handle_notification(note).await,
            Message::Response(resp) => {
                trace!(id = ?resp.id, "dropping unexpected client->server response; this core issues no server-initiated requests yet");
            }
        }
    }

    async fn handle_request(self: Arc<Self>, req: Request) {
        let params = req.params.clone();
        let class = classify(&req.method, &params, self.keyer.as_ref());
        debug!(method = %req.method, id = ?req.id, ?class, "request classified");

        let mut scheduled = self.queue.enqueue(class.clone(), priority_for(&class));
        scheduled.wait_runnable().await;

        let doc_for_cancel = class.document_key().cloned().unwrap_or_else(|| {
            extract_document_uri(&params)
                .as_ref()
                .map(|u| self.keyer.build_settings_key(u))
                .unwrap_or_else(|| crate::ids::DocumentId::identity(&DocumentUri::new(
                    url::Url::parse("lsphost:///no-document").expect("static url parses"),
                )))
        });
        let token = self.cancel.register(doc_for_cancel, req.id.clone(), req.method.clone());

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(DispatchError::Cancelled),
            result = self.dispatch_request_body(&req.method, &req.id, params) => result,
        };

        self.cancel.unregister(req.id.clone());
        scheduled.complete();

        let response = match outcome {
            Ok(value) => Response { id: req.id, result: Some(value), error: None },
            Err(err) => Response { id: req.id, result: None, error: Some(err.into()) },
        };
        if self.out.send(Message::Response(response)).is_err() {
            warn!("connection closed before a response could be sent");
        }
    }

    async fn dispatch_request_body(&self, method: &str, id: &RequestId, params: Value) -> Result<Value, DispatchError> {
        match method {
            lsp_types::request::Initialize::METHOD => {
                let parsed: lsp_types::InitializeParams = serde_json::from_value(params)
                    .map_err(|e| DispatchError::InternalError(format!("malformed initialize params: {e}")))?;
                let capabilities = self.lifecycle.initialize(&parsed).await;
                let result = lsp_types::InitializeResult { capabilities, server_info: None };
                serde_json::to_value(result).map_err(|e| DispatchError::InternalError(e.to_string()))
            }
            lsp_types::request::Shutdown::METHOD => {
                self.lifecycle.shutdown().await;
                Ok(Value::Null)
            }
            "textDocument/prepareCallHierarchy" | "textDocument/prepareTypeHierarchy" => {
                self.dispatcher.dispatch_prepare_hierarchy(method, params).await
            }
            lsp_types::request::WorkspaceSymbolRequest::METHOD => {
                let query = params.get("query").and_then(Value::as_str).unwrap_or("");
                let min_len = self.dispatcher.workspace_symbol_min_query_len().await;
                if crate::dispatch::workspace_symbol_query_too_short(query, min_len) {
                    return Ok(Value::Array(Vec::new()));
                }
                self.dispatcher
                    .dispatch_workspace_request(method, params, merge_sorted_by_name)
                    .await
            }
            "workspace/tests" | "workspace/testDiscover" => {
                self.dispatcher
                    .dispatch_workspace_request(method, params, merge_sorted_by_name)
                    .await
            }
            _ => {
                if !self.lifecycle.initialized_flag().load(std::sync::atomic::Ordering::Acquire) {
                    self.lifecycle.wait_until_initialized().await;
                }
                match extract_document_uri(&params) {
                    Some(uri) => self.dispatcher.dispatch_document_request(method, &uri, params, true).await,
                    None => {
                        trace!(method, ?id, "request with no document/workspace target; no route for it");
                        Err(DispatchError::MethodNotFound(method.to_string()))
                    }
                }
            }
        }
    }

    async fn handle_notification(self: Arc<Self>, note: Notification) {
        let params = note.params.clone();
        let class = classify(&note.method, &params, self.keyer.as_ref());
        debug!(method = %note.method, ?class, "notification classified");

        // Implicit cancellation must fire at classification time, not once
        // the task becomes runnable, or the point of releasing same-document
        // dependents quickly is defeated (see `CancellationRegistry::notify_document_update`).
        if let DependencyClass::DocumentUpdate(doc) = &class {
            self.cancel.notify_document_update(doc.clone());
        }

        let mut scheduled = self.queue.enqueue(class, priority_for_notification(&note.method));
        scheduled.wait_runnable().await;

        self.run_notification_body(note).await;
        scheduled.complete();
    }

    async fn run_notification_body(&self, note: Notification) {
        let method = note.method.as_str();
        let params = note.params;
        match method {
            lsp_types::notification::Initialized::METHOD => {
                self.lifecycle.mark_initialized();
            }
            lsp_types::notification::Exit::METHOD => {
                self.lifecycle.exit(false);
            }
            lsp_types::notification::Cancel::METHOD => {
                if let Some(id) = extract_cancel_id(&params) {
                    self.cancel.cancel_request(id);
                }
            }
            lsp_types::notification::DidChangeConfiguration::METHOD => {
                if let Some(settings_value) = params.get("settings") {
                    match serde_json::from_value(settings_value.clone()) {
                        Ok(settings) => self.settings.update(settings).await,
                        Err(e) => warn!(error = %e, "malformed didChangeConfiguration settings; keeping previous configuration"),
                    }
                }
            }
            lsp_types::notification::DidChangeWorkspaceFolders::METHOD => {
                if let Ok(parsed) = serde_json::from_value::<lsp_types::DidChangeWorkspaceFoldersParams>(params) {
                    let added = parsed.event.added.into_iter().map(|f| f.uri).collect();
                    let removed = parsed.event.removed.into_iter().map(|f| f.uri).collect();
                    let instructions = self.router.folders_changed(added, removed).await;
                    for instr in instructions {
                        debug!(doc = %instr.doc, "document reassigned to a different workspace after folder change");
                        self.dispatcher.document_closed(&instr.uri).await;
                        match self.content_store.current(&instr.uri).await {
                            Some((text, version)) => {
                                self.dispatcher.document_opened(&instr.uri, &text, version).await;
                            }
                            None => {
                                debug!(doc = %instr.doc, "no content available to reopen against the new workspace");
                            }
                        }
                    }
                    self.dispatcher.collect_orphan_services();
                }
            }
            lsp_types::notification::DidOpenTextDocument::METHOD => {
                if let Ok(p) = serde_json::from_value::<lsp_types::DidOpenTextDocumentParams>(params) {
                    let uri = DocumentUri::new(p.text_document.uri.clone());
                    let key = self.keyer.build_settings_key(&uri);
                    self.router.mark_open(key, uri.clone()).await;
                    self.dispatcher
                        .document_opened(&uri, &p.text_document.text, p.text_document.version)
                        .await;
                }
            }
            lsp_types::notification::DidChangeTextDocument::METHOD => {
                if let Ok(p) = serde_json::from_value::<lsp_types::DidChangeTextDocumentParams>(params) {
                    let uri = DocumentUri::new(p.text_document.uri.clone());
                    // Incremental deltas are applied by the document-content
                    // store (out of scope, §1); this core forwards the final
                    // full text a real deployment's store would hold.
                    let text = p.content_changes.last().map(|c| c.text.clone()).unwrap_or_default();
                    self.dispatcher.document_changed(&uri, &text, p.text_document.version).await;
                }
            }
            lsp_types::notification::DidCloseTextDocument::METHOD => {
                if let Ok(p) = serde_json::from_value::<lsp_types::DidCloseTextDocumentParams>(params) {
                    let uri = DocumentUri::new(p.text_document.uri.clone());
                    let key = self.keyer.build_settings_key(&uri);
                    self.dispatcher.document_closed(&uri).await;
                    self.router.mark_closed(key).await;
                }
            }
            lsp_types::notification::DidSaveTextDocument::METHOD => {
                if let Ok(p) = serde_json::from_value::<lsp_types::DidSaveTextDocumentParams>(params) {
                    let uri = DocumentUri::new(p.text_document.uri.clone());
                    self.dispatcher.document_saved(&uri, p.text.as_deref()).await;
                }
            }
            lsp_types::notification::DidChangeWatchedFiles::METHOD => {
                // Open Question (a): watched-files stays Freestanding;
                // unknown files are ignored rather than fatal (§7).
                trace!("watched-files notification received; no build-settings elevation configured");
            }
            other => {
                if !other.starts_with('$') {
                    trace!(method = other, "unhandled notification");
                }
            }
        }
    }

    pub fn send_notification(&self, method: &str, params: Value) {
        let note = Notification { method: method.to_string(), params };
        let _ = self.out.send(Message::Notification(note));
    }
}

/// Every request runs at normal priority today; the hook exists so a future
/// background-indexing request kind has somewhere to plug in without
/// touching the scheduling call sites.
fn priority_for(_class: &DependencyClass) -> Priority {
    Priority::Normal
}

fn priority_for_notification(method: &str) -> Priority {
    if method == lsp_types::notification::DidChangeWatchedFiles::METHOD {
        Priority::Background
    } else {
        Priority::Normal
    }
}

fn extract_cancel_id(params: &Value) -> Option<RequestId> {
    let raw = params.get("id")?;
    if let Some(n) = raw.as_i64() {
        return Some(RequestId::from(n as i32));
    }
    raw.as_str().map(|s| RequestId::from(s.to_string()))
}

/// Flattens and sorts workspace-wide results by their `name` field where
/// present, giving a deterministic order regardless of workspace iteration
/// order (§4.6 last paragraph).
fn merge_sorted_by_name(results: Vec<Value>) -> Value {
    let mut items: Vec<Value> = results
        .into_iter()
        .flat_map(|v| match v {
            Value::Array(a) => a,
            other => vec![other],
        })
        .collect();
    items.sort_by(|a, b| {
        let ka = a.get("name").and_then(Value::as_str).unwrap_or("");
        let kb = b.get("name").and_then(Value::as_str).unwrap_or("");
        ka.cmp(kb)
    });
    Value::Array(items)
}
