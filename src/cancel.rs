//! Cancellation Registry (§4.3): tracks in-flight requests by id and by
//! owning document, and implements both explicit (`$/cancelRequest`) and
//! implicit (edit supersedes stale read) cancellation.
//!
//! Registration and implicit-cancellation iteration are serialized through a
//! dedicated Tokio task reached only via an mpsc command channel — the
//! "serial context" pattern described in SPEC_FULL.md §9, generalized from
//! the teacher's `reactive.rs` channel-driven debouncer task. Routing both
//! operations through one single-consumer channel is what guarantees a
//! notification arriving immediately after a request cannot miss cancelling
//! it: the request's registration command is always sent (and therefore
//! ordered ahead of any later command) before the next inbound message is
//! even read off the transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lsp_types::request::Request as _;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace};

use crate::ids::{DocumentId, RequestId};

/// The LSP method name exempt from implicit cancellation, so that
/// keystroke-by-keystroke completion filtering survives edits within the
/// same session (Testable Property 11).
pub const COMPLETION_METHOD: &str = lsp_types::request::Completion::METHOD;

/// A cooperative cancellation signal. Cheaply cloneable; every clone
/// observes the same cancellation.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called. A handler body awaits this
    /// at its suspension points; if it observes cancellation, it replies
    /// with [`crate::error::DispatchError::Cancelled`] instead of its normal
    /// result.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

enum Command {
    Register {
        doc: DocumentId,
        request_id: RequestId,
        method: String,
        token: CancelToken,
    },
    Unregister {
        request_id: RequestId,
    },
    ExplicitCancel {
        request_id: RequestId,
    },
    ImplicitCancelOnUpdate {
        doc: DocumentId,
    },
    QueryInProgressCount {
        doc: DocumentId,
        reply: oneshot::Sender<usize>,
    },
}

struct Entry {
    request_id: RequestId,
    method: String,
    token: CancelToken,
}

struct State {
    in_progress: HashMap<DocumentId, Vec<Entry>>,
    by_id: HashMap<RequestId, DocumentId>,
    implicit_cancellation_enabled: Arc<AtomicBool>,
}

impl State {
    fn register(&mut self, doc: DocumentId, request_id: RequestId, method: String, token: CancelToken) {
        self.by_id.insert(request_id.clone(), doc.clone());
        self.in_progress.entry(doc).or_default().push(Entry {
            request_id,
            method,
            token,
        });
    }

    fn unregister(&mut self, request_id: &RequestId) {
        let Some(doc) = self.by_id.remove(request_id) else {
            return;
        };
        if let Some(entries) = self.in_progress.get_mut(&doc) {
            entries.retain(|e| &e.request_id != request_id);
            if entries.is_empty() {
                // Testable Property 7: the document's key must not linger
                // once its last in-flight request is gone.
                self.in_progress.remove(&doc);
            }
        }
    }

    fn explicit_cancel(&self, request_id: &RequestId) {
        if let Some(doc) = self.by_id.get(request_id) {
            if let Some(entries) = self.in_progress.get(doc) {
                if let Some(entry) = entries.iter().find(|e| &e.request_id == request_id) {
                    debug!(%request_id, "explicit cancellation");
                    entry.token.cancel();
                    return;
                }
            }
        }
        trace!(%request_id, "cancelRequest for unknown or already-finished request");
    }

    fn implicit_cancel(&self, doc: &DocumentId) {
        if !self.implicit_cancellation_enabled.load(Ordering::Relaxed) {
            return;
        }
        let Some(entries) = self.in_progress.get(doc) else {
            return;
        };
        for entry in entries {
            if entry.method == COMPLETION_METHOD {
                continue;
            }
            debug!(document = %doc, request_id = %entry.request_id, "implicit cancellation on edit");
            entry.token.cancel();
        }
    }
}

/// Handle to the cancellation registry. Cheaply cloneable; every clone talks
/// to the same serial task.
#[derive(Clone)]
pub struct CancellationRegistry {
    tx: mpsc::UnboundedSender<Command>,
}

impl CancellationRegistry {
    pub fn new(implicit_cancellation_enabled: Arc<AtomicBool>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let mut state = State {
            in_progress: HashMap::new(),
            by_id: HashMap::new(),
            implicit_cancellation_enabled,
        };
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Register {
                        doc,
                        request_id,
                        method,
                        token,
                    } => state.register(doc, request_id, method, token),
                    Command::Unregister { request_id } => state.unregister(&request_id),
                    Command::ExplicitCancel { request_id } => state.explicit_cancel(&request_id),
                    Command::ImplicitCancelOnUpdate { doc } => state.implicit_cancel(&doc),
                    Command::QueryInProgressCount { doc, reply } => {
                        let count = state.in_progress.get(&doc).map_or(0, Vec::len);
                        let _ = reply.send(count);
                    }
                }
            }
        });
        Self { tx }
    }

    /// Records a newly-dispatched request and returns the token its handler
    /// body should observe at suspension points. Must be called before the
    /// handler's first `.await` so implicit cancellation from a
    /// fast-following edit cannot miss it.
    pub fn register(&self, doc: DocumentId, request_id: RequestId, method: impl Into<String>) -> CancelToken {
        let token = CancelToken::new();
        let _ = self.tx.send(Command::Register {
            doc,
            request_id,
            method: method.into(),
            token: token.clone(),
        });
        token
    }

    /// Called once a request's reply has been sent, successfully or not.
    pub fn unregister(&self, request_id: RequestId) {
        let _ = self.tx.send(Command::Unregister { request_id });
    }

    pub fn cancel_request(&self, request_id: RequestId) {
        let _ = self.tx.send(Command::ExplicitCancel { request_id });
    }

    /// Signals implicit cancellation for every non-exempt in-flight request
    /// on `doc`. Callers invoke this at the moment a `DocumentUpdate`
    /// message is classified, not when its queue slot becomes runnable —
    /// otherwise the whole point (releasing the queue's same-document
    /// dependency quickly) would be defeated.
    pub fn notify_document_update(&self, doc: DocumentId) {
        let _ = self.tx.send(Command::ImplicitCancelOnUpdate { doc });
    }

    pub async fn in_progress_count(&self, doc: DocumentId) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::QueryInProgressCount { doc, reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn doc(name: &str) -> DocumentId {
        DocumentId::from_url(Url::parse(&format!("file:///{name}")).unwrap())
    }

    fn enabled_registry() -> CancellationRegistry {
        CancellationRegistry::new(Arc::new(AtomicBool::new(true)))
    }

    #[tokio::test]
    async fn explicit_cancel_signals_the_registered_token() {
        let registry = enabled_registry();
        let d = doc("a.rs");
        let token = registry.register(d, RequestId::from(7), "textDocument/hover");
        assert!(!token.is_cancelled());

        registry.cancel_request(RequestId::from(7));
        tokio::time::timeout(std::time::Duration::from_millis(100), token.cancelled())
            .await
            .expect("token should observe cancellation");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn implicit_cancel_skips_completion_requests() {
        let registry = enabled_registry();
        let d = doc("a.rs");
        let hover_token = registry.register(d.clone(), RequestId::from(1), "textDocument/hover");
        let completion_token = registry.register(d.clone(), RequestId::from(2), COMPLETION_METHOD);

        registry.notify_document_update(d.clone());
        tokio::time::timeout(std::time::Duration::from_millis(100), hover_token.cancelled())
            .await
            .expect("hover request should be cancelled by the edit");

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!completion_token.is_cancelled(), "completion requests are exempt from implicit cancellation");
    }

    #[tokio::test]
    async fn disabled_implicit_cancellation_leaves_requests_running() {
        let registry = CancellationRegistry::new(Arc::new(AtomicBool::new(false)));
        let d = doc("a.rs");
        let token = registry.register(d.clone(), RequestId::from(1), "textDocument/hover");

        registry.notify_document_update(d);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn unregister_removes_the_document_key_once_empty() {
        let registry = enabled_registry();
        let d = doc("a.rs");
        registry.register(d.clone(), RequestId::from(1), "textDocument/hover");
        assert_eq!(registry.in_progress_count(d.clone()).await, 1);

        registry.unregister(RequestId::from(1));
        assert_eq!(registry.in_progress_count(d).await, 0);
    }
}
