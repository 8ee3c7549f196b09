//! The language-service boundary (§6): each backend sub-server the core
//! fronts implements this trait. Grounded in the teacher's
//! `DiagnosticProvider` trait (one async method plus a name), generalized
//! from "validate source text" to the full init/lifecycle/request surface
//! §6 requires, since this core routes arbitrary LSP methods rather than
//! just diagnostics.

use async_trait::async_trait;
use lsp_types::{ClientCapabilities, ServerCapabilities, TextDocumentSyncKind};
use serde_json::Value;
use std::collections::HashSet;

use crate::build::Toolchain;
use crate::ids::DocumentUri;

/// Why a service declined to answer a request it was asked to handle.
#[derive(Debug, Clone)]
pub enum ServiceRequestError {
    /// The service has no handler for this method; the dispatcher should
    /// try the next service in precedence order (§4.6 step 4).
    NotImplemented,
    /// The service handled the method but failed.
    Failed(String),
}

/// One running (or starting, or shutting down) backend sub-server.
#[async_trait]
pub trait LanguageService: Send + Sync {
    /// Human-readable name, used in logs and in `InternalError` messages.
    fn name(&self) -> &str;

    /// Whether this instance can serve the given workspace/toolchain pair;
    /// used by the directory to decide whether to reuse an existing
    /// instance (§4.5 step 3).
    fn can_handle(&self, toolchain: &Toolchain) -> bool;

    /// The text-document sync kind this service declared at `initialize`
    /// time. The directory fails fast (§4.5 step 3) if this is not
    /// `Incremental`.
    fn declared_text_sync_kind(&self) -> TextDocumentSyncKind;

    /// Commands this service contributes to `workspace/executeCommand`.
    fn built_in_commands(&self) -> HashSet<String> {
        HashSet::new()
    }

    /// Documentation-only services and similar shared, cheap-to-keep
    /// services declare themselves immortal so orphan collection (§4.5)
    /// never shuts them down.
    fn is_immortal(&self) -> bool {
        false
    }

    async fn initialize(&self, client_capabilities: &ClientCapabilities) -> anyhow::Result<ServerCapabilities>;

    async fn client_initialized(&self);

    async fn open_document(&self, uri: &DocumentUri, text: &str, version: i32);

    async fn change_document(&self, uri: &DocumentUri, text: &str, version: i32);

    async fn close_document(&self, uri: &DocumentUri);

    async fn reopen_document(&self, uri: &DocumentUri, text: &str, version: i32);

    async fn will_save_document(&self, uri: &DocumentUri);

    async fn did_save_document(&self, uri: &DocumentUri, text: Option<&str>);

    /// Forwards one typed request by method name; returns the raw JSON
    /// result on success so the dispatcher can serialize it back to the
    /// client without this trait needing a type parameter per LSP request.
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, ServiceRequestError>;

    async fn shutdown(&self);

    /// Resolves when the service has crashed out-of-band; a well-behaved
    /// implementation that never crashes can return a future that never
    /// completes. The directory races this against normal operation to
    /// detect crashes (§4.5 "Crash handling").
    async fn crashed(&self);
}
