//! Document content store (§1, §6): an out-of-scope collaborator holding the
//! current text and version of every open document. This core only consults
//! it when it must synthesize a close+open against a different backend
//! instance than the one a document is currently bound to (workspace
//! re-routing on a folder change, crash recovery) — ordinary
//! `textDocument/didChange` bodies carry the text directly and never need
//! to consult this collaborator.

use async_trait::async_trait;

use crate::ids::DocumentUri;

#[async_trait]
pub trait DocumentContentStore: Send + Sync {
    /// The current text and version of `uri`, if it is still open.
    async fn current(&self, uri: &DocumentUri) -> Option<(String, i32)>;
}

/// Reports every document as closed. The default wired in `main.rs` until a
/// deployment supplies a real store; mirrors `NullBuildServerManager`/
/// `NullServiceFactory`/`NullSemanticIndexManager` as the out-of-scope
/// collaborator's no-op stand-in. Reopen synthesis becomes a no-op rather
/// than failing loudly.
#[derive(Debug, Default)]
pub struct NullDocumentContentStore;

#[async_trait]
impl DocumentContentStore for NullDocumentContentStore {
    async fn current(&self, _uri: &DocumentUri) -> Option<(String, i32)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_store_reports_every_document_closed() {
        let store = NullDocumentContentStore;
        let uri = DocumentUri::new(url::Url::parse("file:///a.rs").unwrap());
        assert!(store.current(&uri).await.is_none());
    }
}
