//! The semantic-index boundary referenced by §1 ("the semantic index that
//! answers symbol queries") and used by the Request Dispatcher's "poke
//! preparation on interaction" step (§4.6 step 1). Out of scope beyond this
//! contract: the index's own query logic is not part of this core.

use async_trait::async_trait;

use crate::ids::DocumentUri;

#[async_trait]
pub trait SemanticIndexManager: Send + Sync {
    /// The owning workspace should schedule target preparation for `uri`.
    async fn did_change_active_document(&self, uri: &DocumentUri);

    /// A non-owning workspace should mark any pending preparation for `uri`
    /// as irrelevant, since the interaction moved elsewhere.
    async fn mark_preparation_irrelevant(&self, uri: &DocumentUri);
}

/// Used by workspaces that were not supplied a real semantic index (e.g.
/// the placeholder workspace, or tests not exercising this path).
#[derive(Debug, Default)]
pub struct NullSemanticIndexManager;

#[async_trait]
impl SemanticIndexManager for NullSemanticIndexManager {
    async fn did_change_active_document(&self, _uri: &DocumentUri) {}
    async fn mark_preparation_irrelevant(&self, _uri: &DocumentUri) {}
}

/// Maps a document to the language identifier the Language-Service
/// Directory registry is keyed by. A real implementation inspects the
/// client-declared language id or the file extension; this core only
/// depends on the trait.
pub trait LanguageDetector: Send + Sync {
    fn detect(&self, uri: &DocumentUri) -> String;
}

/// Falls back to a fixed language for every document. Useful for single-language
/// deployments and as the default wired in `main.rs`.
pub struct FixedLanguageDetector(pub String);

impl LanguageDetector for FixedLanguageDetector {
    fn detect(&self, _uri: &DocumentUri) -> String {
        self.0.clone()
    }
}
