//! Core identity types: document identity, request ids, and internal task ids.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use url::Url;

/// A raw document URI as received over the wire, before build-settings
/// resolution. Distinct from [`DocumentId`] so call sites cannot accidentally
/// use an un-keyed URI where scheduling identity is required.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentUri(Url);

impl DocumentUri {
    pub fn new(url: Url) -> Self {
        Self(url)
    }

    pub fn as_url(&self) -> &Url {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// The directory containing this document, if the scheme is `file`.
    pub fn parent_dir(&self) -> Option<std::path::PathBuf> {
        let path = self.0.to_file_path().ok()?;
        path.parent().map(|p| p.to_path_buf())
    }
}

impl fmt::Display for DocumentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The build-settings key that identifies a document for scheduling and
/// routing purposes. Most documents map to themselves; generated or
/// reference documents map to the primary file whose build settings govern
/// them. See `GLOSSARY: Document identity (build-settings key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(Url);

impl DocumentId {
    /// Used when no build-server manager is able to resolve a key; the
    /// document is its own key.
    pub fn identity(uri: &DocumentUri) -> Self {
        Self(uri.as_url().clone())
    }

    pub fn from_url(url: Url) -> Self {
        Self(url)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_url(&self) -> &Url {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Either an integer or a string chosen by the client; unique while the
/// request is outstanding. This is exactly `lsp_server::RequestId`'s shape,
/// so we reuse it rather than re-deriving an equivalent type: the whole
/// point of routing transport through `lsp-server` is that this id reaches
/// the Cancellation Registry unchanged from the wire.
pub type RequestId = lsp_server::RequestId;

/// An internal identifier for a task sitting in the Dependency Queue,
/// distinct from [`RequestId`] because notifications (which have no
/// `RequestId`) are scheduled too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Monotonic generator for [`TaskId`]s, one per `LspHost`.
#[derive(Debug, Default)]
pub struct TaskIdGen(AtomicU64);

impl TaskIdGen {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn next(&self) -> TaskId {
        TaskId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_monotonic_and_unique() {
        let gen = TaskIdGen::new();
        let a = gen.next();
        let b = gen.next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn identity_key_matches_the_source_uri() {
        let url = Url::parse("file:///a/foo.rs").unwrap();
        let uri = DocumentUri::new(url.clone());
        let key = DocumentId::identity(&uri);
        assert_eq!(key.as_url(), &url);
    }
}
