//! Error kinds surfaced by the dispatch core, and their JSON-RPC mapping.

use lsp_server::ResponseError;
use thiserror::Error;

use crate::ids::DocumentUri;

/// The reserved LSP cancellation code (not part of the base JSON-RPC spec).
pub const CODE_REQUEST_CANCELLED: i32 = -32800;
pub const CODE_METHOD_NOT_FOUND: i32 = -32601;
pub const CODE_INVALID_PARAMS: i32 = -32602;
pub const CODE_INTERNAL_ERROR: i32 = -32603;
pub const CODE_WORKSPACE_NOT_OPEN: i32 = -32001;
pub const CODE_NO_LANGUAGE_SERVICE: i32 = -32002;
pub const CODE_METHOD_NOT_IMPLEMENTED: i32 = -32003;
pub const CODE_TIMEOUT: i32 = -32004;

/// Errors surfaced by the scheduling and routing core.
///
/// Every variant maps to exactly one JSON-RPC error code via [`DispatchError::code`];
/// see Testable Property 14.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("no workspace claims document '{0}'")]
    WorkspaceNotOpen(String),

    #[error("no language service available for document '{0}'")]
    NoLanguageServiceForDocument(String),

    #[error("no language service implements method '{0}'")]
    NoLanguageServiceImplementsMethod(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl DispatchError {
    pub fn workspace_not_open(uri: &DocumentUri) -> Self {
        Self::WorkspaceNotOpen(uri.as_str().to_string())
    }

    /// The fixed JSON-RPC error code for this variant. One variant, one code;
    /// distinct variants never share a code except under the `InternalError`
    /// server-error range (-32000..-32099), which `Timeout` and
    /// `InternalError` both fall into since the client only needs to
    /// distinguish them by message, not by code family.
    pub fn code(&self) -> i32 {
        match self {
            DispatchError::MethodNotFound(_) => CODE_METHOD_NOT_FOUND,
            DispatchError::WorkspaceNotOpen(_) => CODE_WORKSPACE_NOT_OPEN,
            DispatchError::NoLanguageServiceForDocument(_) => CODE_NO_LANGUAGE_SERVICE,
            DispatchError::NoLanguageServiceImplementsMethod(_) => CODE_METHOD_NOT_IMPLEMENTED,
            DispatchError::Cancelled => CODE_REQUEST_CANCELLED,
            DispatchError::Timeout(_) => CODE_TIMEOUT,
            DispatchError::InternalError(_) => CODE_INTERNAL_ERROR,
        }
    }
}

impl From<DispatchError> for ResponseError {
    fn from(err: DispatchError) -> Self {
        ResponseError {
            code: err.code(),
            message: err.to_string(),
            data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_have_distinct_codes_outside_shared_internal_range() {
        let variants = [
            DispatchError::MethodNotFound("foo".into()),
            DispatchError::WorkspaceNotOpen("file:///a".into()),
            DispatchError::NoLanguageServiceForDocument("file:///a".into()),
            DispatchError::NoLanguageServiceImplementsMethod("foo".into()),
            DispatchError::Cancelled,
        ];
        let mut codes: Vec<i32> = variants.iter().map(DispatchError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), variants.len());
    }

    #[test]
    fn timeout_and_internal_error_share_the_server_error_range() {
        let timeout = DispatchError::Timeout("shutdown".into());
        let internal = DispatchError::InternalError("non-incremental sync".into());
        assert!((-32099..=-32000).contains(&timeout.code()));
        assert!((-32099..=-32000).contains(&internal.code()));
    }

    #[test]
    fn cancelled_maps_to_reserved_lsp_code() {
        assert_eq!(DispatchError::Cancelled.code(), CODE_REQUEST_CANCELLED);
    }

    #[test]
    fn converts_into_response_error() {
        let resp: ResponseError = DispatchError::MethodNotFound("foo/bar".into()).into();
        assert_eq!(resp.code, CODE_METHOD_NOT_FOUND);
    }
}
