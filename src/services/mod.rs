pub mod directory;
pub mod traits;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

pub use traits::{LanguageService, ServiceRequestError};

use crate::build::Toolchain;

/// A small, statically registered category of backend language service
/// (§3A). Not an open string: the set of kinds a host can start is fixed at
/// compile time, mirroring "classification uses a static table built at
/// registration" (§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// The primary service for the document's own language.
    PrimaryToolchain,
    /// A delegating native server for an embedded C-family region.
    CFamilyShim,
    /// A shared, cheap documentation-only service.
    Documentation,
}

impl ServiceKind {
    pub fn is_immortal(self) -> bool {
        matches!(self, ServiceKind::Documentation)
    }
}

/// Maps a language identifier to the service kinds registered for it, in
/// declared precedence order. Built once at `LspHost::new` time.
#[derive(Debug, Clone)]
pub struct ServiceKindRegistry {
    entries: Vec<(String, Vec<ServiceKind>)>,
}

impl ServiceKindRegistry {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn register(&mut self, language: impl Into<String>, kinds: Vec<ServiceKind>) -> &mut Self {
        self.entries.push((language.into(), kinds));
        self
    }

    pub fn kinds_for(&self, language: &str) -> &[ServiceKind] {
        self.entries
            .iter()
            .find(|(lang, _)| lang == language)
            .map(|(_, kinds)| kinds.as_slice())
            .unwrap_or(&[])
    }
}

impl Default for ServiceKindRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry
            .register("primary", vec![ServiceKind::PrimaryToolchain, ServiceKind::Documentation])
            .register("c-family", vec![ServiceKind::CFamilyShim]);
        registry
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    Starting = 0,
    Initialized = 1,
    Running = 2,
    ShuttingDown = 3,
    Terminated = 4,
    Crashed = 5,
}

impl ServiceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ServiceState::Starting,
            1 => ServiceState::Initialized,
            2 => ServiceState::Running,
            3 => ServiceState::ShuttingDown,
            4 => ServiceState::Terminated,
            _ => ServiceState::Crashed,
        }
    }
}

/// A handle to one running backend service, identified by its kind, bound
/// workspace (by root URI, kept as an opaque string here to avoid a
/// dependency cycle with `crate::workspace`), and toolchain.
pub struct LanguageServiceRef {
    pub kind: ServiceKind,
    pub toolchain: Toolchain,
    pub workspace_root: Option<String>,
    state: Arc<AtomicU8>,
    service: Arc<dyn LanguageService>,
}

impl LanguageServiceRef {
    pub fn new(
        kind: ServiceKind,
        toolchain: Toolchain,
        workspace_root: Option<String>,
        service: Arc<dyn LanguageService>,
    ) -> Self {
        Self {
            kind,
            toolchain,
            workspace_root,
            state: Arc::new(AtomicU8::new(ServiceState::Starting as u8)),
            service,
        }
    }

    pub fn service(&self) -> &Arc<dyn LanguageService> {
        &self.service
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: ServiceState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn can_handle(&self, toolchain: &Toolchain) -> bool {
        self.state() == ServiceState::Running && self.service.can_handle(toolchain)
    }
}

impl Clone for LanguageServiceRef {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            toolchain: self.toolchain.clone(),
            workspace_root: self.workspace_root.clone(),
            state: self.state.clone(),
            service: self.service.clone(),
        }
    }
}
