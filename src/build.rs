//! The build-system boundary (§6): an opaque collaborator resolved per
//! workspace, responsible for mapping documents to build targets and
//! toolchains. The core only depends on this trait's contract, never on a
//! concrete build system.

use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;

use crate::classify::BuildSettingsKeyer;
use crate::ids::{DocumentId, DocumentUri};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target(pub String);

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Toolchain(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Language(pub String);

/// Collaborator boundary named in §6. Each workspace owns one instance.
#[async_trait]
pub trait BuildServerManager: BuildSettingsKeyer {
    async fn targets(&self, uri: &DocumentUri) -> HashSet<Target>;

    async fn canonical_target(&self, uri: &DocumentUri) -> Option<Target>;

    async fn toolchain(&self, target: &Target, language: &Language) -> Option<Toolchain>;

    async fn register_for_change_notifications(&self, uri: &DocumentUri, language: &Language);

    async fn unregister_for_change_notifications(&self, uri: &DocumentUri);

    async fn shutdown(&self);

    /// Whether this manager claims at least one build target covering the
    /// document; used by the Workspace Router's resolution algorithm
    /// (§4.4 step 3).
    async fn claims(&self, uri: &DocumentUri) -> bool {
        !self.targets(uri).await.is_empty()
    }
}

/// A build server manager that claims nothing. Backs the placeholder
/// workspace created when no workspace folder/root URI yields a real
/// manager (§4.7 Initialize), so later requests fail with a clear
/// `NoLanguageServiceForDocument`-style error rather than being silently
/// dropped.
#[derive(Debug, Default)]
pub struct NullBuildServerManager;

impl BuildSettingsKeyer for NullBuildServerManager {
    fn build_settings_key(&self, uri: &DocumentUri) -> DocumentId {
        DocumentId::identity(uri)
    }
}

#[async_trait]
impl BuildServerManager for NullBuildServerManager {
    async fn targets(&self, _uri: &DocumentUri) -> HashSet<Target> {
        HashSet::new()
    }

    async fn canonical_target(&self, _uri: &DocumentUri) -> Option<Target> {
        None
    }

    async fn toolchain(&self, _target: &Target, _language: &Language) -> Option<Toolchain> {
        None
    }

    async fn register_for_change_notifications(&self, _uri: &DocumentUri, _language: &Language) {}

    async fn unregister_for_change_notifications(&self, _uri: &DocumentUri) {}

    async fn shutdown(&self) {}

    async fn claims(&self, _uri: &DocumentUri) -> bool {
        false
    }
}

/// Detects whether `dir` looks like a project root a build system would
/// recognize, for implicit workspace discovery (§4.4 step 4). The concrete
/// detection logic (looking for a manifest file) is a minimal stand-in for
/// the real build-system detector this core treats as a collaborator; tests
/// supply their own via [`BuildSystemDetector`] implementations.
#[async_trait]
pub trait BuildSystemDetector: Send + Sync {
    /// Returns the detected build-config file path if `dir` is a project
    /// root, `None` otherwise.
    async fn detect(&self, dir: &std::path::Path) -> Option<std::path::PathBuf>;
}

/// Looks for a fixed set of manifest file names directly inside `dir`.
/// Stands in for a real multi-build-system prober.
#[derive(Debug, Clone)]
pub struct ManifestFileDetector {
    pub manifest_names: Vec<String>,
}

impl Default for ManifestFileDetector {
    fn default() -> Self {
        Self {
            manifest_names: vec!["Cargo.toml".to_string(), "project.toml".to_string()],
        }
    }
}

#[async_trait]
impl BuildSystemDetector for ManifestFileDetector {
    async fn detect(&self, dir: &std::path::Path) -> Option<std::path::PathBuf> {
        for name in &self.manifest_names {
            let candidate = dir.join(name);
            if tokio::fs::metadata(&candidate).await.is_ok() {
                return Some(candidate);
            }
        }
        None
    }
}
