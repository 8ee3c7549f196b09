//! Server-wide configuration (§3A), updated by `workspace/didChangeConfiguration`
//! (a `GlobalConfigurationChange` message) and read by every other component.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::RwLock;

/// Deserialized from the `settings` payload of `workspace/didChangeConfiguration`.
/// Unknown fields are ignored rather than rejected (Testable Property 13),
/// so a forward-compatible client does not break the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub implicit_cancellation_enabled: bool,
    pub workspace_symbol_min_query_len: usize,
    pub index_task_concurrency_fraction: f32,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            implicit_cancellation_enabled: true,
            workspace_symbol_min_query_len: 3,
            index_task_concurrency_fraction: 0.5,
        }
    }
}

/// Shared, mutable server configuration. A `GlobalConfigurationChange` task
/// updates it under the same serialization guarantee as every other global
/// mutation (it runs exclusively, per Invariant 3); readers take the lock
/// for the brief duration of a read.
///
/// `implicit_cancellation_enabled` is mirrored into a plain `AtomicBool` so
/// the Cancellation Registry (which must not `.await` a `RwLock` from its
/// single-consumer task on every document update) can check it without
/// going through the async lock.
pub struct SharedSettings {
    inner: RwLock<ServerSettings>,
    implicit_cancellation_enabled: Arc<AtomicBool>,
}

impl SharedSettings {
    pub fn new(initial: ServerSettings) -> Self {
        let flag = Arc::new(AtomicBool::new(initial.implicit_cancellation_enabled));
        Self {
            inner: RwLock::new(initial),
            implicit_cancellation_enabled: flag,
        }
    }

    pub fn implicit_cancellation_flag(&self) -> Arc<AtomicBool> {
        self.implicit_cancellation_enabled.clone()
    }

    pub async fn get(&self) -> ServerSettings {
        self.inner.read().await.clone()
    }

    pub async fn update(&self, new_settings: ServerSettings) {
        self.implicit_cancellation_enabled
            .store(new_settings.implicit_cancellation_enabled, Ordering::Relaxed);
        *self.inner.write().await = new_settings;
    }
}

impl Default for SharedSettings {
    fn default() -> Self {
        Self::new(ServerSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_are_ignored_not_rejected() {
        let json = serde_json::json!({
            "implicitCancellationEnabled": false,
            "someFutureClientOnlyField": { "nested": true },
        });
        let result: Result<ServerSettings, _> = serde_json::from_value(json);
        assert!(result.is_ok());
    }

    #[test]
    fn camel_case_keys_populate_every_field() {
        let json = serde_json::json!({
            "implicitCancellationEnabled": false,
            "workspaceSymbolMinQueryLen": 5,
            "indexTaskConcurrencyFraction": 0.25,
        });
        let settings: ServerSettings = serde_json::from_value(json).unwrap();
        assert!(!settings.implicit_cancellation_enabled);
        assert_eq!(settings.workspace_symbol_min_query_len, 5);
        assert_eq!(settings.index_task_concurrency_fraction, 0.25);
    }

    #[tokio::test]
    async fn defaults_apply_when_client_sends_no_configuration() {
        let shared = SharedSettings::default();
        let settings = shared.get().await;
        assert!(settings.implicit_cancellation_enabled);
        assert_eq!(settings.workspace_symbol_min_query_len, 3);
    }

    #[tokio::test]
    async fn update_is_visible_to_subsequent_reads() {
        let shared = SharedSettings::default();
        let mut settings = shared.get().await;
        settings.implicit_cancellation_enabled = false;
        shared.update(settings).await;

        assert!(!shared.get().await.implicit_cancellation_enabled);
        assert!(!shared.implicit_cancellation_flag().load(Ordering::Relaxed));
    }
}
