//! Trigger-id → consumer-handle registry.

use crate::bus::BusConnector;
use crate::config::Settings;
use crate::database::TriggerDatabase;
use crate::error::WebhookError;
use crate::handle::ConsumerHandle;
use crate::types::TriggerConfig;
use crate::webhook::Webhook;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("trigger {trigger_id} already exists")]
    AlreadyExists { trigger_id: String },

    #[error("invalid trigger configuration: {0}")]
    InvalidConfig(#[from] WebhookError),
}

/// Owns every consumer handle in the process. All methods take `&self`; the
/// doctor and the admin surface mutate it concurrently.
pub struct TriggerRegistry {
    connector: Arc<dyn BusConnector>,
    webhook: Arc<dyn Webhook>,
    database: Arc<dyn TriggerDatabase>,
    settings: Arc<Settings>,
    handles: RwLock<HashMap<String, Arc<ConsumerHandle>>>,
}

impl TriggerRegistry {
    pub fn new(
        connector: Arc<dyn BusConnector>,
        webhook: Arc<dyn Webhook>,
        database: Arc<dyn TriggerDatabase>,
        settings: Arc<Settings>,
    ) -> Self {
        TriggerRegistry {
            connector,
            webhook,
            database,
            settings,
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Create and start a consumer for `config`. Fails if the trigger id is
    /// already registered.
    pub fn create(&self, config: TriggerConfig) -> Result<Arc<ConsumerHandle>, RegistryError> {
        let trigger_id = config.trigger_id.clone();

        let handle = Arc::new(ConsumerHandle::new(
            config,
            self.connector.clone(),
            self.webhook.clone(),
            self.database.clone(),
            self.settings.clone(),
        )?);

        {
            let mut handles = self.handles.write();
            if handles.contains_key(&trigger_id) {
                return Err(RegistryError::AlreadyExists { trigger_id });
            }
            handles.insert(trigger_id.clone(), handle.clone());
        }

        info!(trigger = %trigger_id, "created consumer");
        handle.start();
        Ok(handle)
    }

    /// Shut the consumer down, wait for it to drain, and forget it.
    pub async fn delete(&self, trigger_id: &str) -> Option<Arc<ConsumerHandle>> {
        let handle = self.handles.write().remove(trigger_id)?;
        handle.shutdown();
        handle.join().await;
        info!(trigger = %trigger_id, "deleted consumer");
        Some(handle)
    }

    pub fn get(&self, trigger_id: &str) -> Option<Arc<ConsumerHandle>> {
        self.handles.read().get(trigger_id).cloned()
    }

    /// Snapshot of every registered handle; safe to iterate while the
    /// registry keeps changing underneath.
    pub fn list(&self) -> Vec<(String, Arc<ConsumerHandle>)> {
        self.handles
            .read()
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }

    /// Remove `trigger_id` only while it still maps to `handle`; keeps a
    /// reap based on a stale snapshot from deleting a replacement consumer.
    pub(crate) fn remove_if_same(&self, trigger_id: &str, handle: &Arc<ConsumerHandle>) -> bool {
        let mut handles = self.handles.write();
        if handles
            .get(trigger_id)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            handles.remove(trigger_id);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{trigger_config, MockConnector, MockWebhook, RecordingDatabase};
    use crate::types::State;
    use std::time::Duration;

    fn registry() -> TriggerRegistry {
        TriggerRegistry::new(
            Arc::new(MockConnector::default()),
            Arc::new(MockWebhook::always(204)),
            Arc::new(RecordingDatabase::default()),
            Arc::new(Settings::default()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_rejects_duplicate_ids() {
        let registry = registry();
        registry.create(trigger_config("/ns/t")).unwrap();

        let err = registry.create(trigger_config("/ns/t")).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists { .. }));
        assert_eq!(registry.len(), 1);

        registry.delete("/ns/t").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_rejects_bad_webhook_url() {
        let registry = registry();
        let mut config = trigger_config("/ns/t");
        config.webhook_url = "not a url".to_string();

        let err = registry.create(config).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidConfig(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_drains_and_removes() {
        let registry = registry();
        let handle = registry.create(trigger_config("/ns/t")).unwrap();

        while handle.current_state() != State::Running {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let deleted = registry.delete("/ns/t").await.unwrap();
        assert_eq!(deleted.current_state(), State::Dead);
        assert!(registry.get("/ns/t").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_unknown_is_none() {
        let registry = registry();
        assert!(registry.delete("/ns/missing").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_if_same_spares_replacements() {
        let registry = registry();
        let old = registry.create(trigger_config("/ns/t")).unwrap();

        registry.delete("/ns/t").await;
        let replacement = registry.create(trigger_config("/ns/t")).unwrap();

        assert!(!registry.remove_if_same("/ns/t", &old));
        assert!(registry.get("/ns/t").is_some());

        assert!(registry.remove_if_same("/ns/t", &replacement));
        assert!(registry.is_empty());
        replacement.shutdown();
        replacement.join().await;
    }
}
