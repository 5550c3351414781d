//! Owner-side facade over a consumer worker.
//!
//! The handle owns the worker task and the shared status record. It never
//! kills the task outright: it writes the desired state and waits for the
//! worker to drain, falling back to an abort only when the bounded join
//! runs out.

use crate::bus::BusConnector;
use crate::config::Settings;
use crate::database::TriggerDatabase;
use crate::error::WebhookError;
use crate::status::ConsumerStatus;
use crate::types::{State, TriggerConfig};
use crate::webhook::{self, Webhook};
use crate::worker::ConsumerWorker;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};
use url::Url;

pub struct ConsumerHandle {
    config: TriggerConfig,
    trigger_url: Url,
    connector: Arc<dyn BusConnector>,
    webhook: Arc<dyn Webhook>,
    database: Arc<dyn TriggerDatabase>,
    settings: Arc<Settings>,
    /// Replaced wholesale on restart so the fresh worker starts from a
    /// clean record.
    status: Mutex<Arc<ConsumerStatus>>,
    task: Mutex<Option<JoinHandle<()>>>,
    restart_count: AtomicU32,
}

impl std::fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("config", &self.config)
            .field("trigger_url", &self.trigger_url)
            .field("restart_count", &self.restart_count)
            .finish()
    }
}

impl ConsumerHandle {
    pub fn new(
        config: TriggerConfig,
        connector: Arc<dyn BusConnector>,
        webhook: Arc<dyn Webhook>,
        database: Arc<dyn TriggerDatabase>,
        settings: Arc<Settings>,
    ) -> Result<Self, WebhookError> {
        let trigger_url = webhook::effective_url(&config.webhook_url, settings.api_host.as_deref())?;
        if settings.api_host.is_some() {
            info!(
                trigger = %config.trigger_id,
                "API_HOST is set, overriding the host stored with the trigger"
            );
        }

        let status = Arc::new(Self::fresh_status(&config));
        Ok(ConsumerHandle {
            config,
            trigger_url,
            connector,
            webhook,
            database,
            settings,
            status: Mutex::new(status),
            task: Mutex::new(None),
            restart_count: AtomicU32::new(0),
        })
    }

    fn fresh_status(config: &TriggerConfig) -> ConsumerStatus {
        if config.active {
            ConsumerStatus::new(&config.trigger_id, State::Initializing, State::Running)
        } else {
            // The worker still spawns, observes the Disabled intent, and
            // exits through its cleanup path without connecting.
            ConsumerStatus::new(&config.trigger_id, State::Disabled, State::Disabled)
        }
    }

    fn spawn_worker(&self) -> JoinHandle<()> {
        let worker = ConsumerWorker::new(
            self.config.clone(),
            self.trigger_url.clone(),
            self.status.lock().clone(),
            self.connector.clone(),
            self.webhook.clone(),
            self.database.clone(),
            self.settings.clone(),
        );
        tokio::spawn(worker.run())
    }

    /// Spawn the worker task. Idempotent; a live worker is never doubled.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            warn!(trigger = %self.config.trigger_id, "consumer already started");
            return;
        }
        *task = Some(self.spawn_worker());
    }

    pub fn trigger_id(&self) -> &str {
        &self.config.trigger_id
    }

    pub fn current_state(&self) -> State {
        self.status.lock().current()
    }

    pub fn desired_state(&self) -> State {
        self.status.lock().desired()
    }

    pub fn last_poll(&self) -> Option<Instant> {
        self.status.lock().last_poll()
    }

    pub fn seconds_since_last_poll(&self) -> Option<f64> {
        self.status.lock().seconds_since_last_poll()
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::Relaxed)
    }

    /// Ask the worker to drain and die. A `Disabled` consumer has no worker
    /// left, so its state flips straight to `Dead`.
    pub fn shutdown(&self) {
        let status = self.status.lock().clone();
        if status.current() == State::Disabled {
            status.record_current(State::Dead);
            status.set_desired(State::Dead);
        } else {
            status.record_current(State::Stopping);
            status.set_desired(State::Dead);
        }
    }

    /// Ask the worker to disable the trigger (it drains and exits as
    /// `Disabled`, staying visible in the registry).
    pub fn disable(&self) {
        self.status.lock().set_desired(State::Disabled);
    }

    /// Bounded wait for the worker task; aborts the task on overrun so a
    /// wedged consumer cannot hold its owner hostage.
    pub async fn join(&self) {
        let task = self.task.lock().take();
        let Some(task) = task else { return };

        let abort = task.abort_handle();
        match tokio::time::timeout(self.settings.join_timeout, task).await {
            Ok(_) => {}
            Err(_) => {
                warn!(
                    trigger = %self.config.trigger_id,
                    "worker did not stop within the join timeout, aborting it"
                );
                abort.abort();
            }
        }
    }

    /// Quietly bounce the worker; only the doctor calls this.
    ///
    /// The old worker is joined before a new one is spawned, so there is
    /// never more than one live worker per trigger.
    pub async fn restart(&self) {
        if self.desired_state() == State::Dead {
            info!(
                trigger = %self.config.trigger_id,
                "request to restart a consumer that is already slated for deletion"
            );
            return;
        }

        self.restart_count.fetch_add(1, Ordering::Relaxed);

        info!(trigger = %self.config.trigger_id, "quietly shutting down consumer for restart");
        self.status.lock().set_desired(State::Restart);
        self.join().await;
        info!(trigger = %self.config.trigger_id, "consumer has shut down");

        // The user may have interleaved a delete request during the join.
        if self.desired_state() != State::Dead {
            info!(trigger = %self.config.trigger_id, "starting new consumer task");
            *self.status.lock() = Arc::new(Self::fresh_status(&self.config));
            *self.task.lock() = Some(self.spawn_worker());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        message, trigger_config, MockBus, MockConnector, MockWebhook, PollScript, RecordingDatabase,
    };
    use std::time::Duration;

    struct Rig {
        handle: ConsumerHandle,
        connector: Arc<MockConnector>,
    }

    fn rig_with(config: TriggerConfig, connector: MockConnector, webhook: MockWebhook) -> Rig {
        let connector = Arc::new(connector);
        let handle = ConsumerHandle::new(
            config,
            connector.clone(),
            Arc::new(webhook),
            Arc::new(RecordingDatabase::default()),
            Arc::new(Settings::default()),
        )
        .unwrap();
        Rig { handle, connector }
    }

    async fn wait_for(handle: &ConsumerHandle, state: State) {
        while handle.current_state() != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_worker_to_dead() {
        let rig = rig_with(
            trigger_config("/ns/t"),
            MockConnector::with_buses(vec![MockBus::scripted(vec![PollScript::Message(
                message("T", 0, 1, "a"),
            )])]),
            MockWebhook::always(204),
        );

        rig.handle.start();
        wait_for(&rig.handle, State::Running).await;

        rig.handle.shutdown();
        assert_eq!(rig.handle.desired_state(), State::Dead);
        rig.handle.join().await;
        assert_eq!(rig.handle.current_state(), State::Dead);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_joins_old_worker_then_spawns_new() {
        let rig = rig_with(
            trigger_config("/ns/t"),
            MockConnector::with_buses(vec![MockBus::default(), MockBus::default()]),
            MockWebhook::always(204),
        );

        rig.handle.start();
        wait_for(&rig.handle, State::Running).await;
        assert_eq!(rig.connector.connect_count(), 1);

        rig.handle.restart().await;
        assert_eq!(rig.handle.restart_count(), 1);

        wait_for(&rig.handle, State::Running).await;
        assert_eq!(rig.connector.connect_count(), 2);
        // The fresh worker starts from a clean record.
        assert_eq!(rig.handle.desired_state(), State::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_shutdown_is_a_noop() {
        let rig = rig_with(
            trigger_config("/ns/t"),
            MockConnector::with_buses(vec![MockBus::default()]),
            MockWebhook::always(204),
        );

        rig.handle.start();
        wait_for(&rig.handle, State::Running).await;
        rig.handle.shutdown();
        rig.handle.join().await;

        rig.handle.restart().await;
        assert_eq!(rig.handle.restart_count(), 0);
        assert_eq!(rig.connector.connect_count(), 1);
        assert_eq!(rig.handle.current_state(), State::Dead);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_consumer_shuts_down_to_dead_immediately() {
        let rig = rig_with(
            trigger_config("/ns/t"),
            MockConnector::with_buses(vec![MockBus::scripted(vec![PollScript::Message(
                message("T", 0, 1, "a"),
            )])]),
            MockWebhook::always(403),
        );

        rig.handle.start();
        wait_for(&rig.handle, State::Disabled).await;

        rig.handle.shutdown();
        assert_eq!(rig.handle.current_state(), State::Dead);
        rig.handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_trigger_never_connects() {
        let mut config = trigger_config("/ns/t");
        config.active = false;

        let rig = rig_with(config, MockConnector::default(), MockWebhook::always(204));
        rig.handle.start();
        rig.handle.join().await;

        assert_eq!(rig.handle.current_state(), State::Disabled);
        assert_eq!(rig.connector.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_spawns_once() {
        let rig = rig_with(
            trigger_config("/ns/t"),
            MockConnector::default(),
            MockWebhook::always(204),
        );

        rig.handle.start();
        rig.handle.start();
        wait_for(&rig.handle, State::Running).await;
        assert_eq!(rig.connector.connect_count(), 1);

        rig.handle.shutdown();
        rig.handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_api_host_override_rewrites_trigger_url() {
        let mut settings = Settings::default();
        settings.api_host = Some("edge.example.org".to_string());

        let handle = ConsumerHandle::new(
            trigger_config("/ns/t"),
            Arc::new(MockConnector::default()),
            Arc::new(MockWebhook::always(204)),
            Arc::new(RecordingDatabase::default()),
            Arc::new(settings),
        )
        .unwrap();

        assert_eq!(handle.trigger_url.host_str(), Some("edge.example.org"));
        assert_eq!(handle.trigger_url.username(), "user");
    }
}
