//! The doctor: a periodic health scan over the registry.
//!
//! A worker that stops completing polling windows while claiming to be
//! `Running` has wedged somewhere (a stuck broker connection, usually).
//! The doctor restarts those, reaps consumers that have finished dying,
//! and leaves `Disabled` ones alone so operators can still see them.

use crate::config::Settings;
use crate::registry::TriggerRegistry;
use crate::types::State;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct Doctor {
    registry: Arc<TriggerRegistry>,
    settings: Arc<Settings>,
}

impl Doctor {
    pub fn new(registry: Arc<TriggerRegistry>, settings: Arc<Settings>) -> Self {
        Doctor { registry, settings }
    }

    /// Scan forever at the configured cadence. Spawn this as its own task;
    /// it ends only when the task is dropped.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.settings.doctor_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.scan().await;
        }
    }

    /// One pass over a snapshot of the registry; tolerates concurrent
    /// create/delete traffic.
    pub async fn scan(&self) {
        for (trigger_id, handle) in self.registry.list() {
            match handle.current_state() {
                State::Dead => {
                    if self.registry.remove_if_same(&trigger_id, &handle) {
                        info!(trigger = %trigger_id, "reaped dead consumer");
                    }
                }
                State::Running => {
                    let stalled = handle
                        .seconds_since_last_poll()
                        .is_some_and(|seconds| seconds > self.settings.stall_seconds);
                    if stalled {
                        warn!(
                            trigger = %trigger_id,
                            restarts = handle.restart_count(),
                            "consumer has stopped polling, restarting it"
                        );
                        handle.restart().await;
                    }
                }
                other => {
                    debug!(trigger = %trigger_id, state = %other, "consumer left alone");
                }
            }
        }
    }
}
