//! The per-trigger consumer worker: poll, batch, fire, commit.
//!
//! A worker runs as its own tokio task, owned by a
//! [`ConsumerHandle`](crate::handle::ConsumerHandle). It observes the shared
//! [`ConsumerStatus`](crate::status::ConsumerStatus) cooperatively: the
//! handle writes the desired state, the worker checks it at the top of the
//! main loop and at every retry decision point, so shutdown is bounded by
//! one backoff sleep plus one HTTP timeout.

use crate::bus::{BusConnector, BusConsumer};
use crate::config::Settings;
use crate::database::TriggerDatabase;
use crate::error::BusError;
use crate::payload::{self, TriggerPayload};
use crate::status::ConsumerStatus;
use crate::types::{BusMessage, NextOffset, State, TriggerConfig};
use crate::webhook::{self, Webhook};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use url::Url;

/// One message staged for delivery: the raw message, its formatted payload,
/// and the payload's JSON-encoded size.
pub(crate) struct BatchEntry {
    pub message: BusMessage,
    pub payload: TriggerPayload,
    pub size: usize,
}

pub(crate) struct ConsumerWorker {
    config: TriggerConfig,
    trigger_url: Url,
    status: Arc<ConsumerStatus>,
    connector: Arc<dyn BusConnector>,
    webhook: Arc<dyn Webhook>,
    database: Arc<dyn TriggerDatabase>,
    settings: Arc<Settings>,
    consumer: Option<Box<dyn BusConsumer>>,
    /// A message that would have pushed the previous batch over the payload
    /// cap, carried into the next polling window.
    queued_message: Option<BusMessage>,
}

impl ConsumerWorker {
    pub(crate) fn new(
        config: TriggerConfig,
        trigger_url: Url,
        status: Arc<ConsumerStatus>,
        connector: Arc<dyn BusConnector>,
        webhook: Arc<dyn Webhook>,
        database: Arc<dyn TriggerDatabase>,
        settings: Arc<Settings>,
    ) -> Self {
        ConsumerWorker {
            config,
            trigger_url,
            status,
            connector,
            webhook,
            database,
            settings,
            consumer: None,
            queued_message: None,
        }
    }

    /// Run until the desired state moves away from `Running`, then clean up
    /// and record the final state. Nothing escapes this method; every
    /// failure is logged and converted into the shutdown path.
    pub(crate) async fn run(mut self) {
        let trigger = self.config.trigger_id.clone();

        if let Err(err) = self.serve().await {
            error!(trigger = %trigger, "uncaught worker error: {err}");
        }

        match self.status.desired() {
            State::Dead => {
                info!(trigger = %trigger, "permanently killing consumer, desired state is Dead")
            }
            State::Restart => {
                info!(trigger = %trigger, "letting the consumer stop quietly to allow a restart")
            }
            State::Disabled => {
                info!(trigger = %trigger, "letting the consumer stop quietly to disable the feed")
            }
            other => error!(trigger = %trigger, "consumer stopped without being asked (desired state {other})"),
        }

        if let Some(consumer) = self.consumer.take() {
            debug!(trigger = %trigger, "closing bus consumer");
            consumer.unsubscribe();
            drop(consumer);
            info!(trigger = %trigger, "cleaned up bus consumer");
        }

        let final_state = self.status.desired();
        info!(trigger = %trigger, "recording consumer as {final_state}");
        self.status.record_current(final_state);
    }

    async fn serve(&mut self) -> Result<(), BusError> {
        if self.status.should_run() && self.consumer.is_none() {
            self.consumer = Some(self.connector.connect(&self.config).await?);
        }

        while self.status.should_run() {
            let batch = self.poll_for_messages().await;
            if !batch.is_empty() {
                self.fire_trigger(batch).await;
            }
            // Keeps an empty topic from hot-spinning the loop.
            sleep(self.settings.idle_pause).await;
        }

        info!(trigger = %self.config.trigger_id, "consumer exiting main loop");
        Ok(())
    }

    /// Whether the current polling window still has wall time left. A
    /// never-polled status reads as an open window, so the first window runs
    /// until a stop event.
    fn window_open(&self) -> bool {
        self.status
            .seconds_since_last_poll()
            .map_or(true, |seconds| {
                seconds < self.settings.poll_window.as_secs_f64()
            })
    }

    /// Assemble one batch: keep pulling until the window closes, the bus
    /// goes quiet, or the next message would break the payload cap.
    async fn poll_for_messages(&mut self) -> Vec<BatchEntry> {
        let trigger = self.config.trigger_id.clone();
        let mut batch: Vec<BatchEntry> = Vec::new();
        let mut total_size = 0usize;
        let mut batching = true;

        if self.status.should_run() {
            while batching && self.window_open() {
                let polled = match self.queued_message.take() {
                    Some(message) => {
                        debug!(trigger = %trigger, "handling message left over from the last batch");
                        Ok(Some(message))
                    }
                    None => match self.consumer.as_ref() {
                        Some(consumer) => consumer.poll(self.settings.poll_deadline).await,
                        None => Ok(None),
                    },
                };

                if !self.status.has_polled() && self.status.current() == State::Initializing {
                    info!(trigger = %trigger, "completed first poll");
                    self.status.record_current(State::Running);
                }

                match polled {
                    Ok(Some(message)) => {
                        let formatted = TriggerPayload::from_message(&self.config, &message);
                        let size = formatted.encoded_size();
                        if total_size + size > self.settings.payload_limit {
                            if batch.is_empty() {
                                error!(
                                    trigger = %trigger,
                                    offset = message.offset,
                                    partition = message.partition,
                                    size,
                                    "single message exceeds the payload size limit, skipping it"
                                );
                                let offsets = payload::next_offsets(std::iter::once(&message));
                                self.commit_next_offsets(&offsets);
                            } else {
                                debug!(
                                    trigger = %trigger,
                                    offset = message.offset,
                                    "message would push the batch over the size limit, queueing it for the next round"
                                );
                                self.queued_message = Some(message);
                            }
                            batching = false;
                        } else {
                            total_size += size;
                            batch.push(BatchEntry {
                                message,
                                payload: formatted,
                                size,
                            });
                        }
                    }
                    Ok(None) => {
                        debug!(trigger = %trigger, "bus had no message, stopping batch");
                        batching = false;
                    }
                    Err(err) if err.is_partition_eof() => {
                        debug!(trigger = %trigger, "no more messages, stopping batch");
                        batching = false;
                    }
                    Err(err) => {
                        error!(trigger = %trigger, "error polling: {err}");
                        batching = false;
                    }
                }
            }
        }

        if !batch.is_empty() {
            info!(
                trigger = %trigger,
                count = batch.len(),
                bytes = total_size,
                "assembled batch"
            );
        }
        self.status.mark_polled();
        batch
    }

    /// Deliver a non-empty batch and commit its offsets on success.
    ///
    /// Retriable outcomes back off exponentially; once the attempts are
    /// spent, the offsets are committed anyway so one poisonous batch cannot
    /// wedge the trigger forever. Disabling statuses stop the trigger for
    /// good.
    async fn fire_trigger(&mut self, batch: Vec<BatchEntry>) {
        if !self.status.should_run() {
            return;
        }

        let trigger = self.config.trigger_id.clone();
        let payloads: Vec<&TriggerPayload> = batch.iter().map(|entry| &entry.payload).collect();
        let body = json!({ "messages": payloads });
        let offsets = payload::next_offsets(batch.iter().map(|entry| &entry.message));
        let bytes: usize = batch.iter().map(|entry| entry.size).sum();
        let last = &batch[batch.len() - 1].message;

        info!(trigger = %trigger, count = batch.len(), bytes, "firing trigger");

        let mut attempt: u32 = 0;
        loop {
            if !self.status.should_run() {
                // Uncommitted means redelivered; that is the at-least-once
                // contract.
                info!(trigger = %trigger, "abandoning batch, consumer was asked to stop");
                return;
            }

            match self.webhook.fire(&self.trigger_url, &body).await {
                Ok(response) if response.is_success() => {
                    match response.activation_id() {
                        Some(activation) => {
                            info!(trigger = %trigger, activation = %activation, "fired trigger")
                        }
                        None => {
                            info!(trigger = %trigger, status = %response.status, "successfully fired trigger")
                        }
                    }
                    // Only commit to the messages that actually went out;
                    // the consumer may have read past the end of this batch.
                    self.commit_next_offsets(&offsets);
                    return;
                }
                Ok(response) if response.disables_trigger() => {
                    error!(
                        trigger = %trigger,
                        status = %response.status,
                        "disabling response status from action target"
                    );
                    error!(
                        trigger = %trigger,
                        url = %webhook::display_url(&self.trigger_url),
                        status = %response.status,
                        request_body = %body,
                        response_body = %String::from_utf8_lossy(&response.body),
                        "dumping the request and response"
                    );
                    self.status.set_desired(State::Disabled);
                    if let Err(err) = self
                        .database
                        .disable_trigger(&trigger, response.status.as_u16())
                        .await
                    {
                        error!(trigger = %trigger, "failed to mark trigger disabled: {err}");
                    }
                    return;
                }
                Ok(response) => {
                    info!(trigger = %trigger, status = %response.status, "retriable response status");
                }
                Err(err) => {
                    error!(trigger = %trigger, "error talking to action target: {err}");
                }
            }

            attempt += 1;
            if attempt <= self.settings.max_retries {
                let backoff = Duration::from_secs(2u64.saturating_pow(attempt));
                info!(
                    trigger = %trigger,
                    attempt,
                    "retrying in {} second(s)",
                    backoff.as_secs()
                );
                sleep(backoff).await;
            } else {
                warn!(
                    trigger = %trigger,
                    "Skipping {} messages to offset {} of partition {}",
                    batch.len(),
                    last.offset,
                    last.partition
                );
                self.commit_next_offsets(&offsets);
                return;
            }
        }
    }

    fn commit_next_offsets(&self, offsets: &[NextOffset]) {
        let Some(consumer) = self.consumer.as_ref() else {
            return;
        };
        if let Err(err) = consumer.commit(offsets) {
            error!(trigger = %self.config.trigger_id, "failed to commit offsets: {err}");
        }
    }
}
