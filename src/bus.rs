//! Messaging-bus adapter: the interface the worker consumes, and its
//! rdkafka binding.

use crate::error::BusError;
use crate::types::{BusMessage, NextOffset, TriggerConfig};
use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::{Message, Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{error, info};

/// A connected, subscribed consumer bound to one trigger's topic.
///
/// Dropping the consumer closes the underlying connection, so the worker's
/// scoped ownership is the release guarantee.
#[async_trait]
pub trait BusConsumer: Send + Sync {
    /// Pull at most one message, waiting up to `deadline`.
    ///
    /// `Ok(None)` means the bus had nothing to say within the deadline;
    /// end-of-partition surfaces as [`BusError::PartitionEof`].
    async fn poll(&self, deadline: Duration) -> Result<Option<BusMessage>, BusError>;

    /// Synchronously store consumer-group bookmarks.
    fn commit(&self, offsets: &[NextOffset]) -> Result<(), BusError>;

    fn unsubscribe(&self);
}

/// Builds consumers. Every worker (re)start needs a fresh one, so the
/// handle keeps a connector instead of a consumer.
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self, config: &TriggerConfig) -> Result<Box<dyn BusConsumer>, BusError>;
}

/// Logs partition assignment changes for the trigger the consumer serves.
struct RebalanceLogger {
    trigger: String,
}

impl ClientContext for RebalanceLogger {}

impl ConsumerContext for RebalanceLogger {
    fn post_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(_) => info!(
                trigger = %self.trigger,
                "completed partition assignment, connected to brokers"
            ),
            Rebalance::Revoke(_) => info!(
                trigger = %self.trigger,
                "partition assignment revoked, disconnected from brokers"
            ),
            Rebalance::Error(err) => error!(trigger = %self.trigger, "rebalance error: {err}"),
        }
    }
}

fn consumer_config(config: &TriggerConfig) -> ClientConfig {
    let mut kafka = ClientConfig::new();
    kafka
        .set("bootstrap.servers", config.brokers.join(","))
        // Each trigger owns an isolated offset set.
        .set("group.id", &config.trigger_id)
        // New triggers skip the historical backlog.
        .set("auto.offset.reset", "latest")
        // Commits are manual, after a successful webhook POST.
        .set("enable.auto.commit", "false")
        // End-of-partition is the batch loop's clean stop signal.
        .set("enable.partition.eof", "true")
        .set("api.version.request", "true");

    if config.is_secure_bus {
        kafka
            .set("security.protocol", "sasl_ssl")
            .set("sasl.mechanisms", "PLAIN")
            .set("sasl.username", config.username.as_deref().unwrap_or_default())
            .set("sasl.password", config.password.as_deref().unwrap_or_default())
            .set("ssl.ca.location", "/etc/ssl/certs/");
    }

    kafka
}

/// rdkafka-backed [`BusConsumer`].
pub struct KafkaBusConsumer {
    inner: StreamConsumer<RebalanceLogger>,
}

#[async_trait]
impl BusConsumer for KafkaBusConsumer {
    async fn poll(&self, deadline: Duration) -> Result<Option<BusMessage>, BusError> {
        match tokio::time::timeout(deadline, self.inner.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(message)) => Ok(Some(BusMessage {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(Bytes::copy_from_slice),
                value: message.payload().map(Bytes::copy_from_slice),
            })),
            Ok(Err(err)) => Err(BusError::from(err)),
        }
    }

    fn commit(&self, offsets: &[NextOffset]) -> Result<(), BusError> {
        let mut list = TopicPartitionList::new();
        for bookmark in offsets {
            list.add_partition_offset(
                &bookmark.topic,
                bookmark.partition,
                Offset::Offset(bookmark.offset),
            )
            .map_err(|err| BusError::Commit {
                message: err.to_string(),
            })?;
        }
        self.inner
            .commit(&list, CommitMode::Sync)
            .map_err(|err| BusError::Commit {
                message: err.to_string(),
            })
    }

    fn unsubscribe(&self) {
        self.inner.unsubscribe();
    }
}

/// Connects rdkafka stream consumers for trigger workers.
#[derive(Clone, Copy, Debug, Default)]
pub struct KafkaConnector;

#[async_trait]
impl BusConnector for KafkaConnector {
    async fn connect(&self, config: &TriggerConfig) -> Result<Box<dyn BusConsumer>, BusError> {
        let consumer: StreamConsumer<RebalanceLogger> = consumer_config(config)
            .create_with_context(RebalanceLogger {
                trigger: config.trigger_id.clone(),
            })
            .map_err(|err| BusError::Connect {
                message: err.to_string(),
            })?;

        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|err| BusError::Connect {
                message: err.to_string(),
            })?;

        info!(
            trigger = %config.trigger_id,
            topic = %config.topic,
            "now listening in order to fire trigger"
        );
        Ok(Box::new(KafkaBusConsumer { inner: consumer }))
    }
}
