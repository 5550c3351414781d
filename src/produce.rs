//! One-shot produce action: validate parameters, acquire a cached producer,
//! send a single message.

use crate::config::Settings;
use crate::error::ProduceError;
use crate::producer_cache::{connection_key, KafkaMessageProducer, ProducerCache};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Deadline for the partition-discovery probe, matching the timeouts the
/// producer itself connects with.
const METADATA_TIMEOUT: Duration = Duration::from_secs(15);

/// Validated produce parameters.
#[derive(Debug)]
struct ProduceRequest {
    brokers: Vec<String>,
    topic: String,
    value: Vec<u8>,
    key: Option<Vec<u8>>,
    username: String,
    password: String,
    /// The SASL broker list is a distinct parameter from `brokers`; it is
    /// what the connection cache keys on.
    sasl_brokers: Vec<String>,
}

/// The produce action. Owns the process-wide producer cache; keep one
/// instance alive for the life of the process so connections are reused
/// across invocations.
pub struct ProduceAction {
    cache: ProducerCache<KafkaMessageProducer>,
    settings: Settings,
}

impl ProduceAction {
    pub fn new(settings: Settings) -> Self {
        let cache = ProducerCache::new(settings.max_cached_producers, settings.eviction_timeout);
        ProduceAction { cache, settings }
    }

    /// Run one produce invocation; the returned JSON is the action result.
    pub async fn run(&self, params: Value) -> Value {
        match self.produce(&params).await {
            Ok((topic, partition, offset)) => success_result(&topic, partition, offset),
            Err(err) => {
                warn!("produce failed: {err}");
                error_result(&err)
            }
        }
    }

    async fn produce(&self, params: &Value) -> Result<(String, i32, i64), ProduceError> {
        let request = validate(params)?;
        let cache_key = connection_key(&request.sasl_brokers, &request.username, &request.password);

        let producer = acquire_with_retry(self.settings.produce_attempts, |attempt| {
            if attempt > 1 {
                info!(attempt, "retrying producer acquisition");
            }
            let producer = self.cache.get(&cache_key, || {
                KafkaMessageProducer::connect(
                    &request.brokers,
                    credential(&request.username),
                    credential(&request.password),
                )
            })?;

            match producer.partition_count(&request.topic, METADATA_TIMEOUT) {
                Ok(partitions) => {
                    debug!(topic = %request.topic, partitions, "discovered topic partitions");
                    Ok(producer)
                }
                Err(err) => {
                    // A cached producer that cannot see the topic is stale;
                    // reconnect on the next attempt.
                    self.cache.remove(&cache_key);
                    Err(err)
                }
            }
        })?;

        let (partition, offset) = producer
            .send(
                &request.topic,
                &request.value,
                request.key.as_deref(),
                self.settings.delivery_timeout,
            )
            .await?;

        info!(
            topic = %request.topic,
            partition,
            offset,
            "sent message"
        );
        Ok((request.topic, partition, offset))
    }
}

fn credential(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Run `step` up to `attempts` times, returning the first success.
fn acquire_with_retry<P, E>(
    attempts: u32,
    mut step: impl FnMut(u32) -> Result<P, E>,
) -> Result<P, E> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match step(attempt) {
            Ok(found) => return Ok(found),
            Err(err) if attempt >= attempts => return Err(err),
            Err(_) => {}
        }
    }
}

fn validate(params: &Value) -> Result<ProduceRequest, ProduceError> {
    let required = ["brokers", "topic", "value"];
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|name| params.get(name).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(ProduceError::MissingParameters(missing.join(", ")));
    }

    let mut brokers = string_list(&params["brokers"]);
    // Callers hand the same broker set to every invocation; shuffling
    // spreads the bootstrap load across them.
    brokers.shuffle(&mut rand::thread_rng());

    let topic = params["topic"].as_str().unwrap_or_default().to_string();

    let mut value = params["value"].as_str().unwrap_or_default().as_bytes().to_vec();
    if flag(params, "base64DecodeValue") {
        value = decode_base64_param(&value, "value")?;
    }

    let mut key = params
        .get("key")
        .and_then(Value::as_str)
        .map(|key| key.as_bytes().to_vec());
    if flag(params, "base64DecodeKey") {
        if let Some(encoded) = key {
            key = Some(decode_base64_param(&encoded, "key")?);
        }
    }

    let username = params
        .get("user")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let password = params
        .get("password")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    // Cache keys come from the SASL list; fall back to the connect list so
    // callers without one still land on a stable key.
    let sasl_brokers = match params.get("kafka_brokers_sasl") {
        Some(list) => string_list(list),
        None => brokers.clone(),
    };

    Ok(ProduceRequest {
        brokers,
        topic,
        value,
        key,
        username,
        password,
        sasl_brokers,
    })
}

fn flag(params: &Value, name: &str) -> bool {
    params.get(name).and_then(Value::as_bool) == Some(true)
}

/// Accepts a JSON list of strings or a single comma-separated string.
fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::String(joined) => joined
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn decode_base64_param(encoded: &[u8], param: &'static str) -> Result<Vec<u8>, ProduceError> {
    let text = std::str::from_utf8(encoded).map_err(|_| ProduceError::NotBase64 { param })?;
    let decoded = B64
        .decode(text.trim())
        .map_err(|_| ProduceError::NotBase64 { param })?;
    let trimmed = decoded.trim_ascii();
    if trimmed.is_empty() {
        return Err(ProduceError::NotBase64 { param });
    }
    Ok(trimmed.to_vec())
}

fn success_result(topic: &str, partition: i32, offset: i64) -> Value {
    json!({
        "success": true,
        "message": format!("Successfully sent message to {topic}:{partition} at offset {offset}"),
    })
}

fn error_result(err: &ProduceError) -> Value {
    json!({ "error": err.to_string() })
}
