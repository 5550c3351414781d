//! Bounded cache of reusable producers keyed by connection credentials.
//!
//! Producers are expensive to stand up (broker handshake plus version
//! probing), so the one-shot produce path keeps a small pool of them alive
//! across invocations.

use crate::error::ProduceError;
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// A cached connection that can be flushed and released with a deadline.
pub trait CacheableProducer: Clone {
    /// Best effort: waits at most `deadline` for in-flight sends.
    fn close(&self, deadline: Duration);
}

/// Capacity-bounded producer map with arbitrary eviction.
pub struct ProducerCache<P: CacheableProducer> {
    capacity: usize,
    close_deadline: Duration,
    entries: Mutex<HashMap<String, P>>,
}

impl<P: CacheableProducer> ProducerCache<P> {
    pub fn new(capacity: usize, close_deadline: Duration) -> Self {
        ProducerCache {
            capacity,
            close_deadline,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Fetch the producer for `key`, connecting on a miss.
    ///
    /// At capacity, one arbitrary entry is evicted and closed before the new
    /// connection is inserted, so the cache never exceeds its bound.
    pub fn get<E>(&self, key: &str, connect: impl FnOnce() -> Result<P, E>) -> Result<P, E> {
        if let Some(hit) = self.entries.lock().get(key) {
            debug!("reusing cached producer");
            return Ok(hit.clone());
        }

        let producer = connect()?;

        let evicted = {
            let mut entries = self.entries.lock();
            let mut evicted = None;
            if entries.len() >= self.capacity && !entries.contains_key(key) {
                if let Some(victim) = entries.keys().next().cloned() {
                    evicted = entries.remove(&victim);
                }
            }
            entries.insert(key.to_string(), producer.clone());
            evicted
        };

        if let Some(old) = evicted {
            info!("producer cache full, evicting one connection");
            old.close(self.close_deadline);
        }

        Ok(producer)
    }

    /// Drop a connection observed broken so the next attempt reconnects.
    pub fn remove(&self, key: &str) {
        let removed = self.entries.lock().remove(key);
        if let Some(producer) = removed {
            producer.close(self.close_deadline);
        }
    }
}

impl<P: CacheableProducer> Drop for ProducerCache<P> {
    /// Closes whatever is still cached when the owner (and with it the
    /// process-wide cache) goes away.
    fn drop(&mut self) {
        for (_, producer) in self.entries.get_mut().drain() {
            producer.close(self.close_deadline);
        }
    }
}

/// Cache key: sorted broker list plus credentials.
///
/// Brokers are sorted before joining so the shuffling callers do for load
/// spreading cannot fragment the cache. The broker list used here is the
/// caller's SASL list, which is a distinct parameter from the connect list.
pub fn connection_key(brokers: &[String], username: &str, password: &str) -> String {
    let mut sorted: Vec<&str> = brokers.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    format!("{}{}:{}", sorted.join(","), username, password)
}

/// rdkafka-backed cache entry for the produce action.
#[derive(Clone)]
pub struct KafkaMessageProducer {
    inner: FutureProducer,
}

impl KafkaMessageProducer {
    /// Connect with 15 s socket/metadata/request timeouts and broker
    /// version probing.
    pub fn connect(
        brokers: &[String],
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self, ProduceError> {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", brokers.join(","))
            .set("socket.timeout.ms", "15000")
            .set("request.timeout.ms", "15000")
            .set("api.version.request", "true")
            .set("api.version.request.timeout.ms", "15000");

        if let (Some(user), Some(pass)) = (username, password) {
            config
                .set("security.protocol", "sasl_ssl")
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", user)
                .set("sasl.password", pass)
                .set("ssl.ca.location", "/etc/ssl/certs/");
        }

        let inner = config
            .create()
            .map_err(|err| ProduceError::from_kafka(&err))?;
        Ok(KafkaMessageProducer { inner })
    }

    /// Discover how many partitions `topic` has; doubles as the connection
    /// probe in the produce action's retry loop.
    pub fn partition_count(&self, topic: &str, deadline: Duration) -> Result<usize, ProduceError> {
        let metadata = self
            .inner
            .client()
            .fetch_metadata(Some(topic), deadline)
            .map_err(|err| ProduceError::from_kafka(&err))?;

        metadata
            .topics()
            .iter()
            .find(|entry| entry.name() == topic)
            .map(|entry| entry.partitions().len())
            .ok_or(ProduceError::NoBrokersAvailable)
    }

    /// Send one message and wait up to `deadline` for the delivery report.
    pub async fn send(
        &self,
        topic: &str,
        value: &[u8],
        key: Option<&[u8]>,
        deadline: Duration,
    ) -> Result<(i32, i64), ProduceError> {
        let mut record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(topic).payload(value);
        if let Some(key) = key {
            record = record.key(key);
        }

        match self.inner.send(record, Timeout::After(deadline)).await {
            Ok((partition, offset)) => Ok((partition, offset)),
            Err((err, _message)) => Err(ProduceError::from_kafka(&err)),
        }
    }
}

impl CacheableProducer for KafkaMessageProducer {
    fn close(&self, deadline: Duration) {
        let _ = self.inner.flush(Timeout::After(deadline));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Debug)]
    struct StubProducer {
        id: usize,
        closed: Arc<AtomicUsize>,
    }

    impl StubProducer {
        fn new(id: usize) -> Self {
            StubProducer {
                id,
                closed: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl CacheableProducer for StubProducer {
        fn close(&self, _deadline: Duration) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn cache(capacity: usize) -> ProducerCache<StubProducer> {
        ProducerCache::new(capacity, Duration::from_secs(1))
    }

    #[test]
    fn test_hit_returns_same_connection() {
        let cache = cache(10);
        let first = cache
            .get::<()>("k", || Ok(StubProducer::new(1)))
            .unwrap();
        let second = cache
            .get::<()>("k", || panic!("hit must not reconnect"))
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_eviction_at_capacity_closes_victim() {
        let cache = cache(10);
        let mut stubs = Vec::new();
        for i in 0..10 {
            stubs.push(
                cache
                    .get::<()>(&format!("k{i}"), || Ok(StubProducer::new(i)))
                    .unwrap(),
            );
        }
        assert_eq!(cache.len(), 10);

        cache.get::<()>("k10", || Ok(StubProducer::new(10))).unwrap();
        assert_eq!(cache.len(), 10);

        let closed: usize = stubs
            .iter()
            .map(|stub| stub.closed.load(Ordering::SeqCst))
            .sum();
        assert_eq!(closed, 1);
    }

    #[test]
    fn test_connect_failure_leaves_cache_unchanged() {
        let cache = cache(10);
        let result = cache.get("k", || Err::<StubProducer, _>("no brokers"));
        assert_eq!(result.unwrap_err(), "no brokers");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_closes_connection() {
        let cache = cache(10);
        let producer = cache.get::<()>("k", || Ok(StubProducer::new(1))).unwrap();
        cache.remove("k");
        assert!(cache.is_empty());
        assert_eq!(producer.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_closes_everything() {
        let cache = cache(10);
        let a = cache.get::<()>("a", || Ok(StubProducer::new(1))).unwrap();
        let b = cache.get::<()>("b", || Ok(StubProducer::new(2))).unwrap();
        drop(cache);
        assert_eq!(a.closed.load(Ordering::SeqCst), 1);
        assert_eq!(b.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_connection_key_ignores_broker_order() {
        let shuffled = connection_key(
            &["b2:9093".to_string(), "b1:9093".to_string(), "b3:9093".to_string()],
            "user",
            "pass",
        );
        let sorted = connection_key(
            &["b1:9093".to_string(), "b2:9093".to_string(), "b3:9093".to_string()],
            "user",
            "pass",
        );
        assert_eq!(shuffled, sorted);
        assert_eq!(sorted, "b1:9093,b2:9093,b3:9093user:pass");
    }

    #[test]
    fn test_connection_key_separates_credentials() {
        let one = connection_key(&["b:9093".to_string()], "alice", "pw");
        let other = connection_key(&["b:9093".to_string()], "bob", "pw");
        assert_ne!(one, other);
    }
}
