//! In-process partitioned log for tests and benchmarks.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use super::{Broker, LogConsumer, LogProducer, LogRecord, StreamError};

/// An in-memory broker holding every topic fully in process.
pub struct MemoryBroker {
    partitions: u32,
    topics: DashMap<String, Arc<MemoryTopic>>,
}

struct MemoryTopic {
    partitions: Vec<RwLock<Vec<Bytes>>>,
    round_robin: AtomicUsize,
}

impl MemoryBroker {
    /// Create a broker whose topics have `partitions` partitions each.
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            topics: DashMap::new(),
        }
    }

    fn topic(&self, name: &str) -> Arc<MemoryTopic> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryTopic {
                    partitions: (0..self.partitions).map(|_| RwLock::new(Vec::new())).collect(),
                    round_robin: AtomicUsize::new(0),
                })
            })
            .clone()
    }

    /// Read back everything published to one partition of a topic.
    #[allow(dead_code)] // test and benchmark helper
    pub async fn records(&self, topic: &str, partition: u32) -> Vec<Bytes> {
        let topic = self.topic(topic);
        topic.partitions[partition as usize].read().await.clone()
    }
}

#[async_trait]
impl LogConsumer for MemoryTopic {
    async fn partitions(&self) -> Result<u32, StreamError> {
        Ok(self.partitions.len() as u32)
    }

    async fn fetch(&self, partition: u32, offset: i64) -> Result<Option<LogRecord>, StreamError> {
        let log = self.partitions[partition as usize].read().await;
        Ok(log.get(offset as usize).map(|payload| LogRecord {
            offset,
            payload: payload.clone(),
        }))
    }
}

#[async_trait]
impl LogProducer for MemoryTopic {
    async fn publish(&self, payload: Bytes) -> Result<(), StreamError> {
        let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % self.partitions.len();
        self.partitions[index].write().await.push(payload);
        Ok(())
    }
}

impl Broker for MemoryBroker {
    fn consumer(&self, topic: &str) -> Arc<dyn LogConsumer> {
        self.topic(topic)
    }

    fn producer(&self, topic: &str) -> Arc<dyn LogProducer> {
        self.topic(topic)
    }
}
