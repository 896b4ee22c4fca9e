//! Partitioned-log abstraction for the ingress and egress streams.
//!
//! The broker transport itself is an external collaborator; this module
//! defines the seam the core consumes it through, plus two backends: an
//! in-process log for tests and benchmarks (`mem://`) and a directory of
//! JSONL partition files for local deployments (`file:///path`). Broker
//! URIs are scheme-dispatched the same way store DSNs are.

pub mod dir;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

/// Stream transport errors.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported broker URI {0:?} (supported schemes: mem://, file://)")]
    UnsupportedScheme(String),
    #[error("no broker URIs configured")]
    NoBrokers,
}

/// One record of a partitioned log.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// The record's offset within its partition.
    pub offset: i64,
    /// The record payload.
    pub payload: Bytes,
}

/// A consumer handle for one topic.
#[async_trait]
pub trait LogConsumer: Send + Sync {
    /// Number of partitions in the topic.
    async fn partitions(&self) -> Result<u32, StreamError>;

    /// Fetch the record at `offset` in `partition`, or `None` if the log
    /// ends before it.
    async fn fetch(&self, partition: u32, offset: i64) -> Result<Option<LogRecord>, StreamError>;
}

/// A producer handle for one topic.
#[async_trait]
pub trait LogProducer: Send + Sync {
    /// Append a record to the topic.
    async fn publish(&self, payload: Bytes) -> Result<(), StreamError>;
}

/// A connection to a partitioned-log broker.
pub trait Broker: Send + Sync {
    /// Open a consumer for a topic.
    fn consumer(&self, topic: &str) -> Arc<dyn LogConsumer>;

    /// Open a producer for a topic.
    fn producer(&self, topic: &str) -> Arc<dyn LogProducer>;
}

/// Open a broker from configured URIs.
///
/// The first URI decides the backend; the memory broker ignores any
/// additional URIs, the directory broker requires exactly one.
pub fn open_broker(uris: &[String]) -> Result<Arc<dyn Broker>, StreamError> {
    let first = uris.first().ok_or(StreamError::NoBrokers)?;
    if first.starts_with("mem://") {
        return Ok(Arc::new(memory::MemoryBroker::new(1)));
    }
    if let Some(path) = first.strip_prefix("file://") {
        return Ok(Arc::new(dir::DirBroker::new(path)));
    }
    Err(StreamError::UnsupportedScheme(first.clone()))
}
