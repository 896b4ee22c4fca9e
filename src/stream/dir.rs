//! Directory-backed partitioned log.
//!
//! Each topic is a directory, each partition a JSONL file named
//! `partition-NNNNN.jsonl`. Appends are line-oriented, offsets are line
//! numbers, and nothing is ever rewritten, so the log survives restarts
//! with offsets intact and replays byte-identically.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{Broker, LogConsumer, LogProducer, LogRecord, StreamError};

/// A broker rooted at a spool directory.
pub struct DirBroker {
    root: PathBuf,
}

impl DirBroker {
    /// Create a broker over the given spool directory.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

struct DirTopic {
    dir: PathBuf,
    append_lock: Mutex<()>,
}

impl DirTopic {
    fn partition_path(&self, partition: u32) -> PathBuf {
        self.dir.join(format!("partition-{partition:05}.jsonl"))
    }
}

#[async_trait]
impl LogConsumer for DirTopic {
    async fn partitions(&self) -> Result<u32, StreamError> {
        let mut count = 0u32;
        match tokio::fs::read_dir(&self.dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if name.starts_with("partition-") && name.ends_with(".jsonl") {
                        count += 1;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(count.max(1))
    }

    async fn fetch(&self, partition: u32, offset: i64) -> Result<Option<LogRecord>, StreamError> {
        let path = self.partition_path(partition);
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let line = contents
            .split(|byte| *byte == b'\n')
            .filter(|line| !line.is_empty())
            .nth(offset as usize);
        Ok(line.map(|line| LogRecord {
            offset,
            payload: Bytes::copy_from_slice(line),
        }))
    }
}

#[async_trait]
impl LogProducer for DirTopic {
    async fn publish(&self, payload: Bytes) -> Result<(), StreamError> {
        let _guard = self.append_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.partition_path(0))
            .await?;
        file.write_all(&payload).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

impl Broker for DirBroker {
    fn consumer(&self, topic: &str) -> Arc<dyn LogConsumer> {
        Arc::new(DirTopic {
            dir: self.root.join(topic),
            append_lock: Mutex::new(()),
        })
    }

    fn producer(&self, topic: &str) -> Arc<dyn LogProducer> {
        Arc::new(DirTopic {
            dir: self.root.join(topic),
            append_lock: Mutex::new(()),
        })
    }
}
