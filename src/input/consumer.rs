//! Partition-ordered ingress consumer.
//!
//! One task per partition drains the input topic in offset order. Offsets
//! are checkpointed only after a record is fully committed and its output
//! published, so a crash replays the tail; the handler is idempotent and
//! the egress is byte-stable, making replays harmless.

use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

use crate::db::Database;
use crate::error::{Disposition, InputError};
use crate::input::{InputEvent, InputHandler};
use crate::metrics;
use crate::stream::{Broker, LogConsumer, LogProducer};
use crate::telemetry;

/// Poll interval when the partition has no new records.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// First backoff applied to deferred or transiently failed records.
const BACKOFF_BASE: Duration = Duration::from_millis(50);
/// Backoff ceiling.
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// The ingress consumer: drains every partition of the input topic
/// through the handler and publishes the resulting output records.
pub struct Consumer {
    db: Database,
    handler: Arc<InputHandler>,
    input: Arc<dyn LogConsumer>,
    output: Arc<dyn LogProducer>,
    input_topic: String,
    stop_after: Option<u64>,
    processed: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl Consumer {
    /// Wire a consumer to the broker's input and output topics.
    pub fn new(
        db: Database,
        broker: &dyn Broker,
        input_topic: &str,
        output_topic: &str,
        stop_after: Option<u64>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            handler: Arc::new(InputHandler::new(db.clone())),
            db,
            input: broker.consumer(input_topic),
            output: broker.producer(output_topic),
            input_topic: input_topic.to_string(),
            stop_after,
            processed: Arc::new(AtomicU64::new(0)),
            cancel,
        }
    }

    /// Run until cancelled, the stop-after budget is exhausted, or a
    /// fatal store error is hit.
    pub async fn run(self) -> Result<(), InputError> {
        let partitions = self.input.partitions().await?;
        info!(topic = %self.input_topic, partitions, "Ingress consumer starting");

        let mut tasks = JoinSet::new();
        for partition in 0..partitions {
            let worker = PartitionWorker {
                db: self.db.clone(),
                handler: Arc::clone(&self.handler),
                input: Arc::clone(&self.input),
                output: Arc::clone(&self.output),
                topic: self.input_topic.clone(),
                partition,
                stop_after: self.stop_after,
                processed: Arc::clone(&self.processed),
                cancel: self.cancel.clone(),
            };
            let span = telemetry::spans::partition(&self.input_topic, partition);
            tasks.spawn(async move { worker.run().await }.instrument(span));
        }

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // A fatal partition takes the whole consumer down.
                    self.cancel.cancel();
                    result = Err(e);
                }
                Err(e) => {
                    self.cancel.cancel();
                    error!(error = %e, "Partition task panicked");
                }
            }
        }
        result
    }
}

struct PartitionWorker {
    db: Database,
    handler: Arc<InputHandler>,
    input: Arc<dyn LogConsumer>,
    output: Arc<dyn LogProducer>,
    topic: String,
    partition: u32,
    stop_after: Option<u64>,
    processed: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl PartitionWorker {
    async fn run(&self) -> Result<(), InputError> {
        let mut offset = self.db.offsets().next_offset(&self.topic, self.partition).await?;
        let mut backoff = BACKOFF_BASE;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let record = match self.input.fetch(self.partition, offset).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, offset, "Fetch failed, backing off");
                    self.sleep(&mut backoff).await;
                    continue;
                }
            };
            let record = match record {
                Some(record) => record,
                None => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    }
                    continue;
                }
            };

            match self.process(&record.payload, offset).await {
                Ok(()) => {
                    backoff = BACKOFF_BASE;
                    offset = self.commit(offset).await?;
                }
                Err(e) => match e.disposition() {
                    Disposition::Retry | Disposition::Defer => {
                        if self.cancel.is_cancelled() {
                            return Ok(());
                        }
                        metrics::DEFERRED_INPUTS
                            .with_label_values(&[e.error_code()])
                            .inc();
                        warn!(error = %e, offset, "Record deferred, backing off");
                        self.sleep(&mut backoff).await;
                    }
                    Disposition::Poison => {
                        metrics::INPUT_FAILURES
                            .with_label_values(&[e.error_code()])
                            .inc();
                        warn!(error = %e, offset, "Record rejected, skipping");
                        backoff = BACKOFF_BASE;
                        offset = self.commit(offset).await?;
                    }
                    Disposition::Fatal => {
                        error!(error = %e, offset, "Fatal store error, aborting");
                        self.cancel.cancel();
                        return Err(e);
                    }
                },
            }
        }
    }

    /// Decode, handle, and publish one record.
    async fn process(&self, payload: &Bytes, offset: i64) -> Result<(), InputError> {
        let input: InputEvent = serde_json::from_slice(payload)
            .map_err(roomserver_events::EventError::Json)?;
        let span = telemetry::spans::record(input.kind.as_str(), offset);
        let output = self
            .handler
            .handle(&input, &self.cancel)
            .instrument(span)
            .await?;
        if let Some(output) = output {
            let encoded = serde_json::to_vec(&output)
                .map_err(roomserver_events::EventError::Json)?;
            self.output.publish(Bytes::from(encoded)).await?;
        }
        Ok(())
    }

    /// Checkpoint past the current offset and account for the stop-after
    /// budget.
    async fn commit(&self, offset: i64) -> Result<i64, InputError> {
        let next = offset + 1;
        self.db
            .offsets()
            .set_next_offset(&self.topic, self.partition, next)
            .await?;
        let total = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(stop_after) = self.stop_after
            && total >= stop_after
        {
            info!(total, "Stop-after budget reached, shutting down");
            self.cancel.cancel();
        }
        Ok(next)
    }

    async fn sleep(&self, backoff: &mut Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(*backoff) => {}
        }
        *backoff = (*backoff * 2).min(BACKOFF_MAX);
    }
}
