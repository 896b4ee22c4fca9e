//! Test server management.
//!
//! Spawns and manages roomserverd instances for integration testing.

#![allow(dead_code)]

use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::sleep;

/// A test server instance.
pub struct TestServer {
    child: Child,
    port: u16,
    data_dir: PathBuf,
}

impl TestServer {
    /// Spawn a new test server over a fresh data directory.
    ///
    /// `input_records` are written to the input topic's first partition
    /// before the server starts, so they are consumed on boot.
    pub async fn spawn(
        port: u16,
        input_records: &[String],
        stop_after: Option<u64>,
    ) -> anyhow::Result<Self> {
        let data_dir = std::env::temp_dir().join(format!("roomserverd-test-{port}"));
        // A stale directory from an earlier run would replay old offsets.
        let _ = std::fs::remove_dir_all(&data_dir);
        std::fs::create_dir_all(&data_dir)?;

        let spool = data_dir.join("spool");
        let input_dir = spool.join("input-room-event");
        std::fs::create_dir_all(&input_dir)?;
        let mut lines = input_records.join("\n");
        if !lines.is_empty() {
            lines.push('\n');
        }
        std::fs::write(input_dir.join("partition-00000.jsonl"), lines)?;

        // Build path to the roomserverd binary (in the workspace target dir)
        let cargo_manifest_dir = env!("CARGO_MANIFEST_DIR");
        let binary_path = PathBuf::from(cargo_manifest_dir).join("target/debug/roomserverd");

        let mut command = Command::new(&binary_path);
        command
            .env("DATABASE", data_dir.join("roomserver.db"))
            .env("KAFKA_URIS", format!("file://{}", spool.display()))
            .env("TOPIC_INPUT_ROOM_EVENT", "input-room-event")
            .env("TOPIC_OUTPUT_ROOM_EVENT", "output-room-event")
            .env("BIND_ADDRESS", format!("127.0.0.1:{port}"));
        if let Some(stop_after) = stop_after {
            command.env("STOP_AFTER", stop_after.to_string());
        }
        let child = command.spawn()?;

        let server = Self {
            child,
            port,
            data_dir,
        };
        // Batch runs (STOP_AFTER) may exit before the listener is
        // observable; callers wait for process exit instead.
        if stop_after.is_none() {
            server.wait_until_ready().await?;
        }
        Ok(server)
    }

    /// Wait for the process to exit on its own (stop-after runs).
    pub async fn wait_for_exit(&mut self) -> anyhow::Result<()> {
        for _ in 0..200 {
            if self.child.try_wait()?.is_some() {
                return Ok(());
            }
            sleep(Duration::from_millis(50)).await;
        }
        anyhow::bail!("server did not exit in time")
    }

    /// The HTTP port the server listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The server's data directory.
    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    /// Read the output topic's first partition, one record per line.
    pub fn output_records(&self) -> Vec<String> {
        let path = self
            .data_dir
            .join("spool/output-room-event/partition-00000.jsonl");
        match std::fs::read_to_string(path) {
            Ok(contents) => contents.lines().map(str::to_string).collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn wait_until_ready(&self) -> anyhow::Result<()> {
        for _ in 0..100 {
            if TcpStream::connect(("127.0.0.1", self.port)).await.is_ok() {
                return Ok(());
            }
            sleep(Duration::from_millis(50)).await;
        }
        anyhow::bail!("server did not start listening on port {}", self.port)
    }

    /// Wait until the consumer has committed `count` input offsets.
    pub async fn wait_for_offset(&self, count: u64) -> anyhow::Result<()> {
        for _ in 0..200 {
            if self.output_records().len() as u64 >= count {
                return Ok(());
            }
            sleep(Duration::from_millis(50)).await;
        }
        anyhow::bail!("server did not emit {count} output records in time")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.data_dir);
    }
}
