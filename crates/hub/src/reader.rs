use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::db::{UsageRecord, UsageStore};
use crate::frame::FrameParser;
use crate::serial::{ConnectionManager, ReadOutcome};
use crate::state::SharedState;

/// Drains the controller link, turns bytes into usage records, and keeps the
/// link open. One instance runs for the life of the process.
pub struct ReaderLoop {
    conn: Arc<ConnectionManager>,
    parser: FrameParser,
    store: UsageStore,
    shared: SharedState,
    interval: Duration,
}

impl ReaderLoop {
    pub fn new(
        conn: Arc<ConnectionManager>,
        store: UsageStore,
        shared: SharedState,
        interval: Duration,
    ) -> Self {
        Self {
            conn,
            parser: FrameParser::new(),
            store,
            shared,
            interval,
        }
    }

    pub async fn run(mut self) {
        info!(interval_ms = self.interval.as_millis() as u64, "reader loop started");
        loop {
            if let Err(e) = self.poll_once().await {
                error!(
                    pending_bytes = self.parser.buffered(),
                    "reader cycle aborted: {e:#}"
                );
                self.shared
                    .write()
                    .await
                    .record_error(format!("reader: {e:#}"));
            }
            sleep(self.interval).await;
        }
    }

    /// One cycle. Returns how many frames were stored. A storage failure
    /// stops the cycle; frames not yet pulled from the parser stay buffered.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let conn = Arc::clone(&self.conn);
        let outcome = tokio::task::spawn_blocking(move || conn.read_available())
            .await
            .context("serial read task failed")?;

        match outcome {
            ReadOutcome::Data(bytes) => self.ingest(&bytes).await,
            ReadOutcome::NotOpen => {
                let conn = Arc::clone(&self.conn);
                let opened = tokio::task::spawn_blocking(move || conn.ensure_open())
                    .await
                    .context("serial open task failed")?;
                if opened {
                    let port = self.conn.port_name().unwrap_or_default();
                    self.shared
                        .write()
                        .await
                        .record_serial(format!("serial port opened: {port}"));
                }
                Ok(0)
            }
            ReadOutcome::Faulted(e) => {
                warn!("serial read failed: {e}");
                self.shared
                    .write()
                    .await
                    .record_serial(format!("serial read failed: {e}"));
                Ok(0)
            }
        }
    }

    async fn ingest(&mut self, bytes: &[u8]) -> Result<usize> {
        let mut stored = 0;
        for frame in self.parser.feed(bytes) {
            let record = UsageRecord {
                timestamp: OffsetDateTime::now_utc(),
                device: frame.device,
                runtime_sec: frame.runtime_sec,
            };
            self.store
                .append(&record)
                .await
                .with_context(|| format!("failed to store {} runtime", frame.device))?;

            info!(device = %frame.device, runtime_sec = frame.runtime_sec, "usage recorded");
            self.shared
                .write()
                .await
                .record_frame(frame.device, frame.runtime_sec);
            stored += 1;
        }
        Ok(stored)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
