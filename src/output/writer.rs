//! Per-monitor CSV writer task.
//!
//! Exactly one task owns each CSV file handle. Rows arrive over the sink
//! channel in producer-submit order and are written in that order; batches
//! accumulate up to `batch_size` rows, a flush timer bounds their age, and
//! a large batch flushes to disk immediately.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::row::{write_csv_line, Row};
use super::SinkStats;
use crate::config::OutputConfig;

/// Sink writer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Draining,
    Closed,
}

const WRITE_RETRIES: u32 = 3;
const WRITE_RETRY_BACKOFF: Duration = Duration::from_millis(50);

pub(super) struct WriterTask {
    pub monitor: &'static str,
    pub path: PathBuf,
    pub file: BufWriter<File>,
    pub rx: mpsc::Receiver<Row>,
    pub stats: Arc<SinkStats>,
    pub cfg: OutputConfig,
    /// Console echo; header printed before the first echoed row.
    pub console_header: Option<String>,
}

impl WriterTask {
    pub async fn run(mut self) {
        let mut state = WriterState::Draining;
        let mut batch: Vec<Row> = Vec::with_capacity(self.cfg.batch_size);
        let mut header_printed = false;

        let mut flush_timer = tokio::time::interval(self.cfg.flush_interval);
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while state == WriterState::Draining {
            tokio::select! {
                maybe_row = self.rx.recv() => {
                    match maybe_row {
                        Some(row) => {
                            if row.console.is_some() && !header_printed {
                                self.print_console_header();
                                header_printed = true;
                            }
                            batch.push(row);

                            if batch.len() >= self.cfg.batch_size
                                && !self.write_batch(&mut batch, false).await
                            {
                                state = WriterState::Closed;
                            }
                        }
                        // All sink handles dropped: final drain below.
                        None => break,
                    }
                }

                _ = flush_timer.tick() => {
                    if !self.write_batch(&mut batch, true).await {
                        state = WriterState::Closed;
                    }
                }
            }
        }

        // Tail rows submitted before the channel closed.
        if state == WriterState::Draining {
            while let Ok(row) = self.rx.try_recv() {
                batch.push(row);
            }
            self.write_batch(&mut batch, true).await;
        }

        if let Err(e) = self.file.flush() {
            error!(monitor = self.monitor, error = %e, "final CSV flush failed");
        }

        debug!(
            monitor = self.monitor,
            path = %self.path.display(),
            rows = self.stats.rows_written(),
            "CSV writer closed",
        );
    }

    fn print_console_header(&self) {
        if let Some(header) = &self.console_header {
            println!("{header}");
            println!("{}", "-".repeat(header.len() + 16));
        }
    }

    /// Write and clear the batch. A large batch flushes to disk
    /// immediately regardless of `flush`. Returns false when the sink is
    /// dead.
    async fn write_batch(&mut self, batch: &mut Vec<Row>, flush: bool) -> bool {
        if batch.is_empty() {
            return true;
        }

        let mut buf = String::new();
        for row in batch.iter() {
            write_csv_line(&mut buf, &row.csv, self.cfg.csv_delimiter);
            if let Some(line) = &row.console {
                println!("{line}");
            }
        }

        let rows = batch.len() as u64;
        let flush = flush || batch.len() >= self.cfg.large_batch_threshold;
        batch.clear();

        for attempt in 1..=WRITE_RETRIES {
            match self.file.write_all(buf.as_bytes()) {
                Ok(()) => {
                    self.stats.add_written(rows);
                    if flush {
                        if let Err(e) = self.file.flush() {
                            warn!(monitor = self.monitor, error = %e, "CSV flush failed");
                        }
                    }
                    return true;
                }
                Err(e) if e.raw_os_error() == Some(libc::ENOSPC) => {
                    error!(
                        monitor = self.monitor,
                        path = %self.path.display(),
                        "disk full, closing sink",
                    );
                    self.stats.add_dropped(rows);
                    return false;
                }
                Err(e) if attempt < WRITE_RETRIES => {
                    warn!(
                        monitor = self.monitor,
                        attempt,
                        error = %e,
                        "CSV write failed, retrying",
                    );
                    tokio::time::sleep(WRITE_RETRY_BACKOFF).await;
                }
                Err(e) => {
                    error!(
                        monitor = self.monitor,
                        error = %e,
                        "CSV write failed after {WRITE_RETRIES} attempts, closing sink",
                    );
                    self.stats.add_dropped(rows);
                    return false;
                }
            }
        }

        false
    }
}
