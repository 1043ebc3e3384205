//! Output controller: CSV files, bounded sinks, batching and echo mode.
//!
//! The controller owns one writer task per active monitor. Monitors hold a
//! [`SinkHandle`] only; the dropped-row counter lives inside the handle's
//! shared stats so nothing holds a reference back to the monitor.
//!
//! Mode is decided once at startup: with exactly one active monitor, rows
//! are mirrored to stdout through the monitor's console encoder; with more
//! than one, files only.

pub mod row;
mod writer;

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::OutputConfig;
use crate::error::SinkError;
use row::Row;
use writer::WriterTask;

/// Output routing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    FileOnly,
    FileAndConsole,
}

/// Shared per-sink counters, readable by anyone holding the handle.
#[derive(Debug, Default)]
pub struct SinkStats {
    rows_written: AtomicU64,
    rows_dropped: AtomicU64,
}

impl SinkStats {
    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    pub fn rows_dropped(&self) -> u64 {
        self.rows_dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn add_written(&self, n: u64) {
        self.rows_written.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_dropped(&self, n: u64) {
        self.rows_dropped.fetch_add(n, Ordering::Relaxed);
    }
}

/// The handle a monitor uses to submit rows.
#[derive(Clone)]
pub struct SinkHandle {
    monitor: &'static str,
    tx: mpsc::Sender<Row>,
    stats: Arc<SinkStats>,
    echo_console: bool,
    submit_timeout: Duration,
}

impl SinkHandle {
    /// Whether rows should carry a console rendering.
    pub fn echo_console(&self) -> bool {
        self.echo_console
    }

    pub fn stats(&self) -> &Arc<SinkStats> {
        &self.stats
    }

    /// Submit a row, blocking up to half the flush interval on a full
    /// channel; beyond that the row is dropped and counted. Keeps the
    /// drain loop from stalling behind slow I/O.
    pub async fn submit(&self, row: Row) {
        match self.tx.try_send(row) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(row)) => {
                match self.tx.send_timeout(row, self.submit_timeout).await {
                    Ok(()) => {}
                    Err(_) => {
                        self.stats.add_dropped(1);
                        debug!(monitor = self.monitor, "sink channel full, row dropped");
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.add_dropped(1);
            }
        }
    }
}

/// Owns all writers and applies the output mode.
pub struct OutputController {
    cfg: OutputConfig,
    host_dir: PathBuf,
    mode: OutputMode,
    writers: Vec<(&'static str, JoinHandle<()>)>,
}

impl OutputController {
    /// Create the controller, deciding mode from the active monitor count
    /// and creating `{directory}/{host}`.
    pub fn new(
        cfg: OutputConfig,
        hostname: &str,
        active_monitors: usize,
    ) -> Result<Self, SinkError> {
        let host_dir = cfg.directory.join(hostname);
        std::fs::create_dir_all(&host_dir)?;

        let mode = if active_monitors == 1 {
            OutputMode::FileAndConsole
        } else {
            OutputMode::FileOnly
        };

        info!(
            dir = %host_dir.display(),
            monitors = active_monitors,
            mode = ?mode,
            "output controller ready",
        );

        Ok(Self {
            cfg,
            host_dir,
            mode,
            writers: Vec::new(),
        })
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Open the CSV sink for one monitor and spawn its writer task.
    /// The header is written iff the file was just created.
    pub fn open_sink(
        &mut self,
        monitor: &'static str,
        csv_header: &[&str],
        console_header: String,
    ) -> Result<SinkHandle, SinkError> {
        let filename = format!(
            "{monitor}_{}.csv",
            Local::now().format("%Y%m%d_%H%M%S")
        );
        let path = self.host_dir.join(filename);

        let is_new = !path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut buffered = BufWriter::new(file);

        if is_new && self.cfg.include_header {
            let mut line = String::new();
            let header: Vec<String> = csv_header.iter().map(|s| s.to_string()).collect();
            row::write_csv_line(&mut line, &header, self.cfg.csv_delimiter);
            buffered.write_all(line.as_bytes())?;
            buffered.flush()?;
        }

        let (tx, rx) = mpsc::channel(self.cfg.buffer_size);
        let stats = Arc::new(SinkStats::default());
        let echo = self.mode == OutputMode::FileAndConsole;

        let task = WriterTask {
            monitor,
            path: path.clone(),
            file: buffered,
            rx,
            stats: Arc::clone(&stats),
            cfg: self.cfg.clone(),
            console_header: echo.then_some(console_header),
        };

        let handle = tokio::spawn(task.run());
        self.writers.push((monitor, handle));

        debug!(monitor, path = %path.display(), "CSV sink opened");

        Ok(SinkHandle {
            monitor,
            tx,
            stats,
            echo_console: echo,
            submit_timeout: self.cfg.flush_interval / 2,
        })
    }

    /// Wait for all writer tasks to finish their final drain. Callers drop
    /// every SinkHandle first; a timeout accepts a partial tail.
    pub async fn close(&mut self, timeout: Duration) {
        for (monitor, handle) in self.writers.drain(..) {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(monitor, error = %e, "writer task join failed"),
                Err(_) => warn!(monitor, "writer task did not close in time"),
            }
        }
    }

    /// Construct a detached sink for tests: rows land in the returned
    /// receiver instead of a file.
    #[doc(hidden)]
    pub fn test_sink(
        monitor: &'static str,
        capacity: usize,
        echo_console: bool,
    ) -> (SinkHandle, mpsc::Receiver<Row>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            SinkHandle {
                monitor,
                tx,
                stats: Arc::new(SinkStats::default()),
                echo_console,
                submit_timeout: Duration::from_millis(100),
            },
            rx,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg(dir: &std::path::Path) -> OutputConfig {
        OutputConfig {
            directory: dir.to_path_buf(),
            buffer_size: 64,
            batch_size: 4,
            large_batch_threshold: 20,
            flush_interval: Duration::from_millis(50),
            csv_delimiter: ',',
            include_header: true,
        }
    }

    fn row(fields: &[&str]) -> Row {
        Row::csv_only(fields.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_mode_selection() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");

        rt.block_on(async {
            let ctl = OutputController::new(test_cfg(dir.path()), "host-a", 1).expect("ctl");
            assert_eq!(ctl.mode(), OutputMode::FileAndConsole);

            let ctl = OutputController::new(test_cfg(dir.path()), "host-a", 3).expect("ctl");
            assert_eq!(ctl.mode(), OutputMode::FileOnly);
        });
    }

    #[tokio::test]
    async fn test_rows_written_in_submit_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut ctl = OutputController::new(test_cfg(dir.path()), "host-a", 2).expect("ctl");

        let sink = ctl
            .open_sink("func", &["timestamp", "comm", "count"], String::new())
            .expect("sink");
        assert!(!sink.echo_console());

        for i in 0..10 {
            sink.submit(row(&[&format!("{i}.000"), "proc", &i.to_string()]))
                .await;
        }
        drop(sink);

        ctl.close(Duration::from_secs(2)).await;

        let host_dir = dir.path().join("host-a");
        let entries: Vec<_> = std::fs::read_dir(&host_dir)
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].file_name().to_string_lossy().into_owned();
        assert!(name.starts_with("func_"), "{name}");
        assert!(name.ends_with(".csv"), "{name}");

        let content = std::fs::read_to_string(entries[0].path()).expect("read csv");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "timestamp,comm,count");
        assert_eq!(lines.len(), 11);
        for (i, line) in lines[1..].iter().enumerate() {
            assert_eq!(*line, format!("{i}.000,proc,{i}"));
        }
        // Complete final line.
        assert!(content.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_every_row_has_header_field_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut ctl = OutputController::new(test_cfg(dir.path()), "h", 2).expect("ctl");

        let sink = ctl
            .open_sink("bio", &["a", "b", "c"], String::new())
            .expect("sink");
        sink.submit(row(&["1", "with,comma", "3"])).await;
        sink.submit(row(&["4", "plain", "6"])).await;
        drop(sink);
        ctl.close(Duration::from_secs(2)).await;

        let host_dir = dir.path().join("h");
        let entry = std::fs::read_dir(&host_dir)
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .next()
            .expect("csv file");
        let content = std::fs::read_to_string(entry.path()).expect("read");

        for line in content.lines() {
            // Quoted comma fields count as one.
            let fields = split_csv(line);
            assert_eq!(fields.len(), 3, "line: {line}");
        }
        assert!(content.contains("\"with,comma\""));
    }

    #[tokio::test]
    async fn test_channel_overflow_drops_and_counts() {
        let (sink, rx) = OutputController::test_sink("open", 2, false);

        // Fill the channel without a consumer; overflow must not block
        // forever and must count drops.
        for i in 0..5 {
            sink.submit(row(&[&i.to_string()])).await;
        }

        assert_eq!(sink.stats().rows_dropped(), 3);
        drop(rx);

        sink.submit(row(&["closed"])).await;
        assert_eq!(sink.stats().rows_dropped(), 4);
    }

    /// Minimal CSV splitter honouring double-quote escaping, test-only.
    fn split_csv(line: &str) -> Vec<String> {
        let mut fields = Vec::new();
        let mut cur = String::new();
        let mut in_quotes = false;
        let mut chars = line.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '"' if in_quotes && chars.peek() == Some(&'"') => {
                    cur.push('"');
                    chars.next();
                }
                '"' => in_quotes = !in_quotes,
                ',' if !in_quotes => fields.push(std::mem::take(&mut cur)),
                c => cur.push(c),
            }
        }
        fields.push(cur);
        fields
    }
}
