//! Supervisor: monitor lifecycle, cancellation and status reporting.
//!
//! Sequences load -> attach -> run -> stop -> unload per monitor. One
//! monitor failing leaves the others running; the caller escalates only
//! when every configured monitor failed. Lifecycle transitions happen on
//! the supervisor's own task; the status table has its own lock and is
//! never held across blocking calls.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::context::ApplicationContext;
use crate::monitor::{Monitor, MonitorState, StatusTable};
use crate::output::{OutputController, SinkStats};
use crate::registry;

struct MonitorEntry {
    name: &'static str,
    monitor: Box<dyn Monitor>,
    drain_tasks: Vec<JoinHandle<()>>,
    sink_stats: Option<Arc<SinkStats>>,
    state: MonitorState,
}

/// Outcome of the startup sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartReport {
    pub started: usize,
    pub failed: usize,
}

pub struct Supervisor {
    entries: Vec<MonitorEntry>,
    status: Arc<StatusTable>,
    cancel: CancellationToken,
    stop_timeout: Duration,
}

impl Supervisor {
    /// Instantiate monitors for every enabled config section.
    pub fn new(ctx: &ApplicationContext) -> Self {
        let mut entries = Vec::new();
        let status = Arc::new(StatusTable::default());

        for factory in registry::REGISTRY {
            if !ctx.config.monitor_enabled(factory.name) {
                continue;
            }

            status.register(factory.name);
            entries.push(MonitorEntry {
                name: factory.name,
                monitor: (factory.build)(&ctx.config, &ctx.caps, ctx.clock),
                drain_tasks: Vec::new(),
                sink_stats: None,
                state: MonitorState::New,
            });
        }

        Self {
            entries,
            status,
            cancel: CancellationToken::new(),
            stop_timeout: ctx.config.stop_timeout,
        }
    }

    pub fn status(&self) -> Arc<StatusTable> {
        Arc::clone(&self.status)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Load, attach and run every configured monitor. A failure marks that
    /// monitor Failed and moves on.
    pub fn start(&mut self, output: &mut OutputController) -> Result<StartReport> {
        let mut report = StartReport {
            started: 0,
            failed: 0,
        };

        for entry in &mut self.entries {
            let name = entry.name;

            if let Err(e) = entry.monitor.load() {
                error!(monitor = name, error = %e, "load failed");
                self.status.record_error(name, &e.to_string());
                entry.state = MonitorState::Failed;
                report.failed += 1;
                continue;
            }
            entry.state = MonitorState::Loaded;
            self.status.set_state(name, MonitorState::Loaded);

            if let Err(e) = entry.monitor.attach() {
                error!(monitor = name, error = %e, "attach failed");
                self.status.record_error(name, &e.to_string());
                entry.monitor.unload();
                entry.state = MonitorState::Failed;
                report.failed += 1;
                continue;
            }

            let sink = match output.open_sink(
                name,
                entry.monitor.csv_header(),
                entry.monitor.console_header(),
            ) {
                Ok(sink) => sink,
                Err(e) => {
                    error!(monitor = name, error = %e, "opening CSV sink failed");
                    self.status.record_error(name, &e.to_string());
                    entry.monitor.unload();
                    entry.state = MonitorState::Failed;
                    report.failed += 1;
                    continue;
                }
            };
            entry.sink_stats = Some(Arc::clone(sink.stats()));

            match entry.monitor.run(
                sink,
                self.cancel.child_token(),
                Arc::clone(&self.status),
            ) {
                Ok(tasks) => {
                    entry.drain_tasks = tasks;
                    entry.state = MonitorState::Running;
                    self.status.set_state(name, MonitorState::Running);
                    info!(monitor = name, "monitor running");
                    report.started += 1;
                }
                Err(e) => {
                    error!(monitor = name, error = %e, "run failed");
                    self.status.record_error(name, &e.to_string());
                    entry.monitor.unload();
                    entry.state = MonitorState::Failed;
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Graceful shutdown: cancel every drain task at once, give them a
    /// shared stop deadline to flush in-flight rows, then unload
    /// regardless. A task that misses the deadline leaves its monitor
    /// Failed with a stop-timeout error.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();

        // All tasks wind down concurrently; the deadline is shared so the
        // whole stop phase is bounded by one stop_timeout.
        let deadline = tokio::time::Instant::now() + self.stop_timeout;

        for entry in &mut self.entries {
            if entry.state != MonitorState::Running {
                // Never ran; make sure probes are gone anyway.
                entry.monitor.unload();
                continue;
            }

            entry.state = MonitorState::Stopping;
            self.status.set_state(entry.name, MonitorState::Stopping);

            let mut timed_out = false;
            for task in entry.drain_tasks.drain(..) {
                match tokio::time::timeout_at(deadline, task).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(monitor = entry.name, error = %e, "drain task join failed");
                    }
                    Err(_) => timed_out = true,
                }
            }

            entry.monitor.unload();

            if timed_out {
                warn!(
                    monitor = entry.name,
                    timeout = ?self.stop_timeout,
                    "drain task did not stop in time, unloaded anyway",
                );
                self.status
                    .record_error(entry.name, "stop timeout exceeded");
                entry.state = MonitorState::Failed;
            } else if entry.state != MonitorState::Failed {
                entry.state = MonitorState::Stopped;
                self.status.set_state(entry.name, MonitorState::Stopped);
            }

            info!(monitor = entry.name, "monitor stopped");
        }
    }

    /// One-line summary per monitor, printed on graceful exit.
    pub fn print_summary(&self) {
        for entry in &self.entries {
            let status = self.status.get(entry.name).unwrap_or_default();
            let (written, dropped_rows) = entry
                .sink_stats
                .as_ref()
                .map(|s| (s.rows_written(), s.rows_dropped()))
                .unwrap_or((0, 0));

            println!(
                "{}: state={} rows_written={} rows_dropped={} events_lost={} ticks={} errors={}",
                entry.name,
                status.state.as_str(),
                written,
                dropped_rows,
                status.dropped_events,
                status.ticks,
                status.drain_errors,
            );
        }
    }
}

/// Block until SIGINT or SIGTERM. SIGHUP is deliberately not handled;
/// there is no live config reload.
pub async fn wait_for_shutdown_signal() -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
    }

    Ok(())
}

/// Map the startup report to the process exit decision: only a full
/// failure (every configured monitor dead) is fatal.
pub fn all_monitors_failed(config: &Config, report: StartReport) -> bool {
    let configured = config.enabled_monitors().len();
    configured > 0 && report.started == 0
}
