//! Monitor base contract and shared drain machinery.
//!
//! A monitor pairs one in-kernel BPF program with a user-space drainer and
//! a sink. Lifecycle: New -> Loaded -> Running -> Stopping -> Stopped,
//! with Failed reachable from any state. `load` is idempotent; `run`
//! spawns the drain task(s) and returns their join handles; stopping is
//! cooperative through the supervisor's cancellation token.

pub mod maps;

pub mod bio;
pub mod context_switch;
pub mod exec;
pub mod func;
pub mod interrupt;
pub mod open;
pub mod page_fault;
pub mod syscall;

#[cfg(feature = "bpf")]
pub(crate) mod bpf;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{AttachError, DrainError, LoadError};
use crate::output::SinkHandle;

/// Monitor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    New,
    Loaded,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl MonitorState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Loaded => "loaded",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

/// The uniform monitor object owned by the supervisor.
pub trait Monitor: Send {
    fn name(&self) -> &'static str;

    /// Fixed CSV column set. Frozen per release; for exec the set is
    /// chosen at load time and does not change for the life of the run.
    fn csv_header(&self) -> &'static [&'static str];

    /// Columnar console header used in single-monitor echo mode.
    fn console_header(&self) -> String;

    /// Load the BPF object and verify its map schema. Does not attach
    /// probes. No-op when already loaded.
    fn load(&mut self) -> Result<(), LoadError>;

    /// Bind attach points, falling back where the capability report
    /// offers an alternative.
    fn attach(&mut self) -> Result<(), AttachError>;

    /// Begin draining. Returns after spawning the drain task(s); the
    /// tasks own the sink handle and exit when `cancel` fires or an
    /// unrecoverable drain error occurs.
    fn run(
        &mut self,
        sink: SinkHandle,
        cancel: CancellationToken,
        status: Arc<StatusTable>,
    ) -> anyhow::Result<Vec<JoinHandle<()>>>;

    /// Detach all probes and close all maps. Must not be called while
    /// Running.
    fn unload(&mut self);
}

/// Per-monitor status snapshot.
#[derive(Debug, Clone)]
pub struct MonitorStatus {
    pub state: MonitorState,
    pub ticks: u64,
    pub drain_errors: u64,
    pub dropped_events: u64,
    pub last_error: Option<String>,
}

impl Default for MonitorStatus {
    fn default() -> Self {
        Self {
            state: MonitorState::New,
            ticks: 0,
            drain_errors: 0,
            dropped_events: 0,
            last_error: None,
        }
    }
}

/// Status of all monitors, updated under its own lock. Drain tasks report
/// errors here instead of panicking.
#[derive(Debug, Default)]
pub struct StatusTable {
    inner: Mutex<HashMap<&'static str, MonitorStatus>>,
}

impl StatusTable {
    pub fn register(&self, name: &'static str) {
        let mut inner = self.inner.lock().expect("status lock");
        inner.entry(name).or_default();
    }

    pub fn set_state(&self, name: &'static str, state: MonitorState) {
        let mut inner = self.inner.lock().expect("status lock");
        inner.entry(name).or_default().state = state;
    }

    pub fn record_tick(&self, name: &'static str) {
        let mut inner = self.inner.lock().expect("status lock");
        inner.entry(name).or_default().ticks += 1;
    }

    pub fn record_drain_error(&self, name: &'static str, error: &DrainError, failed: bool) {
        let mut inner = self.inner.lock().expect("status lock");
        let status = inner.entry(name).or_default();
        status.drain_errors += 1;
        status.last_error = Some(error.to_string());
        if failed {
            status.state = MonitorState::Failed;
        }
    }

    pub fn record_error(&self, name: &'static str, error: &str) {
        let mut inner = self.inner.lock().expect("status lock");
        let status = inner.entry(name).or_default();
        status.last_error = Some(error.to_string());
        status.state = MonitorState::Failed;
    }

    pub fn record_dropped(&self, name: &'static str, n: u64) {
        let mut inner = self.inner.lock().expect("status lock");
        inner.entry(name).or_default().dropped_events += n;
    }

    pub fn get(&self, name: &str) -> Option<MonitorStatus> {
        let inner = self.inner.lock().expect("status lock");
        inner.get(name).cloned()
    }

    pub fn snapshot(&self) -> Vec<(&'static str, MonitorStatus)> {
        let inner = self.inner.lock().expect("status lock");
        let mut rows: Vec<_> = inner.iter().map(|(k, v)| (*k, v.clone())).collect();
        rows.sort_by_key(|(name, _)| *name);
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(MonitorState::Running.as_str(), "running");
        assert_eq!(MonitorState::Failed.as_str(), "failed");
    }

    #[test]
    fn test_status_table_ticks_and_errors() {
        let table = StatusTable::default();
        table.register("bio");
        table.set_state("bio", MonitorState::Running);
        table.record_tick("bio");
        table.record_tick("bio");

        let err = DrainError::MapIteration("boom".into());
        table.record_drain_error("bio", &err, false);

        let status = table.get("bio").expect("status");
        assert_eq!(status.state, MonitorState::Running);
        assert_eq!(status.ticks, 2);
        assert_eq!(status.drain_errors, 1);
        assert_eq!(status.last_error.as_deref(), Some("map iteration failed: boom"));

        table.record_drain_error("bio", &err, true);
        assert_eq!(table.get("bio").expect("status").state, MonitorState::Failed);
    }

    #[test]
    fn test_status_table_dropped_and_snapshot() {
        let table = StatusTable::default();
        table.register("exec");
        table.register("bio");
        table.record_dropped("exec", 7);

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].0, "bio");
        assert_eq!(snapshot[1].0, "exec");
        assert_eq!(snapshot[1].1.dropped_events, 7);
    }
}
