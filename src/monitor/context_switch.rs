//! Context switch monitor.

use crate::output::row::{fmt_time_str, fmt_timestamp, Row};

pub const CSV_HEADER: &[&str] = &[
    "timestamp",
    "time_str",
    "comm",
    "cpu",
    "switch_in",
    "switch_out",
    "voluntary",
    "involuntary",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchRecord {
    pub comm: String,
    pub cpu: u32,
    pub switch_in: u64,
    pub switch_out: u64,
    pub voluntary: u64,
    pub involuntary: u64,
}

impl SwitchRecord {
    pub fn total_switches(&self) -> u64 {
        self.switch_in + self.switch_out
    }

    pub fn encode(&self, tick_secs: f64, echo: bool) -> Row {
        let csv = vec![
            fmt_timestamp(tick_secs),
            fmt_time_str(tick_secs),
            self.comm.clone(),
            self.cpu.to_string(),
            self.switch_in.to_string(),
            self.switch_out.to_string(),
            self.voluntary.to_string(),
            self.involuntary.to_string(),
        ];

        let console = echo.then(|| {
            format!(
                "{:<16} {:>4} {:>10} {:>10} {:>10} {:>12}",
                self.comm,
                self.cpu,
                self.switch_in,
                self.switch_out,
                self.voluntary,
                self.involuntary
            )
        });

        Row { csv, console }
    }
}

pub fn console_header() -> String {
    format!(
        "{:<16} {:>4} {:>10} {:>10} {:>10} {:>12}",
        "COMM", "CPU", "SWITCH_IN", "SWITCH_OUT", "VOLUNTARY", "INVOLUNTARY"
    )
}

#[cfg(feature = "bpf")]
pub use self::bpf_monitor::ContextSwitchMonitor;

#[cfg(feature = "bpf")]
mod bpf_monitor {
    use std::sync::Arc;

    use aya::Ebpf;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::capability::CapabilityReport;
    use crate::clock::MonotonicClock;
    use crate::config::{ContextSwitchConfig, TargetsConfig};
    use crate::error::{AttachError, LoadError};
    use crate::monitor::bpf::{attach_tracepoint, load_object, spawn_sweep_loop, take_hash_map};
    use crate::monitor::maps::{fixed_str, SwitchKey, SwitchValue};
    use crate::monitor::{Monitor, StatusTable};
    use crate::output::SinkHandle;

    const BPF_OBJ: &[u8] =
        aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/context_switch.bpf.o"));

    pub struct ContextSwitchMonitor {
        cfg: ContextSwitchConfig,
        targets: TargetsConfig,
        caps: Arc<CapabilityReport>,
        clock: MonotonicClock,
        ebpf: Option<Ebpf>,
    }

    impl ContextSwitchMonitor {
        pub fn new(
            cfg: ContextSwitchConfig,
            targets: TargetsConfig,
            caps: Arc<CapabilityReport>,
            clock: MonotonicClock,
        ) -> Self {
            Self {
                cfg,
                targets,
                caps,
                clock,
                ebpf: None,
            }
        }
    }

    impl Monitor for ContextSwitchMonitor {
        fn name(&self) -> &'static str {
            "context_switch"
        }

        fn csv_header(&self) -> &'static [&'static str] {
            CSV_HEADER
        }

        fn console_header(&self) -> String {
            console_header()
        }

        fn load(&mut self) -> Result<(), LoadError> {
            if self.ebpf.is_some() {
                return Ok(());
            }
            self.ebpf = Some(load_object(
                "context_switch",
                BPF_OBJ,
                &["context_switch_stats"],
                &self.targets,
            )?);
            Ok(())
        }

        fn attach(&mut self) -> Result<(), AttachError> {
            let ebpf = self.ebpf.as_mut().ok_or_else(|| {
                AttachError::NotAvailable("context_switch object not loaded".into())
            })?;

            if !self.caps.tracepoint_available("sched", "sched_switch") {
                return Err(AttachError::NotAvailable("sched:sched_switch".into()));
            }
            attach_tracepoint(ebpf, "trace_sched_switch", "sched", "sched_switch")
        }

        fn run(
            &mut self,
            sink: SinkHandle,
            cancel: CancellationToken,
            status: Arc<StatusTable>,
        ) -> anyhow::Result<Vec<JoinHandle<()>>> {
            let ebpf = self
                .ebpf
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("context_switch monitor not loaded"))?;

            let map = take_hash_map::<SwitchKey, SwitchValue>(ebpf, "context_switch_stats")?;
            let min_switches = self.cfg.min_switches;

            let handle = spawn_sweep_loop(
                "context_switch",
                map,
                self.cfg.interval,
                self.clock,
                sink,
                cancel,
                status,
                move |tick, key: &SwitchKey, value: &SwitchValue, echo| {
                    let record = SwitchRecord {
                        comm: fixed_str(&key.comm),
                        cpu: key.cpu,
                        switch_in: value.switch_in_count,
                        switch_out: value.switch_out_count,
                        voluntary: value.voluntary_count,
                        involuntary: value.involuntary_count,
                    };
                    if record.total_switches() < min_switches {
                        return None;
                    }
                    Some(record.encode(tick, echo))
                },
            );

            Ok(vec![handle])
        }

        fn unload(&mut self) {
            self.ebpf = None;
        }
    }
}
