//! IRQ frequency monitor.

use crate::output::row::{fmt_time_str, fmt_timestamp, Row};

pub const CSV_HEADER: &[&str] = &[
    "timestamp",
    "time_str",
    "comm",
    "irq_type",
    "irq_type_str",
    "cpu",
    "count",
];

pub const IRQ_TYPE_HARDWARE: u32 = 0x1;
pub const IRQ_TYPE_SOFTWARE: u32 = 0x2;
pub const IRQ_TYPE_TIMER: u32 = 0x4;
pub const IRQ_TYPE_NETWORK: u32 = 0x8;
pub const IRQ_TYPE_BLOCK: u32 = 0x10;

/// Render the irq_type bitfield, e.g. "SOFTWARE|NETWORK".
pub fn irq_type_str(irq_type: u32) -> String {
    let mut parts = Vec::new();
    if irq_type & IRQ_TYPE_HARDWARE != 0 {
        parts.push("HARDWARE");
    }
    if irq_type & IRQ_TYPE_SOFTWARE != 0 {
        parts.push("SOFTWARE");
    }
    if irq_type & IRQ_TYPE_TIMER != 0 {
        parts.push("TIMER");
    }
    if irq_type & IRQ_TYPE_NETWORK != 0 {
        parts.push("NETWORK");
    }
    if irq_type & IRQ_TYPE_BLOCK != 0 {
        parts.push("BLOCK");
    }
    if parts.is_empty() {
        "UNKNOWN".to_string()
    } else {
        parts.join("|")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptRecord {
    pub comm: String,
    pub irq_type: u32,
    pub cpu: u32,
    pub count: u64,
}

pub fn console_header() -> String {
    format!(
        "{:<16} {:<18} {:>4} {:>10}",
        "COMM", "IRQ_TYPE", "CPU", "COUNT"
    )
}

impl InterruptRecord {
    pub fn encode(&self, tick_secs: f64, echo: bool) -> Row {
        let type_str = irq_type_str(self.irq_type);

        let csv = vec![
            fmt_timestamp(tick_secs),
            fmt_time_str(tick_secs),
            self.comm.clone(),
            self.irq_type.to_string(),
            type_str.clone(),
            self.cpu.to_string(),
            self.count.to_string(),
        ];

        let console = echo.then(|| {
            format!(
                "{:<16} {:<18} {:>4} {:>10}",
                self.comm, type_str, self.cpu, self.count
            )
        });

        Row { csv, console }
    }
}

#[cfg(feature = "bpf")]
pub use self::bpf_monitor::InterruptMonitor;

#[cfg(feature = "bpf")]
mod bpf_monitor {
    use std::sync::Arc;

    use aya::Ebpf;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::capability::CapabilityReport;
    use crate::clock::MonotonicClock;
    use crate::config::{InterruptConfig, TargetsConfig};
    use crate::error::{AttachError, LoadError};
    use crate::monitor::bpf::{attach_tracepoint, load_object, spawn_sweep_loop, take_hash_map};
    use crate::monitor::maps::{fixed_str, CounterValue, InterruptKey};
    use crate::monitor::{Monitor, StatusTable};
    use crate::output::SinkHandle;

    const BPF_OBJ: &[u8] =
        aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/interrupt.bpf.o"));

    const ATTACH_POINTS: &[(&str, &str, &str)] = &[
        ("trace_irq_handler_exit", "irq", "irq_handler_exit"),
        ("trace_softirq_exit", "irq", "softirq_exit"),
    ];

    pub struct InterruptMonitor {
        cfg: InterruptConfig,
        targets: TargetsConfig,
        caps: Arc<CapabilityReport>,
        clock: MonotonicClock,
        ebpf: Option<Ebpf>,
    }

    impl InterruptMonitor {
        pub fn new(
            cfg: InterruptConfig,
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

    impl Monitor for InterruptMonitor {
        fn name(&self) -> &'static str {
            "interrupt"
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
            self.ebpf = Some(load_object("interrupt", BPF_OBJ, &["interrupt_stats"], &self.targets)?);
            Ok(())
        }

        fn attach(&mut self) -> Result<(), AttachError> {
            let ebpf = self
                .ebpf
                .as_mut()
                .ok_or_else(|| AttachError::NotAvailable("interrupt object not loaded".into()))?;

            for (prog, group, name) in ATTACH_POINTS {
                if !self.caps.tracepoint_available(group, name) {
                    return Err(AttachError::NotAvailable(format!("{group}:{name}")));
                }
                attach_tracepoint(ebpf, prog, group, name)?;
            }
            Ok(())
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
                .ok_or_else(|| anyhow::anyhow!("interrupt monitor not loaded"))?;

            let map = take_hash_map::<InterruptKey, CounterValue>(ebpf, "interrupt_stats")?;

            let handle = spawn_sweep_loop(
                "interrupt",
                map,
                self.cfg.interval,
                self.clock,
                sink,
                cancel,
                status,
                |tick, key: &InterruptKey, value: &CounterValue, echo| {
                    let record = InterruptRecord {
                        comm: fixed_str(&key.comm),
                        irq_type: key.irq_type,
                        cpu: key.cpu,
                        count: value.count,
                    };
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
