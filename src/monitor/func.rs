//! Kernel function call-count monitor.
//!
//! Wildcard patterns are resolved against kallsyms at load time and each
//! matched symbol gets one kprobe slot; every slot feeds the shared
//! (comm, func_id) counter map. The compiled object carries a fixed slot
//! pool, so probe_limit is additionally capped by the pool size.

use crate::output::row::{fmt_time_str, fmt_timestamp, Row};

pub const CSV_HEADER: &[&str] = &["timestamp", "time_str", "comm", "func_name", "count"];

/// Kprobe slot programs compiled into bpf/func.c.
pub const FUNC_PROBE_SLOTS: usize = 16;

/// One aggregated (comm, function) row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncRecord {
    pub comm: String,
    pub func_name: String,
    pub count: u64,
}

pub fn console_header() -> String {
    format!("{:<16} {:<32} {:>10}", "COMM", "FUNC_NAME", "COUNT")
}

impl FuncRecord {
    pub fn encode(&self, tick_secs: f64, echo: bool) -> Row {
        let csv = vec![
            fmt_timestamp(tick_secs),
            fmt_time_str(tick_secs),
            self.comm.clone(),
            self.func_name.clone(),
            self.count.to_string(),
        ];

        let console = echo.then(|| {
            format!(
                "{:<16} {:<32} {:>10}",
                self.comm, self.func_name, self.count
            )
        });

        Row { csv, console }
    }
}

#[cfg(feature = "bpf")]
pub use self::bpf_monitor::FuncMonitor;

#[cfg(feature = "bpf")]
mod bpf_monitor {
    use std::sync::Arc;

    use aya::Ebpf;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;
    use tracing::{info, warn};

    use super::*;
    use crate::capability::CapabilityReport;
    use crate::clock::MonotonicClock;
    use crate::config::{FuncConfig, TargetsConfig};
    use crate::error::{AttachError, LoadError};
    use crate::monitor::bpf::{attach_kprobe, load_object, spawn_sweep_loop, take_hash_map};
    use crate::monitor::maps::{fixed_str, CounterValue, FuncKey};
    use crate::monitor::{Monitor, StatusTable};
    use crate::output::SinkHandle;

    const BPF_OBJ: &[u8] =
        aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/func.bpf.o"));

    pub struct FuncMonitor {
        cfg: FuncConfig,
        targets: TargetsConfig,
        caps: Arc<CapabilityReport>,
        clock: MonotonicClock,
        ebpf: Option<Ebpf>,
        /// Resolved symbol per slot index; index is the kernel-side func_id.
        symbols: Vec<String>,
        attached: usize,
    }

    impl FuncMonitor {
        pub fn new(
            cfg: FuncConfig,
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
                symbols: Vec::new(),
                attached: 0,
            }
        }
    }

    impl Monitor for FuncMonitor {
        fn name(&self) -> &'static str {
            "func"
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

            let limit = self.cfg.probe_limit.min(FUNC_PROBE_SLOTS);
            if self.cfg.probe_limit > FUNC_PROBE_SLOTS {
                warn!(
                    requested = self.cfg.probe_limit,
                    slots = FUNC_PROBE_SLOTS,
                    "probe_limit exceeds compiled slot pool, capping",
                );
            }

            self.symbols = self.caps.resolve_ksyms(&self.cfg.patterns, limit);
            if self.symbols.is_empty() {
                return Err(LoadError::MissingSymbol(format!(
                    "no kernel symbols match {:?}",
                    self.cfg.patterns
                )));
            }

            info!(
                count = self.symbols.len(),
                patterns = ?self.cfg.patterns,
                "resolved kernel functions",
            );

            self.ebpf = Some(load_object("func", BPF_OBJ, &["func_stats"], &self.targets)?);
            Ok(())
        }

        fn attach(&mut self) -> Result<(), AttachError> {
            let ebpf = self
                .ebpf
                .as_mut()
                .ok_or_else(|| AttachError::NotAvailable("func object not loaded".into()))?;

            self.attached = 0;
            for (slot, symbol) in self.symbols.iter().enumerate() {
                let prog = format!("trace_func_{slot}");
                match attach_kprobe(ebpf, &prog, symbol) {
                    Ok(()) => self.attached += 1,
                    Err(e) => warn!(symbol = %symbol, error = %e, "kprobe attach failed, skipping"),
                }
            }

            if self.attached == 0 {
                return Err(AttachError::NotAvailable(
                    "no function kprobes could be attached".into(),
                ));
            }

            info!(attached = self.attached, "function probes attached");
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
                .ok_or_else(|| anyhow::anyhow!("func monitor not loaded"))?;

            let map = take_hash_map::<FuncKey, CounterValue>(ebpf, "func_stats")?;
            let symbols = self.symbols.clone();

            let handle = spawn_sweep_loop(
                "func",
                map,
                self.cfg.interval,
                self.clock,
                sink,
                cancel,
                status,
                move |tick, key: &FuncKey, value: &CounterValue, echo| {
                    let record = FuncRecord {
                        comm: fixed_str(&key.comm),
                        func_name: symbols
                            .get(key.func_id as usize)
                            .cloned()
                            .unwrap_or_else(|| format!("unknown_{}", key.func_id)),
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
