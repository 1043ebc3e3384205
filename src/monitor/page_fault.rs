//! Page fault monitor.
//!
//! Fault subtype comes from the hardware error code; the NUMA node column
//! is a user-side enrichment resolved from the sysfs cpu-to-node map at
//! startup.

use std::collections::HashMap;
use std::path::Path;

use crate::output::row::{fmt_time_str, fmt_timestamp, Row};

pub const CSV_HEADER: &[&str] = &[
    "timestamp",
    "time_str",
    "comm",
    "fault_type",
    "fault_type_str",
    "cpu",
    "numa_node",
    "count",
];

pub const FAULT_TYPE_MINOR: u32 = 0x1;
pub const FAULT_TYPE_MAJOR: u32 = 0x2;
pub const FAULT_TYPE_WRITE: u32 = 0x4;
pub const FAULT_TYPE_USER: u32 = 0x8;

/// Render the fault_type bitfield, e.g. "MAJOR|WRITE|USER".
pub fn fault_type_str(fault_type: u32) -> String {
    let mut parts = Vec::new();
    if fault_type & FAULT_TYPE_MINOR != 0 {
        parts.push("MINOR");
    }
    if fault_type & FAULT_TYPE_MAJOR != 0 {
        parts.push("MAJOR");
    }
    if fault_type & FAULT_TYPE_WRITE != 0 {
        parts.push("WRITE");
    }
    if fault_type & FAULT_TYPE_USER != 0 {
        parts.push("USER");
    }
    if parts.is_empty() {
        "UNKNOWN".to_string()
    } else {
        parts.join("|")
    }
}

/// CPU to NUMA node mapping read from /sys/devices/system/node.
#[derive(Debug, Default, Clone)]
pub struct NumaMap {
    cpu_to_node: HashMap<u32, i32>,
}

impl NumaMap {
    /// Scan `base` (normally /sys/devices/system/node) for nodeN/cpulist.
    pub fn from_sysfs(base: &Path) -> Self {
        let mut cpu_to_node = HashMap::new();

        let Ok(entries) = std::fs::read_dir(base) else {
            return Self::default();
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(node_id) = name
                .strip_prefix("node")
                .and_then(|n| n.parse::<i32>().ok())
            else {
                continue;
            };

            let Ok(cpulist) = std::fs::read_to_string(entry.path().join("cpulist")) else {
                continue;
            };

            for cpu in parse_cpu_list(cpulist.trim()) {
                cpu_to_node.insert(cpu, node_id);
            }
        }

        Self { cpu_to_node }
    }

    pub fn from_pairs(pairs: &[(u32, i32)]) -> Self {
        Self {
            cpu_to_node: pairs.iter().copied().collect(),
        }
    }

    /// Node for a CPU, -1 when unknown.
    pub fn node_of(&self, cpu: u32) -> i32 {
        self.cpu_to_node.get(&cpu).copied().unwrap_or(-1)
    }
}

/// Parse a sysfs CPU list like "0-3,8,10-11".
pub fn parse_cpu_list(text: &str) -> Vec<u32> {
    let mut cpus = Vec::new();

    for part in text.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if let Some((start, end)) = part.split_once('-') {
            let (Ok(start), Ok(end)) = (start.trim().parse::<u32>(), end.trim().parse::<u32>())
            else {
                continue;
            };
            if end < start {
                continue;
            }
            cpus.extend(start..=end);
        } else if let Ok(cpu) = part.parse::<u32>() {
            cpus.push(cpu);
        }
    }

    cpus
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFaultRecord {
    pub comm: String,
    pub fault_type: u32,
    pub cpu: u32,
    pub numa_node: i32,
    pub count: u64,
}

pub fn console_header() -> String {
    format!(
        "{:<16} {:<18} {:>4} {:>5} {:>10}",
        "COMM", "FAULT_TYPE", "CPU", "NODE", "COUNT"
    )
}

impl PageFaultRecord {
    pub fn encode(&self, tick_secs: f64, echo: bool) -> Row {
        let type_str = fault_type_str(self.fault_type);

        let csv = vec![
            fmt_timestamp(tick_secs),
            fmt_time_str(tick_secs),
            self.comm.clone(),
            self.fault_type.to_string(),
            type_str.clone(),
            self.cpu.to_string(),
            self.numa_node.to_string(),
            self.count.to_string(),
        ];

        let console = echo.then(|| {
            format!(
                "{:<16} {:<18} {:>4} {:>5} {:>10}",
                self.comm, type_str, self.cpu, self.numa_node, self.count
            )
        });

        Row { csv, console }
    }
}

#[cfg(feature = "bpf")]
pub use self::bpf_monitor::PageFaultMonitor;

#[cfg(feature = "bpf")]
mod bpf_monitor {
    use std::sync::Arc;

    use aya::Ebpf;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::capability::CapabilityReport;
    use crate::clock::MonotonicClock;
    use crate::config::{PageFaultConfig, TargetsConfig};
    use crate::error::{AttachError, LoadError};
    use crate::monitor::bpf::{attach_tracepoint, load_object, spawn_sweep_loop, take_hash_map};
    use crate::monitor::maps::{fixed_str, CounterValue, PageFaultKey};
    use crate::monitor::{Monitor, StatusTable};
    use crate::output::SinkHandle;

    const BPF_OBJ: &[u8] =
        aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/page_fault.bpf.o"));

    const NODE_SYSFS: &str = "/sys/devices/system/node";

    const ATTACH_POINTS: &[(&str, &str, &str)] = &[
        ("trace_page_fault_user", "exceptions", "page_fault_user"),
        ("trace_page_fault_kernel", "exceptions", "page_fault_kernel"),
    ];

    pub struct PageFaultMonitor {
        cfg: PageFaultConfig,
        targets: TargetsConfig,
        caps: Arc<CapabilityReport>,
        clock: MonotonicClock,
        numa: NumaMap,
        ebpf: Option<Ebpf>,
    }

    impl PageFaultMonitor {
        pub fn new(
            cfg: PageFaultConfig,
            targets: TargetsConfig,
            caps: Arc<CapabilityReport>,
            clock: MonotonicClock,
        ) -> Self {
            Self {
                cfg,
                targets,
                caps,
                clock,
                numa: NumaMap::from_sysfs(std::path::Path::new(NODE_SYSFS)),
                ebpf: None,
            }
        }
    }

    impl Monitor for PageFaultMonitor {
        fn name(&self) -> &'static str {
            "page_fault"
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
            self.ebpf = Some(load_object("page_fault", BPF_OBJ, &["page_fault_stats"], &self.targets)?);
            Ok(())
        }

        fn attach(&mut self) -> Result<(), AttachError> {
            let ebpf = self
                .ebpf
                .as_mut()
                .ok_or_else(|| AttachError::NotAvailable("page_fault object not loaded".into()))?;

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
                .ok_or_else(|| anyhow::anyhow!("page_fault monitor not loaded"))?;

            let map = take_hash_map::<PageFaultKey, CounterValue>(ebpf, "page_fault_stats")?;
            let numa = self.numa.clone();

            let handle = spawn_sweep_loop(
                "page_fault",
                map,
                self.cfg.interval,
                self.clock,
                sink,
                cancel,
                status,
                move |tick, key: &PageFaultKey, value: &CounterValue, echo| {
                    let record = PageFaultRecord {
                        comm: fixed_str(&key.comm),
                        fault_type: key.fault_type,
                        cpu: key.cpu,
                        numa_node: numa.node_of(key.cpu),
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
