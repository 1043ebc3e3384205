//! File open monitor.

use crate::output::row::{fmt_error_rate, fmt_latency_us, fmt_time_str, fmt_timestamp, Row};

pub const CSV_HEADER: &[&str] = &[
    "timestamp",
    "time_str",
    "comm",
    "operation",
    "filename",
    "count",
    "errors",
    "error_rate",
    "avg_lat_us",
    "min_lat_us",
    "max_lat_us",
    "flags",
];

pub const OP_OPEN: u32 = 0;
pub const OP_OPENAT: u32 = 1;

pub fn operation_str(operation: u32) -> &'static str {
    match operation {
        OP_OPEN => "OPEN",
        OP_OPENAT => "OPENAT",
        _ => "UNKNOWN",
    }
}

/// One aggregated (comm, operation, filename) row.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRecord {
    pub comm: String,
    pub operation: u32,
    pub filename: String,
    pub count: u64,
    pub error_count: u64,
    pub total_latency_ns: u64,
    pub min_latency_ns: u64,
    pub max_latency_ns: u64,
    /// Bitwise OR of every flag set observed for this (comm, file).
    pub flags_summary: u32,
}

impl OpenRecord {
    pub fn error_rate(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.error_count as f64 / self.count as f64
    }

    pub fn avg_lat_us(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total_latency_ns as f64 / self.count as f64 / 1000.0
    }

    pub fn min_lat_us(&self) -> f64 {
        self.min_latency_ns as f64 / 1000.0
    }

    pub fn max_lat_us(&self) -> f64 {
        self.max_latency_ns as f64 / 1000.0
    }

    pub fn encode(&self, tick_secs: f64, echo: bool) -> Row {
        let csv = vec![
            fmt_timestamp(tick_secs),
            fmt_time_str(tick_secs),
            self.comm.clone(),
            operation_str(self.operation).to_string(),
            self.filename.clone(),
            self.count.to_string(),
            self.error_count.to_string(),
            fmt_error_rate(self.error_rate()),
            fmt_latency_us(self.avg_lat_us()),
            fmt_latency_us(self.min_lat_us()),
            fmt_latency_us(self.max_lat_us()),
            self.flags_summary.to_string(),
        ];

        let console = echo.then(|| {
            format!(
                "{:<16} {:<7} {:>8} {:>8} {:>12.3} {:>10} {}",
                self.comm,
                operation_str(self.operation),
                self.count,
                self.error_count,
                self.avg_lat_us(),
                format!("{:#x}", self.flags_summary),
                self.filename
            )
        });

        Row { csv, console }
    }
}

pub fn console_header() -> String {
    format!(
        "{:<16} {:<7} {:>8} {:>8} {:>12} {:>10} {}",
        "COMM", "OP", "COUNT", "ERRORS", "AVG_LAT", "FLAGS", "FILENAME"
    )
}

#[cfg(feature = "bpf")]
pub use self::bpf_monitor::OpenMonitor;

#[cfg(feature = "bpf")]
mod bpf_monitor {
    use std::sync::Arc;

    use aya::Ebpf;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;
    use tracing::warn;

    use super::*;
    use crate::capability::CapabilityReport;
    use crate::clock::MonotonicClock;
    use crate::config::{OpenConfig, TargetsConfig};
    use crate::error::{AttachError, LoadError};
    use crate::monitor::bpf::{attach_tracepoint, load_object, spawn_sweep_loop, take_hash_map};
    use crate::monitor::maps::{fixed_str, OpenKey, OpenValue};
    use crate::monitor::{Monitor, StatusTable};
    use crate::output::SinkHandle;

    const BPF_OBJ: &[u8] = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/open.bpf.o"));

    /// Enter/exit pairs per operation. The legacy open pair is optional:
    /// openat-only kernels still give full coverage because libc routes
    /// open() through openat.
    const OPENAT_POINTS: &[(&str, &str, &str)] = &[
        ("trace_sys_enter_openat", "syscalls", "sys_enter_openat"),
        ("trace_sys_exit_openat", "syscalls", "sys_exit_openat"),
    ];

    const OPEN_POINTS: &[(&str, &str, &str)] = &[
        ("trace_sys_enter_open", "syscalls", "sys_enter_open"),
        ("trace_sys_exit_open", "syscalls", "sys_exit_open"),
    ];

    pub struct OpenMonitor {
        cfg: OpenConfig,
        targets: TargetsConfig,
        caps: Arc<CapabilityReport>,
        clock: MonotonicClock,
        ebpf: Option<Ebpf>,
    }

    impl OpenMonitor {
        pub fn new(
            cfg: OpenConfig,
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

    impl Monitor for OpenMonitor {
        fn name(&self) -> &'static str {
            "open"
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
                "open",
                BPF_OBJ,
                &["open_stats", "open_track", "open_key_heap"],
                &self.targets,
            )?);
            Ok(())
        }

        fn attach(&mut self) -> Result<(), AttachError> {
            let ebpf = self
                .ebpf
                .as_mut()
                .ok_or_else(|| AttachError::NotAvailable("open object not loaded".into()))?;

            for (prog, group, name) in OPENAT_POINTS {
                if !self.caps.tracepoint_available(group, name) {
                    return Err(AttachError::NotAvailable(format!("{group}:{name}")));
                }
                attach_tracepoint(ebpf, prog, group, name)?;
            }

            let open_pair_present = OPEN_POINTS
                .iter()
                .all(|(_, group, name)| self.caps.tracepoint_available(group, name));
            if open_pair_present {
                for (prog, group, name) in OPEN_POINTS {
                    attach_tracepoint(ebpf, prog, group, name)?;
                }
            } else {
                warn!("syscalls:sys_enter_open not present, tracking openat only");
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
                .ok_or_else(|| anyhow::anyhow!("open monitor not loaded"))?;

            let map = take_hash_map::<OpenKey, OpenValue>(ebpf, "open_stats")?;

            let handle = spawn_sweep_loop(
                "open",
                map,
                self.cfg.interval,
                self.clock,
                sink,
                cancel,
                status,
                |tick, key: &OpenKey, value: &OpenValue, echo| {
                    let record = OpenRecord {
                        comm: fixed_str(&key.comm),
                        operation: key.operation,
                        filename: fixed_str(&key.filename),
                        count: value.count,
                        error_count: value.error_count,
                        total_latency_ns: value.total_latency_ns,
                        min_latency_ns: value.min_latency_ns,
                        max_latency_ns: value.max_latency_ns,
                        flags_summary: value.flags_summary,
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

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> OpenRecord {
        OpenRecord {
            comm: "sshd".to_string(),
            operation: OP_OPENAT,
            filename: "/etc/passwd".to_string(),
            count: 5,
            error_count: 1,
            total_latency_ns: 50_000,
            min_latency_ns: 4_000,
            max_latency_ns: 30_000,
            flags_summary: 0o100000 | 0o2000000,
        }
    }

    #[test]
    fn test_operation_str() {
        assert_eq!(operation_str(OP_OPEN), "OPEN");
        assert_eq!(operation_str(OP_OPENAT), "OPENAT");
        assert_eq!(operation_str(42), "UNKNOWN");
    }

    #[test]
    fn test_latency_invariant() {
        let r = record();
        assert!(r.min_lat_us() <= r.avg_lat_us());
        assert!(r.avg_lat_us() <= r.max_lat_us());
    }

    #[test]
    fn test_encode() {
        let row = record().encode(1700000005.0, false);
        assert_eq!(row.csv.len(), CSV_HEADER.len());
        assert_eq!(row.csv[3], "OPENAT");
        assert_eq!(row.csv[4], "/etc/passwd");
        assert_eq!(row.csv[5], "5");
        assert_eq!(row.csv[6], "1");
        assert_eq!(row.csv[7], "0.2000");
        assert_eq!(row.csv[8], "10.000");
        assert_eq!(row.csv[9], "4.000");
        assert_eq!(row.csv[10], "30.000");
        assert_eq!(row.csv[11], (0o100000 | 0o2000000u32).to_string());
    }

    #[test]
    fn test_filename_with_comma_survives_encoding() {
        let mut r = record();
        r.filename = "/tmp/a,b".to_string();
        let row = r.encode(0.0, false);
        // The raw field keeps the comma; quoting happens at write time.
        assert_eq!(row.csv[4], "/tmp/a,b");
    }
}
