//! Block I/O monitor.

use crate::output::row::{
    fmt_latency_us, fmt_size_mb, fmt_throughput_mbps, fmt_time_str, fmt_timestamp, Row,
};

pub const CSV_HEADER: &[&str] = &[
    "timestamp",
    "time_str",
    "comm",
    "io_type",
    "io_type_str",
    "count",
    "total_bytes",
    "size_mb",
    "avg_latency_us",
    "min_latency_us",
    "max_latency_us",
    "throughput_mbps",
];

pub const BIO_TYPE_READ: u32 = 0x1;
pub const BIO_TYPE_WRITE: u32 = 0x2;
pub const BIO_TYPE_SYNC: u32 = 0x4;
pub const BIO_TYPE_FLUSH: u32 = 0x8;
pub const BIO_TYPE_DISCARD: u32 = 0x10;
pub const BIO_TYPE_METADATA: u32 = 0x20;
pub const BIO_TYPE_READAHEAD: u32 = 0x40;
pub const BIO_TYPE_NONE: u32 = 0x80;

/// Render the rwbs-derived bitfield, e.g. "WRITE|SYNC".
pub fn io_type_str(bio_type: u32) -> String {
    let mut parts = Vec::new();
    if bio_type & BIO_TYPE_READ != 0 {
        parts.push("READ");
    }
    if bio_type & BIO_TYPE_WRITE != 0 {
        parts.push("WRITE");
    }
    if bio_type & BIO_TYPE_FLUSH != 0 {
        parts.push("FLUSH");
    }
    if bio_type & BIO_TYPE_DISCARD != 0 {
        parts.push("DISCARD");
    }
    if bio_type & BIO_TYPE_METADATA != 0 {
        parts.push("META");
    }
    if bio_type & BIO_TYPE_READAHEAD != 0 {
        parts.push("READAHEAD");
    }
    if bio_type & BIO_TYPE_NONE != 0 {
        parts.push("NONE");
    }
    if bio_type & BIO_TYPE_SYNC != 0 {
        parts.push("SYNC");
    }
    if parts.is_empty() {
        "UNKNOWN".to_string()
    } else {
        parts.join("|")
    }
}

/// One aggregated (comm, io_type) row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BioRecord {
    pub comm: String,
    pub bio_type: u32,
    pub count: u64,
    pub total_bytes: u64,
    pub total_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
}

impl BioRecord {
    pub fn avg_latency_us(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total_ns as f64 / self.count as f64 / 1000.0
    }

    pub fn min_latency_us(&self) -> f64 {
        self.min_ns as f64 / 1000.0
    }

    pub fn max_latency_us(&self) -> f64 {
        self.max_ns as f64 / 1000.0
    }

    /// Derived throughput in MB/s: bytes per nanosecond scaled by 1e3.
    pub fn throughput_mbps(&self) -> f64 {
        if self.total_ns == 0 {
            return 0.0;
        }
        self.total_bytes as f64 / self.total_ns as f64 * 1e3
    }

    pub fn encode(&self, tick_secs: f64, echo: bool) -> Row {
        let type_str = io_type_str(self.bio_type);

        let csv = vec![
            fmt_timestamp(tick_secs),
            fmt_time_str(tick_secs),
            self.comm.clone(),
            self.bio_type.to_string(),
            type_str.clone(),
            self.count.to_string(),
            self.total_bytes.to_string(),
            fmt_size_mb(self.total_bytes),
            fmt_latency_us(self.avg_latency_us()),
            fmt_latency_us(self.min_latency_us()),
            fmt_latency_us(self.max_latency_us()),
            fmt_throughput_mbps(self.throughput_mbps()),
        ];

        let console = echo.then(|| {
            format!(
                "{:<16} {:<18} {:>8} {:>12} {:>12.3} {:>12.3} {:>12.3} {:>10.2}",
                self.comm,
                type_str,
                self.count,
                self.total_bytes,
                self.avg_latency_us(),
                self.min_latency_us(),
                self.max_latency_us(),
                self.throughput_mbps()
            )
        });

        Row { csv, console }
    }
}

pub fn console_header() -> String {
    format!(
        "{:<16} {:<18} {:>8} {:>12} {:>12} {:>12} {:>12} {:>10}",
        "COMM", "IO_TYPE", "COUNT", "BYTES", "AVG_LAT", "MIN_LAT", "MAX_LAT", "MB/S"
    )
}

#[cfg(feature = "bpf")]
pub use self::bpf_monitor::BioMonitor;

#[cfg(feature = "bpf")]
mod bpf_monitor {
    use std::sync::Arc;

    use aya::Ebpf;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::capability::CapabilityReport;
    use crate::clock::MonotonicClock;
    use crate::config::{BioConfig, TargetsConfig};
    use crate::error::{AttachError, LoadError};
    use crate::monitor::bpf::{attach_tracepoint, load_object, spawn_sweep_loop, take_hash_map};
    use crate::monitor::maps::{fixed_str, BioKey, BioValue};
    use crate::monitor::{Monitor, StatusTable};
    use crate::output::SinkHandle;

    const BPF_OBJ: &[u8] = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/bio.bpf.o"));

    const ATTACH_POINTS: &[(&str, &str, &str)] = &[
        ("trace_block_rq_issue", "block", "block_rq_issue"),
        ("trace_block_rq_complete", "block", "block_rq_complete"),
    ];

    pub struct BioMonitor {
        cfg: BioConfig,
        targets: TargetsConfig,
        caps: Arc<CapabilityReport>,
        clock: MonotonicClock,
        ebpf: Option<Ebpf>,
    }

    impl BioMonitor {
        pub fn new(
            cfg: BioConfig,
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

    impl Monitor for BioMonitor {
        fn name(&self) -> &'static str {
            "bio"
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
            self.ebpf = Some(load_object("bio", BPF_OBJ, &["bio_stats", "bio_track"], &self.targets)?);
            Ok(())
        }

        fn attach(&mut self) -> Result<(), AttachError> {
            let ebpf = self
                .ebpf
                .as_mut()
                .ok_or_else(|| AttachError::NotAvailable("bio object not loaded".into()))?;

            // Issue/complete pair both required: an unpaired issue only
            // leaks tracking entries, an unpaired complete sees nothing.
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
                .ok_or_else(|| anyhow::anyhow!("bio monitor not loaded"))?;

            let map = take_hash_map::<BioKey, BioValue>(ebpf, "bio_stats")?;
            let min_latency_us = self.cfg.min_latency_us;

            let handle = spawn_sweep_loop(
                "bio",
                map,
                self.cfg.interval,
                self.clock,
                sink,
                cancel,
                status,
                move |tick, key: &BioKey, value: &BioValue, echo| {
                    let record = BioRecord {
                        comm: fixed_str(&key.comm),
                        bio_type: key.bio_type,
                        count: value.count,
                        total_bytes: value.total_bytes,
                        total_ns: value.total_ns,
                        min_ns: value.min_ns,
                        max_ns: value.max_ns,
                    };
                    if min_latency_us > 0.0 && record.avg_latency_us() < min_latency_us {
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
