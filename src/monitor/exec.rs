//! Exec monitor: one row per execve invocation.
//!
//! The only event-stream monitor: records arrive through a per-CPU perf
//! ring instead of a periodic map sweep. The attach path is picked at
//! load time from the capability report and frozen for the run, header
//! included: the execve tracepoint pair gives argv plus exit-code
//! pairing, the kprobe fallback gives only the filename.

use crate::error::DrainError;
use crate::output::row::{fmt_time_str, fmt_timestamp, Row};

pub const CSV_HEADER_TRACEPOINT: &[&str] = &[
    "timestamp",
    "time_str",
    "comm",
    "uid",
    "pid",
    "ppid",
    "ret",
    "argv",
];

pub const CSV_HEADER_KPROBE: &[&str] =
    &["timestamp", "time_str", "uid", "pid", "comm", "filename"];

/// Which attachment variant the monitor is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecPath {
    /// syscalls:sys_enter_execve + sys_exit_execve.
    Tracepoint,
    /// kprobe on the execve entry symbol; no ppid/ret pairing.
    Kprobe,
}

/// Wire size of `struct exec_event` in bpf/exec.c.
pub const EXEC_EVENT_SIZE: usize = 296;

const COMM_OFF: usize = 24;
const ARGV_OFF: usize = 40;

/// One decoded execve event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecEvent {
    pub timestamp_ns: u64,
    pub uid: u32,
    pub pid: u32,
    pub ppid: u32,
    pub ret: i32,
    pub comm: String,
    /// argv tokens on the tracepoint path, the filename on the kprobe path.
    pub argv: String,
}

/// Decode one perf ring sample into an [`ExecEvent`].
pub fn parse_exec_event(data: &[u8]) -> Result<ExecEvent, DrainError> {
    if data.len() < EXEC_EVENT_SIZE {
        return Err(DrainError::Deserialise(format!(
            "exec event too short: {} bytes",
            data.len()
        )));
    }

    Ok(ExecEvent {
        timestamp_ns: read_u64_le(data, 0),
        uid: read_u32_le(data, 8),
        pid: read_u32_le(data, 12),
        ppid: read_u32_le(data, 16),
        ret: read_u32_le(data, 20) as i32,
        comm: super::maps::fixed_str(&data[COMM_OFF..COMM_OFF + 16]),
        argv: super::maps::fixed_str(&data[ARGV_OFF..ARGV_OFF + 256]),
    })
}

#[inline]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

#[inline]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

pub fn csv_header(path: ExecPath) -> &'static [&'static str] {
    match path {
        ExecPath::Tracepoint => CSV_HEADER_TRACEPOINT,
        ExecPath::Kprobe => CSV_HEADER_KPROBE,
    }
}

pub fn console_header(path: ExecPath) -> String {
    match path {
        ExecPath::Tracepoint => format!(
            "{:<26} {:<16} {:>6} {:>8} {:>8} {:>5} {}",
            "TIME", "COMM", "UID", "PID", "PPID", "RET", "ARGS"
        ),
        ExecPath::Kprobe => format!(
            "{:<26} {:>6} {:>8} {:<16} {}",
            "TIME", "UID", "PID", "COMM", "FILENAME"
        ),
    }
}

impl ExecEvent {
    pub fn encode(&self, path: ExecPath, ts_secs: f64, echo: bool) -> Row {
        let time_str = fmt_time_str(ts_secs);

        let csv = match path {
            ExecPath::Tracepoint => vec![
                fmt_timestamp(ts_secs),
                time_str.clone(),
                self.comm.clone(),
                self.uid.to_string(),
                self.pid.to_string(),
                self.ppid.to_string(),
                self.ret.to_string(),
                self.argv.clone(),
            ],
            ExecPath::Kprobe => vec![
                fmt_timestamp(ts_secs),
                time_str.clone(),
                self.uid.to_string(),
                self.pid.to_string(),
                self.comm.clone(),
                self.argv.clone(),
            ],
        };

        let console = echo.then(|| match path {
            ExecPath::Tracepoint => format!(
                "{:<26} {:<16} {:>6} {:>8} {:>8} {:>5} {}",
                time_str, self.comm, self.uid, self.pid, self.ppid, self.ret, self.argv
            ),
            ExecPath::Kprobe => format!(
                "{:<26} {:>6} {:>8} {:<16} {}",
                time_str, self.uid, self.pid, self.comm, self.argv
            ),
        });

        Row { csv, console }
    }
}

#[cfg(feature = "bpf")]
pub use self::bpf_monitor::ExecMonitor;

#[cfg(feature = "bpf")]
mod bpf_monitor {
    use std::sync::Arc;

    use aya::maps::perf::AsyncPerfEventArray;
    use aya::util::online_cpus;
    use aya::Ebpf;
    use bytes::BytesMut;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, info, warn};

    use super::*;
    use crate::capability::CapabilityReport;
    use crate::clock::MonotonicClock;
    use crate::config::{ExecConfig, TargetsConfig};
    use crate::error::{AttachError, LoadError, MAX_CONSECUTIVE_DRAIN_ERRORS};
    use crate::monitor::bpf::{attach_kprobe, attach_tracepoint, load_object};
    use crate::monitor::{Monitor, MonitorState, StatusTable};
    use crate::output::SinkHandle;

    const BPF_OBJ: &[u8] = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/exec.bpf.o"));

    /// Fallback symbols in probing order.
    const KPROBE_SYMBOLS: &[(&str, &str)] = &[
        ("__x64_sys_execve", "kprobe_execve_wrapped"),
        ("__ia32_sys_execve", "kprobe_execve_wrapped"),
        ("sys_execve", "kprobe_execve_plain"),
    ];

    /// Per-CPU read buffers handed to read_events.
    const PERF_READ_BUFFERS: usize = 16;

    pub struct ExecMonitor {
        #[allow(dead_code)]
        cfg: ExecConfig,
        targets: TargetsConfig,
        caps: Arc<CapabilityReport>,
        clock: MonotonicClock,
        ebpf: Option<Ebpf>,
        path: ExecPath,
        kprobe: Option<(&'static str, &'static str)>,
    }

    impl ExecMonitor {
        pub fn new(
            cfg: ExecConfig,
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
                path: ExecPath::Tracepoint,
                kprobe: None,
            }
        }
    }

    impl Monitor for ExecMonitor {
        fn name(&self) -> &'static str {
            "exec"
        }

        fn csv_header(&self) -> &'static [&'static str] {
            csv_header(self.path)
        }

        fn console_header(&self) -> String {
            console_header(self.path)
        }

        fn load(&mut self) -> Result<(), LoadError> {
            if self.ebpf.is_some() {
                return Ok(());
            }

            // First success wins: tracepoint pair, then the kprobe list.
            if self.caps.tracepoint_available("syscalls", "sys_enter_execve")
                && self.caps.tracepoint_available("syscalls", "sys_exit_execve")
            {
                self.path = ExecPath::Tracepoint;
            } else {
                let fallback = KPROBE_SYMBOLS
                    .iter()
                    .find(|(symbol, _)| self.caps.ksym_exists(symbol))
                    .copied();

                match fallback {
                    Some((symbol, prog)) => {
                        info!(symbol, "execve tracepoints unavailable, using kprobe path");
                        self.path = ExecPath::Kprobe;
                        self.kprobe = Some((symbol, prog));
                    }
                    None => {
                        return Err(LoadError::MissingSymbol(
                            "no execve tracepoint or kprobe symbol available".into(),
                        ));
                    }
                }
            }

            self.ebpf = Some(load_object(
                "exec",
                BPF_OBJ,
                &["exec_events", "exec_info"],
                &self.targets,
            )?);
            Ok(())
        }

        fn attach(&mut self) -> Result<(), AttachError> {
            let ebpf = self
                .ebpf
                .as_mut()
                .ok_or_else(|| AttachError::NotAvailable("exec object not loaded".into()))?;

            match self.path {
                ExecPath::Tracepoint => {
                    attach_tracepoint(
                        ebpf,
                        "trace_sys_enter_execve",
                        "syscalls",
                        "sys_enter_execve",
                    )?;
                    attach_tracepoint(
                        ebpf,
                        "trace_sys_exit_execve",
                        "syscalls",
                        "sys_exit_execve",
                    )?;
                }
                ExecPath::Kprobe => {
                    let (symbol, prog) = self
                        .kprobe
                        .ok_or_else(|| AttachError::NotAvailable("execve kprobe".into()))?;
                    attach_kprobe(ebpf, prog, symbol)?;
                }
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
                .ok_or_else(|| anyhow::anyhow!("exec monitor not loaded"))?;

            let events_map = ebpf
                .take_map("exec_events")
                .ok_or_else(|| anyhow::anyhow!("exec_events map not found"))?;
            let mut perf = AsyncPerfEventArray::try_from(events_map)?;

            let cpus = online_cpus().map_err(|(_, e)| anyhow::anyhow!("online cpus: {e}"))?;
            let mut handles = Vec::with_capacity(cpus.len());

            for cpu in cpus {
                let mut buf = perf.open(cpu, None)?;
                let sink = sink.clone();
                let cancel = cancel.clone();
                let status = Arc::clone(&status);
                let clock = self.clock;
                let path = self.path;

                handles.push(tokio::spawn(async move {
                    let mut buffers: Vec<BytesMut> = (0..PERF_READ_BUFFERS)
                        .map(|_| BytesMut::with_capacity(EXEC_EVENT_SIZE * 2))
                        .collect();
                    let mut consecutive_errors: u32 = 0;

                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,

                            events = buf.read_events(&mut buffers) => {
                                let events = match events {
                                    Ok(events) => {
                                        consecutive_errors = 0;
                                        events
                                    }
                                    Err(e) => {
                                        consecutive_errors += 1;
                                        let failed = consecutive_errors
                                            >= MAX_CONSECUTIVE_DRAIN_ERRORS;
                                        let err = crate::error::DrainError::RingBuffer(
                                            e.to_string(),
                                        );
                                        warn!(cpu, error = %err, "perf ring read failed");
                                        status.record_drain_error("exec", &err, failed);
                                        if failed {
                                            return;
                                        }
                                        continue;
                                    }
                                };

                                // Lost samples do not abort the monitor.
                                if events.lost > 0 {
                                    status.record_dropped("exec", events.lost as u64);
                                }

                                for data in buffers.iter().take(events.read) {
                                    match parse_exec_event(data) {
                                        Ok(event) => {
                                            let ts = clock.to_epoch_secs(event.timestamp_ns);
                                            let row = event.encode(
                                                path,
                                                ts,
                                                sink.echo_console(),
                                            );
                                            sink.submit(row).await;
                                        }
                                        Err(e) => {
                                            debug!(cpu, error = %e, "exec event parse error");
                                            status.record_drain_error("exec", &e, false);
                                        }
                                    }
                                }
                            }
                        }
                    }

                    status.set_state("exec", MonitorState::Stopping);
                }));
            }

            Ok(handles)
        }

        fn unload(&mut self) {
            self.ebpf = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(comm: &str, argv: &str) -> Vec<u8> {
        let mut data = Vec::with_capacity(EXEC_EVENT_SIZE);
        data.extend_from_slice(&123_456_789u64.to_le_bytes()); // timestamp
        data.extend_from_slice(&1000u32.to_le_bytes()); // uid
        data.extend_from_slice(&4242u32.to_le_bytes()); // pid
        data.extend_from_slice(&1u32.to_le_bytes()); // ppid
        data.extend_from_slice(&0i32.to_le_bytes()); // ret

        let mut comm_bytes = [0u8; 16];
        comm_bytes[..comm.len()].copy_from_slice(comm.as_bytes());
        data.extend_from_slice(&comm_bytes);

        let mut argv_bytes = [0u8; 256];
        argv_bytes[..argv.len()].copy_from_slice(argv.as_bytes());
        data.extend_from_slice(&argv_bytes);

        data
    }

    #[test]
    fn test_parse_exec_event() {
        let data = sample_event("sh", "/bin/true");
        let event = parse_exec_event(&data).expect("parse");

        assert_eq!(event.timestamp_ns, 123_456_789);
        assert_eq!(event.uid, 1000);
        assert_eq!(event.pid, 4242);
        assert_eq!(event.ppid, 1);
        assert_eq!(event.ret, 0);
        assert_eq!(event.comm, "sh");
        assert_eq!(event.argv, "/bin/true");
    }

    #[test]
    fn test_parse_negative_ret() {
        let mut data = sample_event("bash", "/nope");
        data[20..24].copy_from_slice(&(-2i32).to_le_bytes());

        let event = parse_exec_event(&data).expect("parse");
        assert_eq!(event.ret, -2);
    }

    #[test]
    fn test_parse_truncated() {
        let data = sample_event("sh", "/bin/true");
        let err = parse_exec_event(&data[..100]).unwrap_err();
        assert!(matches!(err, DrainError::Deserialise(_)));
    }

    #[test]
    fn test_parse_allows_trailing_padding() {
        let mut data = sample_event("sh", "/bin/true");
        data.extend_from_slice(&[0u8; 24]);
        assert!(parse_exec_event(&data).is_ok());
    }

    #[test]
    fn test_encode_tracepoint_path() {
        let event = parse_exec_event(&sample_event("sh", "/bin/true -x")).expect("parse");
        let row = event.encode(ExecPath::Tracepoint, 1700000006.0, false);

        assert_eq!(row.csv.len(), CSV_HEADER_TRACEPOINT.len());
        assert_eq!(row.csv[2], "sh");
        assert_eq!(row.csv[3], "1000");
        assert_eq!(row.csv[4], "4242");
        assert_eq!(row.csv[5], "1");
        assert_eq!(row.csv[6], "0");
        assert_eq!(row.csv[7], "/bin/true -x");
    }

    #[test]
    fn test_encode_kprobe_path() {
        let event = parse_exec_event(&sample_event("true", "/bin/true")).expect("parse");
        let row = event.encode(ExecPath::Kprobe, 1700000006.0, true);

        assert_eq!(row.csv.len(), CSV_HEADER_KPROBE.len());
        assert_eq!(row.csv[2], "1000");
        assert_eq!(row.csv[3], "4242");
        assert_eq!(row.csv[4], "true");
        assert_eq!(row.csv[5], "/bin/true");
        assert!(row.console.expect("console").contains("/bin/true"));
    }

    #[test]
    fn test_header_sets_differ() {
        assert_ne!(csv_header(ExecPath::Tracepoint), csv_header(ExecPath::Kprobe));
        assert_eq!(csv_header(ExecPath::Tracepoint).len(), 8);
        assert_eq!(csv_header(ExecPath::Kprobe).len(), 6);
    }
}
