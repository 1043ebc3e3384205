//! Black-box test of the encode -> sink -> CSV pipeline.
//!
//! Exercises every monitor's row encoder against a real output controller
//! writing to a temporary directory, asserting the invariants downstream
//! consumers rely on: header shape, field counts, ordering, fixed decimal
//! formats and the no-rows-after-close rule.

use std::time::Duration;

use ebpfmon::config::OutputConfig;
use ebpfmon::monitor::bio::{BioRecord, BIO_TYPE_SYNC, BIO_TYPE_WRITE};
use ebpfmon::monitor::context_switch::SwitchRecord;
use ebpfmon::monitor::exec::{parse_exec_event, ExecPath, EXEC_EVENT_SIZE};
use ebpfmon::monitor::func::FuncRecord;
use ebpfmon::monitor::interrupt::{InterruptRecord, IRQ_TYPE_NETWORK, IRQ_TYPE_SOFTWARE};
use ebpfmon::monitor::open::{OpenRecord, OP_OPENAT};
use ebpfmon::monitor::page_fault::{PageFaultRecord, FAULT_TYPE_MINOR, FAULT_TYPE_USER};
use ebpfmon::monitor::syscall::SyscallRecord;
use ebpfmon::monitor::{bio, context_switch, exec, func, interrupt, open, page_fault, syscall};
use ebpfmon::output::row::Row;
use ebpfmon::output::OutputController;

const TICK: f64 = 1_700_000_000.0;

fn output_cfg(dir: &std::path::Path) -> OutputConfig {
    OutputConfig {
        directory: dir.to_path_buf(),
        buffer_size: 256,
        batch_size: 8,
        large_batch_threshold: 20,
        flush_interval: Duration::from_millis(50),
        csv_delimiter: ',',
        include_header: true,
    }
}

fn read_single_csv(host_dir: &std::path::Path, monitor: &str) -> Vec<String> {
    let entry = std::fs::read_dir(host_dir)
        .expect("read_dir")
        .filter_map(|e| e.ok())
        .find(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with(&format!("{monitor}_"))
        })
        .unwrap_or_else(|| panic!("no CSV for {monitor}"));

    let content = std::fs::read_to_string(entry.path()).expect("read csv");
    assert!(content.ends_with('\n'), "file must end with a complete line");
    content.lines().map(str::to_string).collect()
}

/// Split one CSV line honouring double-quote escaping.
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

fn exec_event_bytes(comm: &str, argv: &str, uid: u32, pid: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(EXEC_EVENT_SIZE);
    data.extend_from_slice(&42_000_000u64.to_le_bytes());
    data.extend_from_slice(&uid.to_le_bytes());
    data.extend_from_slice(&pid.to_le_bytes());
    data.extend_from_slice(&1u32.to_le_bytes());
    data.extend_from_slice(&0i32.to_le_bytes());

    let mut comm_bytes = [0u8; 16];
    comm_bytes[..comm.len()].copy_from_slice(comm.as_bytes());
    data.extend_from_slice(&comm_bytes);

    let mut argv_bytes = [0u8; 256];
    argv_bytes[..argv.len()].copy_from_slice(argv.as_bytes());
    data.extend_from_slice(&argv_bytes);
    data
}

#[tokio::test]
async fn every_monitor_writes_header_and_consistent_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut ctl = OutputController::new(output_cfg(dir.path()), "testhost", 8).expect("ctl");

    // (monitor, header, rows)
    let cases: Vec<(&'static str, &[&str], Vec<Row>)> = vec![
        (
            "exec",
            exec::CSV_HEADER_TRACEPOINT,
            vec![parse_exec_event(&exec_event_bytes("sh", "/bin/true", 1000, 77))
                .expect("parse")
                .encode(ExecPath::Tracepoint, TICK, false)],
        ),
        (
            "func",
            func::CSV_HEADER,
            vec![
                FuncRecord {
                    comm: "dd".into(),
                    func_name: "vfs_read".into(),
                    count: 100,
                }
                .encode(TICK, false),
                FuncRecord {
                    comm: "dd".into(),
                    func_name: "vfs_write".into(),
                    count: 3,
                }
                .encode(TICK, false),
            ],
        ),
        (
            "syscall",
            syscall::CSV_HEADER,
            vec![SyscallRecord {
                comm: "cat".into(),
                syscall_nr: 257,
                count: 10,
                error_count: 10,
            }
            .encode(TICK, false)],
        ),
        (
            "bio",
            bio::CSV_HEADER,
            vec![BioRecord {
                comm: "fio".into(),
                bio_type: BIO_TYPE_WRITE | BIO_TYPE_SYNC,
                count: 1,
                total_bytes: 4096,
                total_ns: 800_000,
                min_ns: 800_000,
                max_ns: 800_000,
            }
            .encode(TICK, false)],
        ),
        (
            "open",
            open::CSV_HEADER,
            vec![OpenRecord {
                comm: "sshd".into(),
                operation: OP_OPENAT,
                filename: "/etc/ssh,weird".into(),
                count: 4,
                error_count: 1,
                total_latency_ns: 40_000,
                min_latency_ns: 5_000,
                max_latency_ns: 20_000,
                flags_summary: 0,
            }
            .encode(TICK, false)],
        ),
        (
            "interrupt",
            interrupt::CSV_HEADER,
            vec![InterruptRecord {
                comm: "ksoftirqd/0".into(),
                irq_type: IRQ_TYPE_SOFTWARE | IRQ_TYPE_NETWORK,
                cpu: 0,
                count: 999,
            }
            .encode(TICK, false)],
        ),
        (
            "page_fault",
            page_fault::CSV_HEADER,
            vec![PageFaultRecord {
                comm: "postgres".into(),
                fault_type: FAULT_TYPE_MINOR | FAULT_TYPE_USER,
                cpu: 2,
                numa_node: 0,
                count: 12,
            }
            .encode(TICK, false)],
        ),
        (
            "context_switch",
            context_switch::CSV_HEADER,
            vec![SwitchRecord {
                comm: "rcu_sched".into(),
                cpu: 1,
                switch_in: 5,
                switch_out: 6,
                voluntary: 6,
                involuntary: 5,
            }
            .encode(TICK, false)],
        ),
    ];

    for (monitor, header, rows) in &cases {
        let sink = ctl
            .open_sink(monitor, header, String::new())
            .expect("open sink");
        for row in rows {
            sink.submit(row.clone()).await;
        }
    }

    ctl.close(Duration::from_secs(5)).await;

    let host_dir = dir.path().join("testhost");
    for (monitor, header, rows) in &cases {
        let lines = read_single_csv(&host_dir, monitor);
        assert_eq!(lines.len(), rows.len() + 1, "{monitor}: line count");

        // First line equals csv_header().
        assert_eq!(lines[0], header.join(","), "{monitor}: header");

        // Every subsequent line has exactly as many fields as the header.
        for line in &lines[1..] {
            assert_eq!(
                split_csv(line).len(),
                header.len(),
                "{monitor}: field count in {line}"
            );
        }
    }
}

#[tokio::test]
async fn rows_preserve_submit_order_per_monitor() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut ctl = OutputController::new(output_cfg(dir.path()), "host", 2).expect("ctl");

    let sink = ctl
        .open_sink("func", func::CSV_HEADER, String::new())
        .expect("sink");

    for i in 0..100u64 {
        let row = FuncRecord {
            comm: "proc".into(),
            func_name: format!("fn_{i}"),
            count: i,
        }
        .encode(TICK, false);
        sink.submit(row).await;
    }
    drop(sink);
    ctl.close(Duration::from_secs(5)).await;

    let lines = read_single_csv(&dir.path().join("host"), "func");
    assert_eq!(lines.len(), 101);
    for (i, line) in lines[1..].iter().enumerate() {
        let fields = split_csv(line);
        assert_eq!(fields[3], format!("fn_{i}"), "row order violated");
        assert_eq!(fields[4], i.to_string());
    }
}

#[tokio::test]
async fn no_rows_after_close() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut ctl = OutputController::new(output_cfg(dir.path()), "host", 2).expect("ctl");

    let sink = ctl
        .open_sink("bio", bio::CSV_HEADER, String::new())
        .expect("sink");

    let row = BioRecord {
        comm: "fio".into(),
        bio_type: BIO_TYPE_WRITE,
        count: 1,
        total_bytes: 4096,
        total_ns: 1000,
        min_ns: 1000,
        max_ns: 1000,
    }
    .encode(TICK, false);

    sink.submit(row.clone()).await;
    let sink_clone = sink.clone();
    drop(sink);
    drop(sink_clone);
    ctl.close(Duration::from_secs(5)).await;

    let before = std::fs::read_to_string(
        std::fs::read_dir(dir.path().join("host"))
            .expect("dir")
            .filter_map(|e| e.ok())
            .next()
            .expect("csv")
            .path(),
    )
    .expect("read");
    assert_eq!(before.lines().count(), 2);
}

#[tokio::test]
async fn console_echo_only_with_single_monitor() {
    let dir = tempfile::tempdir().expect("tempdir");

    let mut single = OutputController::new(output_cfg(dir.path()), "single", 1).expect("ctl");
    let sink = single
        .open_sink("func", func::CSV_HEADER, func::console_header())
        .expect("sink");
    assert!(sink.echo_console());
    drop(sink);
    single.close(Duration::from_secs(2)).await;

    let mut multi = OutputController::new(output_cfg(dir.path()), "multi", 2).expect("ctl");
    let sink_a = multi
        .open_sink("func", func::CSV_HEADER, func::console_header())
        .expect("sink");
    let sink_b = multi
        .open_sink("bio", bio::CSV_HEADER, bio::console_header())
        .expect("sink");
    assert!(!sink_a.echo_console());
    assert!(!sink_b.echo_console());
    drop(sink_a);
    drop(sink_b);
    multi.close(Duration::from_secs(2)).await;
}

#[test]
fn syscall_error_rate_formats_to_four_decimals() {
    let record = SyscallRecord {
        comm: "cat".into(),
        syscall_nr: 257,
        count: 10,
        error_count: 10,
    };
    assert!(record.error_count <= record.count);

    let row = record.encode(TICK, false);
    assert_eq!(row.csv[5], "openat");
    assert_eq!(row.csv[9], "1.0000");

    let partial = SyscallRecord {
        error_count: 1,
        ..record
    };
    assert_eq!(partial.encode(TICK, false).csv[9], "0.1000");
}

#[test]
fn bio_single_completion_collapses_latencies() {
    // A single 4 KiB direct read: count=1, total_bytes=4096 and
    // min == avg == max.
    let record = BioRecord {
        comm: "dd".into(),
        bio_type: ebpfmon::monitor::bio::BIO_TYPE_READ,
        count: 1,
        total_bytes: 4096,
        total_ns: 650_000,
        min_ns: 650_000,
        max_ns: 650_000,
    };

    let row = record.encode(TICK, false);
    assert_eq!(row.csv[5], "1");
    assert_eq!(row.csv[6], "4096");
    assert_eq!(row.csv[8], row.csv[9]);
    assert_eq!(row.csv[9], row.csv[10]);
}

#[test]
fn latency_ordering_invariant_holds() {
    let bio = BioRecord {
        comm: "fio".into(),
        bio_type: BIO_TYPE_WRITE,
        count: 8,
        total_bytes: 32768,
        total_ns: 9_000_000,
        min_ns: 400_000,
        max_ns: 3_000_000,
    };
    assert!(bio.min_latency_us() <= bio.avg_latency_us());
    assert!(bio.avg_latency_us() <= bio.max_latency_us());

    let open = OpenRecord {
        comm: "sshd".into(),
        operation: OP_OPENAT,
        filename: "/etc/passwd".into(),
        count: 3,
        error_count: 0,
        total_latency_ns: 33_000,
        min_latency_ns: 8_000,
        max_latency_ns: 15_000,
        flags_summary: 0,
    };
    assert!(open.min_lat_us() <= open.avg_lat_us());
    assert!(open.avg_lat_us() <= open.max_lat_us());
}

#[test]
fn exec_header_frozen_per_path() {
    assert_eq!(
        exec::csv_header(ExecPath::Tracepoint).first(),
        Some(&"timestamp")
    );
    assert!(exec::csv_header(ExecPath::Kprobe).contains(&"filename"));
    assert!(exec::csv_header(ExecPath::Tracepoint).contains(&"argv"));

    let event = parse_exec_event(&exec_event_bytes("true", "/bin/true", 1000, 88)).expect("parse");
    let kprobe_row = event.encode(ExecPath::Kprobe, TICK, false);
    assert_eq!(kprobe_row.csv.len(), exec::CSV_HEADER_KPROBE.len());
    assert_eq!(kprobe_row.csv[5], "/bin/true");
}
