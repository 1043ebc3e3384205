//! Syscall monitor.
//!
//! The kernel side counts calls and errors per (comm, syscall_nr); name
//! resolution and category classification are user-space enrichments from
//! the fixed x86_64 tables below. Category filters apply after drain.

use crate::config::SyscallCategories;
use crate::output::row::{fmt_error_rate, fmt_time_str, fmt_timestamp, Row};

pub const CSV_HEADER: &[&str] = &[
    "timestamp",
    "time_str",
    "monitor_type",
    "comm",
    "syscall_nr",
    "syscall_name",
    "category",
    "count",
    "error_count",
    "error_rate",
];

/// Syscall categories emitted in the CSV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallCategory {
    FileIo,
    Net,
    Mem,
    Process,
    Ipc,
    Other,
}

impl SyscallCategory {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FileIo => "file_io",
            Self::Net => "net",
            Self::Mem => "mem",
            Self::Process => "process",
            Self::Ipc => "ipc",
            Self::Other => "other",
        }
    }
}

const FILE_IO_SYSCALLS: &[u32] = &[
    0, 1, 2, 3, 4, 5, 6, 8, 16, 17, 18, 19, 20, 21, 32, 33, 72, 73, 74, 75, 76, 77, 78, 79, 80,
    81, 82, 83, 84, 85, 86, 87, 88, 89, 90, 91, 92, 93, 94, 257, 258, 259, 260, 261, 262, 263,
    264, 265, 266, 267, 268, 269, 275, 276, 277, 278, 280, 285, 292, 294,
];

const NET_SYSCALLS: &[u32] = &[
    41, 42, 43, 44, 45, 46, 47, 48, 49, 50, 51, 52, 53, 54, 55, 288,
];

const MEM_SYSCALLS: &[u32] = &[9, 10, 11, 12, 25, 26, 27, 28, 279];

const PROCESS_SYSCALLS: &[u32] = &[
    56, 57, 58, 59, 60, 61, 62, 101, 105, 106, 109, 110, 111, 112, 113, 114, 115, 116, 117, 118,
    119, 120, 272, 273, 274,
];

const IPC_SYSCALLS: &[u32] = &[
    22, 29, 30, 31, 64, 65, 66, 67, 68, 69, 70, 71, 220, 240, 241, 242, 243, 244, 245, 293,
];

/// Classify a syscall number into its category.
pub fn classify_syscall(nr: u32) -> SyscallCategory {
    if FILE_IO_SYSCALLS.contains(&nr) {
        SyscallCategory::FileIo
    } else if NET_SYSCALLS.contains(&nr) {
        SyscallCategory::Net
    } else if MEM_SYSCALLS.contains(&nr) {
        SyscallCategory::Mem
    } else if PROCESS_SYSCALLS.contains(&nr) {
        SyscallCategory::Process
    } else if IPC_SYSCALLS.contains(&nr) {
        SyscallCategory::Ipc
    } else {
        SyscallCategory::Other
    }
}

/// x86_64 syscall numbers to names, sorted by number for binary search.
/// Not exhaustive; unknown numbers render as `sys_{nr}`.
const SYSCALL_NAMES: &[(u32, &str)] = &[
    (0, "read"),
    (1, "write"),
    (2, "open"),
    (3, "close"),
    (4, "stat"),
    (5, "fstat"),
    (6, "lstat"),
    (7, "poll"),
    (8, "lseek"),
    (9, "mmap"),
    (10, "mprotect"),
    (11, "munmap"),
    (12, "brk"),
    (13, "rt_sigaction"),
    (14, "rt_sigprocmask"),
    (15, "rt_sigreturn"),
    (16, "ioctl"),
    (17, "pread64"),
    (18, "pwrite64"),
    (19, "readv"),
    (20, "writev"),
    (21, "access"),
    (22, "pipe"),
    (23, "select"),
    (24, "sched_yield"),
    (25, "mremap"),
    (26, "msync"),
    (27, "mincore"),
    (28, "madvise"),
    (29, "shmget"),
    (30, "shmat"),
    (31, "shmctl"),
    (32, "dup"),
    (33, "dup2"),
    (34, "pause"),
    (35, "nanosleep"),
    (36, "getitimer"),
    (37, "alarm"),
    (38, "setitimer"),
    (39, "getpid"),
    (40, "sendfile"),
    (41, "socket"),
    (42, "connect"),
    (43, "accept"),
    (44, "sendto"),
    (45, "recvfrom"),
    (46, "sendmsg"),
    (47, "recvmsg"),
    (48, "shutdown"),
    (49, "bind"),
    (50, "listen"),
    (51, "getsockname"),
    (52, "getpeername"),
    (53, "socketpair"),
    (54, "setsockopt"),
    (55, "getsockopt"),
    (56, "clone"),
    (57, "fork"),
    (58, "vfork"),
    (59, "execve"),
    (60, "exit"),
    (61, "wait4"),
    (62, "kill"),
    (63, "uname"),
    (64, "semget"),
    (65, "semop"),
    (66, "semctl"),
    (67, "shmdt"),
    (68, "msgget"),
    (69, "msgsnd"),
    (70, "msgrcv"),
    (71, "msgctl"),
    (72, "fcntl"),
    (73, "flock"),
    (74, "fsync"),
    (75, "fdatasync"),
    (76, "truncate"),
    (77, "ftruncate"),
    (78, "getdents"),
    (79, "getcwd"),
    (80, "chdir"),
    (81, "fchdir"),
    (82, "rename"),
    (83, "mkdir"),
    (84, "rmdir"),
    (85, "creat"),
    (86, "link"),
    (87, "unlink"),
    (88, "symlink"),
    (89, "readlink"),
    (90, "chmod"),
    (91, "fchmod"),
    (92, "chown"),
    (93, "fchown"),
    (94, "lchown"),
    (95, "umask"),
    (96, "gettimeofday"),
    (97, "getrlimit"),
    (98, "getrusage"),
    (99, "sysinfo"),
    (100, "times"),
    (101, "ptrace"),
    (102, "getuid"),
    (103, "syslog"),
    (104, "getgid"),
    (105, "setuid"),
    (106, "setgid"),
    (107, "geteuid"),
    (108, "getegid"),
    (109, "setpgid"),
    (110, "getppid"),
    (111, "getpgrp"),
    (112, "setsid"),
    (113, "setreuid"),
    (114, "setregid"),
    (115, "getgroups"),
    (116, "setgroups"),
    (117, "setresuid"),
    (118, "getresuid"),
    (119, "setresgid"),
    (120, "getresgid"),
    (121, "getpgid"),
    (124, "getsid"),
    (127, "rt_sigpending"),
    (128, "rt_sigtimedwait"),
    (130, "rt_sigsuspend"),
    (131, "sigaltstack"),
    (137, "statfs"),
    (138, "fstatfs"),
    (157, "prctl"),
    (158, "arch_prctl"),
    (186, "gettid"),
    (202, "futex"),
    (213, "epoll_create"),
    (217, "getdents64"),
    (218, "set_tid_address"),
    (219, "restart_syscall"),
    (220, "semtimedop"),
    (221, "fadvise64"),
    (228, "clock_gettime"),
    (229, "clock_getres"),
    (230, "clock_nanosleep"),
    (231, "exit_group"),
    (232, "epoll_wait"),
    (233, "epoll_ctl"),
    (234, "tgkill"),
    (235, "utimes"),
    (240, "mq_open"),
    (241, "mq_unlink"),
    (242, "mq_timedsend"),
    (243, "mq_timedreceive"),
    (244, "mq_notify"),
    (245, "mq_getsetattr"),
    (257, "openat"),
    (258, "mkdirat"),
    (259, "mknodat"),
    (260, "fchownat"),
    (261, "futimesat"),
    (262, "newfstatat"),
    (263, "unlinkat"),
    (264, "renameat"),
    (265, "linkat"),
    (266, "symlinkat"),
    (267, "readlinkat"),
    (268, "fchmodat"),
    (269, "faccessat"),
    (270, "pselect6"),
    (271, "ppoll"),
    (272, "unshare"),
    (273, "set_robust_list"),
    (274, "get_robust_list"),
    (275, "splice"),
    (276, "tee"),
    (277, "sync_file_range"),
    (278, "vmsplice"),
    (279, "move_pages"),
    (280, "utimensat"),
    (281, "epoll_pwait"),
    (284, "eventfd"),
    (285, "fallocate"),
    (288, "accept4"),
    (289, "signalfd4"),
    (290, "eventfd2"),
    (291, "epoll_create1"),
    (292, "dup3"),
    (293, "pipe2"),
    (294, "inotify_init1"),
    (295, "preadv"),
    (296, "pwritev"),
    (302, "prlimit64"),
    (318, "getrandom"),
    (319, "memfd_create"),
    (322, "execveat"),
    (332, "statx"),
    (435, "clone3"),
    (436, "close_range"),
    (437, "openat2"),
    (439, "faccessat2"),
];

/// Resolve a syscall number to its name.
pub fn syscall_name(nr: u32) -> String {
    match SYSCALL_NAMES.binary_search_by_key(&nr, |(n, _)| *n) {
        Ok(idx) => SYSCALL_NAMES[idx].1.to_string(),
        Err(_) => format!("sys_{nr}"),
    }
}

/// Whether a category passes the configured filters.
pub fn category_enabled(category: SyscallCategory, filters: &SyscallCategories) -> bool {
    match category {
        SyscallCategory::FileIo => filters.file_io,
        SyscallCategory::Net => filters.net,
        SyscallCategory::Mem => filters.mem,
        SyscallCategory::Process => filters.process,
        SyscallCategory::Ipc => filters.ipc,
        SyscallCategory::Other => filters.other,
    }
}

/// One aggregated (comm, syscall) row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallRecord {
    pub comm: String,
    pub syscall_nr: u32,
    pub count: u64,
    pub error_count: u64,
}

impl SyscallRecord {
    pub fn category(&self) -> SyscallCategory {
        classify_syscall(self.syscall_nr)
    }

    pub fn error_rate(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.error_count as f64 / self.count as f64
    }

    pub fn encode(&self, tick_secs: f64, echo: bool) -> Row {
        let name = syscall_name(self.syscall_nr);
        let category = self.category().as_str();

        let csv = vec![
            fmt_timestamp(tick_secs),
            fmt_time_str(tick_secs),
            "syscall".to_string(),
            self.comm.clone(),
            self.syscall_nr.to_string(),
            name.clone(),
            category.to_string(),
            self.count.to_string(),
            self.error_count.to_string(),
            fmt_error_rate(self.error_rate()),
        ];

        let console = echo.then(|| {
            format!(
                "{:<16} {:>6} {:<20} {:<8} {:>10} {:>8} {:>8.4}",
                self.comm,
                self.syscall_nr,
                name,
                category,
                self.count,
                self.error_count,
                self.error_rate()
            )
        });

        Row { csv, console }
    }
}

pub fn console_header() -> String {
    format!(
        "{:<16} {:>6} {:<20} {:<8} {:>10} {:>8} {:>8}",
        "COMM", "NR", "SYSCALL", "CATEGORY", "COUNT", "ERRORS", "ERR_RATE"
    )
}

#[cfg(feature = "bpf")]
pub use self::bpf_monitor::SyscallMonitor;

#[cfg(feature = "bpf")]
mod bpf_monitor {
    use std::sync::Arc;

    use aya::Ebpf;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::capability::CapabilityReport;
    use crate::clock::MonotonicClock;
    use crate::config::{SyscallConfig, TargetsConfig};
    use crate::error::{AttachError, LoadError};
    use crate::monitor::bpf::{attach_tracepoint, load_object, spawn_sweep_loop, take_hash_map};
    use crate::monitor::maps::{fixed_str, SyscallKey, SyscallValue};
    use crate::monitor::{Monitor, StatusTable};
    use crate::output::SinkHandle;

    const BPF_OBJ: &[u8] =
        aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/syscall.bpf.o"));

    pub struct SyscallMonitor {
        cfg: SyscallConfig,
        targets: TargetsConfig,
        caps: Arc<CapabilityReport>,
        clock: MonotonicClock,
        ebpf: Option<Ebpf>,
    }

    impl SyscallMonitor {
        pub fn new(
            cfg: SyscallConfig,
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

    impl Monitor for SyscallMonitor {
        fn name(&self) -> &'static str {
            "syscall"
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
            self.ebpf = Some(load_object("syscall", BPF_OBJ, &["syscall_stats"], &self.targets)?);
            Ok(())
        }

        fn attach(&mut self) -> Result<(), AttachError> {
            let ebpf = self
                .ebpf
                .as_mut()
                .ok_or_else(|| AttachError::NotAvailable("syscall object not loaded".into()))?;

            if !self.caps.tracepoint_available("raw_syscalls", "sys_exit") {
                return Err(AttachError::NotAvailable("raw_syscalls:sys_exit".into()));
            }
            attach_tracepoint(ebpf, "trace_sys_exit", "raw_syscalls", "sys_exit")
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
                .ok_or_else(|| anyhow::anyhow!("syscall monitor not loaded"))?;

            let map = take_hash_map::<SyscallKey, SyscallValue>(ebpf, "syscall_stats")?;
            let filters = self.cfg.categories.clone();

            let handle = spawn_sweep_loop(
                "syscall",
                map,
                self.cfg.interval,
                self.clock,
                sink,
                cancel,
                status,
                move |tick, key: &SyscallKey, value: &SyscallValue, echo| {
                    let record = SyscallRecord {
                        comm: fixed_str(&key.comm),
                        syscall_nr: key.syscall_nr,
                        count: value.count,
                        error_count: value.error_count,
                    };
                    if !category_enabled(record.category(), &filters) {
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
