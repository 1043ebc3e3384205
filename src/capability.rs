//! Kernel capability probing.
//!
//! Runs once at startup: kernel release and version, tracefs location,
//! per-tracepoint availability, kprobe symbols from /proc/kallsyms, BPF
//! filesystem presence and effective privilege. Each monitor's attach step
//! consults the resulting [`CapabilityReport`] to pick a compatible probe
//! variant.

use std::collections::HashSet;
use std::ffi::CStr;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::error::LoadError;

const TRACEFS_CANDIDATES: &[&str] = &["/sys/kernel/debug/tracing", "/sys/kernel/tracing"];
const KALLSYMS_PATH: &str = "/proc/kallsyms";
const BPF_FS_PATH: &str = "/sys/fs/bpf";

/// Parsed kernel version, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KernelVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a release string such as "4.19.90-2107.6.0.el7.x86_64".
    pub fn parse(release: &str) -> Self {
        let mut parts = release.split('.');

        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or_default();
        let minor = parts
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or_default();
        // Patch may carry distro suffixes ("90-2107" etc.).
        let patch = parts
            .next()
            .and_then(|p| p.split('-').next())
            .and_then(|p| p.parse().ok())
            .unwrap_or_default();

        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

impl std::fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Feature flags describing what the running kernel offers.
#[derive(Debug)]
pub struct CapabilityReport {
    pub kernel_release: String,
    pub kernel_version: KernelVersion,
    pub architecture: String,
    pub tracefs_root: Option<PathBuf>,
    pub bpf_fs_mounted: bool,
    pub effective_root: bool,
    /// Text symbols from /proc/kallsyms in file order.
    kallsyms: Vec<String>,
    kallsyms_index: HashSet<String>,
}

impl CapabilityReport {
    /// Inspect the running kernel.
    pub fn probe() -> Result<Self> {
        let (kernel_release, architecture) = uname_strings()?;
        let kernel_version = KernelVersion::parse(&kernel_release);

        let tracefs_root = TRACEFS_CANDIDATES
            .iter()
            .map(Path::new)
            .find(|p| p.join("events").is_dir())
            .map(Path::to_path_buf);

        if tracefs_root.is_none() {
            warn!("tracefs not found; tracepoint availability checks will fail");
        }

        let kallsyms = match std::fs::File::open(KALLSYMS_PATH) {
            Ok(file) => read_kallsyms(std::io::BufReader::new(file)),
            Err(e) => {
                warn!(error = %e, "cannot read {KALLSYMS_PATH}; kprobe symbols unknown");
                Vec::new()
            }
        };
        let kallsyms_index = kallsyms.iter().cloned().collect();

        let report = Self {
            kernel_release,
            kernel_version,
            architecture,
            tracefs_root,
            bpf_fs_mounted: Path::new(BPF_FS_PATH).is_dir(),
            effective_root: nix::unistd::geteuid().is_root(),
            kallsyms,
            kallsyms_index,
        };

        debug!(
            release = %report.kernel_release,
            version = %report.kernel_version,
            arch = %report.architecture,
            tracefs = ?report.tracefs_root,
            bpf_fs = report.bpf_fs_mounted,
            symbols = report.kallsyms.len(),
            "kernel capability probe complete",
        );

        Ok(report)
    }

    /// Build a report from explicit parts. Test constructor.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        kernel_release: &str,
        architecture: &str,
        tracefs_root: Option<PathBuf>,
        bpf_fs_mounted: bool,
        effective_root: bool,
        kallsyms: Vec<String>,
    ) -> Self {
        let kallsyms_index = kallsyms.iter().cloned().collect();
        Self {
            kernel_version: KernelVersion::parse(kernel_release),
            kernel_release: kernel_release.to_string(),
            architecture: architecture.to_string(),
            tracefs_root,
            bpf_fs_mounted,
            effective_root,
            kallsyms,
            kallsyms_index,
        }
    }

    /// Whether a tracepoint exists under the detected tracefs root.
    pub fn tracepoint_available(&self, group: &str, name: &str) -> bool {
        let Some(root) = &self.tracefs_root else {
            return false;
        };
        root.join("events").join(group).join(name).is_dir()
    }

    /// Whether a kernel text symbol exists.
    pub fn ksym_exists(&self, symbol: &str) -> bool {
        self.kallsyms_index.contains(symbol)
    }

    /// Resolve wildcard patterns against kallsyms, preserving symbol order
    /// and capping the result at `limit`.
    pub fn resolve_ksyms(&self, patterns: &[String], limit: usize) -> Vec<String> {
        let mut matched = Vec::new();
        for symbol in &self.kallsyms {
            if matched.len() >= limit {
                break;
            }
            if patterns.iter().any(|p| wildcard_match(symbol, p)) {
                matched.push(symbol.clone());
            }
        }
        matched
    }

    /// Verify the environment can load BPF programs at all.
    pub fn ensure_bpf_ready(&self) -> Result<(), LoadError> {
        if !self.effective_root {
            return Err(LoadError::InsufficientPrivilege);
        }
        if !self.kernel_version.at_least(4, 0) {
            return Err(LoadError::KernelTooOld(format!(
                "kernel {} predates usable eBPF (need 4.0+)",
                self.kernel_version
            )));
        }
        Ok(())
    }
}

/// Read kernel text symbols ("T"/"t") from a kallsyms stream, file order.
fn read_kallsyms<R: BufRead>(reader: R) -> Vec<String> {
    let mut symbols = Vec::new();

    for line in reader.lines() {
        let Ok(line) = line else { break };
        let mut parts = line.split_whitespace();
        let (Some(_addr), Some(kind), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if kind.eq_ignore_ascii_case("t") {
            symbols.push(name.to_string());
        }
    }

    symbols
}

/// Shell-style wildcard match: `*` any run, `?` any single character.
pub fn wildcard_match(name: &str, pattern: &str) -> bool {
    fn inner(n: &[u8], p: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (None, Some(_)) => false,
            (Some(b'*'), _) => {
                // Star swallows zero or more characters.
                inner(n, &p[1..]) || (!n.is_empty() && inner(&n[1..], p))
            }
            (Some(b'?'), Some(_)) => inner(&n[1..], &p[1..]),
            (Some(&pc), Some(&nc)) if pc == nc => inner(&n[1..], &p[1..]),
            _ => false,
        }
    }
    inner(name.as_bytes(), pattern.as_bytes())
}

/// Kernel release and machine strings via uname(2).
fn uname_strings() -> Result<(String, String)> {
    // SAFETY: utsname is plain bytes; uname fills it or fails.
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::uname(&mut uts) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("uname");
    }

    // SAFETY: the kernel null-terminates utsname fields.
    let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    let machine = unsafe { CStr::from_ptr(uts.machine.as_ptr()) }
        .to_string_lossy()
        .into_owned();

    Ok((release, machine))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_version_parse() {
        assert_eq!(KernelVersion::parse("5.15.0"), KernelVersion::new(5, 15, 0));
        assert_eq!(
            KernelVersion::parse("4.19.90-2107.6.0.el7.x86_64"),
            KernelVersion::new(4, 19, 90)
        );
        assert_eq!(
            KernelVersion::parse("6.8.0-rc1"),
            KernelVersion::new(6, 8, 0)
        );
        assert_eq!(KernelVersion::parse("garbage"), KernelVersion::new(0, 0, 0));
    }

    #[test]
    fn test_kernel_version_ordering() {
        assert!(KernelVersion::new(5, 4, 0) > KernelVersion::new(4, 19, 90));
        assert!(KernelVersion::new(4, 19, 0).at_least(4, 19));
        assert!(!KernelVersion::new(3, 10, 0).at_least(4, 0));
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("vfs_read", "vfs_*"));
        assert!(wildcard_match("vfs_read", "vfs_read"));
        assert!(wildcard_match("vfs_read", "*read"));
        assert!(wildcard_match("vfs_read", "vfs_rea?"));
        assert!(wildcard_match("anything", "*"));
        assert!(!wildcard_match("vfs_read", "vfs_write"));
        assert!(!wildcard_match("vfs_read", "vfs_?"));
        assert!(!wildcard_match("ext4_sync", "vfs_*"));
    }

    #[test]
    fn test_read_kallsyms_filters_text_symbols() {
        let data = "\
ffffffff81000000 T _stext
ffffffff81001000 t vfs_read_helper
ffffffff81002000 D some_data
ffffffff81003000 T vfs_read
bad line
ffffffff81004000 W weak_sym
";
        let syms = read_kallsyms(std::io::Cursor::new(data));
        assert_eq!(syms, vec!["_stext", "vfs_read_helper", "vfs_read"]);
    }

    #[test]
    fn test_resolve_ksyms_respects_order_and_limit() {
        let report = CapabilityReport::from_parts(
            "5.15.0",
            "x86_64",
            None,
            false,
            false,
            vec![
                "vfs_read".to_string(),
                "vfs_write".to_string(),
                "ext4_sync_file".to_string(),
                "vfs_fsync".to_string(),
            ],
        );

        let matched = report.resolve_ksyms(&["vfs_*".to_string()], 2);
        assert_eq!(matched, vec!["vfs_read", "vfs_write"]);

        let all = report.resolve_ksyms(&["vfs_*".to_string(), "ext4_*".to_string()], 10);
        assert_eq!(all.len(), 4);

        assert!(report.ksym_exists("vfs_fsync"));
        assert!(!report.ksym_exists("vfs_missing"));
    }

    #[test]
    fn test_ensure_bpf_ready_requires_root() {
        let report =
            CapabilityReport::from_parts("5.15.0", "x86_64", None, true, false, Vec::new());
        assert!(matches!(
            report.ensure_bpf_ready(),
            Err(LoadError::InsufficientPrivilege)
        ));
    }

    #[test]
    fn test_ensure_bpf_ready_requires_kernel() {
        let report =
            CapabilityReport::from_parts("3.10.0", "x86_64", None, true, true, Vec::new());
        assert!(matches!(
            report.ensure_bpf_ready(),
            Err(LoadError::KernelTooOld(_))
        ));

        let report =
            CapabilityReport::from_parts("5.15.0", "x86_64", None, true, true, Vec::new());
        assert!(report.ensure_bpf_ready().is_ok());
    }
}
