use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level configuration for the ebpfmon collector.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// CSV output configuration.
    #[serde(default)]
    pub output: OutputConfig,

    /// Log file configuration.
    #[serde(default)]
    pub logs: LogsConfig,

    /// Daemon helper configuration.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// How long a stopping monitor may drain in-flight rows. Default: 5s.
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,

    /// Kernel-side observation filters. Empty lists observe everything.
    #[serde(default)]
    pub targets: TargetsConfig,

    /// Per-monitor configuration.
    #[serde(default)]
    pub monitors: MonitorsConfig,
}

/// Per-PID / per-UID observation filters, loaded into every monitor's
/// target maps. An empty list leaves that filter switched off.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetsConfig {
    #[serde(default)]
    pub pids: Vec<u32>,

    #[serde(default)]
    pub uids: Vec<u32>,
}

impl TargetsConfig {
    pub fn is_empty(&self) -> bool {
        self.pids.is_empty() && self.uids.is_empty()
    }
}

/// CSV output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Output directory; a per-host subdirectory is created inside it.
    #[serde(default = "default_output_directory")]
    pub directory: PathBuf,

    /// Bounded per-monitor row channel capacity. Default: 2000.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Rows written per batch. Default: 64.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Batches at least this large flush to disk immediately. Default: 20.
    #[serde(default = "default_large_batch_threshold")]
    pub large_batch_threshold: usize,

    /// Maximum time buffered rows wait before a flush. Default: 2s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// CSV field delimiter. Default: ','.
    #[serde(default = "default_csv_delimiter")]
    pub csv_delimiter: char,

    /// Write the header row to new files. Default: true.
    #[serde(default = "default_true")]
    pub include_header: bool,
}

/// Log file configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LogsConfig {
    /// Directory for monitor.log and its dated rotations.
    #[serde(default = "default_logs_directory")]
    pub directory: PathBuf,

    /// Days of rotated logs to keep. Default: 365.
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
}

/// Daemon helper configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// PID file path used by --daemon / --daemon-status / --daemon-stop.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
}

/// Per-monitor configuration sections.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MonitorsConfig {
    #[serde(default)]
    pub exec: ExecConfig,

    #[serde(default)]
    pub func: FuncConfig,

    #[serde(default)]
    pub syscall: SyscallConfig,

    #[serde(default)]
    pub bio: BioConfig,

    #[serde(default)]
    pub open: OpenConfig,

    #[serde(default)]
    pub interrupt: InterruptConfig,

    #[serde(default)]
    pub page_fault: PageFaultConfig,

    #[serde(default)]
    pub context_switch: ContextSwitchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FuncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sweep interval. Default: 5s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Kernel symbol patterns (shell-style wildcards).
    #[serde(default = "default_func_patterns")]
    pub patterns: Vec<String>,

    /// Maximum number of kprobes actually attached. Default: 10.
    #[serde(default = "default_probe_limit")]
    pub probe_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyscallConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Category filters applied after drain.
    #[serde(default)]
    pub categories: SyscallCategories,
}

/// Which syscall categories are emitted. All default to true.
#[derive(Debug, Clone, Deserialize)]
pub struct SyscallCategories {
    #[serde(default = "default_true")]
    pub file_io: bool,

    #[serde(default = "default_true")]
    pub net: bool,

    #[serde(default = "default_true")]
    pub mem: bool,

    #[serde(default = "default_true")]
    pub process: bool,

    #[serde(default = "default_true")]
    pub ipc: bool,

    #[serde(default = "default_true")]
    pub other: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BioConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Rows with an average latency below this are suppressed. 0 = off.
    #[serde(default)]
    pub min_latency_us: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterruptConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sweep interval. Interrupts are high-volume, default 1s.
    #[serde(default = "default_interrupt_interval", with = "humantime_serde")]
    pub interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageFaultConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextSwitchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Rows with fewer total switches than this are suppressed. 0 = off.
    #[serde(default)]
    pub min_switches: u64,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("output")
}

fn default_buffer_size() -> usize {
    2000
}

fn default_batch_size() -> usize {
    64
}

fn default_large_batch_threshold() -> usize {
    20
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_csv_delimiter() -> char {
    ','
}

fn default_true() -> bool {
    true
}

fn default_logs_directory() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    365
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("temp/monitor.pid")
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_interrupt_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_func_patterns() -> Vec<String> {
    vec!["vfs_*".to_string()]
}

fn default_probe_limit() -> usize {
    10
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            output: OutputConfig::default(),
            logs: LogsConfig::default(),
            daemon: DaemonConfig::default(),
            stop_timeout: default_stop_timeout(),
            targets: TargetsConfig::default(),
            monitors: MonitorsConfig::default(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_directory(),
            buffer_size: default_buffer_size(),
            batch_size: default_batch_size(),
            large_batch_threshold: default_large_batch_threshold(),
            flush_interval: default_flush_interval(),
            csv_delimiter: default_csv_delimiter(),
            include_header: true,
        }
    }
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            directory: default_logs_directory(),
            retention_days: default_log_retention_days(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for FuncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_interval(),
            patterns: default_func_patterns(),
            probe_limit: default_probe_limit(),
        }
    }
}

impl Default for SyscallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_interval(),
            categories: SyscallCategories::default(),
        }
    }
}

impl Default for SyscallCategories {
    fn default() -> Self {
        Self {
            file_io: true,
            net: true,
            mem: true,
            process: true,
            ipc: true,
            other: true,
        }
    }
}

impl Default for BioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_interval(),
            min_latency_us: 0.0,
        }
    }
}

impl Default for OpenConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_interval(),
        }
    }
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_interrupt_interval(),
        }
    }
}

impl Default for PageFaultConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_interval(),
        }
    }
}

impl Default for ContextSwitchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_interval(),
            min_switches: 0,
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let cfg: Config =
            serde_yaml::from_str(&data).map_err(|source| ConfigError::InvalidYaml {
                path: path.display().to_string(),
                source,
            })?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output.buffer_size == 0 {
            return Err(ConfigError::Invalid("output.buffer_size must be positive".into()));
        }

        if self.output.batch_size == 0 {
            return Err(ConfigError::Invalid("output.batch_size must be positive".into()));
        }

        if self.output.flush_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "output.flush_interval must be positive".into(),
            ));
        }

        if self.stop_timeout.is_zero() {
            return Err(ConfigError::Invalid("stop_timeout must be positive".into()));
        }

        let m = &self.monitors;

        if m.func.enabled {
            if m.func.patterns.is_empty() {
                return Err(ConfigError::Invalid(
                    "monitors.func.patterns must not be empty".into(),
                ));
            }
            if m.func.probe_limit == 0 || m.func.probe_limit > 100 {
                return Err(ConfigError::Invalid(
                    "monitors.func.probe_limit must be between 1 and 100".into(),
                ));
            }
        }

        if m.bio.min_latency_us < 0.0 {
            return Err(ConfigError::Invalid(
                "monitors.bio.min_latency_us must not be negative".into(),
            ));
        }

        for (name, interval) in [
            ("func", m.func.interval),
            ("syscall", m.syscall.interval),
            ("bio", m.bio.interval),
            ("open", m.open.interval),
            ("interrupt", m.interrupt.interval),
            ("page_fault", m.page_fault.interval),
            ("context_switch", m.context_switch.interval),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "monitors.{name}.interval must be positive"
                )));
            }
        }

        Ok(())
    }

    /// Whether a monitor is enabled in this configuration.
    pub fn monitor_enabled(&self, name: &str) -> bool {
        match name {
            "exec" => self.monitors.exec.enabled,
            "func" => self.monitors.func.enabled,
            "syscall" => self.monitors.syscall.enabled,
            "bio" => self.monitors.bio.enabled,
            "open" => self.monitors.open.enabled,
            "interrupt" => self.monitors.interrupt.enabled,
            "page_fault" => self.monitors.page_fault.enabled,
            "context_switch" => self.monitors.context_switch.enabled,
            _ => false,
        }
    }

    /// Restrict enabled monitors to exactly `names` (the `-m` override).
    pub fn select_monitors(&mut self, names: &[String]) -> Result<(), ConfigError> {
        for name in names {
            if !crate::registry::MONITOR_NAMES.contains(&name.as_str()) {
                return Err(ConfigError::UnknownMonitor(name.clone()));
            }
        }

        let selected = |n: &str| names.iter().any(|s| s == n);
        let m = &mut self.monitors;
        m.exec.enabled = selected("exec");
        m.func.enabled = selected("func");
        m.syscall.enabled = selected("syscall");
        m.bio.enabled = selected("bio");
        m.open.enabled = selected("open");
        m.interrupt.enabled = selected("interrupt");
        m.page_fault.enabled = selected("page_fault");
        m.context_switch.enabled = selected("context_switch");

        Ok(())
    }

    /// Enabled monitor names in registry order.
    pub fn enabled_monitors(&self) -> Vec<&'static str> {
        crate::registry::MONITOR_NAMES
            .iter()
            .copied()
            .filter(|name| self.monitor_enabled(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.output.buffer_size, 2000);
        assert_eq!(cfg.output.large_batch_threshold, 20);
        assert_eq!(cfg.output.flush_interval, Duration::from_secs(2));
        assert_eq!(cfg.stop_timeout, Duration::from_secs(5));
        assert_eq!(cfg.monitors.func.probe_limit, 10);
        assert_eq!(cfg.monitors.interrupt.interval, Duration::from_secs(1));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml_overrides() {
        let yaml = r#"
log_level: debug
output:
  directory: /var/lib/ebpfmon
  flush_interval: 500ms
monitors:
  func:
    patterns: ["vfs_read", "ext4_*"]
    probe_limit: 4
  bio:
    min_latency_us: 100
  exec:
    enabled: false
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.output.directory, PathBuf::from("/var/lib/ebpfmon"));
        assert_eq!(cfg.output.flush_interval, Duration::from_millis(500));
        assert_eq!(cfg.monitors.func.patterns, vec!["vfs_read", "ext4_*"]);
        assert_eq!(cfg.monitors.func.probe_limit, 4);
        assert!((cfg.monitors.bio.min_latency_us - 100.0).abs() < f64::EPSILON);
        assert!(!cfg.monitors.exec.enabled);
        assert!(cfg.monitors.syscall.enabled);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_empty_patterns() {
        let mut cfg = Config::default();
        cfg.monitors.func.patterns.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("patterns"));
    }

    #[test]
    fn test_validation_rejects_probe_limit_out_of_range() {
        let mut cfg = Config::default();
        cfg.monitors.func.probe_limit = 101;
        assert!(cfg.validate().is_err());

        cfg.monitors.func.probe_limit = 0;
        assert!(cfg.validate().is_err());

        // Disabled monitors are not validated.
        cfg.monitors.func.enabled = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_buffer() {
        let mut cfg = Config::default();
        cfg.output.buffer_size = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("buffer_size"));
    }

    #[test]
    fn test_select_monitors_unknown_name() {
        let mut cfg = Config::default();
        let err = cfg
            .select_monitors(&["exec".to_string(), "netio".to_string()])
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownMonitor(name) if name == "netio"));
    }

    #[test]
    fn test_select_monitors_restricts_set() {
        let mut cfg = Config::default();
        cfg.select_monitors(&["exec".to_string(), "bio".to_string()])
            .expect("select");

        assert_eq!(cfg.enabled_monitors(), vec!["exec", "bio"]);
        assert!(!cfg.monitors.syscall.enabled);
        assert!(!cfg.monitors.context_switch.enabled);
    }
}
