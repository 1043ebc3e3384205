//! Typed error taxonomy.
//!
//! Monitors translate every internal failure into one of these types and
//! push it through the status table; drain tasks never panic. The
//! orchestration layer wraps them in `anyhow` where context matters.

use thiserror::Error;

/// Classification of a monitor load failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadErrorKind {
    BytecodeReject,
    MapCreate,
    MissingSymbol,
    KernelTooOld,
    InsufficientPrivilege,
}

/// Loading a monitor's BPF object failed. Fatal for the affected monitor;
/// other monitors proceed.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("BPF bytecode rejected by verifier: {0}")]
    BytecodeReject(String),

    #[error("map creation failed: {0}")]
    MapCreate(String),

    #[error("missing symbol: {0}")]
    MissingSymbol(String),

    #[error("kernel too old: {0}")]
    KernelTooOld(String),

    #[error("insufficient privilege to load BPF programs")]
    InsufficientPrivilege,
}

impl LoadError {
    pub fn kind(&self) -> LoadErrorKind {
        match self {
            Self::BytecodeReject(_) => LoadErrorKind::BytecodeReject,
            Self::MapCreate(_) => LoadErrorKind::MapCreate,
            Self::MissingSymbol(_) => LoadErrorKind::MissingSymbol,
            Self::KernelTooOld(_) => LoadErrorKind::KernelTooOld,
            Self::InsufficientPrivilege => LoadErrorKind::InsufficientPrivilege,
        }
    }
}

/// Binding an attach point failed.
#[derive(Error, Debug)]
pub enum AttachError {
    #[error("attach point not available: {0}")]
    NotAvailable(String),

    #[error("probe already attached: {0}")]
    AlreadyAttached(String),

    #[error("attaching {point}: {reason}")]
    Failed { point: String, reason: String },
}

/// A per-tick transient drain failure. Retried on the next tick; a monitor
/// escalates to Failed after `MAX_CONSECUTIVE_DRAIN_ERRORS`.
#[derive(Error, Debug)]
pub enum DrainError {
    #[error("ring buffer read failed: {0}")]
    RingBuffer(String),

    #[error("map iteration failed: {0}")]
    MapIteration(String),

    #[error("event deserialisation failed: {0}")]
    Deserialise(String),
}

/// Consecutive drain failures tolerated before a monitor goes Failed.
pub const MAX_CONSECUTIVE_DRAIN_ERRORS: u32 = 5;

/// Output-side failure.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("CSV write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("disk full writing {0}")]
    DiskFull(String),

    #[error("sink channel overflow")]
    ChannelOverflow,
}

/// Configuration problem. Fatal at startup, exit code 1.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("parsing config {path}: {source}")]
    InvalidYaml {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("unknown monitor name: {0}")]
    UnknownMonitor(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_kind() {
        assert_eq!(
            LoadError::BytecodeReject("bad insn".into()).kind(),
            LoadErrorKind::BytecodeReject
        );
        assert_eq!(
            LoadError::InsufficientPrivilege.kind(),
            LoadErrorKind::InsufficientPrivilege
        );
    }

    #[test]
    fn test_error_display() {
        let e = AttachError::NotAvailable("syscalls:sys_enter_execve".into());
        assert_eq!(
            e.to_string(),
            "attach point not available: syscalls:sys_enter_execve"
        );

        let e = DrainError::MapIteration("stale key".into());
        assert_eq!(e.to_string(), "map iteration failed: stale key");

        let e = ConfigError::UnknownMonitor("netio".into());
        assert_eq!(e.to_string(), "unknown monitor name: netio");
    }
}
