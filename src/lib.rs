//! ebpfmon: multi-subsystem Linux kernel telemetry collector built on eBPF.
//!
//! In-kernel programs attached to stable tracepoints (and selected
//! kprobes) aggregate events into per-key counters in BPF hash maps; the
//! user-space supervisor periodically drains those maps into per-monitor
//! CSV sinks. The exec monitor is the one event-stream exception,
//! delivered through a perf ring buffer.

pub mod capability;
pub mod clock;
pub mod config;
pub mod context;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod output;
pub mod registry;

#[cfg(feature = "bpf")]
pub mod supervisor;
