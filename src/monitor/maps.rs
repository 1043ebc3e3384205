//! User-space mirrors of the in-kernel map schemas.
//!
//! Layouts are bit-exact with the structs in `bpf/*.c`; the map hash is
//! computed over raw key bytes, so any key built here must be fully
//! zeroed (padding included) before field assignment. `#[repr(C)]` plus
//! explicit padding fields keeps the two sides in lockstep.

pub const TASK_COMM_LEN: usize = 16;
pub const MAX_PATH_LEN: usize = 256;

/// (comm, func_id) -> count. `bpf/func.c` struct func_key.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncKey {
    pub comm: [u8; TASK_COMM_LEN],
    pub func_id: u32,
}

/// Plain counter value shared by func, interrupt and page_fault stats.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterValue {
    pub count: u64,
}

/// (comm, syscall_nr) -> (count, error_count). `bpf/syscall.c`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallKey {
    pub comm: [u8; TASK_COMM_LEN],
    pub syscall_nr: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyscallValue {
    pub count: u64,
    pub error_count: u64,
}

/// (comm, bio_type) -> latency/volume counters. `bpf/bio.c`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BioKey {
    pub comm: [u8; TASK_COMM_LEN],
    pub bio_type: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BioValue {
    pub count: u64,
    pub total_bytes: u64,
    pub total_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
}

/// (comm, operation, filename) -> open statistics. `bpf/open.c`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenKey {
    pub comm: [u8; TASK_COMM_LEN],
    pub operation: u32,
    pub filename: [u8; MAX_PATH_LEN],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenValue {
    pub count: u64,
    pub error_count: u64,
    pub total_latency_ns: u64,
    pub min_latency_ns: u64,
    pub max_latency_ns: u64,
    pub flags_summary: u32,
    pub _pad: u32,
}

/// (comm, irq_type, cpu) -> count. `bpf/interrupt.c`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptKey {
    pub comm: [u8; TASK_COMM_LEN],
    pub irq_type: u32,
    pub cpu: u32,
}

/// (comm, fault_type, cpu) -> count. `bpf/page_fault.c`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFaultKey {
    pub comm: [u8; TASK_COMM_LEN],
    pub fault_type: u32,
    pub cpu: u32,
}

/// (comm, cpu) -> switch counters. `bpf/context_switch.c`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchKey {
    pub comm: [u8; TASK_COMM_LEN],
    pub cpu: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SwitchValue {
    pub switch_in_count: u64,
    pub switch_out_count: u64,
    pub voluntary_count: u64,
    pub involuntary_count: u64,
}

#[cfg(feature = "bpf")]
mod pod_impls {
    use super::*;

    // SAFETY: all of these are plain C structs whose every byte pattern
    // is a valid value; layouts match the kernel-side definitions.
    unsafe impl aya::Pod for FuncKey {}
    unsafe impl aya::Pod for CounterValue {}
    unsafe impl aya::Pod for SyscallKey {}
    unsafe impl aya::Pod for SyscallValue {}
    unsafe impl aya::Pod for BioKey {}
    unsafe impl aya::Pod for BioValue {}
    unsafe impl aya::Pod for OpenKey {}
    unsafe impl aya::Pod for OpenValue {}
    unsafe impl aya::Pod for InterruptKey {}
    unsafe impl aya::Pod for PageFaultKey {}
    unsafe impl aya::Pod for SwitchKey {}
    unsafe impl aya::Pod for SwitchValue {}
}

/// Decode a fixed-width, null-terminated kernel string field.
pub fn fixed_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Copy a str into a fixed-width, zero-padded field. Test helper for
/// building keys the way the kernel does.
pub fn fixed_bytes<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let src = s.as_bytes();
    let n = src.len().min(N - 1);
    out[..n].copy_from_slice(&src[..n]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    #[test]
    fn test_layouts_match_kernel_side() {
        assert_eq!(size_of::<FuncKey>(), 20);
        assert_eq!(size_of::<CounterValue>(), 8);
        assert_eq!(size_of::<SyscallKey>(), 20);
        assert_eq!(size_of::<SyscallValue>(), 16);
        assert_eq!(size_of::<BioKey>(), 20);
        assert_eq!(size_of::<BioValue>(), 40);
        assert_eq!(size_of::<OpenKey>(), 276);
        assert_eq!(size_of::<OpenValue>(), 48);
        assert_eq!(size_of::<InterruptKey>(), 24);
        assert_eq!(size_of::<PageFaultKey>(), 24);
        assert_eq!(size_of::<SwitchKey>(), 20);
        assert_eq!(size_of::<SwitchValue>(), 32);

        assert_eq!(align_of::<OpenKey>(), 4);
        assert_eq!(align_of::<BioValue>(), 8);
    }

    #[test]
    fn test_fixed_str_stops_at_null() {
        let mut comm = [0u8; TASK_COMM_LEN];
        comm[..4].copy_from_slice(b"bash");
        assert_eq!(fixed_str(&comm), "bash");

        let full = [b'x'; TASK_COMM_LEN];
        assert_eq!(fixed_str(&full).len(), TASK_COMM_LEN);

        assert_eq!(fixed_str(&[0u8; 4]), "");
    }

    #[test]
    fn test_fixed_bytes_roundtrip() {
        let comm: [u8; TASK_COMM_LEN] = fixed_bytes("kworker/0:1");
        assert_eq!(fixed_str(&comm), "kworker/0:1");

        // Oversized input truncates and stays terminated.
        let comm: [u8; TASK_COMM_LEN] = fixed_bytes("a-very-long-process-name");
        assert_eq!(fixed_str(&comm).len(), TASK_COMM_LEN - 1);
    }
}
