//! Shared BPF plumbing: object loading, probe attachment and the periodic
//! map sweep that every aggregating monitor drives.

use std::sync::Arc;
use std::time::Duration;

use aya::maps::{Array, HashMap as BpfHashMap, MapData};
use aya::programs::{KProbe, TracePoint};
use aya::{Ebpf, EbpfLoader, Pod};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{MonitorState, StatusTable};
use crate::clock::MonotonicClock;
use crate::config::TargetsConfig;
use crate::error::{AttachError, DrainError, LoadError, MAX_CONSECUTIVE_DRAIN_ERRORS};
use crate::output::row::Row;
use crate::output::SinkHandle;

/// Load a compiled BPF object, verify the named maps exist and populate
/// the target filter maps.
pub(crate) fn load_object(
    monitor: &'static str,
    bytes: &[u8],
    required_maps: &[&str],
    targets: &TargetsConfig,
) -> Result<Ebpf, LoadError> {
    let mut ebpf = EbpfLoader::new().load(bytes).map_err(classify_load_error)?;

    for map in required_maps {
        if ebpf.map(map).is_none() {
            return Err(LoadError::MapCreate(format!(
                "{monitor}: map '{map}' missing from object"
            )));
        }
    }

    apply_target_filters(&mut ebpf, targets)?;

    debug!(monitor, maps = required_maps.len(), "BPF object loaded");
    Ok(ebpf)
}

/// Switch on per-PID / per-UID filtering when targets are configured.
/// With empty lists the filter stays off and every process is observed.
fn apply_target_filters(ebpf: &mut Ebpf, targets: &TargetsConfig) -> Result<(), LoadError> {
    if targets.is_empty() {
        return Ok(());
    }

    if !targets.pids.is_empty() {
        let mut map: BpfHashMap<_, u32, u8> = BpfHashMap::try_from(
            ebpf.map_mut("target_pids")
                .ok_or_else(|| LoadError::MapCreate("target_pids map not found".into()))?,
        )
        .map_err(|e| LoadError::MapCreate(e.to_string()))?;
        for pid in &targets.pids {
            map.insert(pid, 1u8, 0)
                .map_err(|e| LoadError::MapCreate(format!("adding target pid {pid}: {e}")))?;
        }
    }

    if !targets.uids.is_empty() {
        let mut map: BpfHashMap<_, u32, u8> = BpfHashMap::try_from(
            ebpf.map_mut("target_uids")
                .ok_or_else(|| LoadError::MapCreate("target_uids map not found".into()))?,
        )
        .map_err(|e| LoadError::MapCreate(e.to_string()))?;
        for uid in &targets.uids {
            map.insert(uid, 1u8, 0)
                .map_err(|e| LoadError::MapCreate(format!("adding target uid {uid}: {e}")))?;
        }
    }

    let mut enabled: Array<_, u32> = Array::try_from(
        ebpf.map_mut("filter_enabled")
            .ok_or_else(|| LoadError::MapCreate("filter_enabled map not found".into()))?,
    )
    .map_err(|e| LoadError::MapCreate(e.to_string()))?;
    enabled
        .set(0, u32::from(!targets.pids.is_empty()), 0)
        .map_err(|e| LoadError::MapCreate(e.to_string()))?;
    enabled
        .set(1, u32::from(!targets.uids.is_empty()), 0)
        .map_err(|e| LoadError::MapCreate(e.to_string()))?;

    Ok(())
}

fn classify_load_error(e: aya::EbpfError) -> LoadError {
    let text = e.to_string();
    if text.contains("permission denied") || text.contains("Operation not permitted") {
        LoadError::InsufficientPrivilege
    } else if matches!(e, aya::EbpfError::MapError(_)) {
        LoadError::MapCreate(text)
    } else {
        LoadError::BytecodeReject(text)
    }
}

/// Load and attach a tracepoint program.
pub(crate) fn attach_tracepoint(
    ebpf: &mut Ebpf,
    prog_name: &str,
    group: &str,
    name: &str,
) -> Result<(), AttachError> {
    let point = format!("{group}:{name}");

    let prog: &mut TracePoint = ebpf
        .program_mut(prog_name)
        .ok_or_else(|| AttachError::NotAvailable(format!("program '{prog_name}'")))?
        .try_into()
        .map_err(|_| AttachError::Failed {
            point: point.clone(),
            reason: format!("'{prog_name}' is not a tracepoint program"),
        })?;

    prog.load().map_err(|e| AttachError::Failed {
        point: point.clone(),
        reason: e.to_string(),
    })?;
    prog.attach(group, name).map_err(|e| AttachError::Failed {
        point: point.clone(),
        reason: e.to_string(),
    })?;

    debug!(group, name, "attached tracepoint");
    Ok(())
}

/// Load and attach a kprobe program to a symbol.
pub(crate) fn attach_kprobe(
    ebpf: &mut Ebpf,
    prog_name: &str,
    symbol: &str,
) -> Result<(), AttachError> {
    let prog: &mut KProbe = ebpf
        .program_mut(prog_name)
        .ok_or_else(|| AttachError::NotAvailable(format!("program '{prog_name}'")))?
        .try_into()
        .map_err(|_| AttachError::Failed {
            point: symbol.to_string(),
            reason: format!("'{prog_name}' is not a kprobe program"),
        })?;

    prog.load().map_err(|e| AttachError::Failed {
        point: symbol.to_string(),
        reason: e.to_string(),
    })?;
    prog.attach(symbol, 0).map_err(|e| AttachError::Failed {
        point: symbol.to_string(),
        reason: e.to_string(),
    })?;

    debug!(symbol, "attached kprobe");
    Ok(())
}

/// Take a hash map out of a loaded object for exclusive drain ownership.
pub(crate) fn take_hash_map<K: Pod, V: Pod>(
    ebpf: &mut Ebpf,
    map_name: &str,
) -> anyhow::Result<BpfHashMap<MapData, K, V>> {
    let map = ebpf
        .take_map(map_name)
        .ok_or_else(|| anyhow::anyhow!("map '{map_name}' not found"))?;
    Ok(BpfHashMap::try_from(map)?)
}

/// One sweep: snapshot every (key, value) and delete the entries read.
/// Keys re-inserted by the kernel during the sweep are counted from zero
/// on the next tick.
fn sweep<K: Pod, V: Pod>(
    map: &mut BpfHashMap<MapData, K, V>,
) -> Result<Vec<(K, V)>, DrainError> {
    let mut keys = Vec::new();
    for key in map.keys() {
        match key {
            Ok(k) => keys.push(k),
            Err(e) => return Err(DrainError::MapIteration(e.to_string())),
        }
    }

    let mut entries = Vec::with_capacity(keys.len());
    for key in keys {
        // A lookup can miss if user space raced itself; the kernel only
        // inserts and updates.
        if let Ok(value) = map.get(&key, 0) {
            entries.push((key, value));
        }
        let _ = map.remove(&key);
    }

    Ok(entries)
}

/// Drive the periodic drain of an aggregating monitor. `encode` turns one
/// map entry into at most one row; `None` means the entry was filtered.
/// All rows of a tick carry the tick-start timestamp.
pub(crate) fn spawn_sweep_loop<K, V, F>(
    name: &'static str,
    mut map: BpfHashMap<MapData, K, V>,
    interval: Duration,
    clock: MonotonicClock,
    sink: SinkHandle,
    cancel: CancellationToken,
    status: Arc<StatusTable>,
    mut encode: F,
) -> JoinHandle<()>
where
    K: Pod + Send + 'static,
    V: Pod + Send + 'static,
    F: FnMut(f64, &K, &V, bool) -> Option<Row> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // interval() fires immediately; the first sweep should wait one
        // full period.
        ticker.tick().await;

        let mut consecutive_errors: u32 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    let tick_ts = clock.now_epoch_secs();

                    match sweep(&mut map) {
                        Ok(entries) => {
                            consecutive_errors = 0;
                            let echo = sink.echo_console();
                            for (key, value) in &entries {
                                if let Some(row) = encode(tick_ts, key, value, echo) {
                                    sink.submit(row).await;
                                }
                            }
                            status.record_tick(name);
                        }
                        Err(e) => {
                            consecutive_errors += 1;
                            let failed = consecutive_errors >= MAX_CONSECUTIVE_DRAIN_ERRORS;
                            tracing::warn!(
                                monitor = name,
                                consecutive = consecutive_errors,
                                error = %e,
                                "drain tick failed",
                            );
                            status.record_drain_error(name, &e, failed);
                            if failed {
                                return;
                            }
                        }
                    }
                }
            }
        }

        status.set_state(name, MonitorState::Stopping);
    })
}
