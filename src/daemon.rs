//! Daemon helper: background process management through a PID file.
//!
//! The supervisor does not depend on daemon mode; a foreground run never
//! touches any of this. The PID file is removed on clean shutdown only
//! when this helper created it.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{dup2, fork, setsid, ForkResult, Pid};
use tracing::warn;

/// Daemon state as seen through the PID file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Running(i32),
    NotRunning,
    /// PID file exists but no such process.
    Stale(i32),
}

/// Fork into the background, detach from the controlling terminal,
/// redirect std handles to /dev/null and write the PID file.
///
/// Must be called before any async runtime is created: forking a
/// multi-threaded process only carries the calling thread over.
pub fn daemonize(pid_file: &Path) -> Result<()> {
    if let DaemonStatus::Running(pid) = status(pid_file)? {
        bail!("daemon already running with pid {pid}");
    }

    // SAFETY: single-threaded at this point; only fork+exit on the parent
    // side, no allocation between fork and the child's return.
    match unsafe { fork() }.context("first fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().context("setsid")?;

    // Second fork: never reacquire a controlling terminal.
    // SAFETY: as above.
    match unsafe { fork() }.context("second fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    redirect_std_handles().context("redirecting std handles")?;
    write_pid_file(pid_file, std::process::id()).context("writing pid file")?;

    Ok(())
}

/// Inspect the daemon state.
pub fn status(pid_file: &Path) -> Result<DaemonStatus> {
    let Some(pid) = read_pid(pid_file) else {
        return Ok(DaemonStatus::NotRunning);
    };

    if process_alive(pid) {
        Ok(DaemonStatus::Running(pid))
    } else {
        Ok(DaemonStatus::Stale(pid))
    }
}

/// Stop a running daemon: SIGTERM, wait up to `timeout`, escalate to
/// SIGKILL. Removes the PID file afterwards. Returns true when a process
/// was actually signalled.
pub fn stop(pid_file: &Path, timeout: Duration) -> Result<bool> {
    let pid = match status(pid_file)? {
        DaemonStatus::Running(pid) => pid,
        DaemonStatus::Stale(pid) => {
            warn!(pid, "removing stale pid file");
            remove_pid_file(pid_file);
            return Ok(false);
        }
        DaemonStatus::NotRunning => return Ok(false),
    };

    kill(Pid::from_raw(pid), Signal::SIGTERM).context("sending SIGTERM")?;

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !process_alive(pid) {
            remove_pid_file(pid_file);
            return Ok(true);
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    warn!(pid, "daemon did not exit in time, sending SIGKILL");
    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
    remove_pid_file(pid_file);
    Ok(true)
}

/// Remove the PID file, ignoring a missing file.
pub fn remove_pid_file(pid_file: &Path) {
    if let Err(e) = std::fs::remove_file(pid_file) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %pid_file.display(), error = %e, "removing pid file failed");
        }
    }
}

fn write_pid_file(pid_file: &Path, pid: u32) -> Result<()> {
    if let Some(parent) = pid_file.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(pid_file)?;
    writeln!(file, "{pid}")?;
    Ok(())
}

fn read_pid(pid_file: &Path) -> Option<i32> {
    std::fs::read_to_string(pid_file)
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// kill(pid, 0) probes existence without signalling.
fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

fn redirect_std_handles() -> Result<()> {
    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    let fd = devnull.as_raw_fd();

    dup2(fd, libc::STDIN_FILENO).context("dup2 stdin")?;
    dup2(fd, libc::STDOUT_FILENO).context("dup2 stdout")?;
    dup2(fd, libc::STDERR_FILENO).context("dup2 stderr")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_without_pid_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_file = dir.path().join("monitor.pid");
        assert_eq!(status(&pid_file).expect("status"), DaemonStatus::NotRunning);
    }

    #[test]
    fn test_status_running_for_own_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_file = dir.path().join("monitor.pid");
        let own_pid = std::process::id();
        write_pid_file(&pid_file, own_pid).expect("write");

        assert_eq!(
            status(&pid_file).expect("status"),
            DaemonStatus::Running(own_pid as i32)
        );
    }

    #[test]
    fn test_status_stale_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_file = dir.path().join("monitor.pid");
        // PID_MAX_LIMIT is 2^22; this cannot be a live process.
        std::fs::write(&pid_file, "4999999\n").expect("write");

        assert_eq!(
            status(&pid_file).expect("status"),
            DaemonStatus::Stale(4_999_999)
        );
    }

    #[test]
    fn test_stop_cleans_stale_pid_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_file = dir.path().join("monitor.pid");
        std::fs::write(&pid_file, "4999999\n").expect("write");

        let signalled = stop(&pid_file, Duration::from_millis(10)).expect("stop");
        assert!(!signalled);
        assert!(!pid_file.exists());
    }

    #[test]
    fn test_read_pid_rejects_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_file = dir.path().join("monitor.pid");
        std::fs::write(&pid_file, "not a pid\n").expect("write");
        assert_eq!(read_pid(&pid_file), None);
    }

    #[test]
    fn test_pid_file_roundtrip_creates_parents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_file = dir.path().join("temp/nested/monitor.pid");
        write_pid_file(&pid_file, 1234).expect("write");
        assert_eq!(read_pid(&pid_file), Some(1234));

        remove_pid_file(&pid_file);
        assert!(!pid_file.exists());
    }
}
