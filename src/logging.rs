//! Log sink with daily rotation.
//!
//! The active file is `monitor.log`; at the first write of a new day the
//! file is renamed to `monitor.log.YYYY-MM-DD` and a fresh one opened.
//! Rotations older than the retention window are deleted on rotation.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{Local, NaiveDate};
use tracing_subscriber::fmt::MakeWriter;

const LOG_FILE_NAME: &str = "monitor.log";

/// Thread-safe daily rotating writer for the tracing file layer.
#[derive(Clone)]
pub struct DailyLogWriter {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    dir: PathBuf,
    retention_days: u32,
    current_date: NaiveDate,
    file: Option<File>,
}

impl DailyLogWriter {
    pub fn new(dir: &Path, retention_days: u32) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                dir: dir.to_path_buf(),
                retention_days,
                current_date: Local::now().date_naive(),
                file: None,
            })),
        })
    }
}

impl Inner {
    fn active_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE_NAME)
    }

    fn ensure_file(&mut self, today: NaiveDate) -> io::Result<&mut File> {
        if self.file.is_some() && today != self.current_date {
            // Roll: close, rename with the previous date, clean up.
            self.file = None;
            let rotated = self.dir.join(rotated_name(self.current_date));
            if let Err(e) = std::fs::rename(self.active_path(), rotated) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(e);
                }
            }
            cleanup_rotations(&self.dir, today, self.retention_days);
            self.current_date = today;
        }

        if self.file.is_none() {
            self.current_date = today;
            self.file = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.active_path())?,
            );
        }

        Ok(self.file.as_mut().expect("file just ensured"))
    }
}

impl Write for DailyLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().expect("log writer lock");
        let today = Local::now().date_naive();
        inner.ensure_file(today)?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self.inner.lock().expect("log writer lock");
        match inner.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DailyLogWriter {
    type Writer = DailyLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Rotated file name for a given day.
fn rotated_name(date: NaiveDate) -> String {
    format!("{LOG_FILE_NAME}.{}", date.format("%Y-%m-%d"))
}

/// Date parsed back from a rotated file name, if it is one.
fn rotation_date(file_name: &str) -> Option<NaiveDate> {
    let suffix = file_name.strip_prefix(LOG_FILE_NAME)?.strip_prefix('.')?;
    NaiveDate::parse_from_str(suffix, "%Y-%m-%d").ok()
}

fn cleanup_rotations(dir: &Path, today: NaiveDate, retention_days: u32) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(date) = rotation_date(&name) else {
            continue;
        };

        let age = (today - date).num_days();
        if age > i64::from(retention_days) {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn test_rotated_name_roundtrip() {
        let date = day(2026, 8, 1);
        let name = rotated_name(date);
        assert_eq!(name, "monitor.log.2026-08-01");
        assert_eq!(rotation_date(&name), Some(date));
    }

    #[test]
    fn test_rotation_date_rejects_other_files() {
        assert_eq!(rotation_date("monitor.log"), None);
        assert_eq!(rotation_date("monitor.log.tmp"), None);
        assert_eq!(rotation_date("other.log.2026-08-01"), None);
    }

    #[test]
    fn test_write_creates_active_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = DailyLogWriter::new(dir.path(), 7).expect("writer");

        writer.write_all(b"hello\n").expect("write");
        writer.flush().expect("flush");

        let content =
            std::fs::read_to_string(dir.path().join("monitor.log")).expect("read log");
        assert_eq!(content, "hello\n");
    }

    #[test]
    fn test_rotation_on_date_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = DailyLogWriter::new(dir.path(), 7).expect("writer");

        // Pretend yesterday's file is open.
        {
            let mut inner = writer.inner.lock().expect("lock");
            let yesterday = Local::now().date_naive() - chrono::Duration::days(1);
            inner.ensure_file(yesterday).expect("open");
            inner.file.as_mut().expect("file").write_all(b"old\n").expect("write");
        }

        let mut writer = writer;
        writer.write_all(b"new\n").expect("write");

        let yesterday = Local::now().date_naive() - chrono::Duration::days(1);
        let rotated = dir.path().join(rotated_name(yesterday));
        assert!(rotated.exists(), "rotated file missing");
        assert_eq!(std::fs::read_to_string(rotated).expect("read"), "old\n");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("monitor.log")).expect("read"),
            "new\n"
        );
    }

    #[test]
    fn test_cleanup_removes_expired_rotations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let today = day(2026, 8, 1);

        let fresh = dir.path().join(rotated_name(day(2026, 7, 30)));
        let expired = dir.path().join(rotated_name(day(2025, 1, 1)));
        let unrelated = dir.path().join("keep.txt");
        std::fs::write(&fresh, "x").expect("write");
        std::fs::write(&expired, "x").expect("write");
        std::fs::write(&unrelated, "x").expect("write");

        cleanup_rotations(dir.path(), today, 365);

        assert!(fresh.exists());
        assert!(!expired.exists());
        assert!(unrelated.exists());
    }
}
