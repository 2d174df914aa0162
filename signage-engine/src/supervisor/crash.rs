//! Crash journal: a bounded JSON ring buffer of top-level faults.
//!
//! Writes are synchronous so the panic hook can record a fault before anything else
//! happens. The file is replaced atomically through a sibling temp file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{MemoryRefreshKind, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tracing::warn;
use uuid::Uuid;

use crate::utils::fs::ensure_dir_all_sync;
use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub total_bytes: u64,
    pub used_bytes: u64,
    /// Resident memory of this process, when the platform reports it.
    pub process_bytes: Option<u64>,
}

impl MemorySnapshot {
    pub fn capture() -> Self {
        let mut system = System::new_with_specifics(
            RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
        );
        system.refresh_memory();

        let process_bytes = sysinfo::get_current_pid().ok().and_then(|pid| {
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::nothing().with_memory(),
            );
            system.process(pid).map(|p| p.memory())
        });

        Self {
            total_bytes: system.total_memory(),
            used_bytes: system.used_memory(),
            process_bytes,
        }
    }

    /// Used memory as a fraction of total, 0.0 when unknown.
    pub fn used_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashEnvironment {
    pub version: String,
    pub os: String,
    pub arch: String,
    pub pid: u32,
    pub thread: Option<String>,
}

impl CrashEnvironment {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            pid: std::process::id(),
            thread: std::thread::current().name().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub location: Option<String>,
    pub environment: CrashEnvironment,
    pub memory: MemorySnapshot,
}

impl CrashRecord {
    pub fn capture(message: impl Into<String>, location: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            message: message.into(),
            location,
            environment: CrashEnvironment::current(),
            memory: MemorySnapshot::capture(),
        }
    }
}

pub struct CrashJournal {
    path: PathBuf,
    capacity: usize,
    lock: Mutex<()>,
}

impl CrashJournal {
    pub fn new(path: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            path: path.into(),
            capacity: capacity.max(1),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `record`, dropping the oldest entries beyond capacity. Returns the number
    /// of records kept.
    pub fn append(&self, record: &CrashRecord) -> Result<usize> {
        let _guard = self.lock.lock();
        let mut records = self.read_records();
        records.push(record.clone());
        if records.len() > self.capacity {
            let excess = records.len() - self.capacity;
            records.drain(..excess);
        }
        self.write_records(&records)?;
        Ok(records.len())
    }

    /// All records, oldest first. A missing or unreadable journal is empty.
    pub fn load(&self) -> Vec<CrashRecord> {
        let _guard = self.lock.lock();
        self.read_records()
    }

    fn read_records(&self) -> Vec<CrashRecord> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cannot read crash journal");
                return Vec::new();
            }
        };
        serde_json::from_slice(&raw).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "Discarding corrupt crash journal");
            Vec::new()
        })
    }

    fn write_records(&self, records: &[CrashRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            ensure_dir_all_sync(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(records)?;
        let mut file =
            fs::File::create(&tmp).map_err(|e| Error::io_path("create crash journal", &tmp, e))?;
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|e| Error::io_path("write crash journal", &tmp, e))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| Error::io_path("replace crash journal", &self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_prunes_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let journal = CrashJournal::new(dir.path().join("crashes.json"), 3);

        for i in 0..5 {
            let kept = journal
                .append(&CrashRecord::capture(format!("crash {i}"), None))
                .unwrap();
            assert_eq!(kept, (i + 1).min(3));
        }

        let messages: Vec<String> = journal.load().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["crash 2", "crash 3", "crash 4"]);
    }

    #[test]
    fn test_corrupt_journal_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crashes.json");
        fs::write(&path, b"{not json").unwrap();
        let journal = CrashJournal::new(&path, 10);
        assert!(journal.load().is_empty());

        journal
            .append(&CrashRecord::capture("panic", Some("src/main.rs:1:1".into())))
            .unwrap();
        let records = journal.load();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].environment.pid, std::process::id());
    }

    #[test]
    fn test_memory_ratio() {
        let snapshot = MemorySnapshot {
            total_bytes: 1000,
            used_bytes: 950,
            process_bytes: None,
        };
        assert!(snapshot.used_ratio() > 0.9);
        assert_eq!(MemorySnapshot::default().used_ratio(), 0.0);
    }
}
