//! Cross-process coordination through small lock documents
//!
//! A lock file holds `{pid, instance_id, token, acquired_at}`. It is created
//! exclusively, so two racing writers cannot both win. A lock whose owner
//! process is gone, or that is older than the caller's staleness window, is
//! reclaimed by moving it aside first and deleting it only if it is still the
//! file that was judged stale.

use crate::error::{Error, Result};
use crate::storage;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Source of "now", swappable in tests
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Answers whether a process id still belongs to a running process
pub trait LivenessOracle: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Looks the pid up in the process table through sysinfo
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLiveness;

impl LivenessOracle for ProcessLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        let pid = sysinfo::Pid::from_u32(pid);
        let mut system = sysinfo::System::new();
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).is_some()
    }
}

pub trait DistributedLock {
    fn try_acquire(&self, staleness: Duration) -> Result<LockGuard>;
    fn release(&self) -> Result<()>;
    fn is_stale_owner_alive(&self, pid: u32) -> bool;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub instance_id: String,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
}

/// Held lock. Dropping it removes the lock file, if it is still ours.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    token: String,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) {
        // Drop does the work
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(record) = read_record(&self.path) {
            if record.token == self.token {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!("Failed to release lock {}: {}", self.path.display(), e);
                }
            }
        }
    }
}

fn read_raw(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok()
}

fn read_record(path: &Path) -> Option<LockRecord> {
    serde_json::from_str(&read_raw(path)?).ok()
}

pub struct FileLock<C = SystemClock, L = ProcessLiveness> {
    path: PathBuf,
    instance_id: String,
    pid: u32,
    clock: C,
    liveness: L,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>, instance_id: impl Into<String>) -> Self {
        Self::with_parts(path, instance_id, std::process::id(), SystemClock, ProcessLiveness)
    }
}

impl<C: Clock, L: LivenessOracle> FileLock<C, L> {
    pub fn with_parts(
        path: impl Into<PathBuf>,
        instance_id: impl Into<String>,
        pid: u32,
        clock: C,
        liveness: L,
    ) -> Self {
        Self {
            path: path.into(),
            instance_id: instance_id.into(),
            pid,
            clock,
            liveness,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current_owner(&self) -> Option<LockRecord> {
        read_record(&self.path)
    }

    /// Whether an existing lock may be taken over
    fn is_reclaimable(&self, record: Option<&LockRecord>, staleness: Duration) -> bool {
        let Some(record) = record else {
            // Unreadable or half-written
            return true;
        };
        if self.clock.now() - record.acquired_at > staleness {
            debug!("Lock {} is older than {}s", self.path.display(), staleness.num_seconds());
            return true;
        }
        // A leftover from an earlier run of this same instance that reused our pid
        if record.pid == self.pid && record.instance_id == self.instance_id {
            return true;
        }
        !self.is_stale_owner_alive(record.pid)
    }

    fn create_exclusive(&self, token: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let record = LockRecord {
            pid: self.pid,
            instance_id: self.instance_id.clone(),
            token: token.to_string(),
            acquired_at: self.clock.now(),
        };
        let body = serde_json::to_vec(&record).map_err(std::io::Error::other)?;
        let mut file = OpenOptions::new().write(true).create_new(true).open(&self.path)?;
        file.write_all(&body)?;
        file.sync_all()
    }

    fn holds(&self, token: &str) -> bool {
        read_record(&self.path).is_some_and(|record| record.token == token)
    }

    /// Remove a lock file judged stale, but only if it still has the content
    /// that was judged. Returns false when another process replaced it in the
    /// meantime; the replacement is put back.
    fn reclaim(&self, judged: &str) -> Result<bool> {
        let aside = self.path.with_extension(format!("stale-{}", uuid::Uuid::new_v4()));
        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(Error::io(&self.path, e)),
        }
        let moved = read_raw(&aside).unwrap_or_default();
        if moved == judged {
            storage::remove_if_exists(&aside)?;
            return Ok(true);
        }
        debug!("Lock {} changed owner while reclaiming", self.path.display());
        // hard_link never overwrites a lock created since the rename
        if let Err(e) = fs::hard_link(&aside, &self.path) {
            warn!("Could not restore lock {}: {}", self.path.display(), e);
        }
        storage::remove_if_exists(&aside)?;
        Ok(false)
    }

    fn contention(&self, detail: Option<&LockRecord>) -> Error {
        let owner = detail.map(|r| r.pid.to_string()).unwrap_or_default();
        Error::LockContention(format!("{} (held by pid {})", self.path.display(), owner))
    }
}

impl<C: Clock, L: LivenessOracle> DistributedLock for FileLock<C, L> {
    fn try_acquire(&self, staleness: Duration) -> Result<LockGuard> {
        let token = uuid::Uuid::new_v4().to_string();
        // Second attempt only after reclaiming a stale lock
        for _ in 0..2 {
            match self.create_exclusive(&token) {
                Ok(()) => {
                    // A reclaimer working from an older judgement may have moved ours away
                    if !self.holds(&token) {
                        return Err(self.contention(self.current_owner().as_ref()));
                    }
                    debug!("Acquired lock {}", self.path.display());
                    return Ok(LockGuard { path: self.path.clone(), token });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let raw = read_raw(&self.path);
                    let record: Option<LockRecord> = raw.as_deref().and_then(|c| serde_json::from_str(c).ok());
                    if !self.is_reclaimable(record.as_ref(), staleness) {
                        return Err(self.contention(record.as_ref()));
                    }
                    info!("Reclaiming stale lock {}", self.path.display());
                    if !self.reclaim(raw.as_deref().unwrap_or_default())? {
                        return Err(self.contention(self.current_owner().as_ref()));
                    }
                }
                Err(e) => return Err(Error::io(&self.path, e)),
            }
        }
        Err(Error::LockContention(self.path.display().to_string()))
    }

    fn release(&self) -> Result<()> {
        match read_record(&self.path) {
            Some(record) if record.pid == self.pid && record.instance_id == self.instance_id => {
                storage::remove_if_exists(&self.path)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn is_stale_owner_alive(&self, pid: u32) -> bool {
        self.liveness.is_alive(pid)
    }
}

/// Which instance currently owns automatic regeneration of a shared state folder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    pub client_id: String,
    pub auto_regen: bool,
    pub timestamp: i64,
}

pub struct RegenOwnership<C = SystemClock> {
    path: PathBuf,
    clock: C,
    staleness: Duration,
}

impl RegenOwnership {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_clock(path, SystemClock)
    }
}

impl<C: Clock> RegenOwnership<C> {
    pub fn with_clock(path: impl Into<PathBuf>, clock: C) -> Self {
        Self {
            path: path.into(),
            clock,
            staleness: Duration::hours(24),
        }
    }

    pub fn read(&self) -> Option<OwnershipRecord> {
        let content = fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Another instance that has auto regeneration on and refreshed its record recently
    pub fn conflict(&self, instance_id: &str) -> Option<OwnershipRecord> {
        let record = self.read()?;
        let age = self.clock.now().timestamp() - record.timestamp;
        if record.client_id != instance_id && record.auto_regen && age < self.staleness.num_seconds() {
            Some(record)
        } else {
            None
        }
    }

    pub fn claim(&self, instance_id: &str, auto_regen: bool) -> Result<()> {
        let record = OwnershipRecord {
            client_id: instance_id.to_string(),
            auto_regen,
            timestamp: self.clock.now().timestamp(),
        };
        storage::atomic_write(&self.path, &serde_json::to_vec_pretty(&record)?)
    }

    pub fn relinquish(&self, instance_id: &str) -> Result<()> {
        match self.read() {
            Some(record) if record.client_id == instance_id => {
                storage::remove_if_exists(&self.path)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct InstanceFile {
    instance_id: String,
}

/// Stable id for this installation, created on first use
pub fn load_or_create_instance_id(data_dir: &Path) -> Result<String> {
    let path = data_dir.join("instance.json");
    if let Some(content) = storage::read_optional(&path)? {
        match serde_json::from_str::<InstanceFile>(&content) {
            Ok(file) if !file.instance_id.is_empty() => return Ok(file.instance_id),
            _ => warn!("Ignoring unreadable {}", path.display()),
        }
    }
    let file = InstanceFile { instance_id: uuid::Uuid::new_v4().to_string() };
    storage::atomic_write(&path, &serde_json::to_vec_pretty(&file)?)?;
    info!("Created instance id {}", file.instance_id);
    Ok(file.instance_id)
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
