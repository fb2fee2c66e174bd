//! Channel state persistence
//!
//! `channels.json` holds every channel with its sources and rotation
//! cursors. Loads migrate older documents and recover from corruption; saves
//! take the state lock, copy the current file to `channels.json.bak` and
//! swap in the new content atomically.

use crate::error::{Error, Result};
use crate::lock::{DistributedLock, FileLock};
use crate::models::{derive_channel_id, Channel};
use crate::storage;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

pub const STATE_FILE: &str = "channels.json";
const STATE_LOCK_STALENESS_SECS: i64 = 60;

/// What to do when the state document cannot be read
pub enum RecoveryPolicy<'a> {
    /// Nobody to ask: start empty
    Unattended,
    /// Ask the closure whether to restore the backup
    Interactive(&'a mut dyn FnMut(&str) -> bool),
}

#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub channels: Vec<Channel>,
    /// Message for the user when state had to be repaired or dropped
    pub notice: Option<String>,
    pub migrated: bool,
    pub restored: bool,
}

pub struct ChannelStore<L: DistributedLock = FileLock> {
    path: PathBuf,
    lock: L,
}

impl ChannelStore {
    pub fn open(dir: &Path, instance_id: &str) -> Self {
        let path = dir.join(STATE_FILE);
        let lock = FileLock::new(lock_path(&path), instance_id);
        Self { path, lock }
    }
}

fn lock_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.lock", path.display()))
}

impl<L: DistributedLock> ChannelStore<L> {
    pub fn with_lock(path: PathBuf, lock: L) -> Self {
        Self { path, lock }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.bak", self.path.display()))
    }

    pub fn load(&self, recovery: RecoveryPolicy<'_>) -> Result<LoadOutcome> {
        let Some(content) = storage::read_optional(&self.path)? else {
            debug!("No state file at {}, starting empty", self.path.display());
            return Ok(LoadOutcome::default());
        };

        match parse_document(&content) {
            Ok((channels, migrated)) => {
                if migrated {
                    info!("Migrated channel state in {}", self.path.display());
                    if let Err(e) = self.save(&channels) {
                        warn!("Could not re-save migrated state: {}", e);
                    }
                }
                Ok(LoadOutcome {
                    channels,
                    migrated,
                    ..Default::default()
                })
            }
            Err(e) => {
                error!("Channel state {} is unusable: {}", self.path.display(), e);
                self.recover(&e, recovery)
            }
        }
    }

    fn recover(&self, reason: &Error, recovery: RecoveryPolicy<'_>) -> Result<LoadOutcome> {
        let backup = self.backup_path();
        let empty = LoadOutcome {
            notice: Some("Channel state was unreadable; starting with no channels.".to_string()),
            ..Default::default()
        };
        if !backup.exists() {
            return Ok(empty);
        }

        let accepted = match recovery {
            RecoveryPolicy::Unattended => false,
            RecoveryPolicy::Interactive(ask) => ask(&format!(
                "Channel state is corrupt ({}). Restore from backup?",
                reason
            )),
        };
        if !accepted {
            info!("Backup restore declined, starting with no channels");
            return Ok(empty);
        }

        let content = fs::read_to_string(&backup).map_err(|e| Error::io(&backup, e))?;
        match parse_document(&content) {
            Ok((channels, _)) => {
                // Not through save(): that would back up the corrupt file over the good one
                let _guard = self.lock.try_acquire(chrono::Duration::seconds(STATE_LOCK_STALENESS_SECS))?;
                storage::atomic_write(&self.path, content.as_bytes())?;
                info!("Restored {} channels from {}", channels.len(), backup.display());
                Ok(LoadOutcome {
                    channels,
                    notice: Some("Channel state restored from backup.".to_string()),
                    restored: true,
                    ..Default::default()
                })
            }
            Err(e) => {
                warn!("Backup {} is unusable too: {}", backup.display(), e);
                Ok(empty)
            }
        }
    }

    /// Atomically replace the state file. Never blocks on the lock.
    pub fn save(&self, channels: &[Channel]) -> Result<()> {
        validate(channels)?;
        let _guard = self.lock.try_acquire(chrono::Duration::seconds(STATE_LOCK_STALENESS_SECS))?;
        self.write_locked(channels)
    }

    /// Read, change and write the state file under one hold of the lock, so
    /// `apply` works on what is on disk rather than an older copy
    pub fn update<F>(&self, apply: F) -> Result<Vec<Channel>>
    where
        F: FnOnce(&mut Vec<Channel>),
    {
        let _guard = self.lock.try_acquire(chrono::Duration::seconds(STATE_LOCK_STALENESS_SECS))?;
        let mut channels = match storage::read_optional(&self.path)? {
            Some(content) => parse_document(&content)?.0,
            None => Vec::new(),
        };
        apply(&mut channels);
        validate(&channels)?;
        self.write_locked(&channels)?;
        Ok(channels)
    }

    fn write_locked(&self, channels: &[Channel]) -> Result<()> {
        let body = to_document(channels)?;
        self.backup_current()?;
        storage::atomic_write(&self.path, body.as_bytes())?;
        debug!("Saved {} channels to {}", channels.len(), self.path.display());
        Ok(())
    }

    fn backup_current(&self) -> Result<()> {
        let Some(current) = storage::read_optional(&self.path)? else {
            return Ok(());
        };
        if serde_json::from_str::<Value>(&current).is_err() {
            warn!("Not backing up unparsable {}", self.path.display());
            return Ok(());
        }
        storage::atomic_write(&self.backup_path(), current.as_bytes())
    }
}

/// Serialize channels exactly as they are persisted
pub fn to_document(channels: &[Channel]) -> Result<String> {
    Ok(serde_json::to_string_pretty(channels)?)
}

/// Parse and migrate a state document. The flag reports whether migration changed anything.
pub fn parse_document(content: &str) -> Result<(Vec<Channel>, bool)> {
    let mut doc: Value =
        serde_json::from_str(content).map_err(|e| Error::InvalidChannelState(e.to_string()))?;
    let Value::Array(entries) = &mut doc else {
        return Err(Error::InvalidChannelState("expected a list of channels".into()));
    };

    let mut migrated = false;
    for entry in entries.iter_mut() {
        migrated |= migrate_entry(entry)?;
    }

    let mut channels: Vec<Channel> =
        serde_json::from_value(doc).map_err(|e| Error::InvalidChannelState(e.to_string()))?;

    for channel in &mut channels {
        for source in &mut channel.sources {
            let fixed = source.rotation.sanitize();
            if fixed > 0 {
                warn!(
                    "Channel {}: repaired {} rotation entries for {}",
                    channel.number, fixed, source.path
                );
                migrated = true;
            }
        }
    }

    validate(&channels)?;
    Ok((channels, migrated))
}

fn migrate_entry(entry: &mut Value) -> Result<bool> {
    let Some(obj) = entry.as_object_mut() else {
        return Err(Error::InvalidChannelState("channel entry is not an object".into()));
    };
    let mut changed = false;

    let has_id = obj
        .get("id")
        .and_then(Value::as_str)
        .is_some_and(|id| !id.is_empty());
    if !has_id {
        let name = obj.get("name").and_then(Value::as_str).unwrap_or_default();
        let id = derive_channel_id(name);
        obj.insert("id".into(), json!(id));
        obj.insert("is_new".into(), json!(true));
        changed = true;
    }

    if !obj.contains_key("limit_type") {
        obj.insert("limit_type".into(), json!("time"));
        changed = true;
    }

    let rounded = match obj.get("total_gen_duration") {
        Some(Value::Number(n)) if n.as_u64().is_none() => n.as_f64().map(|f| f.max(0.0).round() as u64),
        _ => None,
    };
    if let Some(secs) = rounded {
        obj.insert("total_gen_duration".into(), json!(secs));
        changed = true;
    }

    if let Some(Value::Array(sources)) = obj.get_mut("playlists") {
        for source in sources.iter_mut().filter_map(Value::as_object_mut) {
            for key in ["last_index", "random_order"] {
                if !source.contains_key(key) {
                    source.insert(key.into(), json!({}));
                    changed = true;
                }
            }
        }
    }

    Ok(changed)
}

fn validate(channels: &[Channel]) -> Result<()> {
    let mut numbers = HashSet::new();
    let mut ids = HashSet::new();
    for channel in channels {
        if channel.number == 0 {
            return Err(Error::InvalidChannelState(format!("channel '{}' has number 0", channel.name)));
        }
        if !numbers.insert(channel.number) {
            return Err(Error::InvalidChannelState(format!("duplicate channel number {}", channel.number)));
        }
        if channel.id.is_empty() || !ids.insert(channel.id.as_str()) {
            return Err(Error::InvalidChannelState(format!(
                "missing or duplicate id for channel {}",
                channel.number
            )));
        }
    }
    Ok(())
}

/// First channel number not in use
pub fn suggest_channel_number(channels: &[Channel]) -> u32 {
    let used: HashSet<u32> = channels.iter().map(|c| c.number).collect();
    (1..).find(|n| !used.contains(n)).unwrap_or(1)
}

/// Copy state, caches and emitted files into `<dest_root>/backup_<timestamp>/`
pub fn create_backup(
    shared_dir: &Path,
    data_dir: &Path,
    dest_root: &Path,
    now: DateTime<Utc>,
) -> Result<(PathBuf, usize)> {
    let dest = dest_root.join(format!("backup_{}", now.format("%Y%m%d_%H%M%S")));
    let mut copied = copy_matching(shared_dir, &dest.join("shared"))?;
    if data_dir != shared_dir {
        copied += copy_matching(data_dir, &dest.join("data"))?;
    }
    info!("Backed up {} files to {}", copied, dest.display());
    Ok((dest, copied))
}

/// Copy a backup made by `create_backup` back into place
pub fn restore_backup(backup_dir: &Path, shared_dir: &Path, data_dir: &Path) -> Result<usize> {
    let shared = backup_dir.join("shared");
    if !shared.is_dir() {
        return Err(Error::InvalidChannelState(format!(
            "{} is not a backup directory",
            backup_dir.display()
        )));
    }
    let mut copied = copy_matching(&shared, shared_dir)?;
    let data = backup_dir.join("data");
    if data.is_dir() {
        copied += copy_matching(&data, data_dir)?;
    }
    info!("Restored {} files from {}", copied, backup_dir.display());
    Ok(copied)
}

fn is_backed_up(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower == STATE_FILE
        || lower == "durations.json"
        || lower.ends_with(".m3u")
        || lower.ends_with(".xml")
        || lower.ends_with(".xml.gz")
}

fn copy_matching(from: &Path, to: &Path) -> Result<usize> {
    let entries = match fs::read_dir(from) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(Error::io(from, e)),
    };
    let mut copied = 0;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.path().is_file() && is_backed_up(&name) {
            storage::copy_file(&entry.path(), &to.join(&name))?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
