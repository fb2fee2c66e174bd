//! Folder sources: video file listing and the ffprobe duration cache

use crate::error::{Error, Result};
use crate::storage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

pub const DURATIONS_FILE: &str = "durations.json";
const VIDEO_EXTENSIONS: [&str; 6] = ["mp4", "mkv", "avi", "m4v", "ts", "mov"];

fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| VIDEO_EXTENSIONS.iter().any(|v| v.eq_ignore_ascii_case(e)))
}

/// Every video file under `root`: files of a directory first, then its
/// subdirectories, both sorted by name
pub fn list_video_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        } else if is_video(&path) {
            files.push(path);
        }
    }
    files.sort();
    dirs.sort();
    for dir in dirs {
        match list_video_files(&dir) {
            Ok(found) => files.extend(found),
            Err(e) => warn!("Error listing {}: {}", dir.display(), e),
        }
    }
    Ok(files)
}

/// Cached probe results, keyed by full file path
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationCache {
    #[serde(default)]
    pub durations: BTreeMap<String, f64>,
    /// Unix seconds of the last completed scan
    #[serde(default)]
    pub last_scan: f64,
}

impl DurationCache {
    pub fn load(path: &Path) -> Result<Self> {
        match storage::read_optional(path)? {
            None => Ok(Self::default()),
            Some(content) => Ok(serde_json::from_str(&content)?),
        }
    }

    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            warn!("Ignoring unreadable duration cache {}: {}", path.display(), e);
            Self::default()
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let body = serde_json::to_string_pretty(self)?;
        storage::atomic_write(path, body.as_bytes())
    }

    pub fn duration_of(&self, file: &str) -> Option<f64> {
        self.durations.get(file).copied()
    }

    /// Whether a scan happened less than `days` ago
    pub fn is_fresh(&self, now: DateTime<Utc>, days: u64) -> bool {
        let now_secs = now.timestamp_millis() as f64 / 1000.0;
        let age_days = (now_secs - self.last_scan) / 86_400.0;
        age_days < days as f64
    }
}

/// Measures a media file's duration in seconds
pub trait DurationProbe {
    fn probe(&self, file: &Path) -> Result<Option<f64>>;
}

pub struct FfprobeProbe {
    program: String,
}

#[derive(Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: FfprobeFormat,
}

#[derive(Deserialize, Default)]
struct FfprobeFormat {
    #[serde(default)]
    duration: Option<String>,
}

impl FfprobeProbe {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }
}

impl DurationProbe for FfprobeProbe {
    fn probe(&self, file: &Path) -> Result<Option<f64>> {
        let output = Command::new(&self.program)
            .args(["-v", "error", "-show_entries", "format=duration", "-of", "json"])
            .arg(file)
            .output()
            .map_err(|e| Error::io(&self.program, e))?;
        if !output.status.success() {
            debug!("ffprobe failed for {}: {}", file.display(), String::from_utf8_lossy(&output.stderr).trim());
            return Ok(None);
        }
        Ok(parse_ffprobe_duration(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Duration from `ffprobe -show_entries format=duration -of json` output
pub fn parse_ffprobe_duration(json: &str) -> Option<f64> {
    let parsed: FfprobeOutput = serde_json::from_str(json).ok()?;
    parsed
        .format
        .duration
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| *d > 0.0)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RescanReport {
    pub files_seen: usize,
    pub probed: usize,
    pub failed: usize,
    /// Nothing was probed because the cache was fresh
    pub skipped_fresh: bool,
}

/// Probe the videos under `folder` into `cache`. Files already timed are
/// skipped unless `force`; so is the whole folder while the cache is fresh.
pub fn rescan(
    cache: &mut DurationCache,
    folder: &Path,
    probe: &dyn DurationProbe,
    now: DateTime<Utc>,
    rescan_days: u64,
    force: bool,
) -> Result<RescanReport> {
    let mut report = RescanReport::default();
    if !force && cache.is_fresh(now, rescan_days) {
        info!("Durations for {} are fresh, skipping scan", folder.display());
        report.skipped_fresh = true;
        return Ok(report);
    }

    let files = list_video_files(folder).map_err(|e| Error::io(folder, e))?;
    report.files_seen = files.len();
    for file in files {
        let key = file.to_string_lossy().to_string();
        if !force && cache.duration_of(&key).is_some_and(|d| d > 0.0) {
            continue;
        }
        match probe.probe(&file) {
            Ok(Some(seconds)) => {
                cache.durations.insert(key, seconds);
                report.probed += 1;
            }
            Ok(None) => report.failed += 1,
            Err(e) => {
                warn!("Error scanning duration for {}: {}", file.display(), e);
                report.failed += 1;
            }
        }
    }
    cache.last_scan = now.timestamp_millis() as f64 / 1000.0;
    info!(
        "Scanned {} of {} files in {} ({} failed)",
        report.probed,
        report.files_seen,
        folder.display(),
        report.failed
    );
    Ok(report)
}
