//! Playback files, the combined playlist and the program guide

pub mod guide;
pub mod m3u;

pub use guide::{read_guide, GuideChannel, GuideProgramme};
pub use m3u::{parse_playback, PlaybackBlock};

use crate::config::AppConfig;
use crate::error::Result;
use crate::models::{Channel, PlaybackEntry};
use crate::storage;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const COMBINED_PLAYLIST: &str = "linearcast.m3u";
pub const GUIDE_FILE: &str = "linearcast.xml";
pub const COMPRESSED_GUIDE_FILE: &str = "linearcast.xml.gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Header plus every entry
    Full,
    /// Drop the first `expired` entries of the existing file, keep the
    /// rest untouched and append
    Patch { expired: usize },
}

/// Which aggregate outputs changed on disk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub channels: usize,
    pub playlist_written: bool,
    pub guide_written: bool,
    pub compressed_written: bool,
}

/// Keep alphanumerics, spaces, `_` and `-`; spaces become `_`
pub fn safe_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '_' | '-'))
        .map(|c| if c == ' ' { '_' } else { c })
        .collect()
}

pub fn playback_file_name(channel: &Channel) -> String {
    format!("Channel_{}_{}.m3u", channel.number, safe_name(&channel.name))
}

pub struct PlaylistEmitter {
    dir: PathBuf,
    group_title: String,
    compress_guide: bool,
}

impl PlaylistEmitter {
    pub fn new(dir: impl Into<PathBuf>, group_title: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            group_title: group_title.into(),
            compress_guide: false,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            dir: config.shared_dir().to_path_buf(),
            group_title: config.group_title.clone(),
            compress_guide: config.compress_guide,
        }
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compress_guide = enabled;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn playback_path(&self, channel: &Channel) -> PathBuf {
        self.dir.join(playback_file_name(channel))
    }

    pub fn guide_path(&self) -> PathBuf {
        self.dir.join(GUIDE_FILE)
    }

    /// Parsed entries of a channel's playback file, `None` when it does not exist
    pub fn read_playback(&self, channel: &Channel) -> Result<Option<Vec<PlaybackBlock>>> {
        let path = self.playback_path(channel);
        Ok(storage::read_optional(&path)?.map(|content| parse_playback(&content)))
    }

    pub fn write(&self, channel: &Channel, entries: &[PlaybackEntry], mode: WriteMode) -> Result<PathBuf> {
        let path = self.playback_path(channel);
        let content = match mode {
            WriteMode::Full => m3u::render(entries),
            WriteMode::Patch { expired } => {
                let existing = storage::read_optional(&path)?.unwrap_or_default();
                let blocks = parse_playback(&existing);
                if expired > blocks.len() {
                    warn!(
                        "Channel {}: {} entries expired but the file holds {}",
                        channel.number,
                        expired,
                        blocks.len()
                    );
                }

                let mut out = String::from(m3u::HEADER);
                out.push('\n');
                for block in blocks.iter().skip(expired) {
                    out.push_str(&block.raw);
                    if !block.raw.ends_with('\n') {
                        out.push('\n');
                    }
                }
                for entry in entries {
                    out.push_str(&m3u::format_entry(entry));
                }
                out
            }
        };
        storage::atomic_write(&path, content.as_bytes())?;
        debug!("Wrote {} ({:?}, {} new entries)", path.display(), mode, entries.len());
        Ok(path)
    }

    /// Raw playback file content, kept so a failed save can put it back
    pub fn snapshot_playback(&self, channel: &Channel) -> Result<Option<String>> {
        storage::read_optional(&self.playback_path(channel))
    }

    /// Put a snapshot back: rewrite the content, or remove the file when
    /// there was none
    pub fn restore_playback(&self, channel: &Channel, previous: Option<&str>) -> Result<()> {
        let path = self.playback_path(channel);
        match previous {
            Some(content) => storage::atomic_write(&path, content.as_bytes()),
            None => storage::remove_if_exists(&path).map(|_| ()),
        }
    }

    /// Delete a channel's playback file. Returns whether one existed.
    pub fn remove_playback(&self, channel: &Channel) -> Result<bool> {
        storage::remove_if_exists(&self.playback_path(channel))
    }

    fn combined_playlist(&self, channels: &[(&Channel, Vec<PlaybackEntry>)]) -> String {
        let mut out = String::from(m3u::HEADER);
        out.push('\n');
        for (channel, entries) in channels {
            let name = m3u::flatten(&channel.name);
            for entry in entries {
                out.push_str(&format!(
                    "#EXTINF:{} tvg-id=\"{}\" tvg-name=\"{}. {}\" tvg-chno=\"{}\" group-title=\"{}\",{}\n{}\n",
                    entry.duration_seconds,
                    channel.id,
                    channel.number,
                    name,
                    channel.number,
                    self.group_title,
                    name,
                    entry.file_locator
                ));
            }
        }
        out
    }

    /// Rebuild the combined playlist and the guide from every channel's
    /// playback file. Files are only rewritten when their bytes change.
    pub fn sync_outputs(&self, channels: &[Channel]) -> Result<SyncReport> {
        let mut ordered: Vec<&Channel> = channels.iter().collect();
        ordered.sort_by_key(|c| c.number);

        let mut loaded: Vec<(&Channel, Vec<PlaybackEntry>)> = Vec::with_capacity(ordered.len());
        for channel in ordered {
            let entries = match self.read_playback(channel) {
                Ok(Some(blocks)) => blocks.into_iter().map(|b| b.entry).collect(),
                Ok(None) => {
                    debug!("Channel {} has no playback file yet", channel.number);
                    Vec::new()
                }
                Err(e) => {
                    warn!("Skipping channel {} in aggregate outputs: {}", channel.number, e);
                    continue;
                }
            };
            loaded.push((channel, entries));
        }

        let playlist = self.combined_playlist(&loaded);
        let views: Vec<(&Channel, &[PlaybackEntry])> =
            loaded.iter().map(|(c, e)| (*c, e.as_slice())).collect();
        let guide = guide::render_guide(&views)?;

        let mut report = SyncReport {
            channels: loaded.len(),
            playlist_written: storage::write_if_changed(&self.dir.join(COMBINED_PLAYLIST), playlist.as_bytes())?,
            guide_written: storage::write_if_changed(&self.guide_path(), &guide)?,
            compressed_written: false,
        };
        let compressed_path = self.dir.join(COMPRESSED_GUIDE_FILE);
        if self.compress_guide {
            if report.guide_written || !compressed_path.exists() {
                storage::atomic_write(&compressed_path, &guide::compress(&guide)?)?;
                report.compressed_written = true;
            }
        } else if storage::remove_if_exists(&compressed_path)? {
            debug!("Removed {}", compressed_path.display());
        }

        if report.playlist_written || report.guide_written {
            info!(
                "Updated aggregate outputs for {} channels (playlist: {}, guide: {})",
                report.channels, report.playlist_written, report.guide_written
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
#[path = "emitter_tests.rs"]
mod tests;
