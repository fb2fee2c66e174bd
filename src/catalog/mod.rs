//! Media catalog adapter
//!
//! Turns a channel source into playable items with durations. Smart
//! playlist sources go through a `CatalogBackend` (the local video database
//! or a remote JSON-RPC service). Folder sources are listed from disk and
//! timed from the ffprobe duration cache.

pub mod folder;
pub mod jsonrpc;
pub mod smart_playlist;
pub mod sqlite;

pub use folder::{DurationCache, DurationProbe, FfprobeProbe};
pub use smart_playlist::SmartPlaylist;

use crate::config::{AppConfig, CatalogBackendKind};
use crate::error::{Error, Result};
use crate::models::{GroupKey, Item, Source, SourceKind, SourceOrigin};
use rand::seq::SliceRandom;
use rand::Rng;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const SKIP_LOG_FILE: &str = "missing_durations.log";
const PLAYLIST_PREFIX: &str = "special://profile/playlists/video/";

/// One row answered by a catalog query, before durations are known
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogEntry {
    pub file: String,
    pub title: String,
    pub show_title: Option<String>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub description: Option<String>,
    pub thumbnail: Option<String>,
    pub studio: Option<String>,
}

/// What the secondary lookup knows about one file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaDetails {
    pub duration_seconds: u64,
    /// Show name for episodes, movie title for movies
    pub group_name: Option<String>,
    pub description: Option<String>,
    pub studio: Option<String>,
}

pub trait CatalogBackend {
    fn name(&self) -> &'static str;

    /// Entries matching the playlist's rules, restricted to `kind`
    fn query(&self, playlist: &SmartPlaylist, kind: SourceKind) -> Result<Vec<CatalogEntry>>;

    /// Details for `filename` inside `directory` (with trailing `/`)
    fn lookup(&self, filename: &str, directory: &str, kind: SourceKind) -> Result<Option<MediaDetails>>;
}

/// Items of one source plus the ordering hints the scheduler needs
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub items: Vec<Item>,
    pub group_order_hint: Vec<GroupKey>,
    pub is_randomized: bool,
    pub is_one_match: bool,
}

/// Open the backend named by the configuration
pub fn open_backend(config: &AppConfig) -> Result<Box<dyn CatalogBackend>> {
    match config.catalog.backend {
        CatalogBackendKind::Sqlite => {
            let location = config
                .catalog
                .database
                .clone()
                .ok_or_else(|| Error::CatalogUnavailable("no video database configured".into()))?;
            Ok(Box::new(sqlite::SqliteCatalog::open(&location)?))
        }
        CatalogBackendKind::JsonRpc => Ok(Box::new(jsonrpc::JsonRpcCatalog::new(&config.catalog))),
    }
}

/// Append-only record of items dropped for lack of a duration
#[derive(Debug, Clone)]
pub struct SkipLog {
    path: PathBuf,
}

impl SkipLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, kind: SourceKind, title: Option<&str>, file: &str, reason: &str) {
        warn!("Skipped {}: {}", file, reason);
        let line = match title {
            Some(title) => format!(
                "{} SKIPPED: Title='{}', File='{}', Reason='{}'\n",
                kind.label().to_uppercase(),
                title,
                file,
                reason
            ),
            None => format!("{} SKIPPED: File='{}', Reason='{}'\n", kind.label().to_uppercase(), file, reason),
        };
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = written {
            debug!("Could not append to {}: {}", self.path.display(), e);
        }
    }
}

pub struct MediaCatalog {
    backend: std::result::Result<Box<dyn CatalogBackend>, String>,
    durations: DurationCache,
    playlist_dir: Option<PathBuf>,
    skip_log: SkipLog,
}

impl MediaCatalog {
    pub fn new(
        backend: Option<Box<dyn CatalogBackend>>,
        durations: DurationCache,
        playlist_dir: Option<PathBuf>,
        skip_log: SkipLog,
    ) -> Self {
        Self {
            backend: backend.ok_or_else(|| "no catalog backend".to_string()),
            durations,
            playlist_dir,
            skip_log,
        }
    }

    /// Catalog for one pass. A backend that cannot be opened only fails the
    /// smart playlist sources that need it.
    pub fn from_config(config: &AppConfig) -> Self {
        let backend = open_backend(config).map_err(|e| {
            warn!("Catalog backend unavailable: {}", e);
            e.to_string()
        });
        let durations = DurationCache::load_or_default(&config.data_dir.join(folder::DURATIONS_FILE));
        Self {
            backend,
            durations,
            playlist_dir: config.catalog.smart_playlist_dir.clone(),
            skip_log: SkipLog::new(config.data_dir.join(SKIP_LOG_FILE)),
        }
    }

    pub fn resolve<R: Rng + ?Sized>(&self, source: &Source, rng: &mut R) -> Result<Resolution> {
        match source.origin {
            SourceOrigin::CatalogQuery => self.resolve_playlist(source, rng),
            SourceOrigin::FolderScan => self.resolve_folder(source),
        }
    }

    fn backend(&self) -> Result<&dyn CatalogBackend> {
        match &self.backend {
            Ok(backend) => Ok(backend.as_ref()),
            Err(reason) => Err(Error::CatalogUnavailable(reason.clone())),
        }
    }

    /// File to read for a playlist path, and the name the catalog knows it by
    pub fn locate_playlist(&self, path: &str) -> Result<(PathBuf, String)> {
        let normalized = path.replace('\\', "/");
        let name = normalized.rsplit('/').next().unwrap_or(&normalized).to_string();
        let location = format!("{}{}", PLAYLIST_PREFIX, name);

        if !normalized.starts_with("special://") && Path::new(path).is_file() {
            return Ok((PathBuf::from(path), location));
        }
        match &self.playlist_dir {
            Some(dir) => Ok((dir.join(&name), location)),
            None => Err(Error::InvalidSource(format!(
                "{}: no smart playlist directory configured",
                path
            ))),
        }
    }

    fn resolve_playlist<R: Rng + ?Sized>(&self, source: &Source, rng: &mut R) -> Result<Resolution> {
        let (file, location) = self.locate_playlist(&source.path)?;
        if !file.is_file() {
            return Err(Error::InvalidSource(format!("playlist {} does not exist", file.display())));
        }
        let playlist = SmartPlaylist::load(&file, &location)?;
        if !playlist.matches_kind(source.kind) {
            return Err(Error::InvalidSource(format!(
                "{} is a '{}' playlist, expected '{}'",
                location,
                playlist.media_type,
                source.kind.label()
            )));
        }

        let backend = self.backend()?;
        let mut entries = backend.query(&playlist, source.kind)?;
        debug!("{} returned {} entries for {}", backend.name(), entries.len(), location);
        if entries.is_empty() {
            return Err(Error::EmptySource(location));
        }

        let is_randomized = playlist.is_random();
        // Varies which show is met first; episodes within a show are walked
        // in a stable order downstream
        if is_randomized && source.kind == SourceKind::Episodic {
            entries.shuffle(rng);
        }

        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            let (directory, filename) = split_locator(&entry.file);
            match backend.lookup(filename, &directory, source.kind) {
                Ok(Some(details)) if details.duration_seconds > 0 => {
                    items.push(catalog_item(entry, details, source.kind));
                }
                Ok(_) => self.skip_log.record(
                    source.kind,
                    Some(&entry.title),
                    &entry.file,
                    "Missing or invalid duration in database",
                ),
                Err(e @ Error::CatalogUnavailable(_)) => return Err(e),
                Err(e) => self.skip_log.record(
                    source.kind,
                    Some(&entry.title),
                    &entry.file,
                    &format!("Database error: {}", e),
                ),
            }
        }

        if items.is_empty() {
            return Err(Error::EmptySource(format!("{}: no items with durations", location)));
        }
        info!("Resolved {} items from {}", items.len(), location);
        Ok(Resolution {
            items,
            group_order_hint: playlist.group_order_hint(source.kind),
            is_randomized,
            is_one_match: playlist.match_one,
        })
    }

    fn resolve_folder(&self, source: &Source) -> Result<Resolution> {
        let root = Path::new(&source.path);
        let files = folder::list_video_files(root)
            .map_err(|e| Error::InvalidSource(format!("cannot list {}: {}", source.path, e)))?;
        if files.is_empty() {
            return Err(Error::EmptySource(format!("no video files in {}", source.path)));
        }

        let folder_name = file_name(&source.path);
        let mut items = Vec::with_capacity(files.len());
        for file in files {
            let locator = file.to_string_lossy().to_string();
            let seconds = self.durations.duration_of(&locator).unwrap_or(0.0);
            if seconds <= 0.0 {
                self.skip_log.record(source.kind, None, &locator, "Missing or invalid duration");
                continue;
            }
            let title = file_name(&locator);
            let group_key = match source.kind {
                SourceKind::Episodic => folder_name.clone(),
                SourceKind::Flat => title.clone(),
            };
            items.push(Item {
                file: locator,
                title,
                duration_seconds: seconds as u64,
                group_key,
                ..Default::default()
            });
        }

        if items.is_empty() {
            return Err(Error::EmptySource(format!("{}: no files with cached durations", source.path)));
        }
        info!("Resolved {} items from folder {}", items.len(), source.path);
        Ok(Resolution {
            items,
            ..Default::default()
        })
    }
}

fn file_name(path: &str) -> String {
    let trimmed = path.trim_end_matches(['/', '\\']);
    trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed).to_string()
}

/// `dir/name.mkv` -> (`dir/`, `name.mkv`), the shape the video database stores
pub fn split_locator(file: &str) -> (String, &str) {
    match file.rfind(['/', '\\']) {
        Some(i) => (format!("{}/", &file[..i]), &file[i + 1..]),
        None => (String::new(), file),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn catalog_item(entry: CatalogEntry, details: MediaDetails, kind: SourceKind) -> Item {
    let fallback_title = if entry.title.is_empty() { file_name(&entry.file) } else { entry.title.clone() };
    let group_key = non_empty(details.group_name)
        .or_else(|| non_empty(entry.show_title.clone()))
        .unwrap_or_else(|| fallback_title.clone());
    let episodic = kind == SourceKind::Episodic;
    Item {
        title: fallback_title,
        duration_seconds: details.duration_seconds,
        group_key,
        season: if episodic { entry.season } else { None },
        episode: if episodic { entry.episode } else { None },
        description: non_empty(details.description)
            .or_else(|| non_empty(entry.description))
            .unwrap_or_default(),
        thumbnail: entry.thumbnail,
        studio: non_empty(details.studio).or(entry.studio),
        file: entry.file,
    }
}

#[cfg(test)]
#[path = "catalog_tests.rs"]
mod tests;
