//! Local video database backend (Kodi `MyVideos<NN>.db`)

use super::smart_playlist::{Rule, SmartPlaylist};
use super::{CatalogBackend, CatalogEntry, MediaDetails};
use crate::error::{Error, Result};
use crate::models::SourceKind;
use regex::Regex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const EPISODE_ROWS: &str = "
    SELECT path.strPath, files.strFilename, episode.c00, tvshow.c00,
           episode.c12, episode.c13, episode.c01, tvshow.c12
    FROM episode
    JOIN files ON episode.idFile = files.idFile
    JOIN path ON files.idPath = path.idPath
    JOIN tvshow ON episode.idShow = tvshow.idShow
    ORDER BY tvshow.c00, CAST(episode.c12 AS INTEGER), CAST(episode.c13 AS INTEGER)";

const MOVIE_ROWS: &str = "
    SELECT path.strPath, files.strFilename, movie.c00, movie.c01, movie.c12
    FROM movie
    JOIN files ON movie.idFile = files.idFile
    JOIN path ON files.idPath = path.idPath
    ORDER BY movie.c00";

const EPISODE_DETAILS: &str = "
    SELECT streamdetails.iVideoDuration, tvshow.c12, tvshow.c00, tvshow.c01
    FROM streamdetails
    JOIN files ON streamdetails.idFile = files.idFile
    JOIN path ON files.idPath = path.idPath
    JOIN episode ON files.idFile = episode.idFile
    JOIN tvshow ON episode.idShow = tvshow.idShow
    WHERE files.strFilename = ?1 AND path.strPath = ?2 AND streamdetails.iStreamType = 0
    LIMIT 1";

const MOVIE_DETAILS: &str = "
    SELECT streamdetails.iVideoDuration, movie.c12, movie.c00, movie.c01
    FROM streamdetails
    JOIN files ON streamdetails.idFile = files.idFile
    JOIN path ON files.idPath = path.idPath
    JOIN movie ON files.idFile = movie.idFile
    WHERE files.strFilename = ?1 AND path.strPath = ?2 AND streamdetails.iStreamType = 0
    LIMIT 1";

pub struct SqliteCatalog {
    conn: Connection,
    path: PathBuf,
}

impl SqliteCatalog {
    /// Open a database file read-only. A directory selects its newest
    /// `MyVideos<NN>.db`.
    pub fn open(location: &Path) -> Result<Self> {
        let path = if location.is_dir() {
            newest_database(location)?
        } else {
            location.to_path_buf()
        };
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| Error::CatalogUnavailable(format!("{}: {}", path.display(), e)))?;
        info!("Opened video database {}", path.display());
        Ok(Self { conn, path })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn, path: PathBuf::from(":memory:") }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rows(&self, kind: SourceKind) -> rusqlite::Result<Vec<CatalogEntry>> {
        let mut stmt = self.conn.prepare_cached(match kind {
            SourceKind::Episodic => EPISODE_ROWS,
            SourceKind::Flat => MOVIE_ROWS,
        })?;
        let entries: rusqlite::Result<Vec<CatalogEntry>> = match kind {
            SourceKind::Episodic => stmt
                .query_map([], |row| {
                    let dir: String = row.get(0)?;
                    let name: String = row.get(1)?;
                    Ok(CatalogEntry {
                        file: format!("{}{}", dir, name),
                        title: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        show_title: row.get(3)?,
                        season: parse_number(row.get::<_, Option<String>>(4)?),
                        episode: parse_number(row.get::<_, Option<String>>(5)?),
                        description: row.get(6)?,
                        thumbnail: None,
                        studio: row.get(7)?,
                    })
                })?
                .collect(),
            SourceKind::Flat => stmt
                .query_map([], |row| {
                    let dir: String = row.get(0)?;
                    let name: String = row.get(1)?;
                    Ok(CatalogEntry {
                        file: format!("{}{}", dir, name),
                        title: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        description: row.get(3)?,
                        studio: row.get(4)?,
                        ..Default::default()
                    })
                })?
                .collect(),
        };
        entries
    }
}

fn newest_database(dir: &Path) -> Result<PathBuf> {
    let pattern = Regex::new(r"^MyVideos(\d+)\.db$").map_err(|e| Error::Config(e.to_string()))?;
    let entries = fs::read_dir(dir).map_err(|e| Error::CatalogUnavailable(format!("{}: {}", dir.display(), e)))?;
    let mut best: Option<(u32, PathBuf)> = None;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(version) = pattern
            .captures(&name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
        else {
            continue;
        };
        if best.as_ref().is_none_or(|(v, _)| version > *v) {
            best = Some((version, entry.path()));
        }
    }
    best.map(|(_, path)| path)
        .ok_or_else(|| Error::CatalogUnavailable(format!("no MyVideos database in {}", dir.display())))
}

fn parse_number(value: Option<String>) -> Option<u32> {
    value.and_then(|v| v.trim().parse::<i64>().ok()).filter(|n| *n >= 0).map(|n| n as u32)
}

/// Outcome of one rule against one entry; `None` when the rule is not understood
fn rule_matches(rule: &Rule, entry: &CatalogEntry, kind: SourceKind) -> Option<bool> {
    let field = match rule.field.as_str() {
        "tvshow" if kind == SourceKind::Episodic => entry.show_title.clone().unwrap_or_default(),
        "title" => entry.title.clone(),
        "studio" => entry.studio.clone().unwrap_or_default(),
        "path" | "filename" => entry.file.clone(),
        _ => return None,
    };
    let field = field.to_lowercase();
    let values: Vec<String> = rule.values.iter().map(|v| v.to_lowercase()).collect();
    let result = match rule.operator.as_str() {
        "is" => values.iter().any(|v| field == *v),
        "isnot" => values.iter().all(|v| field != *v),
        "contains" => values.iter().any(|v| field.contains(v.as_str())),
        "doesnotcontain" => values.iter().all(|v| !field.contains(v.as_str())),
        "startswith" => values.iter().any(|v| field.starts_with(v.as_str())),
        "endswith" => values.iter().any(|v| field.ends_with(v.as_str())),
        _ => return None,
    };
    Some(result)
}

/// Whether `entry` satisfies the playlist; rules that are not understood are ignored
pub fn playlist_matches(playlist: &SmartPlaylist, entry: &CatalogEntry, kind: SourceKind) -> bool {
    let outcomes: Vec<bool> = playlist
        .rules
        .iter()
        .filter_map(|rule| rule_matches(rule, entry, kind))
        .collect();
    if outcomes.is_empty() {
        return true;
    }
    if playlist.match_one {
        outcomes.iter().any(|m| *m)
    } else {
        outcomes.iter().all(|m| *m)
    }
}

impl CatalogBackend for SqliteCatalog {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn query(&self, playlist: &SmartPlaylist, kind: SourceKind) -> Result<Vec<CatalogEntry>> {
        for rule in &playlist.rules {
            if rule_matches(rule, &CatalogEntry::default(), kind).is_none() {
                warn!(
                    "{}: ignoring unsupported rule {} {}",
                    playlist.location, rule.field, rule.operator
                );
            }
        }
        let rows = self
            .rows(kind)
            .map_err(|e| Error::CatalogUnavailable(format!("{}: {}", self.path.display(), e)))?;
        let total = rows.len();
        let mut matched: Vec<CatalogEntry> = rows
            .into_iter()
            .filter(|entry| playlist_matches(playlist, entry, kind))
            .collect();
        if let Some(limit) = playlist.limit.filter(|l| *l > 0) {
            matched.truncate(limit);
        }
        debug!("{}: {} of {} {} match", playlist.location, matched.len(), total, kind.label());
        Ok(matched)
    }

    fn lookup(&self, filename: &str, directory: &str, kind: SourceKind) -> Result<Option<MediaDetails>> {
        let sql = match kind {
            SourceKind::Episodic => EPISODE_DETAILS,
            SourceKind::Flat => MOVIE_DETAILS,
        };
        let mut stmt = self
            .conn
            .prepare_cached(sql)
            .map_err(|e| Error::InvalidSource(e.to_string()))?;
        stmt.query_row(params![filename, directory], |row| {
            let duration: Option<i64> = row.get(0)?;
            Ok(MediaDetails {
                duration_seconds: duration.unwrap_or(0).max(0) as u64,
                studio: row.get(1)?,
                group_name: row.get(2)?,
                description: row.get(3)?,
            })
        })
        .optional()
        .map_err(|e| Error::InvalidSource(format!("{}{}: {}", directory, filename, e)))
    }
}
