//! Extended M3U playback files
//!
//! Each entry is an `#EXTINF` line followed by its file locator:
//!
//! ```text
//! #EXTM3U
//! #EXTINF:1320,Frasier//The Good Son (S01E01)//Frasier moves back to Seattle
//! /tv/Frasier/S01E01.mkv
//! ```
//!
//! A slash inside the group or title is followed by an invisible word joiner
//! so the field can never contain or end in the `//` separator. A title with
//! no season tag that would read as having one is closed with ` ()`.

use crate::models::PlaybackEntry;
use regex::Regex;
use std::sync::LazyLock;

pub const HEADER: &str = "#EXTM3U";

static SEASON_TAG: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(.*) \((S\d{2,}E\d{2,})\)$").ok());

const WORD_JOINER: char = '\u{2060}';
const NO_TAG: &str = " ()";

fn escape_slashes(field: &str) -> String {
    field.replace('/', &format!("/{}", WORD_JOINER))
}

fn unescape_slashes(field: &str) -> String {
    field.replace(&format!("/{}", WORD_JOINER), "/")
}

fn looks_tagged(title: &str) -> bool {
    title.ends_with(NO_TAG) || SEASON_TAG.as_ref().is_some_and(|re| re.is_match(title))
}

/// A parsed entry together with the exact text it was read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackBlock {
    pub entry: PlaybackEntry,
    pub raw: String,
}

/// Collapse line breaks so a field stays on its `#EXTINF` line
pub fn flatten(field: &str) -> String {
    if !field.contains(['\r', '\n']) {
        return field.to_string();
    }
    field
        .split(['\r', '\n'])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn format_entry(entry: &PlaybackEntry) -> String {
    let plain = escape_slashes(&flatten(&entry.title));
    let title = match &entry.season_episode_label {
        Some(label) => format!("{} ({})", plain, label),
        None if looks_tagged(&plain) => format!("{}{}", plain, NO_TAG),
        None => plain,
    };
    format!(
        "#EXTINF:{},{}//{}//{}\n{}\n",
        entry.duration_seconds,
        escape_slashes(&flatten(&entry.group_key)),
        title,
        flatten(&entry.description),
        flatten(&entry.file_locator)
    )
}

pub fn render(entries: &[PlaybackEntry]) -> String {
    let mut out = String::from(HEADER);
    out.push('\n');
    for entry in entries {
        out.push_str(&format_entry(entry));
    }
    out
}

/// Parse the `#EXTINF` payload: `<secs>,<group>//<title>//<description>`
fn parse_info(info: &str) -> Option<(u64, String, String, Option<String>, String)> {
    let (secs, rest) = info.split_once(',')?;
    let secs = secs.trim();
    // Durations written by other tools may carry a fraction or -1
    let duration = match secs.parse::<u64>() {
        Ok(d) => d,
        Err(_) => secs.parse::<f64>().ok().filter(|d| *d > 0.0).map_or(0, |d| d.round() as u64),
    };

    let mut parts = rest.splitn(3, "//");
    let group = unescape_slashes(parts.next().unwrap_or_default());
    let title_part = parts.next().unwrap_or_default();
    let description = parts.next().unwrap_or_default().to_string();

    let captures = SEASON_TAG.as_ref().and_then(|re| re.captures(title_part));
    let (title, label) = match captures {
        Some(c) => (c.get(1).map_or("", |m| m.as_str()), Some(c[2].to_string())),
        None => (title_part.strip_suffix(NO_TAG).unwrap_or(title_part), None),
    };
    Some((duration, group, unescape_slashes(title), label, description))
}

/// Read every complete entry of a playback file. Lines between entries
/// (options, blank lines) stay attached to the entry that follows them.
/// An `#EXTINF` with no locator before the next one is dropped.
pub fn parse_playback(content: &str) -> Vec<PlaybackBlock> {
    let mut blocks = Vec::new();
    let mut raw = String::new();
    let mut info: Option<(u64, String, String, Option<String>, String)> = None;

    for (number, line) in content.split_inclusive('\n').enumerate() {
        let trimmed = line.trim();
        if number == 0 && trimmed.starts_with(HEADER) {
            continue;
        }

        if let Some(payload) = trimmed.strip_prefix("#EXTINF:") {
            if info.is_some() {
                raw.clear();
            }
            info = parse_info(payload);
            raw.push_str(line);
        } else if !trimmed.is_empty() && !trimmed.starts_with('#') {
            raw.push_str(line);
            match info.take() {
                Some((duration_seconds, group_key, title, season_episode_label, description)) => {
                    blocks.push(PlaybackBlock {
                        entry: PlaybackEntry {
                            duration_seconds,
                            group_key,
                            title,
                            season_episode_label,
                            description,
                            file_locator: trimmed.to_string(),
                        },
                        raw: std::mem::take(&mut raw),
                    });
                }
                None => raw.clear(),
            }
        } else {
            raw.push_str(line);
        }
    }

    blocks
}
