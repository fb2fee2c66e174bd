//! Data models for channels, their sources and rotation state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Clustering key for items within a source (show name, or a flat item's own title)
pub type GroupKey = String;

/// How a channel's generation budget is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LimitType {
    #[default]
    #[serde(rename = "time")]
    Time,
    #[serde(rename = "items")]
    ItemCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceRole {
    #[default]
    Base,
    Additional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SourceKind {
    #[default]
    #[serde(rename = "episodes")]
    Episodic,
    #[serde(rename = "movies")]
    Flat,
}

impl SourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::Episodic => "episodes",
            SourceKind::Flat => "movies",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SourceOrigin {
    #[default]
    #[serde(rename = "playlist")]
    CatalogQuery,
    #[serde(rename = "folder")]
    FolderScan,
}

/// Insertion parameters for an additional source. Ignored for the base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interleave {
    #[serde(default = "default_one")]
    pub low: i64,
    #[serde(default = "default_one")]
    pub high: i64,
    #[serde(default = "default_one")]
    pub count: i64,
}

fn default_one() -> i64 { 1 }

impl Default for Interleave {
    fn default() -> Self {
        Self { low: 1, high: 1, count: 1 }
    }
}

impl Interleave {
    pub fn fixed(position: i64, count: i64) -> Self {
        Self { low: position, high: position, count }
    }

    /// Number of contiguous slots this source occupies per cycle
    pub fn slots(&self) -> usize {
        self.count.max(1) as usize
    }
}

/// Per-group rotation bookkeeping, persisted inline with its source.
///
/// `last_index[g]` is the zero-based index of the last item of `g` played,
/// `-1` meaning not started. `random_order[g]` is a permutation of the
/// group's indices, walked instead of natural order for randomized groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RotationState {
    #[serde(default)]
    pub last_index: BTreeMap<GroupKey, i64>,
    #[serde(default)]
    pub random_order: BTreeMap<GroupKey, Vec<usize>>,
}

/// Typed view of one group's rotation state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RotationCursor {
    pub last_index: Option<usize>,
    pub permutation: Option<Vec<usize>>,
}

impl RotationCursor {
    /// Position to resume from in a group of `size` items
    pub fn next_index(&self, size: usize) -> usize {
        if size == 0 {
            return 0;
        }
        match self.last_index {
            None => 0,
            Some(i) => (i + 1) % size,
        }
    }

    /// The stored permutation, if it still describes a group of `size`
    pub fn permutation_for(&self, size: usize) -> Option<&[usize]> {
        self.permutation
            .as_deref()
            .filter(|p| p.len() == size && is_permutation(p))
    }
}

impl RotationState {
    pub fn cursor(&self, group: &str) -> RotationCursor {
        RotationCursor {
            last_index: self
                .last_index
                .get(group)
                .copied()
                .filter(|i| *i >= 0)
                .map(|i| i as usize),
            permutation: self.random_order.get(group).cloned(),
        }
    }

    pub fn set_last_index(&mut self, group: &str, index: usize) {
        self.last_index.insert(group.to_string(), index as i64);
    }

    pub fn set_permutation(&mut self, group: &str, permutation: Vec<usize>) {
        self.random_order.insert(group.to_string(), permutation);
    }

    /// Repair values that can never be valid regardless of group size.
    /// Returns the number of entries touched.
    pub fn sanitize(&mut self) -> usize {
        let mut fixed = 0;
        for value in self.last_index.values_mut() {
            if *value < -1 {
                *value = -1;
                fixed += 1;
            }
        }
        let before = self.random_order.len();
        self.random_order.retain(|_, perm| !perm.is_empty() && is_permutation(perm));
        fixed + (before - self.random_order.len())
    }
}

/// True when `values` holds every index in `[0, len)` exactly once
pub fn is_permutation(values: &[usize]) -> bool {
    let mut seen = vec![false; values.len()];
    for &v in values {
        match seen.get_mut(v) {
            Some(slot) if !*slot => *slot = true,
            _ => return false,
        }
    }
    true
}

/// One contributing media feed attached to a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub path: String,
    #[serde(rename = "type", default)]
    pub role: SourceRole,
    #[serde(rename = "playlist_type", default)]
    pub kind: SourceKind,
    #[serde(rename = "source", default)]
    pub origin: SourceOrigin,
    #[serde(default)]
    pub interleave: Interleave,
    #[serde(rename = "shuffle_shows", default)]
    pub shuffle_groups: bool,
    #[serde(rename = "fixed_show_order", default, skip_serializing_if = "Option::is_none")]
    pub fixed_group_order: Option<Vec<GroupKey>>,
    #[serde(flatten)]
    pub rotation: RotationState,
}

impl Source {
    pub fn new(path: impl Into<String>, role: SourceRole, kind: SourceKind, origin: SourceOrigin) -> Self {
        Self {
            path: path.into(),
            role,
            kind,
            origin,
            interleave: Interleave::default(),
            shuffle_groups: false,
            fixed_group_order: None,
            rotation: RotationState::default(),
        }
    }

    pub fn with_interleave(mut self, interleave: Interleave) -> Self {
        self.interleave = interleave;
        self
    }
}

/// A persistent, numbered linear schedule plus its rotation state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub number: u32,
    #[serde(default)]
    pub limit_type: LimitType,
    #[serde(default)]
    pub is_new: bool,
    #[serde(
        rename = "last_gen_time",
        default,
        skip_serializing_if = "Option::is_none",
        with = "timestamp"
    )]
    pub last_generation_time: Option<DateTime<Utc>>,
    #[serde(rename = "total_gen_duration", default, skip_serializing_if = "Option::is_none")]
    pub total_generated_duration: Option<u64>,
    #[serde(rename = "playlists", default)]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_paused: bool,
}

fn is_false(value: &bool) -> bool { !*value }

impl Channel {
    pub fn new(name: impl Into<String>, number: u32, sources: Vec<Source>) -> Self {
        let name = name.into();
        Self {
            id: derive_channel_id(&name),
            name,
            number,
            limit_type: LimitType::Time,
            is_new: true,
            last_generation_time: None,
            total_generated_duration: None,
            sources,
            is_paused: false,
        }
    }

    /// Index of the source driving the outer cycle: the one marked base, else the first
    pub fn base_source_index(&self) -> Option<usize> {
        if self.sources.is_empty() {
            return None;
        }
        Some(
            self.sources
                .iter()
                .position(|s| s.role == SourceRole::Base)
                .unwrap_or(0),
        )
    }

    /// Whether both timing fields needed for incremental updates are present
    pub fn has_timing(&self) -> bool {
        self.last_generation_time.is_some() && self.total_generated_duration.is_some()
    }
}

/// Stable identifier for a channel created without one
pub fn derive_channel_id(name: &str) -> String {
    format!("{}@linearcast", name.replace(' ', "_"))
}

/// A playable media item resolved from a source
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Item {
    pub file: String,
    pub title: String,
    pub duration_seconds: u64,
    pub group_key: GroupKey,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub description: String,
    pub thumbnail: Option<String>,
    pub studio: Option<String>,
}

impl Item {
    /// `S01E02` style tag, only when both season and episode are known
    pub fn season_episode_label(&self) -> Option<String> {
        match (self.season, self.episode) {
            (Some(s), Some(e)) => Some(format!("S{:02}E{:02}", s, e)),
            _ => None,
        }
    }
}

/// One scheduled line pair in a playback file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackEntry {
    pub duration_seconds: u64,
    pub group_key: GroupKey,
    pub title: String,
    pub season_episode_label: Option<String>,
    pub description: String,
    pub file_locator: String,
}

/// Timestamps are stored as RFC 3339 UTC. Older documents carry naive
/// ISO strings, which are read as UTC.
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(s) if s.trim().is_empty() => Ok(None),
            Some(s) => parse(&s)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", s))),
        }
    }

    pub fn parse(s: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_source_uses_legacy_field_names() {
        let json = r#"{
            "path": "special://profile/playlists/video/sitcoms.xsp",
            "type": "additional",
            "playlist_type": "movies",
            "source": "folder",
            "interleave": {"low": 2, "high": 4, "count": 1},
            "shuffle_shows": true,
            "last_index": {"Alien": 0},
            "random_order": {}
        }"#;
        let source: Source = serde_json::from_str(json).unwrap();
        assert_eq!(source.role, SourceRole::Additional);
        assert_eq!(source.kind, SourceKind::Flat);
        assert_eq!(source.origin, SourceOrigin::FolderScan);
        assert!(source.shuffle_groups);
        assert_eq!(source.interleave, Interleave { low: 2, high: 4, count: 1 });
        assert_eq!(source.rotation.last_index.get("Alien"), Some(&0));
    }

    #[test]
    fn test_channel_defaults_for_missing_fields() {
        let json = r#"{"name": "Cartoons", "number": 4}"#;
        let channel: Channel = serde_json::from_str(json).unwrap();
        assert_eq!(channel.limit_type, LimitType::Time);
        assert!(!channel.is_new);
        assert!(channel.last_generation_time.is_none());
        assert!(channel.sources.is_empty());
        assert!(!channel.has_timing());
    }

    #[test]
    fn test_legacy_naive_timestamp_is_utc() {
        let json = r#"{"name": "A", "number": 1, "last_gen_time": "2024-03-01T10:30:00.250000", "total_gen_duration": 86400}"#;
        let channel: Channel = serde_json::from_str(json).unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap()
            + chrono::Duration::milliseconds(250);
        assert_eq!(channel.last_generation_time, Some(expected));
        let out = serde_json::to_string(&channel).unwrap();
        assert!(out.contains("\"last_gen_time\":\"2024-03-01T10:30:00.250Z\""));
    }

    #[test]
    fn test_limit_type_serialization() {
        assert_eq!(serde_json::to_string(&LimitType::ItemCount).unwrap(), "\"items\"");
        assert_eq!(serde_json::to_string(&LimitType::Time).unwrap(), "\"time\"");
    }

    #[test]
    fn test_cursor_next_index_wraps() {
        let mut state = RotationState::default();
        assert_eq!(state.cursor("Show").next_index(3), 0);
        state.set_last_index("Show", 1);
        assert_eq!(state.cursor("Show").next_index(3), 2);
        state.set_last_index("Show", 2);
        assert_eq!(state.cursor("Show").next_index(3), 0);
        state.last_index.insert("Show".into(), -1);
        assert_eq!(state.cursor("Show").last_index, None);
    }

    #[test]
    fn test_sanitize_drops_broken_permutations() {
        let mut state = RotationState::default();
        state.last_index.insert("A".into(), -7);
        state.random_order.insert("A".into(), vec![0, 0, 2]);
        state.random_order.insert("B".into(), vec![2, 0, 1]);
        state.random_order.insert("C".into(), vec![]);
        assert_eq!(state.sanitize(), 3);
        assert_eq!(state.last_index["A"], -1);
        assert!(!state.random_order.contains_key("A"));
        assert!(!state.random_order.contains_key("C"));
        assert_eq!(state.random_order["B"], vec![2, 0, 1]);
    }

    #[test]
    fn test_permutation_for_rejects_stale_size() {
        let cursor = RotationCursor { last_index: None, permutation: Some(vec![1, 0, 2]) };
        assert_eq!(cursor.permutation_for(3), Some(&[1, 0, 2][..]));
        assert_eq!(cursor.permutation_for(4), None);
    }

    #[test]
    fn test_base_source_falls_back_to_first() {
        let extra = Source::new("b.xsp", SourceRole::Additional, SourceKind::Flat, SourceOrigin::CatalogQuery);
        let mut channel = Channel::new("Mixed", 2, vec![extra.clone(), extra]);
        assert_eq!(channel.base_source_index(), Some(0));
        channel.sources[1].role = SourceRole::Base;
        assert_eq!(channel.base_source_index(), Some(1));
        assert_eq!(channel.id, "Mixed@linearcast");
    }

    #[test]
    fn test_season_episode_label() {
        let item = Item { season: Some(1), episode: Some(9), ..Default::default() };
        assert_eq!(item.season_episode_label().as_deref(), Some("S01E09"));
        let movie = Item { season: None, episode: None, ..Default::default() };
        assert_eq!(movie.season_episode_label(), None);
    }
}
