//! Per-source rotation: grouping, ordering and cursor advancement

use crate::catalog::Resolution;
use crate::models::{
    GroupKey, Interleave, Item, PlaybackEntry, RotationCursor, RotationState, Source, SourceKind,
    SourceOrigin,
};
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use tracing::{debug, warn};

static MULTI_EPISODE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)S(\d{2})E(\d{2})-?E?(\d{2})?").ok());

/// How many episodes a single file covers, from `S01E03-E04` style names
pub fn episode_span(file: &str) -> usize {
    let name = file.rsplit(['/', '\\']).next().unwrap_or(file);
    let Some(caps) = MULTI_EPISODE.as_ref().and_then(|re| re.captures(name)) else {
        return 1;
    };
    let start = caps.get(2).and_then(|m| m.as_str().parse::<usize>().ok());
    let end = caps.get(3).and_then(|m| m.as_str().parse::<usize>().ok());
    match (start, end) {
        (Some(start), Some(end)) if end >= start => end - start + 1,
        _ => 1,
    }
}

#[derive(Debug, Clone)]
struct Group {
    key: GroupKey,
    /// Items in walk order (already permuted for randomized groups)
    items: Vec<Item>,
    next: usize,
    /// Last walked position, `None` until something plays
    last_index: Option<usize>,
    permutation: Option<Vec<usize>>,
}

impl Group {
    fn new(key: GroupKey, items: Vec<Item>, cursor: &RotationCursor, permutation: Option<Vec<usize>>) -> Self {
        let size = items.len().max(1);
        Self {
            next: cursor.next_index(items.len()),
            last_index: cursor.last_index.map(|i| i % size),
            key,
            items,
            permutation,
        }
    }
}

/// A source ready for scheduling: grouped, ordered, with live cursors
#[derive(Debug, Clone)]
pub struct SourceView {
    pub label: String,
    pub kind: SourceKind,
    pub interleave: Interleave,
    shuffle_groups: bool,
    /// Skip the episodes a multi-episode file covers. Only catalog listings
    /// carry one row per covered episode; folders list each file once.
    skip_covered: bool,
    groups: Vec<Group>,
    /// Indices into `groups` in this run's order
    order: Vec<usize>,
}

impl SourceView {
    /// Group resolved items and apply ordering and stored cursors
    pub fn prepare<R: Rng + ?Sized>(source: &Source, resolution: Resolution, rng: &mut R) -> Self {
        let mut keys: Vec<GroupKey> = Vec::new();
        let mut buckets: HashMap<GroupKey, Vec<Item>> = HashMap::new();
        for item in resolution.items {
            if !buckets.contains_key(&item.group_key) {
                keys.push(item.group_key.clone());
            }
            buckets.entry(item.group_key.clone()).or_default().push(item);
        }

        let ordered = group_order(
            source,
            &keys,
            &resolution.group_order_hint,
            resolution.is_randomized,
            resolution.is_one_match,
            rng,
        );
        let randomized_walk = resolution.is_randomized
            && source.kind == SourceKind::Episodic
            && source.origin == SourceOrigin::CatalogQuery;
        let sort_episodes = source.kind == SourceKind::Episodic && source.origin == SourceOrigin::CatalogQuery;

        let mut groups = Vec::with_capacity(ordered.len());
        for key in ordered {
            let Some(mut items) = buckets.remove(&key) else {
                continue;
            };
            let cursor = source.rotation.cursor(&key);
            let mut permutation = None;
            if sort_episodes {
                // Stable base order, so stored cursors and permutations keep
                // pointing at the same files however the catalog listed them
                items.sort_by(|a, b| {
                    (a.season.unwrap_or(1), a.episode.unwrap_or(1), &a.file)
                        .cmp(&(b.season.unwrap_or(1), b.episode.unwrap_or(1), &b.file))
                });
            }
            if randomized_walk {
                let mut seen = HashSet::new();
                items.retain(|i| seen.insert(i.file.clone()));
                let perm = match cursor.permutation_for(items.len()) {
                    Some(p) => p.to_vec(),
                    None => {
                        let mut p: Vec<usize> = (0..items.len()).collect();
                        p.shuffle(rng);
                        debug!("{}: new random order for '{}' ({} items)", source.path, key, p.len());
                        p
                    }
                };
                let mut slots: Vec<Option<Item>> = items.into_iter().map(Some).collect();
                items = perm.iter().filter_map(|&i| slots[i].take()).collect();
                permutation = Some(perm);
            }

            if let Some(last) = cursor.last_index {
                if last >= items.len() {
                    warn!(
                        "{}: cursor {} for '{}' is past {} items, wrapping",
                        source.path,
                        last,
                        key,
                        items.len()
                    );
                }
            }
            groups.push(Group::new(key, items, &cursor, permutation));
        }

        let order = (0..groups.len()).collect();
        Self {
            label: source.path.clone(),
            kind: source.kind,
            interleave: source.interleave,
            shuffle_groups: source.shuffle_groups,
            skip_covered: sort_episodes && !randomized_walk,
            groups,
            order,
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Group keys in this run's order
    pub fn group_keys(&self) -> Vec<&str> {
        self.order.iter().map(|&g| self.groups[g].key.as_str()).collect()
    }

    /// Group order for one cycle, reshuffled when the source asks for it
    pub fn cycle_order<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<usize> {
        let mut order = self.order.clone();
        if self.shuffle_groups {
            order.shuffle(rng);
        }
        order
    }

    /// Emit the next item of `group` and advance its cursor past the
    /// episodes the file covers
    pub fn emit(&mut self, group: usize) -> PlaybackEntry {
        let kind = self.kind;
        let skip_covered = self.skip_covered;
        let g = &mut self.groups[group];
        let n = g.items.len();
        let index = g.next % n;
        let item = &g.items[index];
        let span = if skip_covered { episode_span(&item.file).min(n) } else { 1 };

        let entry = PlaybackEntry {
            duration_seconds: item.duration_seconds,
            group_key: g.key.clone(),
            title: item.title.clone(),
            season_episode_label: match kind {
                SourceKind::Episodic => item.season_episode_label(),
                SourceKind::Flat => None,
            },
            description: item.description.clone(),
            file_locator: item.file.clone(),
        };

        g.last_index = Some((index + span - 1) % n);
        g.next = (index + span) % n;
        entry
    }

    /// Rotation state to persist: one cursor per present group, plus the
    /// permutations walked this run
    pub fn rotation(&self) -> RotationState {
        let mut state = RotationState::default();
        for g in &self.groups {
            state.last_index.insert(g.key.clone(), g.last_index.map_or(-1, |i| i as i64));
            if let Some(perm) = &g.permutation {
                state.set_permutation(&g.key, perm.clone());
            }
        }
        state
    }
}

fn group_order<R: Rng + ?Sized>(
    source: &Source,
    present: &[GroupKey],
    hint: &[GroupKey],
    is_randomized: bool,
    is_one_match: bool,
    rng: &mut R,
) -> Vec<GroupKey> {
    if is_randomized
        && is_one_match
        && source.kind == SourceKind::Episodic
        && source.origin == SourceOrigin::CatalogQuery
    {
        let mut order = present.to_vec();
        order.shuffle(rng);
        return order;
    }

    if let Some(fixed) = source.fixed_group_order.as_ref().filter(|f| !f.is_empty()) {
        let order: Vec<GroupKey> = fixed.iter().filter(|k| present.contains(k)).cloned().collect();
        if !order.is_empty() {
            return order;
        }
        warn!("{}: none of the fixed group order is present, using natural order", source.path);
    }

    let mut order: Vec<GroupKey> = Vec::with_capacity(present.len());
    for key in hint {
        if present.contains(key) && !order.contains(key) {
            order.push(key.clone());
        }
    }
    for key in present {
        if !order.contains(key) {
            order.push(key.clone());
        }
    }
    order
}
