//! Builds a channel's linear schedule from its base and additional sources
//!
//! The base source drives a repeating cycle: one slot per base group plus
//! `count` slots for every additional source. Each cycle places the
//! additions (fixed or random start), then walks the slots, emitting from
//! the additions where they claim a position and from the next base group
//! otherwise. Generation stops as soon as the budget is met, possibly in the
//! middle of a cycle.

pub mod placement;
pub mod rotation;

pub use placement::Placement;
pub use rotation::{episode_span, SourceView};

use crate::error::{Error, Result};
use crate::models::{LimitType, PlaybackEntry, RotationState};
use rand::Rng;
use tracing::{debug, info, warn};

/// Running duration and item count of a schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Totals {
    pub duration_seconds: u64,
    pub count: usize,
}

impl Totals {
    pub fn of(entries: &[PlaybackEntry]) -> Self {
        let mut totals = Totals::default();
        for entry in entries {
            totals.add(entry);
        }
        totals
    }

    pub fn add(&mut self, entry: &PlaybackEntry) {
        self.duration_seconds += entry.duration_seconds;
        self.count += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Duration(u64),
    Count(usize),
}

/// When generation ends. `prefix` counts entries kept from an earlier run,
/// so an incremental top-up only produces the deficit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopCondition {
    pub limit: Limit,
    pub prefix: Totals,
}

impl StopCondition {
    pub fn new(limit: Limit) -> Self {
        Self { limit, prefix: Totals::default() }
    }

    pub fn for_limit_type(limit_type: LimitType, max_duration_secs: u64, max_items: usize) -> Self {
        match limit_type {
            LimitType::Time => Self::new(Limit::Duration(max_duration_secs)),
            LimitType::ItemCount => Self::new(Limit::Count(max_items)),
        }
    }

    pub fn with_prefix(mut self, prefix: Totals) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn is_satisfied(&self, produced: &Totals) -> bool {
        match self.limit {
            Limit::Duration(max) => self.prefix.duration_seconds + produced.duration_seconds >= max,
            Limit::Count(max) => self.prefix.count + produced.count >= max,
        }
    }

    /// Nothing left to produce
    pub fn has_no_deficit(&self) -> bool {
        self.is_satisfied(&Totals::default())
    }
}

/// Result of one scheduling run. `rotations[0]` belongs to the base source,
/// the rest follow the additions in order.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub entries: Vec<PlaybackEntry>,
    pub totals: Totals,
    pub cycles: usize,
    pub rotations: Vec<RotationState>,
}

pub struct Scheduler {
    channel: u32,
    stop: StopCondition,
}

impl Scheduler {
    pub fn new(channel: u32, stop: StopCondition) -> Self {
        Self { channel, stop }
    }

    pub fn run<R: Rng + ?Sized>(
        &self,
        mut base: SourceView,
        mut additions: Vec<SourceView>,
        rng: &mut R,
    ) -> Result<Schedule> {
        let mut entries: Vec<PlaybackEntry> = Vec::new();
        let mut produced = Totals::default();
        let mut cycles = 0;

        if self.stop.has_no_deficit() {
            debug!("Channel {}: nothing to schedule", self.channel);
            return Ok(self.finish(entries, produced, cycles, &base, &additions));
        }
        if base.is_empty() && additions.iter().all(SourceView::is_empty) {
            return Err(Error::ScheduleExhausted { channel: self.channel });
        }

        let cycle_len = base.group_count() + additions.iter().map(|a| a.interleave.slots()).sum::<usize>();
        let placements: Vec<Placement> = additions
            .iter()
            .map(|a| Placement::new(&a.interleave, cycle_len, &a.label))
            .collect();
        for (addition, placement) in additions.iter().zip(&placements) {
            debug!(
                "Channel {}: {} ({} groups) placed at {:?} in a cycle of {}",
                self.channel,
                addition.label,
                addition.group_count(),
                placement,
                cycle_len
            );
            if addition.is_empty() {
                warn!("Channel {}: {} has no groups, its slots go to the base", self.channel, addition.label);
            }
        }
        // Round-robin position in each addition's group order, kept across cycles
        let mut addition_counters = vec![0usize; additions.len()];

        while !self.stop.is_satisfied(&produced) {
            cycles += 1;
            let before = produced;
            let base_order = base.cycle_order(rng);

            if additions.is_empty() {
                for &group in &base_order {
                    if self.stop.is_satisfied(&produced) {
                        break;
                    }
                    let entry = base.emit(group);
                    produced.add(&entry);
                    entries.push(entry);
                }
            } else {
                let starts: Vec<usize> = placements.iter().map(|p| p.pick(rng)).collect();
                let orders: Vec<Vec<usize>> = additions.iter().map(|a| a.cycle_order(rng)).collect();
                let mut next_base = 0;

                for pos in 1..=cycle_len {
                    if self.stop.is_satisfied(&produced) {
                        break;
                    }
                    let mut inserted = false;
                    for (i, addition) in additions.iter_mut().enumerate() {
                        let start = starts[i];
                        if pos < start || pos >= start + addition.interleave.slots() || orders[i].is_empty() {
                            continue;
                        }
                        if self.stop.is_satisfied(&produced) {
                            break;
                        }
                        let group = orders[i][addition_counters[i] % orders[i].len()];
                        addition_counters[i] += 1;
                        let entry = addition.emit(group);
                        produced.add(&entry);
                        entries.push(entry);
                        inserted = true;
                    }
                    if !inserted && next_base < base_order.len() && !self.stop.is_satisfied(&produced) {
                        let entry = base.emit(base_order[next_base]);
                        next_base += 1;
                        produced.add(&entry);
                        entries.push(entry);
                    }
                }
            }

            let progressed = match self.stop.limit {
                Limit::Duration(_) => produced.duration_seconds > before.duration_seconds,
                Limit::Count(_) => produced.count > before.count,
            };
            if !progressed {
                warn!("Channel {}: cycle {} produced nothing, giving up", self.channel, cycles);
                return Err(Error::ScheduleExhausted { channel: self.channel });
            }
        }

        info!(
            "Channel {}: scheduled {} items ({}s) over {} cycles",
            self.channel, produced.count, produced.duration_seconds, cycles
        );
        Ok(self.finish(entries, produced, cycles, &base, &additions))
    }

    fn finish(
        &self,
        entries: Vec<PlaybackEntry>,
        totals: Totals,
        cycles: usize,
        base: &SourceView,
        additions: &[SourceView],
    ) -> Schedule {
        let rotations = std::iter::once(base)
            .chain(additions.iter())
            .map(SourceView::rotation)
            .collect();
        Schedule { entries, totals, cycles, rotations }
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
