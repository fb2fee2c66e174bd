//! Regeneration: which channels need entries, building them, and the
//! periodic loop that keeps every channel topped up

use crate::catalog::MediaCatalog;
use crate::config::AppConfig;
use crate::emitter::{PlaylistEmitter, WriteMode};
use crate::error::{Error, Result};
use crate::lock::{load_or_create_instance_id, Clock, DistributedLock, FileLock, RegenOwnership, SystemClock};
use crate::models::{Channel, PlaybackEntry, RotationState};
use crate::scheduler::{Schedule, Scheduler, SourceView, StopCondition, Totals};
use crate::state::{ChannelStore, RecoveryPolicy};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, error, info, warn};

pub const INSTANCE_LOCK_FILE: &str = "instance.lock";
pub const OWNERSHIP_FILE: &str = "linearcast_settings.lock";
/// Age alone frees the instance lock only after this long; a dead owner frees it at once
const INSTANCE_LOCK_STALENESS_DAYS: i64 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Full,
    Incremental,
    Skip,
}

/// What a channel needs at `now`
pub fn decide(channel: &Channel, now: DateTime<Utc>, threshold: Duration) -> Action {
    if channel.is_new {
        return Action::Full;
    }
    let (Some(last), Some(total)) = (channel.last_generation_time, channel.total_generated_duration) else {
        return Action::Full;
    };
    let remaining = Duration::seconds(total as i64) - (now - last);
    if remaining < threshold {
        Action::Incremental
    } else {
        Action::Skip
    }
}

/// Number of leading entries that finished playing within `elapsed_secs`.
/// The entry playing at that moment is kept.
pub fn expired_prefix(entries: &[PlaybackEntry], elapsed_secs: u64) -> usize {
    let mut covered = 0u64;
    let mut count = 0;
    while count < entries.len() && covered + entries[count].duration_seconds <= elapsed_secs {
        covered += entries[count].duration_seconds;
        count += 1;
    }
    count
}

/// When the first retained entry started: the old generation time plus
/// what played out in full. `now` once nothing is retained.
fn playout_anchor(
    last: DateTime<Utc>,
    existing: &[PlaybackEntry],
    expired: usize,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    if expired >= existing.len() {
        return now;
    }
    let played = Totals::of(&existing[..expired]).duration_seconds;
    last + Duration::seconds(played as i64)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegenOutcome {
    pub performed: Action,
    pub expired: usize,
    pub added: usize,
    pub total_duration: u64,
}

impl RegenOutcome {
    fn skipped() -> Self {
        Self { performed: Action::Skip, expired: 0, added: 0, total_duration: 0 }
    }
}

/// Builds and writes new entries for one channel at a time
pub struct Regenerator {
    catalog: MediaCatalog,
    emitter: PlaylistEmitter,
    max_duration_secs: u64,
    max_items: usize,
}

impl Regenerator {
    pub fn new(catalog: MediaCatalog, emitter: PlaylistEmitter, max_duration_secs: u64, max_items: usize) -> Self {
        Self { catalog, emitter, max_duration_secs, max_items }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            MediaCatalog::from_config(config),
            PlaylistEmitter::from_config(config),
            config.max_duration_secs(),
            config.max_playlist_items,
        )
    }

    pub fn emitter(&self) -> &PlaylistEmitter {
        &self.emitter
    }

    /// Run `action` for `channel`. The channel's rotation and timing are
    /// only touched once its playback file has been written.
    pub fn regenerate<R: Rng + ?Sized>(
        &self,
        channel: &mut Channel,
        action: Action,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Result<RegenOutcome> {
        match action {
            Action::Skip => Ok(RegenOutcome::skipped()),
            Action::Full => self.full(channel, now, rng),
            Action::Incremental => self.incremental(channel, now, rng),
        }
    }

    fn stop_for(&self, channel: &Channel) -> StopCondition {
        StopCondition::for_limit_type(channel.limit_type, self.max_duration_secs, self.max_items)
    }

    fn full<R: Rng + ?Sized>(&self, channel: &mut Channel, now: DateTime<Utc>, rng: &mut R) -> Result<RegenOutcome> {
        let (schedule, owners) = self.schedule(channel, self.stop_for(channel), rng)?;
        self.emitter.write(channel, &schedule.entries, WriteMode::Full)?;

        commit_rotations(channel, &owners, schedule.rotations);
        channel.is_new = false;
        channel.last_generation_time = Some(now);
        channel.total_generated_duration = Some(schedule.totals.duration_seconds);
        info!(
            "Channel {} ({}): generated {} entries, {}s",
            channel.number,
            channel.name,
            schedule.entries.len(),
            schedule.totals.duration_seconds
        );
        Ok(RegenOutcome {
            performed: Action::Full,
            expired: 0,
            added: schedule.entries.len(),
            total_duration: schedule.totals.duration_seconds,
        })
    }

    fn incremental<R: Rng + ?Sized>(
        &self,
        channel: &mut Channel,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Result<RegenOutcome> {
        let Some(last) = channel.last_generation_time.filter(|_| channel.has_timing()) else {
            debug!("Channel {}: no timing recorded, regenerating in full", channel.number);
            return self.full(channel, now, rng);
        };
        let existing: Vec<PlaybackEntry> = match self.emitter.read_playback(channel)? {
            Some(blocks) if !blocks.is_empty() => blocks.into_iter().map(|b| b.entry).collect(),
            _ => {
                info!("Channel {}: no existing entries, regenerating in full", channel.number);
                return self.full(channel, now, rng);
            }
        };

        let elapsed = (now - last).num_seconds().max(0) as u64;
        let expired = expired_prefix(&existing, elapsed);
        let retained = Totals::of(&existing[expired..]);
        let anchor = playout_anchor(last, &existing, expired, now);
        let stop = self.stop_for(channel).with_prefix(retained);

        if stop.has_no_deficit() {
            if expired > 0 {
                self.emitter.write(channel, &[], WriteMode::Patch { expired })?;
            }
            channel.last_generation_time = Some(anchor);
            channel.total_generated_duration = Some(retained.duration_seconds);
            debug!("Channel {}: trimmed {} entries, nothing to add", channel.number, expired);
            return Ok(RegenOutcome {
                performed: Action::Incremental,
                expired,
                added: 0,
                total_duration: retained.duration_seconds,
            });
        }

        let (schedule, owners) = self.schedule(channel, stop, rng)?;
        self.emitter.write(channel, &schedule.entries, WriteMode::Patch { expired })?;

        let total = retained.duration_seconds + schedule.totals.duration_seconds;
        commit_rotations(channel, &owners, schedule.rotations);
        channel.last_generation_time = Some(anchor);
        channel.total_generated_duration = Some(total);
        info!(
            "Channel {} ({}): dropped {} played entries, added {} ({}s total)",
            channel.number,
            channel.name,
            expired,
            schedule.entries.len(),
            total
        );
        Ok(RegenOutcome {
            performed: Action::Incremental,
            expired,
            added: schedule.entries.len(),
            total_duration: total,
        })
    }

    /// Resolve every source and run the scheduler. Alongside the schedule
    /// comes the source index each rotation belongs to.
    fn schedule<R: Rng + ?Sized>(
        &self,
        channel: &Channel,
        stop: StopCondition,
        rng: &mut R,
    ) -> Result<(Schedule, Vec<usize>)> {
        let exhausted = Error::ScheduleExhausted { channel: channel.number };
        let Some(base_index) = channel.base_source_index() else {
            return Err(exhausted);
        };

        let mut base: Option<(usize, SourceView)> = None;
        let mut additions: Vec<(usize, SourceView)> = Vec::new();
        for (index, source) in channel.sources.iter().enumerate() {
            match self.catalog.resolve(source, rng) {
                Ok(resolution) => {
                    let view = SourceView::prepare(source, resolution, rng);
                    if index == base_index {
                        base = Some((index, view));
                    } else {
                        additions.push((index, view));
                    }
                }
                Err(e) if e.is_source_level() => {
                    warn!("Channel {}: skipping source {}: {}", channel.number, source.path, e);
                }
                Err(e) => return Err(e),
            }
        }

        let (base_index, base_view) = match base {
            Some(base) => base,
            None if !additions.is_empty() => {
                let promoted = additions.remove(0);
                warn!(
                    "Channel {}: base source unusable, {} drives the schedule",
                    channel.number, promoted.1.label
                );
                promoted
            }
            None => return Err(exhausted),
        };

        let mut owners = vec![base_index];
        let mut views = Vec::with_capacity(additions.len());
        for (index, view) in additions {
            owners.push(index);
            views.push(view);
        }
        let schedule = Scheduler::new(channel.number, stop).run(base_view, views, rng)?;
        Ok((schedule, owners))
    }
}

/// Fold each run's cursors into the owning source. Groups the run did not
/// see keep their stored cursors.
fn commit_rotations(channel: &mut Channel, owners: &[usize], rotations: Vec<RotationState>) {
    for (&index, rotation) in owners.iter().zip(rotations) {
        if let Some(source) = channel.sources.get_mut(index) {
            source.rotation.last_index.extend(rotation.last_index);
            source.rotation.random_order.extend(rotation.random_order);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFailure {
    pub number: u32,
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub successful: usize,
    pub skipped: usize,
    pub failures: Vec<ChannelFailure>,
}

impl RunSummary {
    pub fn log(&self) {
        if self.successful == 0 && self.failures.is_empty() {
            debug!("Nothing to regenerate ({} channels checked)", self.total);
            return;
        }
        info!(
            "Regeneration pass: {} channels, {} updated, {} skipped, {} failed",
            self.total,
            self.successful,
            self.skipped,
            self.failures.len()
        );
        for failure in &self.failures {
            error!("Channel {} ({}): {}", failure.number, failure.name, failure.error);
        }
    }
}

/// Cancellation for passes and the periodic loop. A `()` sent on the
/// paired sender requests shutdown; a dropped sender does not.
pub struct Shutdown {
    receiver: Receiver<()>,
    requested: std::cell::Cell<bool>,
}

impl Shutdown {
    pub fn channel() -> (Sender<()>, Shutdown) {
        let (sender, receiver) = mpsc::channel();
        let shutdown = Shutdown { receiver, requested: std::cell::Cell::new(false) };
        (sender, shutdown)
    }

    pub fn is_requested(&self) -> bool {
        if !self.requested.get() {
            match self.receiver.try_recv() {
                Ok(()) => self.requested.set(true),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }
        }
        self.requested.get()
    }

    /// Sleep up to `timeout`, returning early (with `true`) on shutdown
    pub fn wait(&self, timeout: std::time::Duration) -> bool {
        if self.requested.get() {
            return true;
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(()) => {
                self.requested.set(true);
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                false
            }
        }
    }
}

/// A channel regenerated by a pass: as loaded, as regenerated, and the
/// playback file it replaced
#[derive(Debug, Clone)]
struct Regenerated {
    before: Channel,
    after: Channel,
    previous_playback: Option<String>,
}

/// Results of one pass over a set of channels, kept until they are saved
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub summary: RunSummary,
    regenerated: Vec<Regenerated>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.regenerated.is_empty()
    }

    /// Fold the regenerated channels into `current` by id. A channel that was
    /// edited, deleted or regenerated elsewhere since this batch loaded it
    /// keeps what is stored. Returns how many were merged.
    pub fn merge_into(&self, current: &mut [Channel]) -> usize {
        let mut merged = 0;
        for result in &self.regenerated {
            let Some(stored) = current.iter_mut().find(|c| c.id == result.before.id) else {
                debug!("Channel {} was deleted meanwhile, dropping its result", result.before.number);
                continue;
            };
            // Pausing does not conflict with a regeneration
            let mut comparable = stored.clone();
            comparable.is_paused = result.before.is_paused;
            if comparable != result.before {
                info!("Channel {} changed meanwhile, keeping the stored version", stored.number);
                continue;
            }
            let is_paused = stored.is_paused;
            *stored = result.after.clone();
            stored.is_paused = is_paused;
            merged += 1;
        }
        merged
    }

    /// Put back the playback files this batch replaced
    pub fn restore_files(&self, emitter: &PlaylistEmitter) {
        for result in &self.regenerated {
            if let Err(e) = emitter.restore_playback(&result.after, result.previous_playback.as_deref()) {
                warn!("Channel {}: could not restore its playback file: {}", result.after.number, e);
            }
        }
        if !self.regenerated.is_empty() {
            info!("Rolled back {} playback files", self.regenerated.len());
        }
    }
}

/// Run `action` (or whatever `decide` says, when `None`) over every
/// channel in order, stopping early on shutdown
pub fn regenerate_channels<R: Rng + ?Sized>(
    regenerator: &Regenerator,
    channels: &mut [Channel],
    action: Option<Action>,
    now: DateTime<Utc>,
    threshold: Duration,
    shutdown: &Shutdown,
    rng: &mut R,
) -> Batch {
    let mut batch = Batch { summary: RunSummary { total: channels.len(), ..Default::default() }, ..Default::default() };
    let summary = &mut batch.summary;
    for channel in channels.iter_mut() {
        if shutdown.is_requested() {
            info!("Shutdown requested, stopping before channel {}", channel.number);
            break;
        }
        let action = match action {
            Some(forced) => forced,
            None if channel.is_paused => {
                debug!("Channel {} is paused", channel.number);
                summary.skipped += 1;
                continue;
            }
            None => decide(channel, now, threshold),
        };
        if action == Action::Skip {
            summary.skipped += 1;
            continue;
        }

        let before = channel.clone();
        let attempt = match regenerator.emitter().snapshot_playback(channel) {
            Ok(previous) => regenerator.regenerate(channel, action, now, rng).map(|_| previous),
            Err(e) => Err(e),
        };
        match attempt {
            Ok(previous_playback) => {
                summary.successful += 1;
                batch.regenerated.push(Regenerated { before, after: channel.clone(), previous_playback });
            }
            Err(e) => summary.failures.push(ChannelFailure {
                number: channel.number,
                name: channel.name.clone(),
                error: e.to_string(),
            }),
        }
    }
    batch
}

/// State shared by consecutive passes of one process
pub struct Session<C: Clock = SystemClock> {
    instance_id: String,
    store: ChannelStore,
    clock: C,
    /// Results a pass could not save because another writer held the lock
    pending: Option<Batch>,
}

impl Session {
    pub fn open(config: &AppConfig) -> Result<Self> {
        let instance_id = load_or_create_instance_id(&config.data_dir)?;
        let store = ChannelStore::open(config.shared_dir(), &instance_id);
        Ok(Self::with_clock(instance_id, store, SystemClock))
    }
}

impl<C: Clock> Session<C> {
    pub fn with_clock(instance_id: impl Into<String>, store: ChannelStore, clock: C) -> Self {
        Self { instance_id: instance_id.into(), store, clock, pending: None }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn store(&self) -> &ChannelStore {
        &self.store
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Merge `batch` into the stored state under the lock. Returns the
    /// saved channels, or `None` when the lock is taken and the batch is
    /// held for a later pass. Any other failure rolls the playback files back.
    fn commit(&mut self, batch: Batch, emitter: &PlaylistEmitter) -> Result<Option<Vec<Channel>>> {
        let mut merged = 0;
        match self.store.update(|current| merged = batch.merge_into(current)) {
            Ok(channels) => {
                debug!("Merged {} of {} regenerated channels", merged, batch.regenerated.len());
                Ok(Some(channels))
            }
            Err(Error::LockContention(reason)) => {
                debug!("State locked ({}), saving on the next tick", reason);
                self.pending = Some(batch);
                Ok(None)
            }
            Err(e) => {
                batch.restore_files(emitter);
                Err(e)
            }
        }
    }

    /// Save results left over from an earlier pass. `false` when the lock
    /// is still taken.
    fn flush_pending(&mut self, emitter: &PlaylistEmitter) -> Result<bool> {
        let Some(batch) = self.pending.take() else {
            return Ok(true);
        };
        let count = batch.regenerated.len();
        match self.commit(batch, emitter)? {
            Some(channels) => {
                info!("Saved {} channels held over from an earlier pass", count);
                emitter.sync_outputs(&channels)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Last attempt to save held results; when the lock is still taken the
    /// playback files go back to what the stored state describes
    fn settle_pending(&mut self, emitter: &PlaylistEmitter) {
        match self.flush_pending(emitter) {
            Ok(true) => {}
            Ok(false) => {
                if let Some(batch) = self.pending.take() {
                    warn!("Channel state is still locked at exit, discarding unsaved results");
                    batch.restore_files(emitter);
                }
            }
            Err(e) => warn!("Could not save held results: {}", e),
        }
    }
}

/// One sweep: load, regenerate due channels, merge the results into the
/// stored state, refresh the aggregate outputs
pub fn run_pass<C: Clock>(config: &AppConfig, session: &mut Session<C>, shutdown: &Shutdown) -> Result<RunSummary> {
    let regenerator = Regenerator::from_config(config);
    if !session.flush_pending(regenerator.emitter())? {
        return Ok(RunSummary::default());
    }

    let outcome = session.store.load(RecoveryPolicy::Unattended)?;
    if let Some(notice) = &outcome.notice {
        warn!("{}", notice);
    }
    let mut channels = outcome.channels;

    let now = session.clock.now();
    let batch = regenerate_channels(
        &regenerator,
        &mut channels,
        None,
        now,
        config.regen_threshold(),
        shutdown,
        &mut rand::rng(),
    );
    let summary = batch.summary.clone();

    if !batch.is_empty() {
        let saved = session.commit(batch, regenerator.emitter())?;
        regenerator.emitter().sync_outputs(saved.as_deref().unwrap_or(&channels))?;
    }
    Ok(summary)
}

/// The periodic loop. Holds the instance lock and the regeneration
/// ownership record until shutdown.
pub fn run_loop<C, F>(mut load_config: F, session: &mut Session<C>, shutdown: &Shutdown) -> Result<()>
where
    C: Clock,
    F: FnMut() -> Result<AppConfig>,
{
    let mut config = load_config()?;
    let shared = config.shared_dir().to_path_buf();

    let instance_lock = FileLock::new(shared.join(INSTANCE_LOCK_FILE), session.instance_id());
    let guard = instance_lock
        .try_acquire(Duration::days(INSTANCE_LOCK_STALENESS_DAYS))
        .map_err(|e| match e {
            Error::LockContention(reason) => {
                Error::LockContention(format!("another linearcast loop is running: {}", reason))
            }
            other => other,
        })?;

    let ownership = RegenOwnership::new(shared.join(OWNERSHIP_FILE));
    if let Some(owner) = ownership.conflict(session.instance_id()) {
        return Err(Error::LockContention(format!(
            "automatic regeneration is owned by instance {}",
            owner.client_id
        )));
    }
    ownership.claim(session.instance_id(), config.auto_regen)?;
    info!(
        "Regeneration loop started (every {} min, instance {})",
        config.auto_regen_interval_minutes,
        session.instance_id()
    );

    loop {
        if config.auto_regen {
            match run_pass(&config, session, shutdown) {
                Ok(summary) => summary.log(),
                Err(e) => error!("Regeneration pass failed: {}", e),
            }
        } else {
            debug!("Automatic regeneration is off");
        }

        if shutdown.wait(config.regen_interval()) {
            break;
        }

        match load_config() {
            Ok(fresh) => {
                if fresh.shared_dir() != shared.as_path() {
                    warn!("shared_dir changes take effect after a restart");
                }
                config = fresh;
            }
            Err(e) => warn!("Keeping previous configuration: {}", e),
        }
        if let Err(e) = ownership.claim(session.instance_id(), config.auto_regen) {
            warn!("Could not refresh regeneration ownership: {}", e);
        }
    }

    if session.has_pending() {
        session.settle_pending(&PlaylistEmitter::from_config(&config));
    }
    ownership.relinquish(session.instance_id())?;
    guard.release();
    info!("Regeneration loop stopped");
    Ok(())
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
