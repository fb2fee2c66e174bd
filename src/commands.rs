//! User-facing operations behind the CLI subcommands
//!
//! Each operation loads the channel state, applies one change and saves it
//! back. Problems the user can fix come back as an unsuccessful
//! `CommandOutcome`; everything else is an `Err`.

use crate::catalog::folder::{self, DurationCache, DurationProbe, FfprobeProbe};
use crate::config::AppConfig;
use crate::emitter::{self, PlaylistEmitter};
use crate::error::{Error, Result};
use crate::lock::{load_or_create_instance_id, Clock, SystemClock};
use crate::models::{
    derive_channel_id, Channel, Interleave, LimitType, Source, SourceKind, SourceOrigin, SourceRole,
};
use crate::orchestrator::{regenerate_channels, Action, Regenerator, RunSummary, Shutdown};
use crate::state::{self, ChannelStore, RecoveryPolicy};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub success: bool,
    pub status: String,
}

impl CommandOutcome {
    pub fn ok(status: impl Into<String>) -> Self {
        Self { success: true, status: status.into() }
    }

    pub fn failed(status: impl Into<String>) -> Self {
        Self { success: false, status: status.into() }
    }
}

/// Changes for `edit_channel`; `None` leaves a field alone
#[derive(Debug, Clone, Default)]
pub struct ChannelEdit {
    pub name: Option<String>,
    pub number: Option<u32>,
    pub limit_type: Option<LimitType>,
    pub sources: Option<Vec<Source>>,
    pub paused: Option<bool>,
}

type Prompt = Box<dyn FnMut(&str) -> bool>;

pub struct Commands {
    config: AppConfig,
    store: ChannelStore,
    emitter: PlaylistEmitter,
    clock: Box<dyn Clock>,
    prompt: Option<Prompt>,
}

impl Commands {
    pub fn open(config: AppConfig) -> Result<Self> {
        let instance_id = load_or_create_instance_id(&config.data_dir)?;
        let store = ChannelStore::open(config.shared_dir(), &instance_id);
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: AppConfig, store: ChannelStore) -> Self {
        let emitter = PlaylistEmitter::from_config(&config);
        Self { config, store, emitter, clock: Box::new(SystemClock), prompt: None }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Ask the user before restoring a corrupt state file from its backup
    pub fn with_prompt(mut self, prompt: impl FnMut(&str) -> bool + 'static) -> Self {
        self.prompt = Some(Box::new(prompt));
        self
    }

    pub fn load(&mut self) -> Result<Vec<Channel>> {
        let outcome = match self.prompt.as_mut() {
            Some(ask) => self.store.load(RecoveryPolicy::Interactive(&mut **ask))?,
            None => self.store.load(RecoveryPolicy::Unattended)?,
        };
        if let Some(notice) = &outcome.notice {
            warn!("{}", notice);
        }
        Ok(outcome.channels)
    }

    fn save_and_sync(&self, channels: &[Channel]) -> Result<()> {
        self.store.save(channels)?;
        let report = self.emitter.sync_outputs(channels)?;
        info!("Aggregate outputs cover {} channels", report.channels);
        Ok(())
    }

    pub fn create_channel(
        &mut self,
        name: &str,
        number: Option<u32>,
        limit_type: LimitType,
        sources: Vec<Source>,
    ) -> Result<CommandOutcome> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(CommandOutcome::failed("Channel name cannot be empty"));
        }
        if sources.is_empty() {
            return Ok(CommandOutcome::failed("A channel needs at least one source"));
        }

        let mut channels = self.load()?;
        let suggested = state::suggest_channel_number(&channels);
        let number = number.unwrap_or(suggested);
        if number == 0 {
            return Ok(CommandOutcome::failed("Channel numbers start at 1"));
        }
        if let Some(existing) = channels.iter().find(|c| c.number == number) {
            return Ok(CommandOutcome::failed(format!(
                "Channel number {} is already used by '{}'. Try {}.",
                number, existing.name, suggested
            )));
        }

        let mut channel = Channel::new(name, number, sources);
        channel.id = unique_id(&channels, name);
        channel.limit_type = limit_type;
        channels.push(channel);
        channels.sort_by_key(|c| c.number);
        self.store.save(&channels)?;
        info!("Created channel {} ({})", number, name);
        Ok(CommandOutcome::ok(format!(
            "Created channel {} '{}'. It is generated on the next pass.",
            number, name
        )))
    }

    pub fn edit_channel(&mut self, number: u32, edit: ChannelEdit) -> Result<CommandOutcome> {
        let mut channels = self.load()?;
        let Some(index) = channels.iter().position(|c| c.number == number) else {
            return Ok(CommandOutcome::failed(format!("No channel {}", number)));
        };
        if let Some(new_number) = edit.number {
            if new_number == 0 {
                return Ok(CommandOutcome::failed("Channel numbers start at 1"));
            }
            if new_number != number && channels.iter().any(|c| c.number == new_number) {
                return Ok(CommandOutcome::failed(format!("Channel number {} is already in use", new_number)));
            }
        }
        if edit.sources.as_ref().is_some_and(Vec::is_empty) {
            return Ok(CommandOutcome::failed("A channel needs at least one source"));
        }
        if edit.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Ok(CommandOutcome::failed("Channel name cannot be empty"));
        }

        let before = channels[index].clone();
        let channel = &mut channels[index];
        if let Some(name) = edit.name {
            channel.name = name.trim().to_string();
        }
        if let Some(new_number) = edit.number {
            channel.number = new_number;
        }
        if let Some(limit_type) = edit.limit_type {
            channel.limit_type = limit_type;
        }
        if let Some(sources) = edit.sources {
            channel.sources = sources;
        }
        let schedule_unchanged = channel.name == before.name
            && channel.number == before.number
            && channel.limit_type == before.limit_type
            && channel.sources == before.sources;
        if let Some(paused) = edit.paused {
            channel.is_paused = paused;
        }
        if !schedule_unchanged {
            channel.is_new = true;
        }

        let renamed = emitter::playback_file_name(channel) != emitter::playback_file_name(&before);
        let status = format!("Updated channel {} '{}'", channel.number, channel.name);
        channels.sort_by_key(|c| c.number);
        self.store.save(&channels)?;
        if renamed && self.emitter.remove_playback(&before)? {
            info!("Removed {}", self.emitter.playback_path(&before).display());
        }
        self.emitter.sync_outputs(&channels)?;
        Ok(CommandOutcome::ok(status))
    }

    pub fn delete_channel(&mut self, number: u32) -> Result<CommandOutcome> {
        let mut channels = self.load()?;
        let Some(index) = channels.iter().position(|c| c.number == number) else {
            return Ok(CommandOutcome::failed(format!("No channel {}", number)));
        };
        let removed = channels.remove(index);
        self.store.save(&channels)?;
        self.emitter.remove_playback(&removed)?;
        self.emitter.sync_outputs(&channels)?;
        info!("Deleted channel {} ({})", removed.number, removed.name);
        Ok(CommandOutcome::ok(format!("Deleted channel {} '{}'", removed.number, removed.name)))
    }

    pub fn delete_all(&mut self) -> Result<CommandOutcome> {
        let channels = self.load()?;
        self.store.save(&[])?;
        for channel in &channels {
            self.emitter.remove_playback(channel)?;
        }
        self.emitter.sync_outputs(&[])?;
        Ok(CommandOutcome::ok(format!("Deleted {} channels", channels.len())))
    }

    pub fn regenerate_channel(&mut self, number: u32) -> Result<CommandOutcome> {
        self.run_forced(Some(number), Action::Full)
    }

    pub fn regenerate_all(&mut self) -> Result<CommandOutcome> {
        self.run_forced(None, Action::Full)
    }

    pub fn update_channel(&mut self, number: u32) -> Result<CommandOutcome> {
        self.run_forced(Some(number), Action::Incremental)
    }

    pub fn update_all(&mut self) -> Result<CommandOutcome> {
        self.run_forced(None, Action::Incremental)
    }

    fn run_forced(&mut self, number: Option<u32>, action: Action) -> Result<CommandOutcome> {
        let mut channels = self.load()?;
        let selected = match number {
            Some(n) => match channels.iter().position(|c| c.number == n) {
                Some(i) => i..i + 1,
                None => return Ok(CommandOutcome::failed(format!("No channel {}", n))),
            },
            None => 0..channels.len(),
        };
        if selected.is_empty() {
            return Ok(CommandOutcome::ok("No channels to regenerate"));
        }

        let regenerator = Regenerator::from_config(&self.config);
        let (_stop, shutdown) = Shutdown::channel();
        let batch = regenerate_channels(
            &regenerator,
            &mut channels[selected],
            Some(action),
            self.clock.now(),
            self.config.regen_threshold(),
            &shutdown,
            &mut rand::rng(),
        );
        if batch.is_empty() {
            return Ok(summary_outcome(&batch.summary, action));
        }

        match self.store.update(|current| {
            batch.merge_into(current);
        }) {
            Ok(saved) => {
                let report = self.emitter.sync_outputs(&saved)?;
                info!("Aggregate outputs cover {} channels", report.channels);
                Ok(summary_outcome(&batch.summary, action))
            }
            Err(e) => {
                batch.restore_files(&self.emitter);
                match e {
                    Error::LockContention(reason) => Ok(CommandOutcome::failed(format!(
                        "Channel state is locked by another process ({}); nothing was changed",
                        reason
                    ))),
                    other => Err(other),
                }
            }
        }
    }

    /// Probe durations for one folder, or every folder source of every channel
    pub fn rescan_durations(&mut self, target: Option<&Path>, force: bool) -> Result<CommandOutcome> {
        let probe = FfprobeProbe::new(self.config.ffprobe_path.clone());
        self.rescan_durations_with(&probe, target, force)
    }

    pub fn rescan_durations_with(
        &mut self,
        probe: &dyn DurationProbe,
        target: Option<&Path>,
        force: bool,
    ) -> Result<CommandOutcome> {
        let folders: Vec<PathBuf> = match target {
            Some(path) => vec![path.to_path_buf()],
            None => {
                let channels = self.load()?;
                let paths: BTreeSet<&str> = channels
                    .iter()
                    .flat_map(|c| &c.sources)
                    .filter(|s| s.origin == SourceOrigin::FolderScan)
                    .map(|s| s.path.as_str())
                    .collect();
                paths.into_iter().map(PathBuf::from).collect()
            }
        };
        if folders.is_empty() {
            return Ok(CommandOutcome::ok("No folder sources to scan"));
        }

        let cache_path = self.config.data_dir.join(folder::DURATIONS_FILE);
        let mut cache = DurationCache::load_or_default(&cache_path);
        let now = self.clock.now();
        if !force && cache.is_fresh(now, self.config.rescan_days) {
            return Ok(CommandOutcome::ok(format!(
                "Durations were scanned less than {} days ago",
                self.config.rescan_days
            )));
        }

        let mut probed = 0;
        let mut failed = 0;
        let mut errors = Vec::new();
        for path in &folders {
            // Freshness was settled above for the whole batch
            match folder::rescan(&mut cache, path, probe, now, 0, force) {
                Ok(report) => {
                    probed += report.probed;
                    failed += report.failed;
                }
                Err(e) => {
                    warn!("Scan of {} failed: {}", path.display(), e);
                    errors.push(format!("{}: {}", path.display(), e));
                }
            }
        }
        cache.save(&cache_path)?;

        let mut status = format!(
            "Scanned {} folders: {} durations measured, {} files without a duration",
            folders.len(),
            probed,
            failed
        );
        for error in &errors {
            let _ = write!(status, "\n  {}", error);
        }
        Ok(CommandOutcome { success: errors.is_empty(), status })
    }

    /// Copy state, caches and outputs into a timestamped folder under `dest_root`
    pub fn backup(&mut self, dest_root: Option<&Path>) -> Result<CommandOutcome> {
        let default_root = self.config.data_dir.join("backups");
        let root = dest_root.unwrap_or(&default_root);
        let (dest, copied) =
            state::create_backup(self.config.shared_dir(), &self.config.data_dir, root, self.clock.now())?;
        Ok(CommandOutcome::ok(format!("Backed up {} files to {}", copied, dest.display())))
    }

    pub fn restore(&mut self, backup_dir: &Path) -> Result<CommandOutcome> {
        match state::restore_backup(backup_dir, self.config.shared_dir(), &self.config.data_dir) {
            Ok(copied) => Ok(CommandOutcome::ok(format!(
                "Restored {} files from {}",
                copied,
                backup_dir.display()
            ))),
            Err(Error::InvalidChannelState(reason)) => Ok(CommandOutcome::failed(reason)),
            Err(e) => Err(e),
        }
    }

    pub fn list(&mut self) -> Result<CommandOutcome> {
        let channels = self.load()?;
        if channels.is_empty() {
            return Ok(CommandOutcome::ok("No channels"));
        }
        let mut out = String::new();
        for channel in &channels {
            let limit = match channel.limit_type {
                LimitType::Time => "time",
                LimitType::ItemCount => "items",
            };
            let _ = write!(
                out,
                "{}. {} [{}, {} sources]",
                channel.number,
                channel.name,
                limit,
                channel.sources.len()
            );
            match channel.last_generation_time {
                Some(at) => {
                    let _ = write!(
                        out,
                        " generated {} ({}s)",
                        at.format("%Y-%m-%d %H:%M"),
                        channel.total_generated_duration.unwrap_or(0)
                    );
                }
                None => out.push_str(" not generated yet"),
            }
            if channel.is_paused {
                out.push_str(" paused");
            }
            out.push('\n');
        }
        Ok(CommandOutcome::ok(out.trim_end()))
    }

    /// Programme list from the emitted guide, for one channel or all
    pub fn guide(&mut self, number: Option<u32>) -> Result<CommandOutcome> {
        let Some(guide) = emitter::read_guide(&self.emitter.guide_path())? else {
            return Ok(CommandOutcome::failed("No guide has been written yet"));
        };
        let wanted: Option<String> = match number {
            Some(n) => match self.load()?.into_iter().find(|c| c.number == n) {
                Some(channel) => Some(channel.id),
                None => return Ok(CommandOutcome::failed(format!("No channel {}", n))),
            },
            None => None,
        };

        let mut out = String::new();
        for channel in guide.iter().filter(|c| wanted.as_ref().is_none_or(|id| *id == c.id)) {
            let _ = writeln!(out, "{}", channel.display_name);
            for programme in &channel.programmes {
                let _ = writeln!(out, "  {}", programme.title);
            }
        }
        Ok(CommandOutcome::ok(out.trim_end()))
    }
}

/// Id for a new channel, suffixed when another channel already derived the same one
fn unique_id(channels: &[Channel], name: &str) -> String {
    let base = derive_channel_id(name);
    if !channels.iter().any(|c| c.id == base) {
        return base;
    }
    let stem = name.replace(' ', "_");
    (2..)
        .map(|n| format!("{}_{}@linearcast", stem, n))
        .find(|id| !channels.iter().any(|c| &c.id == id))
        .unwrap_or(base)
}

/// Parse a source given as `KIND:ORIGIN:PATH[@OPTIONS]`.
///
/// KIND is `episodes` or `movies`, ORIGIN is `playlist` or `folder`. OPTIONS
/// is a comma list of `LOW[-HIGH][xCOUNT]` and `shuffle`, for example
/// `movies:folder:/media/shorts@2-5x2,shuffle`. The path may itself contain
/// colons, so only the first two separate fields.
pub fn parse_source(spec: &str, role: SourceRole) -> std::result::Result<Source, String> {
    let mut fields = spec.splitn(3, ':');
    let kind = match fields.next().map(str::to_lowercase).as_deref() {
        Some("episodes") => SourceKind::Episodic,
        Some("movies") => SourceKind::Flat,
        other => return Err(format!("unknown source kind {:?}, expected episodes or movies", other.unwrap_or(""))),
    };
    let origin = match fields.next().map(str::to_lowercase).as_deref() {
        Some("playlist") => SourceOrigin::CatalogQuery,
        Some("folder") => SourceOrigin::FolderScan,
        other => return Err(format!("unknown source origin {:?}, expected playlist or folder", other.unwrap_or(""))),
    };
    let rest = fields.next().unwrap_or("");

    let (path, options) = match rest.rsplit_once('@') {
        Some((path, opts)) => match parse_source_options(opts) {
            Some(options) => (path, options),
            None => (rest, SourceOptions::default()),
        },
        None => (rest, SourceOptions::default()),
    };
    if path.trim().is_empty() {
        return Err("source path is empty".into());
    }

    let mut source = Source::new(path, role, kind, origin);
    if let Some(interleave) = options.interleave {
        source.interleave = interleave;
    }
    source.shuffle_groups = options.shuffle;
    Ok(source)
}

#[derive(Default)]
struct SourceOptions {
    interleave: Option<Interleave>,
    shuffle: bool,
}

fn parse_source_options(text: &str) -> Option<SourceOptions> {
    let mut options = SourceOptions::default();
    for token in text.split(',').map(str::trim) {
        if token.eq_ignore_ascii_case("shuffle") {
            options.shuffle = true;
            continue;
        }
        let (range, count) = match token.split_once('x') {
            Some((range, count)) => (range, count.parse::<i64>().ok()?),
            None => (token, 1),
        };
        let (low, high) = match range.split_once('-') {
            Some((low, high)) => (low.parse::<i64>().ok()?, high.parse::<i64>().ok()?),
            None => {
                let position = range.parse::<i64>().ok()?;
                (position, position)
            }
        };
        options.interleave = Some(Interleave { low, high, count });
    }
    Some(options)
}

fn summary_outcome(summary: &RunSummary, action: Action) -> CommandOutcome {
    let verb = match action {
        Action::Incremental => "Updated",
        _ => "Regenerated",
    };
    let mut status = format!("{} {} of {} channels", verb, summary.successful, summary.total);
    for failure in &summary.failures {
        let _ = write!(status, "\n  {}. {}: {}", failure.number, failure.name, failure.error);
    }
    CommandOutcome { success: summary.failures.is_empty(), status }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::folder::DURATIONS_FILE;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::HashMap;
    use std::fs;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    struct FakeProbe(HashMap<String, f64>);

    impl DurationProbe for FakeProbe {
        fn probe(&self, file: &Path) -> Result<Option<f64>> {
            let name = file.file_name().unwrap().to_string_lossy().to_string();
            Ok(self.0.get(&name).copied())
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        commands: Commands,
        show: String,
    }

    /// A data folder with one show whose two episodes are already timed
    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        let show = dir.path().join("Show");
        fs::create_dir_all(&show).unwrap();
        let mut cache = DurationCache::default();
        for name in ["e1.mkv", "e2.mkv"] {
            fs::write(show.join(name), b"").unwrap();
            cache.durations.insert(show.join(name).to_string_lossy().to_string(), 900.0);
        }
        cache.save(&data.join(DURATIONS_FILE)).unwrap();

        let config = AppConfig { data_dir: data.clone(), max_playlist_hours: 1, ..Default::default() };
        let store = ChannelStore::open(&data, "test");
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let commands = Commands::with_store(config, store).with_clock(FixedClock(now));
        Fixture { commands, show: show.to_string_lossy().to_string(), dir }
    }

    fn source(path: &str) -> Source {
        Source::new(path, SourceRole::Base, SourceKind::Episodic, SourceOrigin::FolderScan)
    }

    fn data(fx: &Fixture) -> PathBuf {
        fx.dir.path().join("data")
    }

    #[test]
    fn test_create_validates_numbers_and_names() {
        let mut fx = fixture();
        let show = fx.show.clone();
        let c = &mut fx.commands;
        assert!(c.create_channel("Reruns", None, LimitType::Time, vec![source(&show)]).unwrap().success);

        let taken = c.create_channel("Other", Some(1), LimitType::Time, vec![source(&show)]).unwrap();
        assert!(!taken.success);
        assert!(taken.status.contains("Try 2"));
        assert!(!c.create_channel("  ", None, LimitType::Time, vec![source(&show)]).unwrap().success);
        assert!(!c.create_channel("Empty", None, LimitType::Time, Vec::new()).unwrap().success);

        // Same name, different number: the id gets a suffix
        assert!(c.create_channel("Reruns", Some(5), LimitType::ItemCount, vec![source(&show)]).unwrap().success);
        let channels = c.load().unwrap();
        let ids: Vec<&str> = channels.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["Reruns@linearcast", "Reruns_2@linearcast"]);
        assert!(channels.iter().all(|c| c.is_new));
        assert_eq!(channels[1].limit_type, LimitType::ItemCount);
    }

    #[test]
    fn test_regenerate_then_rename_moves_playback_file() {
        let mut fx = fixture();
        let show = fx.show.clone();
        let data = data(&fx);
        let c = &mut fx.commands;
        c.create_channel("Reruns", Some(3), LimitType::Time, vec![source(&show)]).unwrap();

        let outcome = c.regenerate_channel(3).unwrap();
        assert!(outcome.success, "{}", outcome.status);
        assert!(data.join("Channel_3_Reruns.m3u").exists());
        assert!(data.join(emitter::COMBINED_PLAYLIST).exists());
        let channels = c.load().unwrap();
        assert!(!channels[0].is_new);
        assert_eq!(channels[0].total_generated_duration, Some(3600));

        let edit = ChannelEdit { name: Some("Late Reruns".into()), number: Some(4), ..Default::default() };
        assert!(c.edit_channel(3, edit).unwrap().success);
        assert!(!data.join("Channel_3_Reruns.m3u").exists());
        let channels = c.load().unwrap();
        assert_eq!(channels[0].number, 4);
        assert_eq!(channels[0].id, "Reruns@linearcast");
        assert!(channels[0].is_new);

        assert!(!c.regenerate_channel(3).unwrap().success);
        assert!(c.update_all().unwrap().success);
        assert!(data.join("Channel_4_Late_Reruns.m3u").exists());
    }

    #[test]
    fn test_locked_state_leaves_playback_files_untouched() {
        let mut fx = fixture();
        let show = fx.show.clone();
        let data = data(&fx);
        let c = &mut fx.commands;
        c.create_channel("Reruns", Some(1), LimitType::Time, vec![source(&show)]).unwrap();
        c.create_channel("Fresh", Some(2), LimitType::Time, vec![source(&show)]).unwrap();
        assert!(c.regenerate_channel(1).unwrap().success);
        let playback = data.join("Channel_1_Reruns.m3u");
        let original = fs::read_to_string(&playback).unwrap();
        let state_before = fs::read_to_string(c.store.path()).unwrap();

        let lock_path = PathBuf::from(format!("{}.lock", c.store.path().display()));
        let record = crate::lock::LockRecord {
            pid: std::process::id(),
            instance_id: "other".into(),
            token: "held".into(),
            acquired_at: Utc::now(),
        };
        fs::write(&lock_path, serde_json::to_vec(&record).unwrap()).unwrap();

        let outcome = c.regenerate_all().unwrap();
        assert!(!outcome.success);
        assert!(outcome.status.contains("locked"));
        assert_eq!(fs::read_to_string(&playback).unwrap(), original);
        assert!(!data.join("Channel_2_Fresh.m3u").exists());
        assert_eq!(fs::read_to_string(c.store.path()).unwrap(), state_before);

        fs::remove_file(&lock_path).unwrap();
        assert!(c.regenerate_all().unwrap().success);
        assert!(data.join("Channel_2_Fresh.m3u").exists());
    }

    #[test]
    fn test_pause_alone_keeps_generated_state() {
        let mut fx = fixture();
        let show = fx.show.clone();
        let c = &mut fx.commands;
        c.create_channel("Reruns", Some(1), LimitType::Time, vec![source(&show)]).unwrap();
        c.regenerate_all().unwrap();

        let edit = ChannelEdit { paused: Some(true), ..Default::default() };
        assert!(c.edit_channel(1, edit).unwrap().success);
        let channels = c.load().unwrap();
        assert!(channels[0].is_paused);
        assert!(!channels[0].is_new);
        assert!(c.list().unwrap().status.contains("paused"));
    }

    #[test]
    fn test_delete_removes_state_and_files() {
        let mut fx = fixture();
        let show = fx.show.clone();
        let data = data(&fx);
        let c = &mut fx.commands;
        c.create_channel("One", Some(1), LimitType::Time, vec![source(&show)]).unwrap();
        c.create_channel("Two", Some(2), LimitType::Time, vec![source(&show)]).unwrap();
        c.regenerate_all().unwrap();
        assert!(data.join("Channel_1_One.m3u").exists());

        assert!(c.delete_channel(1).unwrap().success);
        assert!(!data.join("Channel_1_One.m3u").exists());
        assert!(!c.delete_channel(1).unwrap().success);
        let guide = c.guide(None).unwrap();
        assert!(guide.status.starts_with("2. Two"));
        assert!(!guide.status.contains("1. One"));

        assert_eq!(c.delete_all().unwrap().status, "Deleted 1 channels");
        assert!(!data.join("Channel_2_Two.m3u").exists());
        assert_eq!(c.list().unwrap().status, "No channels");
    }

    #[test]
    fn test_guide_for_one_channel() {
        let mut fx = fixture();
        let show = fx.show.clone();
        let c = &mut fx.commands;
        assert!(!c.guide(None).unwrap().success);
        c.create_channel("One", Some(1), LimitType::Time, vec![source(&show)]).unwrap();
        c.create_channel("Two", Some(2), LimitType::Time, vec![source(&show)]).unwrap();
        c.regenerate_all().unwrap();

        let status = c.guide(Some(2)).unwrap().status;
        let lines: Vec<&str> = status.lines().collect();
        assert_eq!(lines[0], "2. Two");
        assert_eq!(lines[1], "  Show - e1.mkv");
        assert_eq!(lines.len(), 5);
        assert!(!c.guide(Some(9)).unwrap().success);
    }

    #[test]
    fn test_rescan_collects_folder_sources() {
        let mut fx = fixture();
        let show = fx.show.clone();
        let data = data(&fx);
        fs::write(Path::new(&show).join("e3.mkv"), b"").unwrap();
        let c = &mut fx.commands;
        c.create_channel("One", Some(1), LimitType::Time, vec![source(&show)]).unwrap();
        c.create_channel("Two", Some(2), LimitType::Time, vec![source(&show)]).unwrap();

        let probe = FakeProbe(HashMap::from([("e3.mkv".to_string(), 1200.0)]));
        let outcome = c.rescan_durations_with(&probe, None, false).unwrap();
        assert!(outcome.success);
        assert!(outcome.status.starts_with("Scanned 1 folders: 1 durations measured"));

        let cache = DurationCache::load(&data.join(DURATIONS_FILE)).unwrap();
        assert_eq!(cache.duration_of(&Path::new(&show).join("e3.mkv").to_string_lossy()), Some(1200.0));

        let again = c.rescan_durations_with(&probe, None, false).unwrap();
        assert!(again.status.contains("less than 7 days ago"));
    }

    #[test]
    fn test_parse_source_specs() {
        let base = parse_source("episodes:playlist:special://profile/playlists/video/Sitcoms.xsp", SourceRole::Base)
            .unwrap();
        assert_eq!(base.path, "special://profile/playlists/video/Sitcoms.xsp");
        assert_eq!(base.kind, SourceKind::Episodic);
        assert_eq!(base.origin, SourceOrigin::CatalogQuery);
        assert_eq!(base.interleave, Interleave::default());

        let extra = parse_source("movies:folder:/media/shorts@2-5x2,shuffle", SourceRole::Additional).unwrap();
        assert_eq!(extra.path, "/media/shorts");
        assert_eq!(extra.kind, SourceKind::Flat);
        assert_eq!(extra.origin, SourceOrigin::FolderScan);
        assert_eq!(extra.interleave, Interleave { low: 2, high: 5, count: 2 });
        assert!(extra.shuffle_groups);

        // An '@' that is not followed by options stays part of the path
        let odd = parse_source("movies:folder:/media/me@home", SourceRole::Additional).unwrap();
        assert_eq!(odd.path, "/media/me@home");
        assert_eq!(parse_source("movies:folder:/m@3", SourceRole::Additional).unwrap().interleave, Interleave::fixed(3, 1));

        assert!(parse_source("films:folder:/m", SourceRole::Base).is_err());
        assert!(parse_source("movies:disk:/m", SourceRole::Base).is_err());
        assert!(parse_source("movies:folder:", SourceRole::Base).is_err());
    }

    #[test]
    fn test_backup_and_restore() {
        let mut fx = fixture();
        let show = fx.show.clone();
        let data = data(&fx);
        let c = &mut fx.commands;
        c.create_channel("One", Some(1), LimitType::Time, vec![source(&show)]).unwrap();

        let outcome = c.backup(None).unwrap();
        assert!(outcome.success);
        let backup_dir = data.join("backups").join("backup_20240501_120000");
        assert!(backup_dir.join("shared").join(state::STATE_FILE).exists());

        c.delete_all().unwrap();
        assert!(c.restore(&backup_dir).unwrap().success);
        assert_eq!(c.load().unwrap().len(), 1);
        assert!(!c.restore(&data.join("nowhere")).unwrap().success);
    }
}
