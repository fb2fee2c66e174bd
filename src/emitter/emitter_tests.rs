//! Tests for playback file writing and aggregate outputs

#[cfg(test)]
mod tests {
    use crate::emitter::*;
    use crate::models::*;
    use std::fs;

    fn entry(group: &str, index: usize, secs: u64) -> PlaybackEntry {
        PlaybackEntry {
            duration_seconds: secs,
            group_key: group.into(),
            title: format!("{} {}", group, index),
            season_episode_label: Some(format!("S01E{:02}", index + 1)),
            description: String::new(),
            file_locator: format!("/tv/{}/{}.mkv", group, index),
        }
    }

    #[test]
    fn test_safe_file_names() {
        assert_eq!(safe_name("Comedy & Co: 80s!"), "Comedy__Co_80s");
        assert_eq!(safe_name("sci-fi_night"), "sci-fi_night");
        let channel = Channel::new("Late Night", 7, Vec::new());
        assert_eq!(playback_file_name(&channel), "Channel_7_Late_Night.m3u");
    }

    #[test]
    fn test_patch_keeps_retained_bytes_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let emitter = PlaylistEmitter::new(dir.path(), "linearcast");
        let channel = Channel::new("Sitcoms", 1, Vec::new());

        let path = emitter
            .write(&channel, &[entry("A", 0, 60), entry("B", 0, 60), entry("A", 1, 60)], WriteMode::Full)
            .unwrap();

        // Hand edits to retained entries survive a patch
        let edited = fs::read_to_string(&path)
            .unwrap()
            .replace("/tv/A/1.mkv", "#EXTVLCOPT:network-caching=1000\n/tv/A/1.mkv");
        fs::write(&path, &edited).unwrap();
        let before = emitter.read_playback(&channel).unwrap().unwrap();

        emitter
            .write(&channel, &[entry("B", 1, 60)], WriteMode::Patch { expired: 1 })
            .unwrap();
        let after = emitter.read_playback(&channel).unwrap().unwrap();

        let titles: Vec<&str> = after.iter().map(|b| b.entry.title.as_str()).collect();
        assert_eq!(titles, vec!["B 0", "A 1", "B 1"]);
        assert_eq!(after[0].raw, before[1].raw);
        assert_eq!(after[1].raw, before[2].raw);
        assert!(after[1].raw.contains("#EXTVLCOPT"));

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("#EXTM3U\n#EXTINF:60,B//B 0 (S01E01)//\n"));
    }

    #[test]
    fn test_patch_without_file_or_with_excess_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let emitter = PlaylistEmitter::new(dir.path(), "linearcast");
        let channel = Channel::new("Movies", 2, Vec::new());

        emitter
            .write(&channel, &[entry("A", 0, 60)], WriteMode::Patch { expired: 3 })
            .unwrap();
        let blocks = emitter.read_playback(&channel).unwrap().unwrap();
        assert_eq!(blocks.len(), 1);

        emitter.write(&channel, &[], WriteMode::Patch { expired: 5 }).unwrap();
        assert_eq!(emitter.read_playback(&channel).unwrap().unwrap(), Vec::new());
        assert_eq!(fs::read_to_string(emitter.playback_path(&channel)).unwrap(), "#EXTM3U\n");

        assert!(emitter.remove_playback(&channel).unwrap());
        assert!(!emitter.remove_playback(&channel).unwrap());
        assert_eq!(emitter.read_playback(&channel).unwrap(), None);
    }

    #[test]
    fn test_sync_outputs_orders_channels_and_skips_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let emitter = PlaylistEmitter::new(dir.path(), "My TV");
        let second = Channel::new("Movies", 2, Vec::new());
        let first = Channel::new("Sitcoms", 1, Vec::new());
        emitter.write(&first, &[entry("A", 0, 1320)], WriteMode::Full).unwrap();
        emitter.write(&second, &[entry("M", 0, 7020)], WriteMode::Full).unwrap();

        let channels = vec![second.clone(), first.clone()];
        let report = emitter.sync_outputs(&channels).unwrap();
        assert_eq!(report.channels, 2);
        assert!(report.playlist_written);
        assert!(report.guide_written);
        assert!(!report.compressed_written);

        let combined = fs::read_to_string(dir.path().join(COMBINED_PLAYLIST)).unwrap();
        let lines: Vec<&str> = combined.lines().collect();
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(
            lines[1],
            "#EXTINF:1320 tvg-id=\"Sitcoms@linearcast\" tvg-name=\"1. Sitcoms\" tvg-chno=\"1\" group-title=\"My TV\",Sitcoms"
        );
        assert_eq!(lines[2], "/tv/A/0.mkv");
        assert!(lines[3].contains("tvg-chno=\"2\""));

        let guide = read_guide(&emitter.guide_path()).unwrap().unwrap();
        let names: Vec<&str> = guide.iter().map(|c| c.display_name.as_str()).collect();
        assert_eq!(names, vec!["1. Sitcoms", "2. Movies"]);
        assert_eq!(guide[0].programmes[0].title, "A - A 0 (S01E01)");

        let again = emitter.sync_outputs(&channels).unwrap();
        assert!(!again.playlist_written);
        assert!(!again.guide_written);
    }

    #[test]
    fn test_compressed_guide_follows_setting() {
        let dir = tempfile::tempdir().unwrap();
        let channel = Channel::new("News", 1, Vec::new());
        let compressing = PlaylistEmitter::new(dir.path(), "linearcast").with_compression(true);
        compressing.write(&channel, &[entry("A", 0, 60)], WriteMode::Full).unwrap();

        let report = compressing.sync_outputs(std::slice::from_ref(&channel)).unwrap();
        assert!(report.compressed_written);
        assert!(dir.path().join(COMPRESSED_GUIDE_FILE).exists());

        let plain = PlaylistEmitter::new(dir.path(), "linearcast");
        plain.sync_outputs(std::slice::from_ref(&channel)).unwrap();
        assert!(!dir.path().join(COMPRESSED_GUIDE_FILE).exists());
    }
}
