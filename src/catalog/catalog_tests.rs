//! Tests for source resolution through the catalog

#[cfg(test)]
mod tests {
    use crate::catalog::sqlite::{fixture, SqliteCatalog};
    use crate::catalog::*;
    use crate::error::Error;
    use crate::models::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::fs;
    use std::path::Path;

    const SITCOMS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes" ?>
<smartplaylist type="episodes">
    <name>Sitcoms</name>
    <match>one</match>
    <rule field="tvshow" operator="is">
        <value>Cheers</value>
        <value>Frasier</value>
    </rule>
</smartplaylist>"#;

    fn catalog_with_playlists(dir: &Path) -> MediaCatalog {
        fs::write(dir.join("sitcoms.xsp"), SITCOMS).unwrap();
        fs::write(
            dir.join("movies.xsp"),
            r#"<smartplaylist type="movies"><order>random</order></smartplaylist>"#,
        )
        .unwrap();
        MediaCatalog::new(
            Some(Box::new(SqliteCatalog::from_connection(fixture::library()))),
            DurationCache::default(),
            Some(dir.to_path_buf()),
            SkipLog::new(dir.join(SKIP_LOG_FILE)),
        )
    }

    fn playlist_source(path: &str, kind: SourceKind) -> Source {
        Source::new(path, SourceRole::Base, kind, SourceOrigin::CatalogQuery)
    }

    #[test]
    fn test_playlist_resolves_with_durations_and_groups() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog_with_playlists(dir.path());
        let mut rng = StdRng::seed_from_u64(1);
        let source = playlist_source("special://profile/playlists/video/sitcoms.xsp", SourceKind::Episodic);

        let resolution = catalog.resolve(&source, &mut rng).unwrap();
        assert!(!resolution.is_randomized);
        assert!(resolution.is_one_match);
        assert_eq!(resolution.group_order_hint, vec!["Cheers", "Frasier"]);

        // Cheers S01E02 has no stream duration and is dropped
        assert_eq!(resolution.items.len(), 3);
        let cheers: Vec<&Item> = resolution.items.iter().filter(|i| i.group_key == "Cheers").collect();
        assert_eq!(cheers.len(), 1);
        assert_eq!(cheers[0].duration_seconds, 1400);
        assert_eq!(cheers[0].description, "Boston bar");
        assert_eq!(cheers[0].season_episode_label().as_deref(), Some("S01E01"));

        let log = fs::read_to_string(dir.path().join(SKIP_LOG_FILE)).unwrap();
        assert!(log.contains("EPISODES SKIPPED: Title='Sams Women'"));
        assert!(log.contains("Reason='Missing or invalid duration in database'"));
    }

    #[test]
    fn test_flat_items_group_by_title() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog_with_playlists(dir.path());
        let mut rng = StdRng::seed_from_u64(1);
        let resolution = catalog
            .resolve(&playlist_source("movies.xsp", SourceKind::Flat), &mut rng)
            .unwrap();
        assert!(resolution.is_randomized);
        let groups: Vec<&str> = resolution.items.iter().map(|i| i.group_key.as_str()).collect();
        assert_eq!(groups, vec!["Alien", "Heat"]);
        assert!(resolution.items.iter().all(|i| i.season.is_none()));
    }

    #[test]
    fn test_playlist_type_mismatch_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog_with_playlists(dir.path());
        let mut rng = StdRng::seed_from_u64(1);
        let err = catalog
            .resolve(&playlist_source("sitcoms.xsp", SourceKind::Flat), &mut rng)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSource(_)));

        let err = catalog
            .resolve(&playlist_source("missing.xsp", SourceKind::Flat), &mut rng)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSource(_)));
    }

    #[test]
    fn test_missing_backend_is_catalog_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sitcoms.xsp"), SITCOMS).unwrap();
        let catalog = MediaCatalog::new(
            None,
            DurationCache::default(),
            Some(dir.path().to_path_buf()),
            SkipLog::new(dir.path().join(SKIP_LOG_FILE)),
        );
        let mut rng = StdRng::seed_from_u64(1);
        let err = catalog
            .resolve(&playlist_source("sitcoms.xsp", SourceKind::Episodic), &mut rng)
            .unwrap_err();
        assert!(matches!(err, Error::CatalogUnavailable(_)));
        assert!(err.is_source_level());
    }

    #[test]
    fn test_folder_source_uses_cached_durations() {
        let media = tempfile::tempdir().unwrap();
        let show = media.path().join("Columbo");
        fs::create_dir_all(&show).unwrap();
        for name in ["e1.mkv", "e2.mkv", "e3.mkv"] {
            fs::write(show.join(name), b"").unwrap();
        }
        let mut durations = DurationCache::default();
        durations.durations.insert(show.join("e1.mkv").to_string_lossy().to_string(), 4500.7);
        durations.durations.insert(show.join("e3.mkv").to_string_lossy().to_string(), 0.0);

        let catalog = MediaCatalog::new(None, durations, None, SkipLog::new(media.path().join(SKIP_LOG_FILE)));
        let mut rng = StdRng::seed_from_u64(1);
        let source = Source::new(
            show.to_string_lossy(),
            SourceRole::Base,
            SourceKind::Episodic,
            SourceOrigin::FolderScan,
        );
        let resolution = catalog.resolve(&source, &mut rng).unwrap();
        assert_eq!(resolution.items.len(), 1);
        assert_eq!(resolution.items[0].group_key, "Columbo");
        assert_eq!(resolution.items[0].title, "e1.mkv");
        assert_eq!(resolution.items[0].duration_seconds, 4500);

        let log = fs::read_to_string(media.path().join(SKIP_LOG_FILE)).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.starts_with("EPISODES SKIPPED: File="));

        let empty = tempfile::tempdir().unwrap();
        let source = Source::new(
            empty.path().to_string_lossy(),
            SourceRole::Base,
            SourceKind::Flat,
            SourceOrigin::FolderScan,
        );
        assert!(matches!(catalog.resolve(&source, &mut rng), Err(Error::EmptySource(_))));
    }

    #[test]
    fn test_split_locator() {
        assert_eq!(split_locator("/tv/Frasier/S01E01.mkv"), ("/tv/Frasier/".to_string(), "S01E01.mkv"));
        assert_eq!(split_locator("smb://nas/a.mkv"), ("smb://nas/".to_string(), "a.mkv"));
        assert_eq!(split_locator("a.mkv"), (String::new(), "a.mkv"));
    }

    /// Answers one show's episodes, in whatever order it is told to
    struct ScrambledLibrary {
        rows: Vec<CatalogEntry>,
    }

    impl CatalogBackend for ScrambledLibrary {
        fn name(&self) -> &'static str {
            "scrambled"
        }

        fn query(&self, _playlist: &SmartPlaylist, _kind: SourceKind) -> crate::error::Result<Vec<CatalogEntry>> {
            Ok(self.rows.clone())
        }

        fn lookup(&self, _filename: &str, _directory: &str, _kind: SourceKind) -> crate::error::Result<Option<MediaDetails>> {
            Ok(Some(MediaDetails { duration_seconds: 1320, group_name: Some("Taxi".into()), ..Default::default() }))
        }
    }

    #[test]
    fn test_random_playlist_plays_each_episode_once_across_regenerations() {
        use crate::scheduler::{Limit, Scheduler, SourceView, StopCondition};

        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("taxi.xsp"),
            r#"<smartplaylist type="episodes"><order>random</order></smartplaylist>"#,
        )
        .unwrap();
        let episodes: Vec<CatalogEntry> = (1..=6)
            .map(|e| CatalogEntry {
                file: format!("/tv/Taxi/Taxi.S01E0{}.mkv", e),
                title: format!("Episode {}", e),
                show_title: Some("Taxi".into()),
                season: Some(1),
                episode: Some(e),
                ..Default::default()
            })
            .collect();

        let mut source = playlist_source("taxi.xsp", SourceKind::Episodic);
        let mut played = Vec::new();
        for run in 0..6u64 {
            let mut rows = episodes.clone();
            rows.rotate_left(run as usize);
            let catalog = MediaCatalog::new(
                Some(Box::new(ScrambledLibrary { rows })),
                DurationCache::default(),
                Some(dir.path().to_path_buf()),
                SkipLog::new(dir.path().join(SKIP_LOG_FILE)),
            );
            let mut rng = StdRng::seed_from_u64(100 + run);
            let resolution = catalog.resolve(&source, &mut rng).unwrap();
            assert!(resolution.is_randomized);
            let view = SourceView::prepare(&source, resolution, &mut rng);
            let schedule = Scheduler::new(1, StopCondition::new(Limit::Count(1)))
                .run(view, Vec::new(), &mut rng)
                .unwrap();
            played.push(schedule.entries[0].title.clone());
            source.rotation = schedule.rotations[0].clone();
        }

        played.sort();
        played.dedup();
        assert_eq!(played.len(), 6);
    }
}
