//! Tests for lock files and regeneration ownership

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::lock::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct FakeClock(Arc<Mutex<DateTime<Utc>>>);

    impl FakeClock {
        fn at(secs: i64) -> Self {
            FakeClock(Arc::new(Mutex::new(Utc.timestamp_opt(secs, 0).unwrap())))
        }

        fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    #[derive(Clone, Default)]
    struct FakeLiveness(Arc<Mutex<HashSet<u32>>>);

    impl FakeLiveness {
        fn with_alive(pids: &[u32]) -> Self {
            FakeLiveness(Arc::new(Mutex::new(pids.iter().copied().collect())))
        }

        fn kill(&self, pid: u32) {
            self.0.lock().unwrap().remove(&pid);
        }
    }

    impl LivenessOracle for FakeLiveness {
        fn is_alive(&self, pid: u32) -> bool {
            self.0.lock().unwrap().contains(&pid)
        }
    }

    const START: i64 = 1_700_000_000;

    fn lock(
        dir: &std::path::Path,
        instance: &str,
        pid: u32,
        clock: &FakeClock,
        alive: &FakeLiveness,
    ) -> FileLock<FakeClock, FakeLiveness> {
        FileLock::with_parts(dir.join("channels.json.lock"), instance, pid, clock.clone(), alive.clone())
    }

    #[test]
    fn test_second_writer_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let clock = FakeClock::at(START);
        let alive = FakeLiveness::with_alive(&[100, 200]);
        let first = lock(dir.path(), "a", 100, &clock, &alive);
        let second = lock(dir.path(), "b", 200, &clock, &alive);

        let guard = first.try_acquire(Duration::seconds(60)).unwrap();
        let err = second.try_acquire(Duration::seconds(60)).unwrap_err();
        assert!(matches!(err, Error::LockContention(_)));

        drop(guard);
        assert!(!dir.path().join("channels.json.lock").exists());
        assert!(second.try_acquire(Duration::seconds(60)).is_ok());
    }

    #[test]
    fn test_stale_lock_is_reclaimed_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let clock = FakeClock::at(START);
        let alive = FakeLiveness::with_alive(&[100, 200]);
        let first = lock(dir.path(), "a", 100, &clock, &alive);
        let second = lock(dir.path(), "b", 200, &clock, &alive);

        let stale = first.try_acquire(Duration::seconds(60)).unwrap();
        clock.advance(Duration::seconds(61));
        let fresh = second.try_acquire(Duration::seconds(60)).unwrap();
        assert_eq!(second.current_owner().unwrap().pid, 200);

        // The reclaimed guard must not remove the new owner's file
        drop(stale);
        assert!(fresh.path().exists());
    }

    #[test]
    fn test_dead_owner_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let clock = FakeClock::at(START);
        let alive = FakeLiveness::with_alive(&[100, 200]);
        let first = lock(dir.path(), "a", 100, &clock, &alive);
        let second = lock(dir.path(), "b", 200, &clock, &alive);

        let _held = first.try_acquire(Duration::hours(24)).unwrap();
        assert!(second.try_acquire(Duration::hours(24)).is_err());
        assert!(second.is_stale_owner_alive(100));

        alive.kill(100);
        assert!(!second.is_stale_owner_alive(100));
        assert!(second.try_acquire(Duration::hours(24)).is_ok());
    }

    #[test]
    fn test_garbage_lock_file_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("channels.json.lock"), "not json").unwrap();
        let clock = FakeClock::at(START);
        let alive = FakeLiveness::with_alive(&[1]);
        let l = lock(dir.path(), "a", 1, &clock, &alive);
        assert!(l.try_acquire(Duration::seconds(60)).is_ok());
    }

    #[test]
    fn test_two_reclaimers_of_one_stale_lock_cannot_both_win() {
        let dir = tempfile::tempdir().unwrap();
        let clock = FakeClock::at(START);
        let alive = FakeLiveness::with_alive(&[100, 200, 300]);
        let path = dir.path().join("channels.json.lock");
        let gone = lock(dir.path(), "x", 300, &clock, &alive);
        std::mem::forget(gone.try_acquire(Duration::seconds(60)).unwrap());
        alive.kill(300);

        let a = lock(dir.path(), "a", 100, &clock, &alive);
        let b = lock(dir.path(), "b", 200, &clock, &alive);
        // Both racers read the dead owner's file before either acts
        let judged_by_a = std::fs::read_to_string(&path).unwrap();
        let judged_by_b = judged_by_a.clone();

        assert!(a.reclaim(&judged_by_a).unwrap());
        let held = a.try_acquire(Duration::seconds(60)).unwrap();
        assert_eq!(a.current_owner().unwrap().instance_id, "a");

        // b acts on its outdated judgement and must leave a's lock in place
        assert!(!b.reclaim(&judged_by_b).unwrap());
        assert_eq!(b.current_owner().unwrap().instance_id, "a");
        assert!(matches!(b.try_acquire(Duration::seconds(60)), Err(Error::LockContention(_))));

        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
        drop(held);
        assert!(!path.exists());
    }

    #[test]
    fn test_reclaim_of_vanished_lock_proceeds() {
        let dir = tempfile::tempdir().unwrap();
        let clock = FakeClock::at(START);
        let alive = FakeLiveness::with_alive(&[100]);
        let a = lock(dir.path(), "a", 100, &clock, &alive);
        assert!(a.reclaim("{}").unwrap());
        assert!(a.try_acquire(Duration::seconds(60)).is_ok());
    }

    #[test]
    fn test_release_only_removes_own_lock() {
        let dir = tempfile::tempdir().unwrap();
        let clock = FakeClock::at(START);
        let alive = FakeLiveness::with_alive(&[100, 200]);
        let owner = lock(dir.path(), "a", 100, &clock, &alive);
        let other = lock(dir.path(), "b", 200, &clock, &alive);

        let guard = owner.try_acquire(Duration::seconds(60)).unwrap();
        other.release().unwrap();
        assert!(guard.path().exists());
        owner.release().unwrap();
        assert!(!guard.path().exists());
    }

    #[test]
    fn test_ownership_conflict_and_staleness() {
        let dir = tempfile::tempdir().unwrap();
        let clock = FakeClock::at(START);
        let path = dir.path().join("linearcast_settings.lock");
        let ownership = RegenOwnership::with_clock(&path, clock.clone());

        assert!(ownership.conflict("me").is_none());
        ownership.claim("other", true).unwrap();
        let conflict = ownership.conflict("me").unwrap();
        assert_eq!(conflict.client_id, "other");
        assert!(ownership.conflict("other").is_none());

        clock.advance(Duration::hours(25));
        assert!(ownership.conflict("me").is_none());
    }

    #[test]
    fn test_ownership_without_auto_regen_is_not_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let clock = FakeClock::at(START);
        let ownership = RegenOwnership::with_clock(dir.path().join("owner.lock"), clock);
        ownership.claim("other", false).unwrap();
        assert!(ownership.conflict("me").is_none());
        ownership.relinquish("me").unwrap();
        assert!(ownership.read().is_some());
        ownership.relinquish("other").unwrap();
        assert!(ownership.read().is_none());
    }

    #[test]
    fn test_instance_id_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_instance_id(dir.path()).unwrap();
        let second = load_or_create_instance_id(dir.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 36);
    }
}
