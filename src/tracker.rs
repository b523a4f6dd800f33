use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::downtime::DowntimeTracker;
use crate::reconcile::{ReconcileSummary, Reconciler};
use crate::source::{SnapshotCache, SnapshotSource, SourceError};
use crate::store::{DayLogStore, StoreError, day_key};

const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("fetching snapshot failed: {0}")]
    Fetch(#[from] SourceError),
    #[error("saving day log failed: {0}")]
    Save(#[from] StoreError),
    #[error("recording cycle time failed: {0}")]
    Stamp(#[source] io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub day: String,
    pub now: DateTime<FixedOffset>,
    pub downtime_secs: f64,
    pub observed: usize,
    pub participants: usize,
    #[serde(flatten)]
    pub summary: ReconcileSummary,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub cycles: u64,
    pub failures: u64,
}

/// Owns one reconciliation pipeline: fetch, reconcile today's log, persist.
pub struct Tracker<S> {
    source: S,
    store: DayLogStore,
    downtime: DowntimeTracker,
    reconciler: Reconciler,
    offset: FixedOffset,
    cache: SnapshotCache,
}

impl<S: SnapshotSource> Tracker<S> {
    pub fn new(
        source: S,
        store: DayLogStore,
        downtime: DowntimeTracker,
        reconciler: Reconciler,
        offset: FixedOffset,
    ) -> Self {
        Self {
            source,
            store,
            downtime,
            reconciler,
            offset,
            cache: SnapshotCache::new(),
        }
    }

    /// Handle to the latest fetched snapshot, shareable with query code.
    pub fn cache(&self) -> SnapshotCache {
        self.cache.clone()
    }

    pub fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.offset)
    }

    /// Runs one full cycle at `now`. Nothing is written unless the fetch
    /// succeeds, and the cycle time is only recorded after the day log is saved.
    pub fn run_cycle(&self, now: DateTime<FixedOffset>) -> Result<CycleReport, CycleError> {
        let now = now.with_timezone(&self.offset);
        let snapshot = self.source.fetch()?;
        let observed = snapshot.players.len();
        let downtime_secs = self.downtime.compute_downtime(now);
        let day = now.date_naive();

        let prior = self.store.load(day);
        let (updated, summary) =
            self.reconciler
                .reconcile(prior, &snapshot.players, now, downtime_secs);
        self.cache.publish(snapshot);
        self.store.save(day, &updated)?;
        self.downtime
            .record_cycle_time(now)
            .map_err(CycleError::Stamp)?;

        Ok(CycleReport {
            day: day_key(day),
            now,
            downtime_secs,
            observed,
            participants: updated.len(),
            summary,
        })
    }

    /// Cycles every `interval` until `stop` is set. A failed cycle is logged
    /// and retried on the next tick; cycles never overlap.
    pub fn run_until(&self, interval: Duration, stop: &AtomicBool) -> LoopStats {
        let mut stats = LoopStats::default();
        while !stop.load(Ordering::SeqCst) {
            let started = Instant::now();
            stats.cycles += 1;
            match self.run_cycle(self.now()) {
                Ok(report) => info!(
                    day = %report.day,
                    players = report.observed,
                    created = report.summary.created,
                    split = report.summary.split,
                    "cycle complete"
                ),
                Err(err) => {
                    stats.failures += 1;
                    error!(error = %err, "cycle abandoned");
                }
            }
            sleep_unless_stopped(interval.saturating_sub(started.elapsed()), stop);
        }
        stats
    }
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + total;
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return;
        }
        thread::sleep(left.min(STOP_POLL));
    }
}

#[cfg(test)]
mod tests {
    use super::{CycleError, Tracker};
    use crate::downtime::DowntimeTracker;
    use crate::reconcile::{RawObservation, Reconciler};
    use crate::source::{Snapshot, SnapshotSource, SourceError};
    use crate::store::DayLogStore;
    use chrono::{DateTime, Duration, FixedOffset, NaiveDate};
    use std::fs;
    use std::io;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StaticSource(Snapshot);

    impl SnapshotSource for StaticSource {
        fn fetch(&self) -> Result<Snapshot, SourceError> {
            Ok(self.0.clone())
        }
    }

    struct DownSource;

    impl SnapshotSource for DownSource {
        fn fetch(&self) -> Result<Snapshot, SourceError> {
            Err(SourceError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "no reply",
            )))
        }
    }

    struct StopAfterFetch {
        stop: Arc<AtomicBool>,
    }

    impl SnapshotSource for StopAfterFetch {
        fn fetch(&self) -> Result<Snapshot, SourceError> {
            self.stop.store(true, Ordering::SeqCst);
            Ok(Snapshot::default())
        }
    }

    fn at(raw: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(raw).expect("timestamp")
    }

    fn bob(elapsed: f64) -> Snapshot {
        Snapshot {
            info: None,
            players: vec![RawObservation {
                name: Some("Bob".to_string()),
                elapsed_seconds: Some(elapsed),
                score: Some(1),
            }],
        }
    }

    fn tracker<S: SnapshotSource>(source: S, root: &Path) -> Tracker<S> {
        Tracker::new(
            source,
            DayLogStore::new(root.join("stats"), "players"),
            DowntimeTracker::new(root.join("server_time.json")),
            Reconciler::default(),
            FixedOffset::east_opt(3 * 3600).expect("offset"),
        )
    }

    #[test]
    fn cycle_persists_day_log_stamp_and_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker = tracker(StaticSource(bob(10.0)), dir.path());
        assert!(tracker.cache().latest().is_none());

        let now = at("2026-07-01T23:59:50+03:00");
        let report = tracker.run_cycle(now).expect("cycle");
        assert_eq!(report.day, "2026-07-01");
        assert_eq!(report.summary.created, 1);
        assert_eq!(report.downtime_secs, 0.0);

        let store = DayLogStore::new(dir.path().join("stats"), "players");
        let day = NaiveDate::from_ymd_opt(2026, 7, 1).expect("day");
        assert_eq!(store.load(day).get("Bob").expect("bob").sessions.len(), 1);
        assert!(dir.path().join("server_time.json").exists());
        assert_eq!(tracker.cache().latest(), Some(bob(10.0)));
    }

    #[test]
    fn later_cycle_sees_downtime_and_extends_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker = tracker(StaticSource(bob(10.0)), dir.path());
        let now = at("2026-07-01T12:00:00+03:00");
        tracker.run_cycle(now).expect("first");

        let report = tracker
            .run_cycle(now + Duration::seconds(120))
            .expect("second");
        assert_eq!(report.downtime_secs, 120.0);
        assert_eq!(report.summary.tolerance_secs, 120.0);
        assert_eq!(report.summary.extended, 1);
    }

    #[test]
    fn day_rolls_over_in_the_configured_zone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker = tracker(StaticSource(bob(10.0)), dir.path());
        let report = tracker
            .run_cycle(at("2026-07-01T22:30:00+00:00"))
            .expect("cycle");
        assert_eq!(report.day, "2026-07-02");
    }

    #[test]
    fn failed_fetch_leaves_existing_state_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let now = at("2026-07-01T12:00:00+03:00");
        tracker(StaticSource(bob(10.0)), dir.path())
            .run_cycle(now)
            .expect("seed cycle");
        let day_file = dir.path().join("stats/players-2026-07-01.jsonl");
        let before = fs::read_to_string(&day_file).expect("day file");
        let stamp_before =
            fs::read_to_string(dir.path().join("server_time.json")).expect("stamp");

        let down = tracker(DownSource, dir.path());
        let err = down
            .run_cycle(now + Duration::seconds(3))
            .expect_err("fetch fails");
        assert!(matches!(err, CycleError::Fetch(_)));
        assert_eq!(fs::read_to_string(&day_file).expect("day file"), before);
        assert_eq!(
            fs::read_to_string(dir.path().join("server_time.json")).expect("stamp"),
            stamp_before
        );
        assert!(down.cache().latest().is_none());
    }

    #[test]
    fn unwritable_store_is_a_save_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("stats"), "not a directory").expect("seed");
        let tracker = tracker(StaticSource(bob(10.0)), dir.path());

        let err = tracker
            .run_cycle(at("2026-07-01T12:00:00+03:00"))
            .expect_err("save fails");
        assert!(matches!(err, CycleError::Save(_)));
        assert!(!dir.path().join("server_time.json").exists());
    }

    #[test]
    fn loop_runs_until_stopped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stop = Arc::new(AtomicBool::new(false));
        let tracker = tracker(
            StopAfterFetch {
                stop: Arc::clone(&stop),
            },
            dir.path(),
        );

        let stats = tracker.run_until(std::time::Duration::from_secs(60), &stop);
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.failures, 0);
    }

    #[test]
    fn loop_counts_failures_and_keeps_going() {
        struct FlakySource {
            calls: AtomicUsize,
            stop: Arc<AtomicBool>,
        }

        impl SnapshotSource for FlakySource {
            fn fetch(&self) -> Result<Snapshot, SourceError> {
                if self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
                    self.stop.store(true, Ordering::SeqCst);
                }
                DownSource.fetch()
            }
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let stop = Arc::new(AtomicBool::new(false));
        let flaky = tracker(
            FlakySource {
                calls: AtomicUsize::new(0),
                stop: Arc::clone(&stop),
            },
            dir.path(),
        );

        let stats = flaky.run_until(std::time::Duration::ZERO, &stop);
        assert_eq!(stats.cycles, 3);
        assert_eq!(stats.failures, 3);
    }
}
