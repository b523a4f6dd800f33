//! Turns point-in-time player readings into per-day session intervals.

mod observation;

pub use observation::{Observation, ObservationError, RawObservation};

use chrono::{DateTime, Duration, FixedOffset};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::store::{DayLog, ParticipantDayRecord, Session};

pub const MIN_SESSION_GAP_SECS_DEFAULT: f64 = 7.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Created,
    Extended,
    Split,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ReconcileSummary {
    pub tolerance_secs: f64,
    pub created: usize,
    pub extended: usize,
    pub split: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciler {
    min_gap_secs: f64,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(MIN_SESSION_GAP_SECS_DEFAULT)
    }
}

impl Reconciler {
    pub fn new(min_gap_secs: f64) -> Self {
        Self { min_gap_secs }
    }

    pub fn min_gap_secs(&self) -> f64 {
        self.min_gap_secs
    }

    /// Longest silence still treated as the same session. An outage widens it,
    /// since players could not be observed while nothing was polling.
    pub fn gap_tolerance(&self, downtime_secs: f64) -> f64 {
        self.min_gap_secs.max(downtime_secs)
    }

    pub fn reconcile(
        &self,
        mut day: DayLog,
        observations: &[RawObservation],
        now: DateTime<FixedOffset>,
        downtime_secs: f64,
    ) -> (DayLog, ReconcileSummary) {
        let tolerance = self.gap_tolerance(downtime_secs);
        if downtime_secs > self.min_gap_secs {
            info!(
                downtime_secs = downtime_secs as i64,
                "session gap adjusted for downtime"
            );
        }

        let mut summary = ReconcileSummary {
            tolerance_secs: tolerance,
            ..ReconcileSummary::default()
        };
        for raw in observations {
            let observation = match Observation::try_from(raw.clone()) {
                Ok(observation) => observation,
                Err(err) => {
                    warn!(error = %err, "skipping malformed observation");
                    summary.skipped += 1;
                    continue;
                }
            };
            match observe(&mut day, observation, now, tolerance) {
                Outcome::Created => summary.created += 1,
                Outcome::Extended => summary.extended += 1,
                Outcome::Split => summary.split += 1,
            }
        }
        (day, summary)
    }
}

fn observe(
    day: &mut DayLog,
    observation: Observation,
    now: DateTime<FixedOffset>,
    tolerance: f64,
) -> Outcome {
    let Some(record) = day.get_mut(&observation.name) else {
        debug!(name = %observation.name, "first sighting today");
        day.upsert(new_record(observation, now));
        return Outcome::Created;
    };

    let since_last_seen = record
        .last_seen
        .map(|last_seen| seconds_between(last_seen, now))
        .unwrap_or(0.0);
    record.last_seen = Some(now);

    let outcome = match record.sessions.last_mut() {
        None => {
            record.sessions.push(backdated_session(&observation, now));
            Outcome::Created
        }
        Some(last) if since_last_seen <= tolerance => {
            if now > last.end {
                last.end = now;
            }
            if observation.score > last.score {
                last.score = observation.score;
            }
            Outcome::Extended
        }
        Some(_) => {
            info!(
                name = %observation.name,
                gap_secs = since_last_seen as i64,
                "player returned, opening new session"
            );
            record
                .sessions
                .push(Session::starting_at(now, now, observation.score));
            Outcome::Split
        }
    };

    // Counters can reset when the game server restarts; only ever move them up.
    if observation.elapsed_seconds > record.latest_elapsed_seconds {
        record.latest_elapsed_seconds = observation.elapsed_seconds;
        record.progressed_at = Some(now);
    }
    if observation.score > record.latest_score {
        record.latest_score = observation.score;
    }
    outcome
}

fn new_record(observation: Observation, now: DateTime<FixedOffset>) -> ParticipantDayRecord {
    let session = backdated_session(&observation, now);
    let mut record = ParticipantDayRecord::new(observation.name);
    record.latest_elapsed_seconds = observation.elapsed_seconds;
    record.latest_score = observation.score;
    record.progressed_at = Some(now);
    record.last_seen = Some(now);
    record.sessions.push(session);
    record
}

/// The source's own connection timer tells when the current run began.
fn backdated_session(observation: &Observation, now: DateTime<FixedOffset>) -> Session {
    let elapsed = Duration::milliseconds((observation.elapsed_seconds * 1000.0).round() as i64);
    let start = now.checked_sub_signed(elapsed).unwrap_or_else(|| {
        warn!(name = %observation.name, "elapsed time out of range, starting session now");
        now
    });
    Session::starting_at(start, now, observation.score)
}

fn seconds_between(from: DateTime<FixedOffset>, to: DateTime<FixedOffset>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}
