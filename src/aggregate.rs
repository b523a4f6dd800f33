use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, warn};

use crate::period::Period;
use crate::store::{DayLog, DayLogStore, StoreError, day_key};

const UNNAMED_PLAYER: &str = "NoName";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateResult {
    pub name: String,
    pub total_seconds: f64,
    pub total_score: i64,
}

/// Reasons a query is declined. These are expected outcomes, not failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum QueryRejection {
    /// Not enough history collected yet for this kind of period.
    InsufficientData { found: usize, required: usize },
    /// No day log falls inside the requested range.
    NoData { period: String },
    InvalidPeriod { period: String },
}

impl fmt::Display for QueryRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData { found, required } => write!(
                f,
                "not enough history yet: {found} day(s) recorded, {required} required"
            ),
            Self::NoData { period } => write!(f, "no data available for {period}"),
            Self::InvalidPeriod { period } => write!(
                f,
                "unknown period `{period}`; choose today, yesterday, this_week or this_month"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Ranked {
        period: Period,
        days: Vec<NaiveDate>,
        results: Vec<AggregateResult>,
    },
    Rejected(QueryRejection),
}

/// Parses `period` and aggregates it; an unknown name is a rejection.
pub fn aggregate_named(
    store: &DayLogStore,
    period: &str,
    today: NaiveDate,
) -> Result<QueryOutcome, StoreError> {
    match period.parse::<Period>() {
        Ok(period) => aggregate(store, period, today),
        Err(err) => Ok(QueryOutcome::Rejected(QueryRejection::InvalidPeriod {
            period: err.0,
        })),
    }
}

pub fn aggregate(
    store: &DayLogStore,
    period: Period,
    today: NaiveDate,
) -> Result<QueryOutcome, StoreError> {
    let available = store.available_days()?;
    let selected = match select_days(period, today, &available) {
        Ok(selected) => selected,
        Err(rejection) => return Ok(QueryOutcome::Rejected(rejection)),
    };

    let logs = selected
        .iter()
        .map(|&day| store.load(day))
        .collect::<Vec<_>>();
    Ok(QueryOutcome::Ranked {
        period,
        results: rank_day_logs(&logs),
        days: selected,
    })
}

/// Applies the minimum-history policy and intersects the period with the
/// days that actually have logs.
pub fn select_days(
    period: Period,
    today: NaiveDate,
    available: &BTreeSet<NaiveDate>,
) -> Result<Vec<NaiveDate>, QueryRejection> {
    let required = period.min_history_days();
    if available.len() < required {
        debug!(found = available.len(), required, "rejecting query for lack of history");
        return Err(QueryRejection::InsufficientData {
            found: available.len(),
            required,
        });
    }

    let selected = period
        .resolve(today)
        .into_iter()
        .filter(|day| available.contains(day))
        .collect::<Vec<_>>();
    if selected.is_empty() {
        return Err(QueryRejection::NoData {
            period: period.as_str().to_string(),
        });
    }
    Ok(selected)
}

/// Sums playtime and score per player over the given logs, longest playtime
/// first. Players tied on playtime keep the order they were first seen in.
pub fn rank_day_logs<'a>(logs: impl IntoIterator<Item = &'a DayLog>) -> Vec<AggregateResult> {
    let mut results: Vec<AggregateResult> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for log in logs {
        for record in log.records() {
            let name = match record.name.trim() {
                "" => UNNAMED_PLAYER.to_string(),
                trimmed => trimmed.to_string(),
            };

            let mut seconds = 0.0;
            let mut score = 0i64;
            for session in &record.sessions {
                let duration = session.seconds();
                if duration > 0.0 {
                    seconds += duration;
                } else if duration < 0.0 {
                    warn!(
                        name = %name,
                        start = %session.start,
                        end = %session.end,
                        "session ends before it starts, ignoring its duration"
                    );
                }
                score = score.saturating_add(session.score);
            }

            let idx = *positions.entry(name.clone()).or_insert_with(|| {
                results.push(AggregateResult {
                    name,
                    total_seconds: 0.0,
                    total_score: 0,
                });
                results.len() - 1
            });
            let entry = &mut results[idx];
            entry.total_seconds += seconds;
            entry.total_score = entry.total_score.saturating_add(score);
        }
    }

    for result in &mut results {
        result.total_score = result.total_score.max(0);
    }
    results.sort_by(|a, b| b.total_seconds.total_cmp(&a.total_seconds));
    results
}

/// Compact human duration: `~1m`, `12.5m`, `1d 2h 5m`.
pub fn format_playtime(seconds: f64) -> String {
    let minutes = seconds / 60.0;
    if minutes < 1.0 {
        return "~1m".to_string();
    }
    if minutes < 60.0 {
        return format!("{minutes:.1}m");
    }

    let whole = seconds as u64;
    let days = whole / 86_400;
    let hours = (whole % 86_400) / 3_600;
    let mins = (whole % 3_600) / 60;
    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if mins > 0 {
        parts.push(format!("{mins}m"));
    }
    parts.join(" ")
}

pub fn day_keys(days: &[NaiveDate]) -> Vec<String> {
    days.iter().copied().map(day_key).collect()
}

#[cfg(test)]
mod tests {
    use super::{
        AggregateResult, QueryOutcome, QueryRejection, aggregate, aggregate_named,
        format_playtime, rank_day_logs, select_days,
    };
    use crate::period::Period;
    use crate::store::{DayLog, DayLogStore, ParticipantDayRecord, Session};
    use chrono::{DateTime, Duration, FixedOffset, NaiveDate};
    use std::collections::BTreeSet;

    fn day(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("day")
    }

    fn at(raw: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(raw).expect("timestamp")
    }

    fn record(name: &str, spans: &[(i64, i64, i64)]) -> ParticipantDayRecord {
        let base = at("2026-06-01T12:00:00+03:00");
        let mut record = ParticipantDayRecord::new(name);
        for &(start, end, score) in spans {
            record.sessions.push(Session::starting_at(
                base + Duration::seconds(start),
                base + Duration::seconds(end),
                score,
            ));
        }
        record
    }

    #[test]
    fn sums_sessions_across_days_and_ranks_by_time() {
        let monday = DayLog::from_records([
            record("Ann", &[(0, 60, 2), (100, 160, 3)]),
            record("Bob", &[(0, 300, 1)]),
        ]);
        let tuesday = DayLog::from_records([record("Ann", &[(0, 240, 5)])]);

        let ranked = rank_day_logs([&monday, &tuesday]);
        assert_eq!(
            ranked,
            vec![
                AggregateResult {
                    name: "Ann".to_string(),
                    total_seconds: 360.0,
                    total_score: 10,
                },
                AggregateResult {
                    name: "Bob".to_string(),
                    total_seconds: 300.0,
                    total_score: 1,
                },
            ]
        );
    }

    #[test]
    fn non_positive_sessions_add_no_time_and_score_never_negative() {
        let log = DayLog::from_records([
            record("Neg", &[(50, 10, -4), (0, 0, -1)]),
            record("Zero", &[(0, 0, 2)]),
        ]);

        let ranked = rank_day_logs([&log]);
        let neg = ranked.iter().find(|r| r.name == "Neg").expect("neg");
        assert_eq!(neg.total_seconds, 0.0);
        assert_eq!(neg.total_score, 0);
        let zero = ranked.iter().find(|r| r.name == "Zero").expect("zero");
        assert_eq!(zero.total_score, 2);
    }

    #[test]
    fn ties_keep_first_seen_order_and_blank_names_merge() {
        let log = DayLog::from_records([
            record("Zed", &[(0, 30, 0)]),
            record("", &[(0, 30, 0)]),
            record("Amy", &[(0, 30, 0)]),
            record("  ", &[(0, 30, 0)]),
        ]);

        let names = rank_day_logs([&log])
            .into_iter()
            .map(|r| r.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["NoName", "Zed", "Amy"]);
    }

    #[test]
    fn yesterday_with_one_day_of_history_is_insufficient() {
        let available = BTreeSet::from([day("2026-06-01")]);
        assert_eq!(
            select_days(Period::Yesterday, day("2026-06-02"), &available),
            Err(QueryRejection::InsufficientData {
                found: 1,
                required: 2,
            })
        );
    }

    #[test]
    fn enough_history_but_nothing_in_range_is_no_data() {
        let available = BTreeSet::from([day("2026-05-01"), day("2026-05-02")]);
        assert_eq!(
            select_days(Period::Today, day("2026-06-02"), &available),
            Err(QueryRejection::NoData {
                period: "today".to_string(),
            })
        );
    }

    #[test]
    fn week_selects_only_existing_days_in_range() {
        let available = BTreeSet::from([
            day("2026-05-20"),
            day("2026-05-28"),
            day("2026-06-01"),
            day("2026-06-03"),
        ]);
        assert_eq!(
            select_days(Period::ThisWeek, day("2026-06-02"), &available),
            Ok(vec![day("2026-05-28"), day("2026-06-01")])
        );
    }

    #[test]
    fn aggregates_from_store_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DayLogStore::new(dir.path(), "players");
        store
            .save(
                day("2026-06-01"),
                &DayLog::from_records([record("Ann", &[(0, 90, 1)])]),
            )
            .expect("save");
        store
            .save(
                day("2026-06-02"),
                &DayLog::from_records([record("Ann", &[(0, 30, 1)]), record("Bob", &[(0, 10, 0)])]),
            )
            .expect("save");

        let outcome = aggregate(&store, Period::Yesterday, day("2026-06-02")).expect("aggregate");
        let QueryOutcome::Ranked { days, results, .. } = outcome else {
            panic!("expected ranked outcome, got {outcome:?}");
        };
        assert_eq!(days, vec![day("2026-06-01")]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].total_seconds, 90.0);
    }

    #[test]
    fn unknown_period_name_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DayLogStore::new(dir.path(), "players");
        assert_eq!(
            aggregate_named(&store, "decade", day("2026-06-02")).expect("aggregate"),
            QueryOutcome::Rejected(QueryRejection::InvalidPeriod {
                period: "decade".to_string(),
            })
        );
    }

    #[test]
    fn formats_playtime_like_the_presenter() {
        assert_eq!(format_playtime(30.0), "~1m");
        assert_eq!(format_playtime(750.0), "12.5m");
        assert_eq!(format_playtime(3_600.0), "1h");
        assert_eq!(format_playtime(93_900.0), "1d 2h 5m");
    }
}
