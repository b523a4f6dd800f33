use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use super::atomic::replace_file;

const DAY_FORMAT: &str = "%Y-%m-%d";
const DAY_SUFFIX: &str = ".jsonl";
const LEGACY_DAY_SUFFIX: &str = ".json";
const PLAYTIME_FORMAT: &str = "seconds";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write `{}`: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode day log: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid stats pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

/// One unbroken period a participant was observed present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "play_start")]
    pub start: DateTime<FixedOffset>,
    #[serde(rename = "play_end")]
    pub end: DateTime<FixedOffset>,
    #[serde(default)]
    pub score: i64,
}

impl Session {
    pub fn starting_at(start: DateTime<FixedOffset>, end: DateTime<FixedOffset>, score: i64) -> Self {
        Self { start, end, score }
    }

    pub fn seconds(&self) -> f64 {
        (self.end - self.start).num_milliseconds() as f64 / 1000.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantDayRecord {
    #[serde(rename = "player_name")]
    pub name: String,
    #[serde(rename = "player_playtime", default)]
    pub latest_elapsed_seconds: f64,
    #[serde(rename = "player_score", default)]
    pub latest_score: i64,
    #[serde(default = "default_playtime_format")]
    pub playtime_format: String,
    /// Last time `latest_elapsed_seconds` advanced.
    #[serde(rename = "timestamp", default, skip_serializing_if = "Option::is_none")]
    pub progressed_at: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<FixedOffset>>,
    #[serde(default, deserialize_with = "lenient_sessions")]
    pub sessions: Vec<Session>,
}

impl ParticipantDayRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            latest_elapsed_seconds: 0.0,
            latest_score: 0,
            playtime_format: default_playtime_format(),
            progressed_at: None,
            last_seen: None,
            sessions: Vec::new(),
        }
    }
}

fn default_playtime_format() -> String {
    PLAYTIME_FORMAT.to_string()
}

fn lenient_sessions<'de, D>(deserializer: D) -> Result<Vec<Session>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    let mut sessions = Vec::with_capacity(raw.len());
    for value in raw {
        match serde_json::from_value::<Session>(value) {
            Ok(session) => sessions.push(session),
            Err(err) => warn!(error = %err, "dropping malformed session entry"),
        }
    }
    Ok(sessions)
}

/// All participant records for one calendar day, keyed by name and kept in
/// first-insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DayLog {
    records: Vec<ParticipantDayRecord>,
    positions: HashMap<String, usize>,
}

impl DayLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = ParticipantDayRecord>) -> Self {
        let mut log = Self::new();
        for record in records {
            log.upsert(record);
        }
        log
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ParticipantDayRecord> {
        self.positions.get(name).map(|&idx| &self.records[idx])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ParticipantDayRecord> {
        let idx = *self.positions.get(name)?;
        Some(&mut self.records[idx])
    }

    /// Inserts `record`, replacing any record with the same name in place.
    pub fn upsert(&mut self, record: ParticipantDayRecord) {
        if let Some(&idx) = self.positions.get(&record.name) {
            self.records[idx] = record;
            return;
        }
        self.positions.insert(record.name.clone(), self.records.len());
        self.records.push(record);
    }

    pub fn records(&self) -> impl Iterator<Item = &ParticipantDayRecord> {
        self.records.iter()
    }

    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for record in &self.records {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Parses newline-delimited records, skipping lines that do not decode.
    pub fn parse_jsonl(input: &str) -> Self {
        let mut log = Self::new();
        for (idx, line) in input.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ParticipantDayRecord>(line) {
                Ok(record) => log.upsert(record),
                Err(err) => warn!(line = idx + 1, error = %err, "skipping malformed record line"),
            }
        }
        log
    }
}

pub fn day_key(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

/// Per-day JSONL files named `<prefix>-YYYY-MM-DD.jsonl` in one directory.
#[derive(Debug, Clone)]
pub struct DayLogStore {
    dir: PathBuf,
    prefix: String,
}

impl DayLogStore {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, day: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}-{}{DAY_SUFFIX}", self.prefix, day_key(day)))
    }

    fn legacy_path_for(&self, day: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}-{}{LEGACY_DAY_SUFFIX}", self.prefix, day_key(day)))
    }

    /// Loads the day log, or an empty one when the file is missing or unreadable.
    pub fn load(&self, day: NaiveDate) -> DayLog {
        let primary = self.path_for(day);
        let path = if primary.exists() {
            primary
        } else {
            let legacy = self.legacy_path_for(day);
            if !legacy.exists() {
                debug!(day = %day_key(day), "no day log yet");
                return DayLog::new();
            }
            legacy
        };

        match fs::read_to_string(&path) {
            Ok(content) => DayLog::parse_jsonl(&content),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable day log, starting empty");
                DayLog::new()
            }
        }
    }

    pub fn save(&self, day: NaiveDate, log: &DayLog) -> Result<(), StoreError> {
        let content = log.to_jsonl()?;
        let path = self.path_for(day);
        replace_file(&path, content.as_bytes())
            .map_err(|source| StoreError::Write { path, source })
    }

    /// Every day that has a log file, oldest first.
    pub fn available_days(&self) -> Result<BTreeSet<NaiveDate>, StoreError> {
        let pattern = format!(
            "{}/{}-*.json*",
            glob::Pattern::escape(&self.dir.to_string_lossy()),
            glob::Pattern::escape(&self.prefix)
        );
        let stem_prefix = format!("{}-", self.prefix);
        let mut days = BTreeSet::new();
        for entry in glob::glob(&pattern)?.filter_map(Result::ok) {
            if !entry.is_file() {
                continue;
            }
            let Some(file_name) = entry.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Some(stem) = file_name
                .strip_suffix(DAY_SUFFIX)
                .or_else(|| file_name.strip_suffix(LEGACY_DAY_SUFFIX))
            else {
                continue;
            };
            let Some(raw_day) = stem.strip_prefix(&stem_prefix) else {
                continue;
            };
            if let Ok(day) = NaiveDate::parse_from_str(raw_day, DAY_FORMAT) {
                days.insert(day);
            }
        }
        Ok(days)
    }
}
