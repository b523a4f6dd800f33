use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::store::atomic::replace_file;

#[derive(Debug, Serialize, Deserialize)]
struct CycleStamp {
    last_time: DateTime<FixedOffset>,
}

/// Remembers when the last successful cycle ran so an outage can be measured
/// across restarts.
#[derive(Debug, Clone)]
pub struct DowntimeTracker {
    path: PathBuf,
}

impl DowntimeTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_cycle_time(&self, now: DateTime<FixedOffset>) -> io::Result<()> {
        let content = serde_json::to_vec(&CycleStamp { last_time: now })?;
        replace_file(&self.path, &content)
    }

    pub fn last_cycle_time(&self) -> Option<DateTime<FixedOffset>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "unreadable cycle timestamp");
                return None;
            }
        };
        match serde_json::from_str::<CycleStamp>(&content) {
            Ok(stamp) => Some(stamp.last_time),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "corrupt cycle timestamp");
                None
            }
        }
    }

    /// Seconds since the last recorded cycle, never negative; zero on first run.
    pub fn compute_downtime(&self, now: DateTime<FixedOffset>) -> f64 {
        let Some(last) = self.last_cycle_time() else {
            debug!("no previous cycle recorded");
            return 0.0;
        };
        let seconds = (now - last).num_milliseconds() as f64 / 1000.0;
        seconds.max(0.0)
    }
}
