//! Where player snapshots come from, and the shared view of the latest one.

pub mod a2s;

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reconcile::RawObservation;

pub use a2s::A2sSource;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("snapshot source unreachable: {0}")]
    Io(#[from] io::Error),
    #[error("malformed server response: {0}")]
    Protocol(String),
    #[error("split (multi-packet) responses are not supported")]
    SplitResponse,
    #[error("invalid snapshot file: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Server metadata carried alongside the players. Not interpreted by the
/// reconciler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub map: String,
    #[serde(default)]
    pub player_count: u32,
    #[serde(default)]
    pub max_players: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub info: Option<ServerInfo>,
    #[serde(default)]
    pub players: Vec<RawObservation>,
}

pub trait SnapshotSource {
    fn fetch(&self) -> Result<Snapshot, SourceError>;
}

impl<S: SnapshotSource + ?Sized> SnapshotSource for Box<S> {
    fn fetch(&self) -> Result<Snapshot, SourceError> {
        (**self).fetch()
    }
}

/// Reads a snapshot from a JSON file on every fetch:
/// `{"info": {...}, "players": [{"name": .., "duration": .., "score": ..}]}`.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotSource for JsonFileSource {
    fn fetch(&self) -> Result<Snapshot, SourceError> {
        let content = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Most recent successfully fetched snapshot, or `None` before the first
/// cycle completes. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotCache {
    latest: Arc<RwLock<Option<Snapshot>>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<Snapshot> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn publish(&self, snapshot: Snapshot) {
        *self
            .latest
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::{JsonFileSource, Snapshot, SnapshotCache, SnapshotSource, SourceError};
    use std::fs;

    #[test]
    fn file_source_reads_players_and_info() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("snapshot.json");
        fs::write(
            &path,
            r#"{"info":{"server_name":"Mafia","map":"de_dust2","player_count":2,"max_players":16},
               "players":[{"name":"Bob","duration":10.0,"score":0},{"name":"Ann","duration":4.5}]}"#,
        )
        .expect("seed");

        let snapshot = JsonFileSource::new(&path).fetch().expect("fetch");
        assert_eq!(snapshot.players.len(), 2);
        assert_eq!(snapshot.players[1].score, None);
        assert_eq!(snapshot.info.expect("info").map, "de_dust2");
    }

    #[test]
    fn file_source_reports_bad_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("snapshot.json");
        fs::write(&path, "{\"players\": [").expect("seed");

        assert!(matches!(
            JsonFileSource::new(&path).fetch(),
            Err(SourceError::Decode(_))
        ));
    }

    #[test]
    fn cache_is_empty_until_published_and_shared_by_clones() {
        let cache = SnapshotCache::new();
        let reader = cache.clone();
        assert!(reader.latest().is_none());

        cache.publish(Snapshot::default());
        assert_eq!(reader.latest(), Some(Snapshot::default()));
    }
}
