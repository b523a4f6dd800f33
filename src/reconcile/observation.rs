use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A player reading as delivered by a snapshot source; any field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "duration")]
    pub elapsed_seconds: Option<f64>,
    #[serde(default)]
    pub score: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub name: String,
    pub elapsed_seconds: f64,
    pub score: i64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ObservationError {
    #[error("observation has no name")]
    MissingName,
    #[error("observation for `{0}` has no elapsed time")]
    MissingElapsed(String),
    #[error("observation for `{name}` has invalid elapsed time {value}")]
    InvalidElapsed { name: String, value: f64 },
}

impl TryFrom<RawObservation> for Observation {
    type Error = ObservationError;

    fn try_from(raw: RawObservation) -> Result<Self, Self::Error> {
        let name = raw.name.ok_or(ObservationError::MissingName)?;
        let elapsed_seconds = raw
            .elapsed_seconds
            .ok_or_else(|| ObservationError::MissingElapsed(name.clone()))?;
        if !elapsed_seconds.is_finite() || elapsed_seconds < 0.0 {
            return Err(ObservationError::InvalidElapsed {
                name,
                value: elapsed_seconds,
            });
        }
        Ok(Self {
            name,
            elapsed_seconds,
            score: raw.score.unwrap_or(0),
        })
    }
}
