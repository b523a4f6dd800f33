use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::FixedOffset;
use serde::Deserialize;
use thiserror::Error;

use crate::reconcile::MIN_SESSION_GAP_SECS_DEFAULT;

pub const SERVER_DEFAULT: &str = "127.0.0.1:27015";
pub const UTC_OFFSET_DEFAULT: &str = "+03:00";
pub const POLL_INTERVAL_SECS_DEFAULT: u64 = 3;
pub const QUERY_TIMEOUT_SECS_DEFAULT: u64 = 5;
pub const STATS_PREFIX_DEFAULT: &str = "players";

#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub server: String,
    pub utc_offset: FixedOffset,
    pub poll_interval: Duration,
    pub min_session_gap_secs: f64,
    pub query_timeout: Duration,
    pub stats_prefix: String,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            server: SERVER_DEFAULT.to_string(),
            utc_offset: DEFAULT_OFFSET,
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS_DEFAULT),
            min_session_gap_secs: MIN_SESSION_GAP_SECS_DEFAULT,
            query_timeout: Duration::from_secs(QUERY_TIMEOUT_SECS_DEFAULT),
            stats_prefix: STATS_PREFIX_DEFAULT.to_string(),
        }
    }
}

const DEFAULT_OFFSET: FixedOffset = FixedOffset::east_opt(3 * 3600).unwrap();
const FIXED_UTC: FixedOffset = FixedOffset::east_opt(0).unwrap();

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    server: Option<String>,
    #[serde(default)]
    utc_offset: Option<String>,
    #[serde(default)]
    poll_interval_secs: Option<u64>,
    #[serde(default)]
    min_session_gap_secs: Option<f64>,
    #[serde(default)]
    query_timeout_secs: Option<u64>,
    #[serde(default)]
    stats_prefix: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid utc_offset `{0}`; expected something like +03:00")]
    InvalidOffset(String),
    #[error("`{key}` must be positive")]
    NotPositive { key: &'static str },
    #[error("stats_prefix must be a plain, non-empty file name prefix")]
    InvalidPrefix,
}

/// Merges the user config and then the data-directory config over the
/// defaults. Missing files are skipped; a later layer wins per key.
pub fn load_effective_config(
    data_config: Option<&Path>,
    user_config: Option<&Path>,
) -> Result<EffectiveConfig, ConfigError> {
    let mut merged = EffectiveConfig::default();

    for path in [user_config, data_config].into_iter().flatten() {
        if path.exists() {
            let layer = load_config_layer(path)?;
            merge_layer(&mut merged, layer)?;
        }
    }

    Ok(merged)
}

pub fn load_config_file(path: &Path) -> Result<EffectiveConfig, ConfigError> {
    let mut config = EffectiveConfig::default();
    merge_layer(&mut config, load_config_layer(path)?)?;
    Ok(config)
}

fn load_config_layer(path: &Path) -> Result<RawConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(RawConfig::default());
    }
    Ok(serde_yaml::from_str(&content)?)
}

fn merge_layer(merged: &mut EffectiveConfig, layer: RawConfig) -> Result<(), ConfigError> {
    if let Some(server) = layer.server {
        merged.server = server;
    }
    if let Some(raw) = layer.utc_offset {
        merged.utc_offset = parse_utc_offset(&raw)?;
    }
    if let Some(secs) = layer.poll_interval_secs {
        if secs == 0 {
            return Err(ConfigError::NotPositive {
                key: "poll_interval_secs",
            });
        }
        merged.poll_interval = Duration::from_secs(secs);
    }
    if let Some(gap) = layer.min_session_gap_secs {
        if !(gap.is_finite() && gap > 0.0) {
            return Err(ConfigError::NotPositive {
                key: "min_session_gap_secs",
            });
        }
        merged.min_session_gap_secs = gap;
    }
    if let Some(secs) = layer.query_timeout_secs {
        if secs == 0 {
            return Err(ConfigError::NotPositive {
                key: "query_timeout_secs",
            });
        }
        merged.query_timeout = Duration::from_secs(secs);
    }
    if let Some(prefix) = layer.stats_prefix {
        let plain = !prefix.is_empty()
            && prefix
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !plain {
            return Err(ConfigError::InvalidPrefix);
        }
        merged.stats_prefix = prefix;
    }
    Ok(())
}

/// Parses `+HH:MM`, `-HH:MM`, `+HHMM` or `Z`.
pub fn parse_utc_offset(raw: &str) -> Result<FixedOffset, ConfigError> {
    let invalid = || ConfigError::InvalidOffset(raw.to_string());
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
        return Ok(FIXED_UTC);
    }

    let (sign, rest) = match trimmed.split_at_checked(1) {
        Some(("+", rest)) => (1, rest),
        Some(("-", rest)) => (-1, rest),
        _ => return Err(invalid()),
    };
    let digits = rest.replace(':', "");
    if digits.len() != 4 || !digits.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(invalid());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

pub fn default_config_yaml() -> String {
    format!(
        r#"server: "{SERVER_DEFAULT}"
utc_offset: "{UTC_OFFSET_DEFAULT}"
poll_interval_secs: {POLL_INTERVAL_SECS_DEFAULT}
min_session_gap_secs: {MIN_SESSION_GAP_SECS_DEFAULT}
query_timeout_secs: {QUERY_TIMEOUT_SECS_DEFAULT}
stats_prefix: {STATS_PREFIX_DEFAULT}
"#
    )
}
