use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Days, NaiveDate};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown period `{0}`; expected one of today, yesterday, this_week, this_month")]
pub struct PeriodError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Period {
    Today,
    Yesterday,
    ThisWeek,
    ThisMonth,
}

impl Period {
    pub const ALL: [Period; 4] = [
        Period::Today,
        Period::Yesterday,
        Period::ThisWeek,
        Period::ThisMonth,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Today => "today",
            Self::Yesterday => "yesterday",
            Self::ThisWeek => "this_week",
            Self::ThisMonth => "this_month",
        }
    }

    /// Day logs that must exist before a query over this period is answered.
    pub const fn min_history_days(self) -> usize {
        match self {
            Self::Today => 1,
            Self::Yesterday => 2,
            Self::ThisWeek => 3,
            Self::ThisMonth => 7,
        }
    }

    /// Calendar days covered by the period, oldest first.
    pub fn resolve(self, today: NaiveDate) -> Vec<NaiveDate> {
        match self {
            Self::Today => vec![today],
            Self::Yesterday => today.pred_opt().into_iter().collect(),
            Self::ThisWeek => (0..7u64)
                .rev()
                .filter_map(|back| today.checked_sub_days(Days::new(back)))
                .collect(),
            Self::ThisMonth => {
                let Some(first) = today.with_day(1) else {
                    return Vec::new();
                };
                first
                    .iter_days()
                    .take_while(|day| day.month() == today.month())
                    .collect()
            }
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = PeriodError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|period| period.as_str() == normalized)
            .ok_or_else(|| PeriodError(raw.to_string()))
    }
}

/// Resolves a symbolic period name to its day keys relative to `today`.
pub fn resolve(period: &str, today: NaiveDate) -> Result<Vec<NaiveDate>, PeriodError> {
    Ok(period.parse::<Period>()?.resolve(today))
}
