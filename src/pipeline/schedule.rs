//! Schedule expressions for periodic retraining.

use crate::error::{ModelOpsError, Result};
use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

/// Hour of day `@daily` runs at
pub const DAILY_HOUR: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Top of every hour
    Hourly,
    /// Once a day at `hour`:00 UTC
    DailyAt { hour: u32 },
}

impl Schedule {
    /// First firing time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Hourly => {
                let top = after
                    .with_minute(0)
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(after);
                top + Duration::hours(1)
            }
            Self::DailyAt { hour } => {
                let at = NaiveTime::from_hms_opt(*hour, 0, 0).unwrap_or(NaiveTime::MIN);
                let today = after.date_naive().and_time(at).and_utc();
                if today > after {
                    today
                } else {
                    today + Duration::days(1)
                }
            }
        }
    }

    /// Wall-clock wait from `now` until the next firing
    pub fn delay_from(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.next_after(now) - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

impl FromStr for Schedule {
    type Err = ModelOpsError;

    fn from_str(s: &str) -> Result<Self> {
        let expression = s.trim();
        match expression {
            "@hourly" => return Ok(Self::Hourly),
            "@daily" => return Ok(Self::DailyAt { hour: DAILY_HOUR }),
            _ => {}
        }

        let fields: Vec<&str> = expression.split_whitespace().collect();
        match fields.as_slice() {
            ["0", hour, "*", "*", "*"] => {
                let hour: u32 = hour.parse().map_err(|_| {
                    ModelOpsError::Validation(format!("invalid hour in schedule '{expression}'"))
                })?;
                if hour > 23 {
                    return Err(ModelOpsError::Validation(format!(
                        "hour {hour} out of range in schedule '{expression}'"
                    )));
                }
                Ok(Self::DailyAt { hour })
            }
            _ => Err(ModelOpsError::Validation(format!(
                "unsupported schedule '{expression}'; expected @hourly, @daily or '0 H * * *'"
            ))),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hourly => write!(f, "@hourly"),
            Self::DailyAt { hour } => write!(f, "0 {hour} * * *"),
        }
    }
}
