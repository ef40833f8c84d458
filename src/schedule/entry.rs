//! Schedule entry types.
//!
//! A schedule is either calendar-based (`crontab`: minute / hour /
//! day-of-week / day-of-month / month-of-year, each defaulting to "every
//! value") or interval-based (`timedelta`: days / seconds / minutes /
//! hours / weeks, each defaulting to 0). Entries are stored as tagged
//! JSON documents keyed by their unique name.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

fn every() -> String {
    "*".to_string()
}

/// Crontab fields may arrive as numbers (`{"minute": 0}`) or strings
/// (`{"minute": "*/5"}`); both normalize to strings.
fn field<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Str(String),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Num(n) => n.to_string(),
        Raw::Str(s) => s,
    })
}

/// When a schedule entry fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Calendar specification.
    Crontab {
        #[serde(default = "every", deserialize_with = "field")]
        minute: String,
        #[serde(default = "every", deserialize_with = "field")]
        hour: String,
        #[serde(default = "every", deserialize_with = "field")]
        day_of_week: String,
        #[serde(default = "every", deserialize_with = "field")]
        day_of_month: String,
        #[serde(default = "every", deserialize_with = "field")]
        month_of_year: String,
    },
    /// Fixed interval specification.
    Timedelta {
        #[serde(default)]
        days: i64,
        #[serde(default)]
        seconds: i64,
        #[serde(default)]
        minutes: i64,
        #[serde(default)]
        hours: i64,
        #[serde(default)]
        weeks: i64,
    },
}

impl Schedule {
    /// A crontab firing every minute.
    pub fn crontab() -> Self {
        Self::Crontab {
            minute: every(),
            hour: every(),
            day_of_week: every(),
            day_of_month: every(),
            month_of_year: every(),
        }
    }

    /// An interval of whole minutes.
    pub fn minutes(minutes: i64) -> Self {
        Self::Timedelta {
            days: 0,
            seconds: 0,
            minutes,
            hours: 0,
            weeks: 0,
        }
    }

    /// An interval of whole seconds.
    pub fn seconds(seconds: i64) -> Self {
        Self::Timedelta {
            days: 0,
            seconds,
            minutes: 0,
            hours: 0,
            weeks: 0,
        }
    }

    fn interval(&self) -> Option<Duration> {
        match self {
            Self::Crontab { .. } => None,
            Self::Timedelta {
                days,
                seconds,
                minutes,
                hours,
                weeks,
            } => Some(
                Duration::weeks(*weeks)
                    + Duration::days(*days)
                    + Duration::hours(*hours)
                    + Duration::minutes(*minutes)
                    + Duration::seconds(*seconds),
            ),
        }
    }

    /// The cron expression equivalent of a crontab schedule, in the
    /// `sec min hour day-of-month month day-of-week` field order.
    fn cron_expr(&self) -> Option<String> {
        match self {
            Self::Crontab {
                minute,
                hour,
                day_of_week,
                day_of_month,
                month_of_year,
            } => Some(format!(
                "0 {minute} {hour} {day_of_month} {month_of_year} {day_of_week}"
            )),
            Self::Timedelta { .. } => None,
        }
    }

    /// Validate the schedule without consulting any clock.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Crontab { .. } => {
                let expr = self.cron_expr().unwrap_or_default();
                cron::Schedule::from_str(&expr)
                    .map(|_| ())
                    .map_err(|e| format!("invalid crontab: {e}"))
            }
            Self::Timedelta { .. } => {
                let interval = self.interval().unwrap_or_else(Duration::zero);
                if interval <= Duration::zero() {
                    Err("interval must be positive".to_string())
                } else {
                    Ok(())
                }
            }
        }
    }

    /// The next fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Crontab { .. } => {
                let expr = self.cron_expr()?;
                let schedule = cron::Schedule::from_str(&expr).ok()?;
                schedule.after(&after).next()
            }
            Self::Timedelta { .. } => Some(after + self.interval()?),
        }
    }

    /// Whether the entry is due at `now`, given when it last ran. An
    /// entry that never ran is due on first consultation.
    pub fn is_due(&self, last_run_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_run_at {
            None => true,
            Some(last) => self.next_after(last).is_some_and(|next| next <= now),
        }
    }
}

/// One durable periodic-schedule entry. `name` is the unique key:
/// writing an entry with an existing name overwrites it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub name: String,
    /// Name of the registered unit of work to fire.
    pub task: String,
    pub schedule: Schedule,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Execution routing metadata. Overwritten with the process's own
    /// default routing target on every write.
    #[serde(default)]
    pub options: Map<String, Value>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_run_count: u64,
}

impl ScheduleEntry {
    pub fn new(
        name: impl Into<String>,
        task: impl Into<String>,
        schedule: Schedule,
    ) -> Self {
        Self {
            name: name.into(),
            task: task.into(),
            schedule,
            args: Vec::new(),
            kwargs: Map::new(),
            options: Map::new(),
            last_run_at: None,
            total_run_count: 0,
        }
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.schedule.is_due(self.last_run_at, now)
    }

    /// Advance the run bookkeeping for one firing.
    pub fn mark_run(&mut self, at: DateTime<Utc>) {
        self.last_run_at = Some(at);
        self.total_run_count += 1;
    }
}
