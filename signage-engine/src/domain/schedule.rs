//! Schedules: time window + day mask + priority selecting a playlist.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use super::playlist::Playlist;

/// A rule selecting an active playlist.
///
/// Windows whose end is before their start wrap past midnight (22:00 - 02:00); the
/// portion after midnight belongs to the day the window started on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Window start, `HH:MM` or `HH:MM:SS` local time.
    #[serde(alias = "start_time")]
    pub start_time: String,
    /// Window end, `HH:MM` or `HH:MM:SS` local time.
    #[serde(alias = "end_time")]
    pub end_time: String,
    #[serde(alias = "start_date", default)]
    pub start_date: Option<NaiveDate>,
    #[serde(alias = "end_date", default)]
    pub end_date: Option<NaiveDate>,
    /// Active days, 0 = Sunday through 6 = Saturday. Empty means every day.
    #[serde(alias = "days_of_week", default)]
    pub days_of_week: Vec<u8>,
    #[serde(default)]
    pub priority: i32,
    #[serde(alias = "playlist_id", default)]
    pub playlist_id: Option<String>,
    #[serde(default)]
    pub playlist: Option<Playlist>,
    #[serde(alias = "is_active", default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl Schedule {
    /// Whether this schedule selects content at the given local time.
    pub fn is_active_at(&self, now: NaiveDateTime) -> bool {
        if !self.is_active {
            return false;
        }

        let (Some(start), Some(end)) = (parse_time(&self.start_time), parse_time(&self.end_time))
        else {
            return false;
        };

        let today = now.date();
        let time = now.time();

        if start <= end {
            return self.day_allowed(today) && time >= start && time <= end;
        }

        // Overnight window: either the evening part of today or the early-morning
        // tail of a window that started yesterday.
        if time >= start {
            return self.day_allowed(today);
        }
        if time <= end {
            return today.pred_opt().is_some_and(|yesterday| self.day_allowed(yesterday));
        }
        false
    }

    /// Whether the schedule could be active at some point on `date`.
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        self.is_active && self.day_allowed(date)
    }

    fn day_allowed(&self, date: NaiveDate) -> bool {
        if let Some(start) = self.start_date
            && date < start
        {
            return false;
        }
        if let Some(end) = self.end_date
            && date > end
        {
            return false;
        }
        if self.days_of_week.is_empty() {
            return true;
        }
        let index = weekday_index(date.weekday());
        self.days_of_week.contains(&index)
    }
}

/// Pick the highest-priority schedule active at `now` (first one wins on ties).
pub fn resolve_active(schedules: &[Schedule], now: NaiveDateTime) -> Option<&Schedule> {
    schedules
        .iter()
        .filter(|s| s.is_active_at(now))
        .fold(None, |best: Option<&Schedule>, s| match best {
            Some(b) if b.priority >= s.priority => Some(b),
            _ => Some(s),
        })
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

fn weekday_index(weekday: Weekday) -> u8 {
    weekday.num_days_from_sunday() as u8
}
