use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const HISTORY_CAPACITY: usize = 30;
pub const DEFAULT_DAILY_LIMIT_SECS: u64 = 30 * 60;
pub const DEFAULT_REDIRECT_URL: &str = "https://www.youtube.com";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayEntry {
    pub date: NaiveDate,
    pub time_spent_seconds: u64,
}

/// Today's accumulated watch time plus the archive of completed days.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    #[serde(default)]
    pub daily_time_seconds: u64,
    pub last_reset_date: NaiveDate,
    #[serde(default)]
    pub history: Vec<DayEntry>,
    #[serde(default)]
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl UsageRecord {
    pub fn fresh(today: NaiveDate) -> Self {
        Self {
            daily_time_seconds: 0,
            last_reset_date: today,
            history: Vec::new(),
            last_updated_at: None,
        }
    }

    /// Archives the covered day and starts `today` from zero. Returns false
    /// when the record already covers `today` or a later day.
    pub fn roll_forward(&mut self, today: NaiveDate) -> bool {
        if self.last_reset_date >= today {
            return false;
        }
        if self.daily_time_seconds > 0 {
            self.history.push(DayEntry {
                date: self.last_reset_date,
                time_spent_seconds: self.daily_time_seconds,
            });
            if self.history.len() > HISTORY_CAPACITY {
                let overflow = self.history.len() - HISTORY_CAPACITY;
                self.history.drain(..overflow);
            }
        }
        self.daily_time_seconds = 0;
        self.last_reset_date = today;
        true
    }

    /// Adds `seconds` without ever exceeding `limit`; returns the amount
    /// actually added.
    pub fn add_clamped(&mut self, seconds: u64, limit: u64) -> u64 {
        let before = self.daily_time_seconds.min(limit);
        let after = before.saturating_add(seconds).min(limit);
        self.daily_time_seconds = after;
        after - before
    }

    pub fn remaining(&self, limit: u64) -> u64 {
        limit.saturating_sub(self.daily_time_seconds)
    }

    pub fn average_history_seconds(&self) -> Option<u64> {
        if self.history.is_empty() {
            return None;
        }
        let total: u64 = self.history.iter().map(|day| day.time_spent_seconds).sum();
        Some(total / self.history.len() as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_limit")]
    pub daily_limit_seconds: u64,
    #[serde(default = "default_redirect")]
    pub redirect_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            daily_limit_seconds: DEFAULT_DAILY_LIMIT_SECS,
            redirect_url: DEFAULT_REDIRECT_URL.to_string(),
        }
    }
}

impl Settings {
    /// A zero limit is treated as missing.
    pub fn sanitized(mut self) -> Self {
        if self.daily_limit_seconds == 0 {
            self.daily_limit_seconds = DEFAULT_DAILY_LIMIT_SECS;
        }
        if super::validate_redirect(self.redirect_url.trim()).is_err() {
            self.redirect_url = DEFAULT_REDIRECT_URL.to_string();
        }
        self
    }

    pub fn limit_reached(&self, record: &UsageRecord) -> bool {
        record.daily_time_seconds >= self.daily_limit_seconds
    }
}

fn default_limit() -> u64 {
    DEFAULT_DAILY_LIMIT_SECS
}

fn default_redirect() -> String {
    DEFAULT_REDIRECT_URL.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(offset: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap() + chrono::Duration::days(offset)
    }

    #[test]
    fn roll_forward_is_noop_within_same_day() {
        let mut record = UsageRecord::fresh(day(0));
        record.daily_time_seconds = 42;
        assert!(!record.roll_forward(day(0)));
        assert_eq!(record.daily_time_seconds, 42);
        assert!(record.history.is_empty());
    }

    #[test]
    fn roll_forward_archives_previous_day() {
        let mut record = UsageRecord::fresh(day(0));
        record.daily_time_seconds = 42;
        assert!(record.roll_forward(day(1)));
        assert!(!record.roll_forward(day(1)));
        assert_eq!(record.daily_time_seconds, 0);
        assert_eq!(record.last_reset_date, day(1));
        assert_eq!(
            record.history,
            vec![DayEntry {
                date: day(0),
                time_spent_seconds: 42
            }]
        );
    }

    #[test]
    fn empty_days_are_not_archived() {
        let mut record = UsageRecord::fresh(day(0));
        assert!(record.roll_forward(day(3)));
        assert!(record.history.is_empty());
        assert_eq!(record.last_reset_date, day(3));
    }

    #[test]
    fn clock_moving_backwards_does_not_roll() {
        let mut record = UsageRecord::fresh(day(5));
        record.daily_time_seconds = 10;
        assert!(!record.roll_forward(day(4)));
        assert_eq!(record.daily_time_seconds, 10);
    }

    #[test]
    fn history_keeps_thirty_most_recent_days() {
        let mut record = UsageRecord::fresh(day(0));
        for offset in 1..=31 {
            record.daily_time_seconds = offset as u64;
            assert!(record.roll_forward(day(offset)));
        }
        assert_eq!(record.history.len(), HISTORY_CAPACITY);
        assert_eq!(record.history.first().unwrap().date, day(1));
        assert_eq!(record.history.last().unwrap().date, day(30));
        assert!(record.history.iter().all(|entry| entry.date != record.last_reset_date));
    }

    #[test]
    fn add_clamped_never_exceeds_limit() {
        let mut record = UsageRecord::fresh(day(0));
        assert_eq!(record.add_clamped(50, 60), 50);
        assert_eq!(record.add_clamped(50, 60), 10);
        assert_eq!(record.add_clamped(50, 60), 0);
        assert_eq!(record.daily_time_seconds, 60);
        assert_eq!(record.remaining(60), 0);
    }

    #[test]
    fn settings_default_missing_fields() {
        let settings: Settings = serde_json::from_str(r#"{"redirectUrl": ""}"#).unwrap();
        let settings = settings.sanitized();
        assert_eq!(settings.daily_limit_seconds, DEFAULT_DAILY_LIMIT_SECS);
        assert_eq!(settings.redirect_url, DEFAULT_REDIRECT_URL);
    }
}
