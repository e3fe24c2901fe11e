mod record;

pub use record::{
    DEFAULT_DAILY_LIMIT_SECS, DEFAULT_REDIRECT_URL, DayEntry, HISTORY_CAPACITY, Settings,
    UsageRecord,
};

use crate::{clock::Clock, protocol::Notice, storage::Storage};
use anyhow::{Context, Result, bail};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use url::Url;

pub const USAGE_KEY: &str = "usageRecord";
pub const SETTINGS_KEY: &str = "settings";
const NOTICE_CAPACITY: usize = 64;

/// Result of one `commit_elapsed` read-modify-write cycle.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub committed: u64,
    pub record: UsageRecord,
    pub settings: Settings,
}

impl CommitOutcome {
    pub fn limit_reached(&self) -> bool {
        self.settings.limit_reached(&self.record)
    }
}

/// Typed access to the persisted usage record and settings.
///
/// Reads and writes are plain async get/set calls without locking; the
/// session coordinator is the single writer during live operation.
#[derive(Clone)]
pub struct UsageStore {
    storage: Storage,
    clock: Arc<dyn Clock>,
    notices: broadcast::Sender<Notice>,
}

impl UsageStore {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            storage,
            clock,
            notices,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Today's view of the record. A stale day is rolled forward in the
    /// returned copy only; persisting it is left to the rollover check.
    pub async fn snapshot(&self) -> Result<(UsageRecord, Settings)> {
        let values = self.storage.get(&[USAGE_KEY, SETTINGS_KEY]).await?;
        let (mut record, _) = self.decode_record(values.get(USAGE_KEY));
        record.roll_forward(self.clock.today());
        let settings = decode_settings(values.get(SETTINGS_KEY));
        Ok((record, settings))
    }

    /// Writes `defaults` only when no settings record exists yet.
    pub async fn seed_settings(&self, defaults: Settings) -> Result<bool> {
        let values = self.storage.get(&[SETTINGS_KEY]).await?;
        if values.contains_key(SETTINGS_KEY) {
            return Ok(false);
        }
        let defaults = defaults.sanitized();
        self.storage
            .set(vec![(SETTINGS_KEY.to_string(), serde_json::to_value(&defaults)?)])
            .await?;
        tracing::info!(
            limit = defaults.daily_limit_seconds,
            redirect = %defaults.redirect_url,
            "seeded default settings"
        );
        Ok(true)
    }

    /// Adds `seconds` to today's total, clamped at the daily limit.
    ///
    /// Callers must pass only time they have not committed before.
    pub async fn commit_elapsed(&self, seconds: u64) -> Result<CommitOutcome> {
        let values = self.storage.get(&[USAGE_KEY, SETTINGS_KEY]).await?;
        let (mut record, _) = self.decode_record(values.get(USAGE_KEY));
        let settings = decode_settings(values.get(SETTINGS_KEY));

        let rolled = record.roll_forward(self.clock.today());
        let committed = record.add_clamped(seconds, settings.daily_limit_seconds);
        if committed == 0 && !rolled {
            return Ok(CommitOutcome {
                committed,
                record,
                settings,
            });
        }

        record.last_updated_at = Some(self.clock.now());
        self.write_record(&record).await?;
        if rolled {
            self.publish(Notice::DailyReset);
        }
        self.publish(Notice::StatsUpdated {
            daily_time_seconds: record.daily_time_seconds,
        });
        tracing::debug!(
            committed,
            daily_time = record.daily_time_seconds,
            limit = settings.daily_limit_seconds,
            "committed watch time"
        );

        Ok(CommitOutcome {
            committed,
            record,
            settings,
        })
    }

    /// Archives the previous day if the calendar day changed. Safe to call
    /// redundantly.
    pub async fn rollover_if_new_day(&self) -> Result<bool> {
        let values = self.storage.get(&[USAGE_KEY]).await?;
        let today = self.clock.today();
        let (mut record, present) = self.decode_record(values.get(USAGE_KEY));

        if !present {
            self.write_record(&record).await?;
            tracing::info!(%today, "initialized usage record");
            return Ok(false);
        }

        if !record.roll_forward(today) {
            return Ok(false);
        }

        record.last_updated_at = Some(self.clock.now());
        self.write_record(&record).await?;
        tracing::info!(%today, history = record.history.len(), "new day, usage counter reset");
        self.publish(Notice::DailyReset);
        Ok(true)
    }

    pub async fn update_settings(
        &self,
        daily_limit_seconds: Option<u64>,
        redirect_url: Option<String>,
    ) -> Result<Settings> {
        if daily_limit_seconds == Some(0) {
            bail!("daily limit must be positive");
        }
        if let Some(url) = redirect_url.as_deref() {
            validate_redirect(url.trim())?;
        }

        let values = self.storage.get(&[USAGE_KEY, SETTINGS_KEY]).await?;
        let (mut record, _) = self.decode_record(values.get(USAGE_KEY));
        let mut settings = decode_settings(values.get(SETTINGS_KEY));
        record.roll_forward(self.clock.today());

        if let Some(limit) = daily_limit_seconds {
            settings.daily_limit_seconds = limit;
        }
        if let Some(url) = redirect_url {
            settings.redirect_url = url.trim().to_string();
        }

        let mut entries = vec![(SETTINGS_KEY.to_string(), serde_json::to_value(&settings)?)];
        let clamped = record.daily_time_seconds > settings.daily_limit_seconds;
        if clamped {
            record.daily_time_seconds = settings.daily_limit_seconds;
            record.last_updated_at = Some(self.clock.now());
            entries.push((USAGE_KEY.to_string(), serde_json::to_value(&record)?));
        }
        self.storage.set(entries).await?;

        if clamped {
            self.publish(Notice::StatsUpdated {
                daily_time_seconds: record.daily_time_seconds,
            });
        }
        tracing::info!(
            limit = settings.daily_limit_seconds,
            redirect = %settings.redirect_url,
            "settings updated"
        );
        Ok(settings)
    }

    pub async fn reset_today(&self, clear_history: bool) -> Result<()> {
        let values = self.storage.get(&[USAGE_KEY]).await?;
        let (mut record, _) = self.decode_record(values.get(USAGE_KEY));
        record.daily_time_seconds = 0;
        record.last_reset_date = self.clock.today();
        if clear_history {
            record.history.clear();
        }
        record.last_updated_at = Some(self.clock.now());
        self.write_record(&record).await?;
        tracing::info!(clear_history, "usage counter reset manually");
        self.publish(Notice::DailyReset);
        Ok(())
    }

    async fn write_record(&self, record: &UsageRecord) -> Result<()> {
        self.storage
            .set(vec![(USAGE_KEY.to_string(), serde_json::to_value(record)?)])
            .await
    }

    fn decode_record(&self, value: Option<&Value>) -> (UsageRecord, bool) {
        let Some(value) = value else {
            return (UsageRecord::fresh(self.clock.today()), false);
        };
        match serde_json::from_value::<UsageRecord>(value.clone()) {
            Ok(record) => (record, true),
            Err(err) => {
                tracing::warn!(error = %err, "stored usage record is malformed; using defaults");
                (UsageRecord::fresh(self.clock.today()), true)
            }
        }
    }

    fn publish(&self, notice: Notice) {
        // No subscribers is the normal case when no dashboard is open.
        let _ = self.notices.send(notice);
    }
}

/// Redirect targets must be absolute http(s) URLs with a host.
pub(crate) fn validate_redirect(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("redirect url is not a valid url: {raw}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("redirect url must be an http(s) url: {raw}");
    }
    if url.host_str().is_none_or(str::is_empty) {
        bail!("redirect url has no host: {raw}");
    }
    Ok(url)
}

fn decode_settings(value: Option<&Value>) -> Settings {
    let Some(value) = value else {
        return Settings::default();
    };
    match serde_json::from_value::<Settings>(value.clone()) {
        Ok(settings) => settings.sanitized(),
        Err(err) => {
            tracing::warn!(error = %err, "stored settings are malformed; using defaults");
            Settings::default()
        }
    }
}
