use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

pub const SCHEMA_VERSION_KEY: &str = "schemaVersion";
pub const SCHEMA_VERSION: u64 = 1;

/// Asynchronous JSON key-value store.
///
/// Each `set` entry is an independent upsert; there is no multi-key
/// transaction, so callers that read-modify-write must serialize themselves.
#[derive(Clone)]
pub struct Storage {
    pool: Arc<SqlitePool>,
    path: PathBuf,
}

impl Storage {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let options = SqliteConnectOptions::new()
            .filename(&path_buf)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| "failed to connect to sqlite database")?;

        Ok(Self {
            pool: Arc::new(pool),
            path: path_buf,
        })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to ensure kv_store schema")?;

        let stored = self.get(&[SCHEMA_VERSION_KEY]).await?;
        match stored.get(SCHEMA_VERSION_KEY).and_then(Value::as_u64) {
            Some(version) if version > SCHEMA_VERSION => {
                tracing::warn!(
                    stored = version,
                    supported = SCHEMA_VERSION,
                    "store was written by a newer version; leaving it untouched"
                );
            }
            Some(version) if version == SCHEMA_VERSION => {}
            _ => {
                self.set(vec![(
                    SCHEMA_VERSION_KEY.to_string(),
                    Value::from(SCHEMA_VERSION),
                )])
                .await?;
            }
        }

        Ok(())
    }

    /// Returns the requested keys that are present. Values that are not valid
    /// JSON are skipped so callers fall back to their defaults.
    pub async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?")
                .bind(*key)
                .fetch_optional(&*self.pool)
                .await
                .with_context(|| format!("failed to read key {key}"))?;
            let Some(row) = row else {
                continue;
            };
            let raw: String = row.try_get("value")?;
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) => {
                    found.insert((*key).to_string(), value);
                }
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "ignoring malformed stored value");
                }
            }
        }
        Ok(found)
    }

    pub async fn set(&self, entries: Vec<(String, Value)>) -> Result<()> {
        let updated_at = Utc::now().to_rfc3339();
        for (key, value) in entries {
            sqlx::query(
                r#"
                INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at;
                "#,
            )
            .bind(&key)
            .bind(value.to_string())
            .bind(&updated_at)
            .execute(&*self.pool)
            .await
            .with_context(|| format!("failed to write key {key}"))?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub async fn set_raw(&self, key: &str, raw: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value;
            "#,
        )
        .bind(key)
        .bind(raw)
        .bind(Utc::now().to_rfc3339())
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
