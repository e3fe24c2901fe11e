use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(skip)]
    pub log_file: Option<PathBuf>,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            Self::from_file(path)?
        } else {
            let default_path = PathBuf::from("shorts-budget.toml");
            if default_path.exists() {
                Self::from_file(&default_path)?
            } else {
                Self::default()
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| "failed to parse configuration TOML")?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = env::var("SHORTS_BUDGET_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Ok(db_path) = env::var("SHORTS_BUDGET_DB_PATH") {
            self.storage.database_path = PathBuf::from(db_path);
        }
        if let Ok(log_path) = env::var("SHORTS_BUDGET_LOG_FILE") {
            self.log_file = Some(PathBuf::from(log_path));
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| PathBuf::from("shorts-budget.log"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_rollover_check")]
    pub rollover_check_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            rollover_check_secs: default_rollover_check(),
        }
    }
}

/// Values seeded into the persisted settings record on first start.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_daily_limit")]
    pub default_daily_limit_secs: u64,
    #[serde(default = "default_redirect_url")]
    pub default_redirect_url: String,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_daily_limit_secs: default_daily_limit(),
            default_redirect_url: default_redirect_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_reinject_settle")]
    pub reinject_settle_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay(),
            reinject_settle_ms: default_reinject_settle(),
        }
    }
}

impl DeliveryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn reinject_settle(&self) -> Duration {
        Duration::from_millis(self.reinject_settle_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_refresh_hz")]
    pub refresh_hz: u64,
    #[serde(default = "default_history_days")]
    pub history_days: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            refresh_hz: default_refresh_hz(),
            history_days: default_history_days(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8797".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("shorts-budget.db")
}

fn default_rollover_check() -> u64 {
    60
}

fn default_daily_limit() -> u64 {
    30 * 60
}

fn default_redirect_url() -> String {
    "https://www.youtube.com".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    500
}

fn default_reinject_settle() -> u64 {
    1000
}

fn default_refresh_hz() -> u64 {
    4
}

fn default_history_days() -> usize {
    7
}
