use crate::error::ConfigError;
use serde::Deserialize;
use std::time::Duration;

/// The root configuration structure for the entire application.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseSettings,
    pub locking: LockingSettings,
    pub logging: LoggingSettings,
}

impl Config {
    /// Rejects settings that would leave the pools or the lock refresh task unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let db = &self.database;
        if db.max_pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "database.max_pool_size must be at least 1".to_string(),
            ));
        }
        if db.max_high_priority_pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "database.max_high_priority_pool_size must be at least 1".to_string(),
            ));
        }
        if db.max_high_priority_pool_size > db.max_pool_size {
            return Err(ConfigError::ValidationError(format!(
                "database.max_high_priority_pool_size ({}) may not exceed database.max_pool_size ({})",
                db.max_high_priority_pool_size, db.max_pool_size
            )));
        }
        if self.locking.refresh_period_secs == 0 {
            return Err(ConfigError::ValidationError(
                "locking.refresh_period_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where and how to reach the PostgreSQL database.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// A full connection URL. When set, it wins over the individual parts below.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub username: String,
    pub password: Option<String>,
    /// Size of the standard connection pool.
    pub max_pool_size: u32,
    /// Size of the separate pool reserved for latency-sensitive work.
    pub max_high_priority_pool_size: u32,
    /// Seconds an idle pooled connection is kept before being closed.
    pub max_idle_time_secs: u64,
    /// Seconds to wait for a pooled connection before giving up.
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            name: "wres".to_string(),
            username: "wres".to_string(),
            password: None,
            max_pool_size: 10,
            max_high_priority_pool_size: 5,
            max_idle_time_secs: 30,
            acquire_timeout_secs: 5,
        }
    }
}

impl DatabaseSettings {
    /// Builds the connection URL, preferring an explicit `url`.
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        match &self.password {
            Some(password) => format!(
                "postgres://{}:{}@{}:{}/{}",
                self.username, password, self.host, self.port, self.name
            ),
            None => format!(
                "postgres://{}@{}:{}/{}",
                self.username, self.host, self.port, self.name
            ),
        }
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_idle_time_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Timing of the advisory lock manager's connection monitor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockingSettings {
    /// How often the two lock connections are checked and repaired.
    pub refresh_period_secs: u64,
    /// Timeout for a single connection validity check.
    pub validity_timeout_secs: u64,
    /// Extra attempts made when re-acquiring a lock on a replacement connection.
    pub reacquire_retries: u32,
    /// Pause between those attempts.
    pub reacquire_delay_millis: u64,
}

impl Default for LockingSettings {
    fn default() -> Self {
        Self {
            refresh_period_secs: 5,
            validity_timeout_secs: 1,
            reacquire_retries: 5,
            reacquire_delay_millis: 5,
        }
    }
}

impl LockingSettings {
    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs(self.refresh_period_secs)
    }

    pub fn validity_timeout(&self) -> Duration {
        Duration::from_secs(self.validity_timeout_secs)
    }

    pub fn reacquire_delay(&self) -> Duration {
        Duration::from_millis(self.reacquire_delay_millis)
    }
}

/// Optional file logging in addition to stderr.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Directory for daily rolling log files. Stderr only when absent.
    pub directory: Option<String>,
    pub file_prefix: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            directory: None,
            file_prefix: "hydrostore.log".to_string(),
        }
    }
}
