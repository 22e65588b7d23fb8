use crate::error::{Error, Result};
use crate::record::LogLevel;
use crate::store::{JournalMode, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Version stamped into the default store file name. Bump it when the
/// table layout changes; old files are simply left behind.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub housekeeping: HousekeepingConfig,
    pub minimum_level: LogLevel,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub folder: PathBuf,
    pub file_name: String,
    pub journal_mode: JournalMode,
    pub busy_timeout_ms: u64,
    pub transaction_behavior: TransactionBehavior,
    pub max_retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            folder: PathBuf::from("logs"),
            file_name: format!("logs_v{}.db", SCHEMA_VERSION),
            journal_mode: JournalMode::Wal,
            busy_timeout_ms: 5_000,
            transaction_behavior: TransactionBehavior::Immediate,
            max_retry_attempts: 3,
            retry_backoff_ms: 100,
        }
    }
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.folder.join(&self.file_name)
    }

    /// Point the storage section at an explicit file.
    pub fn at(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        Self {
            folder: path.parent().map(Path::to_path_buf).unwrap_or_default(),
            file_name: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Records per insert transaction.
    pub batch_size: usize,
    /// Records held in memory before new ones are discarded.
    pub max_cache_size: usize,
    pub flush_interval_ms: u64,
    pub dispose_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_cache_size: 10_000,
            flush_interval_ms: 1_000,
            dispose_timeout_ms: 5_000,
        }
    }
}

impl CacheConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn dispose_timeout(&self) -> Duration {
        Duration::from_millis(self.dispose_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HousekeepingMode {
    /// A background timer deletes expired records every `interval_secs`.
    Automatic,
    /// Cleanup only runs when the caller asks for it.
    Manual,
}

/// Longest accepted retention window, in days (about ten thousand years).
const MAX_RETENTION_DAYS: i64 = 3_652_500;

/// Upper bound for `housekeeping.retention_hours`.
pub const MAX_RETENTION_HOURS: u64 = MAX_RETENTION_DAYS as u64 * 24;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HousekeepingConfig {
    pub mode: HousekeepingMode,
    pub retention_hours: u64,
    pub interval_secs: u64,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            mode: HousekeepingMode::Automatic,
            retention_hours: 24 * 7,
            interval_secs: 3600,
        }
    }
}

impl HousekeepingConfig {
    /// Retention window. Values above [`MAX_RETENTION_HOURS`] are clamped.
    pub fn retention(&self) -> chrono::Duration {
        i64::try_from(self.retention_hours.min(MAX_RETENTION_HOURS))
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or_else(|| chrono::Duration::days(MAX_RETENTION_DAYS))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Load configuration from a file (any format the `config` crate knows),
/// then apply `LOGSTORE__SECTION__KEY` environment overrides.
pub fn load_config(path: impl AsRef<Path>) -> Result<LoggerConfig> {
    let path = path.as_ref().to_string_lossy().into_owned();
    let config = config::Config::builder()
        .add_source(config::File::with_name(&path).required(false))
        .add_source(config::Environment::with_prefix("LOGSTORE").separator("__"))
        .build()?;

    let cfg: LoggerConfig = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &LoggerConfig) -> Result<()> {
    if cfg.storage.file_name.trim().is_empty() {
        return Err(Error::InvalidConfig("storage.file_name cannot be empty".into()));
    }

    if cfg.storage.max_retry_attempts == 0 {
        return Err(Error::InvalidConfig(
            "storage.max_retry_attempts must be at least 1".into(),
        ));
    }

    if cfg.cache.batch_size == 0 {
        return Err(Error::InvalidConfig("cache.batch_size must be at least 1".into()));
    }

    if cfg.cache.max_cache_size == 0 {
        return Err(Error::InvalidConfig(
            "cache.max_cache_size must be at least 1".into(),
        ));
    }

    if cfg.housekeeping.retention_hours == 0 {
        return Err(Error::InvalidConfig(
            "housekeeping.retention_hours must be at least 1".into(),
        ));
    }

    if cfg.housekeeping.retention_hours > MAX_RETENTION_HOURS {
        return Err(Error::InvalidConfig(format!(
            "housekeeping.retention_hours must be at most {}",
            MAX_RETENTION_HOURS
        )));
    }

    if cfg.housekeeping.mode == HousekeepingMode::Automatic && cfg.housekeeping.interval_secs == 0 {
        return Err(Error::InvalidConfig(
            "housekeeping.interval_secs must be at least 1 in automatic mode".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_file_name_is_versioned() {
        let cfg = LoggerConfig::default();
        assert_eq!(cfg.storage.file_name, "logs_v1.db");
        assert_eq!(cfg.storage.database_path(), PathBuf::from("logs/logs_v1.db"));
        assert!(validate_config(&cfg).is_ok());
    }

    #[test]
    fn test_validate_config_rejects_zero_sizes() {
        let mut cfg = LoggerConfig::default();
        cfg.cache.batch_size = 0;
        let result = validate_config(&cfg);
        assert!(result.unwrap_err().to_string().contains("batch_size"));

        let mut cfg = LoggerConfig::default();
        cfg.cache.max_cache_size = 0;
        assert!(validate_config(&cfg).is_err());

        let mut cfg = LoggerConfig::default();
        cfg.storage.max_retry_attempts = 0;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_validate_config_rejects_huge_retention() {
        let mut cfg = LoggerConfig::default();
        cfg.housekeeping.retention_hours = MAX_RETENTION_HOURS;
        assert!(validate_config(&cfg).is_ok());

        cfg.housekeeping.retention_hours = MAX_RETENTION_HOURS + 1;
        let result = validate_config(&cfg);
        assert!(result.unwrap_err().to_string().contains("retention_hours"));

        cfg.housekeeping.retention_hours = u64::MAX;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_retention_never_wraps_negative() {
        let mut cfg = HousekeepingConfig::default();
        assert_eq!(cfg.retention(), chrono::Duration::hours(24 * 7));

        cfg.retention_hours = u64::MAX;
        assert_eq!(cfg.retention(), chrono::Duration::hours(MAX_RETENTION_HOURS as i64));
        assert!(cfg.retention() > chrono::Duration::zero());

        cfg.retention_hours = i64::MAX as u64 + 1;
        assert!(cfg.retention() > chrono::Duration::zero());
    }

    #[test]
    fn test_manual_mode_allows_zero_interval() {
        let mut cfg = LoggerConfig::default();
        cfg.housekeeping.mode = HousekeepingMode::Manual;
        cfg.housekeeping.interval_secs = 0;
        assert!(validate_config(&cfg).is_ok());
    }

    #[test]
    fn test_storage_at_splits_path() {
        let storage = StorageConfig::at("/var/log/app/events_v2.db");
        assert_eq!(storage.folder, PathBuf::from("/var/log/app"));
        assert_eq!(storage.file_name, "events_v2.db");
    }

    #[test]
    fn test_load_config_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logstore.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
minimum_level = "warning"

[cache]
batch_size = 25

[housekeeping]
mode = "manual"
retention_hours = 48
"#
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.minimum_level, LogLevel::Warning);
        assert_eq!(cfg.cache.batch_size, 25);
        assert_eq!(cfg.cache.max_cache_size, 10_000);
        assert_eq!(cfg.housekeeping.mode, HousekeepingMode::Manual);
        assert_eq!(cfg.housekeeping.retention(), chrono::Duration::hours(48));
    }
}
