//! Environment-driven configuration.
//!
//! Every option is read from a `PACKRAT_`-prefixed environment variable
//! (`.env` files are honored via `dotenv` in the binary). The schema is
//! closed: an unrecognized `PACKRAT_*` variable is a configuration error.
//! No global settings object exists; the resulting [`Config`] value is
//! passed into the orchestrator explicitly.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use chrono_tz::Tz;
use regex::Regex;

use crate::archive::ArchiveOptions;
use crate::error::{Error, Result};
use crate::retention::{RetentionPolicy, TimeBucket};
use crate::storage::S3Config;

const ENV_PREFIX: &str = "PACKRAT_";

const DEFAULT_COMPRESSION_LEVEL: u32 = 9;
const DEFAULT_AWS_REGION: &str = "us-east-1";

/// Every variable the engine recognizes, without the prefix.
const RECOGNIZED_KEYS: [&str; 32] = [
    "NAME",
    "CRON",
    "SOURCES",
    "STORAGE_PATHS",
    "STORAGE_TYPE",
    "ACTION",
    "TZ",
    "COMPRESSION_LEVEL",
    "INCLUDE_REGEX",
    "EXCLUDE_REGEX",
    "STRIP_SOURCE_PATHS",
    "LABEL_TIME_UNITS",
    "RENAME_FILES",
    "MAX_BACKUPS",
    "RETENTION_YEARLY",
    "RETENTION_MONTHLY",
    "RETENTION_WEEKLY",
    "RETENTION_DAILY",
    "RETENTION_HOURLY",
    "RETENTION_MINUTELY",
    "RESTORE_PATH",
    "CLEAN_BEFORE_RESTORE",
    "CHOWN_UID",
    "CHOWN_GID",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_S3_BUCKET_NAME",
    "AWS_S3_BUCKET_PATH",
    "AWS_REGION",
    "AWS_ENDPOINT",
    "LOG_LEVEL",
    "LOG_FILE",
];

/// Which backends a run publishes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Local,
    Aws,
    All,
}

/// What the binary should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Backup,
    Restore,
}

/// All options consumed by the engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backup identity; the leading field of every filename.
    pub name: String,
    pub sources: Vec<PathBuf>,
    pub storage_paths: Vec<PathBuf>,
    pub storage_type: StorageType,
    pub action: Option<Action>,
    /// Zone used for filename timestamps.
    pub tz: Tz,
    pub compression_level: u32,
    pub include_regex: Option<Regex>,
    pub exclude_regex: Option<Regex>,
    pub strip_source_paths: bool,
    pub label_time_units: bool,
    /// Run the rename step after each backup cycle.
    pub rename_files: bool,
    pub max_backups: Option<usize>,
    pub retention_yearly: Option<usize>,
    pub retention_monthly: Option<usize>,
    pub retention_weekly: Option<usize>,
    pub retention_daily: Option<usize>,
    pub retention_hourly: Option<usize>,
    pub retention_minutely: Option<usize>,
    pub restore_path: Option<PathBuf>,
    pub clean_before_restore: bool,
    pub chown_uid: Option<u32>,
    pub chown_gid: Option<u32>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_s3_bucket_name: Option<String>,
    pub aws_s3_bucket_path: Option<String>,
    pub aws_region: String,
    pub aws_endpoint: Option<String>,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub cron: Option<String>,
}

impl Config {
    /// Programmatic constructor with defaults; the binary uses [`Config::from_env`].
    pub fn new(
        name: impl Into<String>,
        sources: Vec<PathBuf>,
        storage_paths: Vec<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            sources,
            storage_paths,
            storage_type: StorageType::Local,
            action: None,
            tz: Tz::UTC,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            include_regex: None,
            exclude_regex: None,
            strip_source_paths: false,
            label_time_units: true,
            rename_files: false,
            max_backups: None,
            retention_yearly: None,
            retention_monthly: None,
            retention_weekly: None,
            retention_daily: None,
            retention_hourly: None,
            retention_minutely: None,
            restore_path: None,
            clean_before_restore: false,
            chown_uid: None,
            chown_gid: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            aws_s3_bucket_name: None,
            aws_s3_bucket_path: None,
            aws_region: DEFAULT_AWS_REGION.to_string(),
            aws_endpoint: None,
            log_level: "info".to_string(),
            log_file: None,
            cron: None,
        }
    }

    /// Load and validate the configuration from the environment.
    pub fn from_env() -> Result<Self> {
        reject_unknown_keys()?;

        let name = require_env("NAME")?;
        let sources = path_list_env("SOURCES");
        let storage_paths = path_list_env("STORAGE_PATHS");

        let storage_type = match env_value("STORAGE_TYPE").as_deref() {
            None | Some("local") => StorageType::Local,
            Some("aws") => StorageType::Aws,
            Some("all") => StorageType::All,
            Some(other) => {
                return Err(Error::Config(format!(
                    "{ENV_PREFIX}STORAGE_TYPE must be one of local, aws, all (got '{other}')"
                )))
            }
        };
        let action = match env_value("ACTION").as_deref() {
            None => None,
            Some("backup") => Some(Action::Backup),
            Some("restore") => Some(Action::Restore),
            Some(other) => {
                return Err(Error::Config(format!(
                    "{ENV_PREFIX}ACTION must be one of backup, restore (got '{other}')"
                )))
            }
        };

        let tz = match env_value("TZ") {
            None => Tz::UTC,
            Some(zone) => zone
                .parse::<Tz>()
                .map_err(|_| Error::Config(format!("unknown time zone: {zone}")))?,
        };

        let config = Self {
            name,
            sources,
            storage_paths,
            storage_type,
            action,
            tz,
            compression_level: parse_env("COMPRESSION_LEVEL")?
                .unwrap_or(DEFAULT_COMPRESSION_LEVEL),
            include_regex: regex_env("INCLUDE_REGEX")?,
            exclude_regex: regex_env("EXCLUDE_REGEX")?,
            strip_source_paths: bool_env("STRIP_SOURCE_PATHS", false)?,
            label_time_units: bool_env("LABEL_TIME_UNITS", true)?,
            rename_files: bool_env("RENAME_FILES", false)?,
            max_backups: parse_env("MAX_BACKUPS")?,
            retention_yearly: parse_env("RETENTION_YEARLY")?,
            retention_monthly: parse_env("RETENTION_MONTHLY")?,
            retention_weekly: parse_env("RETENTION_WEEKLY")?,
            retention_daily: parse_env("RETENTION_DAILY")?,
            retention_hourly: parse_env("RETENTION_HOURLY")?,
            retention_minutely: parse_env("RETENTION_MINUTELY")?,
            restore_path: env_value("RESTORE_PATH").map(PathBuf::from),
            clean_before_restore: bool_env("CLEAN_BEFORE_RESTORE", false)?,
            chown_uid: parse_env("CHOWN_UID")?,
            chown_gid: parse_env("CHOWN_GID")?,
            aws_access_key_id: env_value("AWS_ACCESS_KEY_ID"),
            aws_secret_access_key: env_value("AWS_SECRET_ACCESS_KEY"),
            aws_s3_bucket_name: env_value("AWS_S3_BUCKET_NAME"),
            aws_s3_bucket_path: env_value("AWS_S3_BUCKET_PATH"),
            aws_region: env_value("AWS_REGION").unwrap_or_else(|| DEFAULT_AWS_REGION.to_string()),
            aws_endpoint: env_value("AWS_ENDPOINT"),
            log_level: env_value("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_file: env_value("LOG_FILE").map(PathBuf::from),
            cron: env_value("CRON"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check required options, ranges and cross-option consistency.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("no backup name provided".to_string()));
        }
        if self.sources.is_empty() {
            return Err(Error::Config("no source paths provided".to_string()));
        }
        for source in &self.sources {
            if !source.exists() {
                return Err(Error::Config(format!(
                    "source does not exist: {}",
                    source.display()
                )));
            }
        }
        if !(1..=9).contains(&self.compression_level) {
            return Err(Error::Config(format!(
                "compression level must be between 1 and 9 (got {})",
                self.compression_level
            )));
        }
        if matches!(self.storage_type, StorageType::Local | StorageType::All)
            && self.storage_paths.is_empty()
        {
            return Err(Error::Config("no storage paths provided".to_string()));
        }
        if matches!(self.storage_type, StorageType::Aws | StorageType::All) {
            self.s3_config()?;
        }
        Ok(())
    }

    /// Derive the active retention policy.
    ///
    /// `max_backups` wins whenever it is set, even when per-bucket counts
    /// are also configured; per-bucket counts apply only in its absence.
    pub fn retention_policy(&self) -> RetentionPolicy {
        if let Some(max_backups) = self.max_backups {
            return RetentionPolicy::CountBased(max_backups);
        }

        let counts: BTreeMap<TimeBucket, usize> = [
            (TimeBucket::Yearly, self.retention_yearly),
            (TimeBucket::Monthly, self.retention_monthly),
            (TimeBucket::Weekly, self.retention_weekly),
            (TimeBucket::Daily, self.retention_daily),
            (TimeBucket::Hourly, self.retention_hourly),
            (TimeBucket::Minutely, self.retention_minutely),
        ]
        .into_iter()
        .filter_map(|(bucket, count)| count.map(|count| (bucket, count)))
        .collect();

        if counts.is_empty() {
            RetentionPolicy::KeepAll
        } else {
            RetentionPolicy::TimeBased(counts)
        }
    }

    pub fn archive_options(&self) -> ArchiveOptions {
        ArchiveOptions {
            compression_level: self.compression_level,
            strip_source_paths: self.strip_source_paths,
            include_regex: self.include_regex.clone(),
            exclude_regex: self.exclude_regex.clone(),
        }
    }

    /// The object-store connection settings, or a configuration error when
    /// the credentials are incomplete.
    pub fn s3_config(&self) -> Result<S3Config> {
        match (
            &self.aws_access_key_id,
            &self.aws_secret_access_key,
            &self.aws_s3_bucket_name,
        ) {
            (Some(access_key_id), Some(secret_access_key), Some(bucket)) => Ok(S3Config {
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                bucket: bucket.clone(),
                bucket_path: self.aws_s3_bucket_path.clone(),
                region: self.aws_region.clone(),
                endpoint: self.aws_endpoint.clone(),
            }),
            _ => Err(Error::Config("AWS credentials are not set".to_string())),
        }
    }
}

fn reject_unknown_keys() -> Result<()> {
    for (key, _) in std::env::vars() {
        if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
            if !RECOGNIZED_KEYS.contains(&stripped) {
                return Err(Error::Config(format!("unknown option: {key}")));
            }
        }
    }
    Ok(())
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .filter(|value| !value.is_empty())
}

fn require_env(key: &str) -> Result<String> {
    env_value(key).ok_or_else(|| Error::Config(format!("{ENV_PREFIX}{key} is not set")))
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>> {
    env_value(key)
        .map(|value| {
            value
                .parse::<T>()
                .map_err(|_| Error::Config(format!("{ENV_PREFIX}{key} is not a valid number: {value}")))
        })
        .transpose()
}

fn bool_env(key: &str, default: bool) -> Result<bool> {
    match env_value(key) {
        None => Ok(default),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(Error::Config(format!(
                "{ENV_PREFIX}{key} must be a boolean (got '{value}')"
            ))),
        },
    }
}

fn regex_env(key: &str) -> Result<Option<Regex>> {
    env_value(key)
        .map(|pattern| {
            Regex::new(&pattern)
                .map_err(|e| Error::Config(format!("invalid {ENV_PREFIX}{key}: {e}")))
        })
        .transpose()
}

fn path_list_env(key: &str) -> Vec<PathBuf> {
    env_value(key)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(PathBuf::from)
                .collect()
        })
        .unwrap_or_default()
}
