//! Core settings: backend selection, read-only mode and logging.
//!
//! # Responsibility
//! - Load settings from TOML files and `OBJSTORE_*` environment variables.
//! - Reject inconsistent settings before any backend is opened.
//!
//! # Invariants
//! - Every loader returns validated settings.
//! - A SQLite backend is never selected without `sqlite_path`.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const ENV_PREFIX: &str = "OBJSTORE_";
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Backend technology selected for one of storage, permission or cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Memory,
    Sqlite,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(ConfigError::InvalidValue(format!(
                "unknown backend `{other}`"
            ))),
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Sqlite => write!(f, "sqlite"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// One of `trace`, `debug`, `info`, `warn`, `error`.
    pub level: String,
    /// Absolute directory for rolling log files; stderr when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    /// Forbids schema changes on storage and permission backends.
    pub readonly: bool,
    pub storage_backend: BackendKind,
    pub permission_backend: BackendKind,
    pub cache_backend: BackendKind,
    /// Database file shared by every SQLite backend.
    pub sqlite_path: Option<PathBuf>,
    pub cache_prefix: String,
    /// Default page size; `None` returns whole listings.
    pub paginate_by: Option<usize>,
    /// Tombstones kept per scope by `purge_deleted`.
    pub max_retained_tombstones: Option<usize>,
    pub logging: LoggingSettings,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            readonly: false,
            storage_backend: BackendKind::Memory,
            permission_backend: BackendKind::Memory,
            cache_backend: BackendKind::Memory,
            sqlite_path: None,
            cache_prefix: String::new(),
            paginate_by: None,
            max_retained_tombstones: None,
            logging: LoggingSettings::default(),
        }
    }
}

impl CoreSettings {
    /// Loads defaults overridden by `OBJSTORE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads a TOML file, then applies environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::FileRead(format!("{}: {err}", path.display())))?;
        let mut settings = Self::from_toml_str(&contents)?;
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let settings: Self =
            toml::from_str(contents).map_err(|err| ConfigError::Parse(err.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Applies `OBJSTORE_<KEY>` overrides read through `lookup`.
    ///
    /// Empty values clear optional settings.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(value) = var("READONLY") {
            self.readonly = parse_value("READONLY", &value)?;
        }
        if let Some(value) = var("STORAGE_BACKEND") {
            self.storage_backend = value.parse()?;
        }
        if let Some(value) = var("PERMISSION_BACKEND") {
            self.permission_backend = value.parse()?;
        }
        if let Some(value) = var("CACHE_BACKEND") {
            self.cache_backend = value.parse()?;
        }
        if let Some(value) = var("SQLITE_PATH") {
            self.sqlite_path = non_empty(value).map(PathBuf::from);
        }
        if let Some(value) = var("CACHE_PREFIX") {
            self.cache_prefix = value;
        }
        if let Some(value) = var("PAGINATE_BY") {
            self.paginate_by = non_empty(value)
                .map(|text| parse_value("PAGINATE_BY", &text))
                .transpose()?;
        }
        if let Some(value) = var("MAX_RETAINED_TOMBSTONES") {
            self.max_retained_tombstones = non_empty(value)
                .map(|text| parse_value("MAX_RETAINED_TOMBSTONES", &text))
                .transpose()?;
        }
        if let Some(value) = var("LOG_LEVEL") {
            self.logging.level = value.trim().to_ascii_lowercase();
        }
        if let Some(value) = var("LOG_DIR") {
            self.logging.log_dir = non_empty(value).map(PathBuf::from);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let uses_sqlite = [
            self.storage_backend,
            self.permission_backend,
            self.cache_backend,
        ]
        .contains(&BackendKind::Sqlite);
        if uses_sqlite && self.sqlite_path.is_none() {
            return Err(ConfigError::ValidationFailed(
                "sqlite backend selected but sqlite_path is not set".to_string(),
            ));
        }

        if self.paginate_by == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "paginate_by must be greater than 0".to_string(),
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "invalid log level `{}`",
                self.logging.level
            )));
        }

        if let Some(dir) = &self.logging.log_dir {
            if !dir.is_absolute() {
                return Err(ConfigError::ValidationFailed(format!(
                    "log_dir must be absolute: {}",
                    dir.display()
                )));
            }
        }
        Ok(())
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_value<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse().map_err(|err| {
        ConfigError::InvalidValue(format!("{ENV_PREFIX}{name}=`{value}`: {err}"))
    })
}

/// Settings loading or validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    FileRead(String),
    Parse(String),
    InvalidValue(String),
    ValidationFailed(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FileRead(message) => write!(f, "failed to read settings file: {message}"),
            Self::Parse(message) => write!(f, "failed to parse settings: {message}"),
            Self::InvalidValue(message) => write!(f, "invalid settings value: {message}"),
            Self::ValidationFailed(message) => write!(f, "settings validation failed: {message}"),
        }
    }
}

impl Error for ConfigError {}
