//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroUsize, str::FromStr};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::MIN_FOLDED_KEY_LEN;

mod cli;

pub use cli::{CliArgs, Command, SoakArgs, SoakOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "cachegraph";
const ENV_PREFIX: &str = "CACHEGRAPH";
const DEFAULT_CACHE_CAPACITY: usize = 10_000;
const DEFAULT_CACHE_SHARDS: usize = 16;
const DEFAULT_EVENT_CAPACITY: usize = 1024;
const DEFAULT_MAX_KEY_LEN: usize = 250;
const MAX_CACHE_SHARDS: usize = 1024;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub capacity: NonZeroUsize,
    pub shards: NonZeroUsize,
    pub event_capacity: NonZeroUsize,
    /// Zero disables key folding.
    pub max_key_len: usize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Soak(args)) => raw.apply_soak_overrides(&args.overrides),
        None => raw.apply_soak_overrides(&SoakOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_soak_overrides(&mut self, overrides: &SoakOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(capacity) = overrides.cache_capacity {
            self.cache.capacity = Some(capacity);
        }
        if let Some(shards) = overrides.cache_shards {
            self.cache.shards = Some(shards);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, cache } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self { logging, cache })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let capacity = non_zero(
        cache.capacity.unwrap_or(DEFAULT_CACHE_CAPACITY),
        "cache.capacity",
    )?;
    let shards = non_zero(cache.shards.unwrap_or(DEFAULT_CACHE_SHARDS), "cache.shards")?;
    if shards.get() > MAX_CACHE_SHARDS {
        return Err(LoadError::invalid(
            "cache.shards",
            format!("must not exceed {MAX_CACHE_SHARDS}"),
        ));
    }
    let event_capacity = non_zero(
        cache.event_capacity.unwrap_or(DEFAULT_EVENT_CAPACITY),
        "cache.event_capacity",
    )?;

    let max_key_len = cache.max_key_len.unwrap_or(DEFAULT_MAX_KEY_LEN);
    if max_key_len != 0 && max_key_len < MIN_FOLDED_KEY_LEN {
        return Err(LoadError::invalid(
            "cache.max_key_len",
            format!("must be 0 or at least {MIN_FOLDED_KEY_LEN}"),
        ));
    }

    Ok(CacheSettings {
        capacity,
        shards,
        event_capacity,
        max_key_len,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    capacity: Option<usize>,
    shards: Option<usize>,
    event_capacity: Option<usize>,
    max_key_len: Option<usize>,
}

fn non_zero(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
