use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

pub(crate) const DEFAULT_SOAK_THREADS: usize = 8;
pub(crate) const DEFAULT_SOAK_KEYS: usize = 256;
pub(crate) const DEFAULT_SOAK_TOKENS: usize = 16;
pub(crate) const DEFAULT_SOAK_ROUNDS: usize = 10_000;
pub(crate) const DEFAULT_SOAK_LOCK_TIMEOUT_MS: u64 = 50;

/// Command-line arguments for the cachegraph binary.
#[derive(Debug, Parser)]
#[command(name = "cachegraph", version, about = "Dependency-aware cache engine")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "CACHEGRAPH_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Drive the engine from many threads and verify its invariants afterwards.
    Soak(SoakArgs),
}

#[derive(Debug, Args, Clone)]
pub struct SoakArgs {
    #[command(flatten)]
    pub overrides: SoakOverrides,

    /// Worker threads issuing operations.
    #[arg(long, default_value_t = DEFAULT_SOAK_THREADS)]
    pub threads: usize,

    /// Distinct cache keys the workers touch.
    #[arg(long, default_value_t = DEFAULT_SOAK_KEYS)]
    pub keys: usize,

    /// Distinct dependency tokens the workers declare and invalidate.
    #[arg(long, default_value_t = DEFAULT_SOAK_TOKENS)]
    pub tokens: usize,

    /// Operations per worker.
    #[arg(long, default_value_t = DEFAULT_SOAK_ROUNDS)]
    pub rounds: usize,

    /// How long a worker waits for a named lock before giving up.
    #[arg(long = "lock-timeout-ms", default_value_t = DEFAULT_SOAK_LOCK_TIMEOUT_MS)]
    pub lock_timeout_ms: u64,
}

impl Default for SoakArgs {
    fn default() -> Self {
        Self {
            overrides: SoakOverrides::default(),
            threads: DEFAULT_SOAK_THREADS,
            keys: DEFAULT_SOAK_KEYS,
            tokens: DEFAULT_SOAK_TOKENS,
            rounds: DEFAULT_SOAK_ROUNDS,
            lock_timeout_ms: DEFAULT_SOAK_LOCK_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct SoakOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the store capacity.
    #[arg(long = "cache-capacity", value_name = "ENTRIES")]
    pub cache_capacity: Option<usize>,

    /// Override the number of store shards.
    #[arg(long = "cache-shards", value_name = "COUNT")]
    pub cache_shards: Option<usize>,
}
