//! Configuration module for the chatbench harness.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. The resolved
//! [`Config`] is passed by value into the pool, servers, and harness —
//! nothing reads configuration from ambient global state.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Concurrency strategy under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Single control loop, one connection at a time.
    Iterative,
    /// One worker task per connection under a concurrency cap.
    Threading,
    /// One OS process per connection.
    Forking,
}

impl Strategy {
    /// Label used in result artifacts and default file names.
    pub fn label(self) -> &'static str {
        match self {
            Strategy::Iterative => "iterative",
            Strategy::Threading => "threading",
            Strategy::Forking => "forking",
        }
    }
}

/// Command-line arguments for the harness
#[derive(Parser, Debug)]
#[command(name = "chatbench")]
#[command(author = "chatbench authors")]
#[command(version = "0.1.0")]
#[command(about = "A chat-server benchmarking harness comparing concurrency strategies", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Concurrency strategy to benchmark
    #[arg(short, long, value_enum)]
    pub strategy: Option<Strategy>,

    /// Number of logical servers in the pool
    #[arg(long)]
    pub servers: Option<usize>,

    /// Number of simulated clients to drive
    #[arg(long)]
    pub clients: Option<usize>,

    /// Maximum simultaneous sessions per server
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Seconds a queued client may wait before being marked lost
    #[arg(long)]
    pub max_wait: Option<u64>,

    /// Simulation duration cap in seconds
    #[arg(short, long)]
    pub duration: Option<u64>,

    /// Host the servers bind on
    #[arg(long)]
    pub host: Option<String>,

    /// First server port; server i listens on base_port + i
    #[arg(short = 'p', long)]
    pub base_port: Option<u16>,

    /// Where to write the result artifact
    #[arg(long)]
    pub results_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    // The forking strategy re-execs this binary once per connection with the
    // flags below; they are not part of the user-facing surface.
    #[arg(long, hide = true)]
    pub child_fd: Option<i32>,

    #[arg(long, hide = true)]
    pub child_server: Option<String>,

    #[arg(long, hide = true)]
    pub child_client: Option<String>,

    #[arg(long, hide = true)]
    pub child_read_timeout: Option<u64>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-pool configuration
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    /// Number of logical servers
    #[serde(default = "default_num_servers")]
    pub num_servers: usize,
    /// Host to bind on
    #[serde(default = "default_host")]
    pub host: String,
    /// First server port
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Maximum simultaneous sessions per server
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Admission queue depth; 0 means unbounded
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Seconds a queued client may wait before eviction
    #[serde(default = "default_max_wait_seconds")]
    pub max_wait_seconds: u64,
    /// Per-read/write timeout inside a session
    #[serde(default = "default_read_timeout_seconds")]
    pub read_timeout_seconds: u64,
    /// Grace period before an unresponsive child process is killed
    #[serde(default = "default_child_grace_seconds")]
    pub child_grace_seconds: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_servers: default_num_servers(),
            host: default_host(),
            base_port: default_base_port(),
            max_concurrency: default_max_concurrency(),
            queue_depth: default_queue_depth(),
            max_wait_seconds: default_max_wait_seconds(),
            read_timeout_seconds: default_read_timeout_seconds(),
            child_grace_seconds: default_child_grace_seconds(),
        }
    }
}

/// Simulation-drive configuration
#[derive(Debug, Deserialize)]
pub struct SimulationConfig {
    /// Strategy to benchmark
    pub strategy: Option<Strategy>,
    /// Number of virtual clients
    #[serde(default = "default_num_clients")]
    pub clients: usize,
    /// Duration cap in seconds
    #[serde(default = "default_duration_seconds")]
    pub duration_seconds: u64,
    /// Chat messages each client sends before rating
    #[serde(default = "default_messages_per_client")]
    pub messages_per_client: usize,
    /// Pause between client batches during ramp-up
    #[serde(default = "default_client_spacing_ms")]
    pub client_spacing_ms: u64,
    /// Fixed rating for reproducible runs; random 1..=5 when absent
    pub fixed_rating: Option<u8>,
    /// Result artifact path override
    pub results_file: Option<PathBuf>,
    /// Live metrics file path override
    pub live_file: Option<PathBuf>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            strategy: None,
            clients: default_num_clients(),
            duration_seconds: default_duration_seconds(),
            messages_per_client: default_messages_per_client(),
            client_spacing_ms: default_client_spacing_ms(),
            fixed_rating: None,
            results_file: None,
            live_file: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_num_servers() -> usize {
    3
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_base_port() -> u16 {
    8000
}

fn default_max_concurrency() -> usize {
    5
}

fn default_queue_depth() -> usize {
    1024
}

fn default_max_wait_seconds() -> u64 {
    300
}

fn default_read_timeout_seconds() -> u64 {
    5
}

fn default_child_grace_seconds() -> u64 {
    5
}

fn default_num_clients() -> usize {
    100
}

fn default_duration_seconds() -> u64 {
    60
}

fn default_messages_per_client() -> usize {
    5
}

fn default_client_spacing_ms() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub strategy: Strategy,
    pub num_servers: usize,
    pub num_clients: usize,
    pub max_concurrency: usize,
    pub max_wait_seconds: u64,
    pub read_timeout_seconds: u64,
    pub child_grace_seconds: u64,
    pub duration_seconds: u64,
    pub host: String,
    pub base_port: u16,
    pub queue_depth: usize,
    pub messages_per_client: usize,
    pub client_spacing_ms: u64,
    pub fixed_rating: Option<u8>,
    pub results_file: Option<PathBuf>,
    pub live_file: Option<PathBuf>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            strategy: Strategy::Threading,
            num_servers: default_num_servers(),
            num_clients: default_num_clients(),
            max_concurrency: default_max_concurrency(),
            max_wait_seconds: default_max_wait_seconds(),
            read_timeout_seconds: default_read_timeout_seconds(),
            child_grace_seconds: default_child_grace_seconds(),
            duration_seconds: default_duration_seconds(),
            host: default_host(),
            base_port: default_base_port(),
            queue_depth: default_queue_depth(),
            messages_per_client: default_messages_per_client(),
            client_spacing_ms: default_client_spacing_ms(),
            fixed_rating: None,
            results_file: None,
            live_file: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Resolve configuration from parsed CLI args and the optional TOML
    /// file they point at. CLI arguments take precedence.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    fn merge(cli: CliArgs, file: TomlConfig) -> Self {
        Config {
            strategy: cli
                .strategy
                .or(file.simulation.strategy)
                .unwrap_or(Strategy::Threading),
            num_servers: cli.servers.unwrap_or(file.pool.num_servers),
            num_clients: cli.clients.unwrap_or(file.simulation.clients),
            max_concurrency: cli.max_concurrency.unwrap_or(file.pool.max_concurrency),
            max_wait_seconds: cli.max_wait.unwrap_or(file.pool.max_wait_seconds),
            read_timeout_seconds: file.pool.read_timeout_seconds,
            child_grace_seconds: file.pool.child_grace_seconds,
            duration_seconds: cli.duration.unwrap_or(file.simulation.duration_seconds),
            host: cli.host.unwrap_or(file.pool.host),
            base_port: cli.base_port.unwrap_or(file.pool.base_port),
            queue_depth: file.pool.queue_depth,
            messages_per_client: file.simulation.messages_per_client,
            client_spacing_ms: file.simulation.client_spacing_ms,
            fixed_rating: file.simulation.fixed_rating,
            results_file: cli.results_file.or(file.simulation.results_file),
            live_file: file.simulation.live_file,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                file.logging.level
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_servers == 0 {
            return Err(ConfigError::Invalid("num_servers must be positive".into()));
        }
        if self.num_clients == 0 {
            return Err(ConfigError::Invalid("num_clients must be positive".into()));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrency must be positive".into(),
            ));
        }
        if self.duration_seconds == 0 {
            return Err(ConfigError::Invalid("duration must be positive".into()));
        }
        if let Some(rating) = self.fixed_rating {
            if !(1..=5).contains(&rating) {
                return Err(ConfigError::Invalid(
                    "fixed_rating must be between 1 and 5".into(),
                ));
            }
        }
        Ok(())
    }

    /// Display name of server `index`: `Server_A`, `Server_B`, ...
    pub fn server_name(index: usize) -> String {
        match u8::try_from(index) {
            Ok(i) if i < 26 => format!("Server_{}", (b'A' + i) as char),
            _ => format!("Server_{}", index + 1),
        }
    }

    /// Port for server `index`. A base port of 0 lets every server pick its
    /// own ephemeral port instead of colliding on low port numbers.
    pub fn port_for(&self, index: usize) -> u16 {
        if self.base_port == 0 {
            0
        } else {
            self.base_port.wrapping_add(index as u16)
        }
    }

    /// Queue depth as an optional bound; 0 configures the unbounded
    /// reference behavior.
    pub fn queue_bound(&self) -> Option<usize> {
        (self.queue_depth > 0).then_some(self.queue_depth)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_seconds)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds)
    }

    pub fn child_grace(&self) -> Duration {
        Duration::from_secs(self.child_grace_seconds)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_seconds)
    }

    pub fn client_spacing(&self) -> Duration {
        Duration::from_millis(self.client_spacing_ms)
    }

    pub fn results_path(&self) -> PathBuf {
        self.results_file.clone().unwrap_or_else(|| {
            PathBuf::from(format!("{}_simulation_results.json", self.strategy.label()))
        })
    }

    pub fn live_path(&self) -> PathBuf {
        self.live_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("live_{}_metrics.json", self.strategy.label())))
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(reason) => {
                write!(f, "Invalid configuration: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
