//! Configuration for the chat server and client.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Port used by both roles when none is given.
pub const DEFAULT_PORT: u16 = 20160;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "chat")]
#[command(author = "broadcast-chat authors")]
#[command(version = "0.1.0")]
#[command(about = "Broadcast chat over a length-prefixed TCP protocol", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub role: RoleArgs,
}

/// Which side of the chat to run
#[derive(Subcommand, Debug)]
pub enum RoleArgs {
    /// Accept clients and relay every message to all other clients
    Server {
        /// Port to listen on
        port: Option<u16>,

        /// Address to bind to (e.g., 0.0.0.0)
        #[arg(short = 'l', long)]
        listen: Option<String>,

        /// Maximum number of concurrent clients
        #[arg(short = 'm', long)]
        max_clients: Option<usize>,

        /// Seconds without any activity before the server exits (0 = never)
        #[arg(short = 't', long)]
        idle_timeout: Option<u64>,
    },
    /// Connect to a server, send stdin lines and print relayed messages
    Client {
        /// Server host name or address
        host: String,

        /// Server port
        port: Option<u16>,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_clients: default_max_clients(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            port: default_port(),
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_clients() -> usize {
    20
}

fn default_idle_timeout() -> u64 {
    180 // 3 minutes
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_clients: usize,
    /// `None` disables the idle timeout.
    pub idle_timeout: Option<Duration>,
}

/// Resolved client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
}

/// Role selected on the command line
#[derive(Debug, Clone)]
pub enum Role {
    Server(ServerConfig),
    Client(ClientConfig),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        // Port 0 on the command line means "use the configured port"
        let role = match cli.role {
            RoleArgs::Server {
                port,
                listen,
                max_clients,
                idle_timeout,
            } => {
                let server = toml_config.server;
                let idle_secs = idle_timeout.unwrap_or(server.idle_timeout_secs);
                Role::Server(ServerConfig {
                    host: listen.unwrap_or(server.host),
                    port: port.filter(|p| *p > 0).unwrap_or(server.port),
                    max_clients: max_clients.unwrap_or(server.max_clients),
                    idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
                })
            }
            RoleArgs::Client { host, port } => Role::Client(ClientConfig {
                host,
                port: port.filter(|p| *p > 0).unwrap_or(toml_config.client.port),
            }),
        };

        Ok(Config {
            role,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
}
