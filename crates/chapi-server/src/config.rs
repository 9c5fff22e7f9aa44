//! Server configuration: TOML file + CLI overrides.

use chapi_core::{ChapiError, ChapiResult, Charset};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub channel: ChannelSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds a request may stay suspended; 0 disables the timeout.
    #[serde(default = "default_suspend_timeout")]
    pub suspend_timeout: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Path prefixes whose requests are held open.
    #[serde(default = "default_suspend_paths")]
    pub suspend_paths: Vec<String>,
    #[serde(default = "default_charset")]
    pub charset: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            suspend_timeout: default_suspend_timeout(),
            max_connections: default_max_connections(),
            suspend_paths: default_suspend_paths(),
            charset: default_charset(),
        }
    }
}

/// `[channel]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelSection {
    #[serde(default = "default_token_ttl")]
    pub token_ttl: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            token_ttl: default_token_ttl(),
            queue_capacity: default_queue_capacity(),
            max_channels: default_max_channels(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_suspend_timeout() -> u64 {
    300
}
fn default_max_connections() -> usize {
    10_000
}
fn default_suspend_paths() -> Vec<String> {
    vec!["/".to_string()]
}
fn default_charset() -> String {
    "utf-8".to_string()
}
fn default_token_ttl() -> u64 {
    7200
}
fn default_queue_capacity() -> usize {
    256
}
fn default_max_channels() -> usize {
    10_000
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub suspend_timeout: Option<u64>,
    pub max_connections: Option<usize>,
    pub charset: Option<String>,
}

/// Resolved server configuration (CLI overrides applied, values validated).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub suspend_timeout: Option<Duration>,
    pub max_connections: usize,
    pub suspend_paths: Vec<String>,
    pub charset: Charset,
    pub token_ttl: u64,
    pub queue_capacity: usize,
    pub max_channels: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let server = ServerSection::default();
        let channel = ChannelSection::default();
        Self {
            host: server.host,
            port: server.port,
            suspend_timeout: Some(Duration::from_secs(server.suspend_timeout)),
            max_connections: server.max_connections,
            suspend_paths: server.suspend_paths,
            charset: Charset::default(),
            token_ttl: channel.token_ttl,
            queue_capacity: channel.queue_capacity,
            max_channels: channel.max_channels,
        }
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> ChapiResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, cli)
    }

    /// Parse TOML config text.
    pub fn parse(content: &str) -> ChapiResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| ChapiError::Config(format!("config parse error: {e}")))
    }

    fn resolve(file: ConfigFile, cli: CliOverrides) -> ChapiResult<Self> {
        let charset: Charset = cli
            .charset
            .as_deref()
            .unwrap_or(&file.server.charset)
            .parse()?;

        let suspend_timeout = cli.suspend_timeout.unwrap_or(file.server.suspend_timeout);
        let max_connections = cli.max_connections.unwrap_or(file.server.max_connections);
        if max_connections == 0 {
            return Err(ChapiError::Config("max_connections must be positive".into()));
        }
        if file.channel.queue_capacity == 0 {
            return Err(ChapiError::Config("channel.queue_capacity must be positive".into()));
        }
        if file.server.suspend_paths.iter().any(|p| !p.starts_with('/')) {
            return Err(ChapiError::Config("suspend_paths must start with '/'".into()));
        }

        Ok(Self {
            host: cli.host.unwrap_or(file.server.host),
            port: cli.port.unwrap_or(file.server.port),
            suspend_timeout: (suspend_timeout > 0).then(|| Duration::from_secs(suspend_timeout)),
            max_connections,
            suspend_paths: file.server.suspend_paths,
            charset,
            token_ttl: file.channel.token_ttl,
            queue_capacity: file.channel.queue_capacity,
            max_channels: file.channel.max_channels,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.suspend_timeout, Some(Duration::from_secs(300)));
        assert_eq!(cfg.suspend_paths, vec!["/".to_string()]);
        assert_eq!(cfg.charset, Charset::Utf8);
    }

    #[test]
    fn file_values_and_cli_overrides() {
        let file = ServerConfig::parse(
            r#"
            [server]
            port = 9000
            suspend_timeout = 0
            suspend_paths = ["/app", "/feed"]
            charset = "iso-8859-1"

            [channel]
            token_ttl = 60
            "#,
        )
        .unwrap();

        let cfg = ServerConfig::resolve(
            file,
            CliOverrides {
                port: Some(9100),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.suspend_timeout, None);
        assert_eq!(cfg.suspend_paths.len(), 2);
        assert_eq!(cfg.charset, Charset::Latin1);
        assert_eq!(cfg.token_ttl, 60);
        assert_eq!(cfg.queue_capacity, 256);
    }

    #[test]
    fn rejects_invalid_values() {
        let bad_charset = ServerConfig::parse("[server]\ncharset = \"koi8-r\"").unwrap();
        assert!(ServerConfig::resolve(bad_charset, CliOverrides::default()).is_err());

        let bad_path = ServerConfig::parse("[server]\nsuspend_paths = [\"app\"]").unwrap();
        assert!(ServerConfig::resolve(bad_path, CliOverrides::default()).is_err());

        assert!(ServerConfig::parse("[server]\nport = \"x\"").is_err());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = ServerConfig::load(
            Some(Path::new("/nonexistent/chapi/config.toml")),
            CliOverrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.max_connections, 10_000);
    }
}
