//! Gateway configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use dvid_core::{generate_secret, DvidError, DvidResult};

use crate::connection::ConnectionConfig;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ws_path: default_ws_path(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// `[connection]` section: per-session transport limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSection {
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_write_wait_ms")]
    pub write_wait_ms: u64,
    #[serde(default = "default_pong_wait_ms")]
    pub pong_wait_ms: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            send_buffer: default_send_buffer(),
            max_message_bytes: default_max_message_bytes(),
            write_wait_ms: default_write_wait_ms(),
            pong_wait_ms: default_pong_wait_ms(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    /// Hex-encoded token signing secret.
    #[serde(default)]
    pub secret: Option<String>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_token_ttl_secs(),
            secret: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_ws_path() -> String {
    "/ws".to_string()
}
fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_send_buffer() -> usize {
    128
}
fn default_max_message_bytes() -> usize {
    4096
}
fn default_write_wait_ms() -> u64 {
    5000
}
fn default_pong_wait_ms() -> u64 {
    60_000
}
fn default_token_ttl_secs() -> u64 {
    3600
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ws_path: Option<String>,
    pub request_timeout_ms: Option<u64>,
    pub log_level: Option<String>,
}

/// Resolved gateway configuration (CLI overrides applied, values validated).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub ws_path: String,
    pub request_timeout: Duration,
    pub connection: ConnectionConfig,
    pub token_ttl_secs: u64,
    pub secret: Vec<u8>,
    pub log_level: String,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> DvidResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides)
    }

    /// Merge a parsed file with CLI overrides.
    pub fn resolve(file: ConfigFile, overrides: Overrides) -> DvidResult<Self> {
        let ws_path = overrides.ws_path.unwrap_or(file.server.ws_path);
        if !ws_path.starts_with('/') {
            return Err(DvidError::Config(format!(
                "ws_path must start with '/': {ws_path}"
            )));
        }
        let request_timeout_ms = overrides
            .request_timeout_ms
            .unwrap_or(file.server.request_timeout_ms);
        if request_timeout_ms == 0 {
            return Err(DvidError::Config("request_timeout_ms must be positive".into()));
        }

        let conn = file.connection;
        if conn.send_buffer == 0 {
            return Err(DvidError::Config("send_buffer must be positive".into()));
        }
        if conn.pong_wait_ms < 10 {
            return Err(DvidError::Config("pong_wait_ms must be at least 10".into()));
        }

        let secret = match file.auth.secret {
            Some(hex_secret) => hex::decode(hex_secret.trim())
                .map_err(|e| DvidError::Config(format!("auth.secret is not hex: {e}")))?,
            None => {
                warn!("no auth secret configured, issued tokens will not survive a restart");
                generate_secret()?
            }
        };

        Ok(Self {
            host: overrides.host.unwrap_or(file.server.host),
            port: overrides.port.unwrap_or(file.server.port),
            ws_path,
            request_timeout: Duration::from_millis(request_timeout_ms),
            connection: ConnectionConfig {
                send_buffer: conn.send_buffer,
                max_message_bytes: conn.max_message_bytes,
                write_wait: Duration::from_millis(conn.write_wait_ms),
                pong_wait: Duration::from_millis(conn.pong_wait_ms),
            },
            token_ttl_secs: file.auth.token_ttl_secs,
            secret,
            log_level: overrides
                .log_level
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_string()),
        })
    }

    /// `host:port` listen address.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse the TOML config text.
pub fn parse(content: &str) -> DvidResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| DvidError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
