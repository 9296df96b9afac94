//! Configuration handling for the guard binary.
//!
//! Settings come from a YAML file, then environment variables. A missing or
//! unreadable file falls back to defaults.

use anyhow::{Context, Result};
use guard_session::{ClientConfig, DuplicatePolicy, ServerConfig};
use guard_wire::{DEFAULT_FRAME_BUFFER_SIZE, DEFAULT_MAX_API_PAYLOAD};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Root configuration (matches the YAML layout)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub server: ServerSection,
    pub client: ClientSection,
}

/// `server:` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Bind address for both listeners
    pub host: String,
    /// Notification port
    pub port: u16,
    /// API port
    pub api_port: u16,
    pub handshake_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub frame_buffer_size: usize,
    pub max_api_payload: usize,
    pub duplicate_policy: DuplicatePolicy,
    pub admin_username: String,
    pub admin_password: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            api_port: 8081,
            handshake_timeout_secs: 30,
            request_timeout_secs: 10,
            frame_buffer_size: DEFAULT_FRAME_BUFFER_SIZE,
            max_api_payload: DEFAULT_MAX_API_PAYLOAD,
            duplicate_policy: DuplicatePolicy::Allow,
            admin_username: "admin".to_string(),
            admin_password: "admin".to_string(),
        }
    }
}

/// `client:` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Server host to dial
    pub host: String,
    pub port: u16,
    pub api_port: u16,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub reconnect_backoff_secs: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            api_port: 8081,
            request_timeout_secs: 10,
            connect_timeout_secs: 5,
            reconnect_backoff_secs: 2,
        }
    }
}

impl GuardConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Self {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<GuardConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());

        info!(
            "Final configuration: server={}:{}/{}, client={}:{}/{}",
            config.server.host,
            config.server.port,
            config.server.api_port,
            config.client.host,
            config.client.port,
            config.client.api_port
        );
        config
    }

    /// Apply `GUARD_*` overrides read through `lookup`
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("GUARD_HOST") {
            info!("Host overridden by environment: {}", host);
            self.client.host = host;
        }

        if let Some(port) = lookup("GUARD_PORT").and_then(|v| v.parse::<u16>().ok()) {
            self.server.port = port;
            self.client.port = port;
            info!("Notification port overridden by environment: {}", port);
        }

        if let Some(port) = lookup("GUARD_API_PORT").and_then(|v| v.parse::<u16>().ok()) {
            self.server.api_port = port;
            self.client.api_port = port;
            info!("API port overridden by environment: {}", port);
        }

        if let Some(username) = lookup("GUARD_ADMIN_USERNAME") {
            self.server.admin_username = username;
        }

        if let Some(password) = lookup("GUARD_ADMIN_PASSWORD") {
            self.server.admin_password = password;
        }
    }

    /// Server settings
    pub fn server_config(&self) -> Result<ServerConfig> {
        let ip: IpAddr = self
            .server
            .host
            .parse()
            .with_context(|| format!("invalid server host {:?}", self.server.host))?;

        Ok(ServerConfig {
            notify_addr: SocketAddr::new(ip, self.server.port),
            api_addr: SocketAddr::new(ip, self.server.api_port),
            handshake_timeout: Duration::from_secs(self.server.handshake_timeout_secs),
            request_timeout: Duration::from_secs(self.server.request_timeout_secs),
            frame_buffer_size: self.server.frame_buffer_size,
            max_api_payload: self.server.max_api_payload,
            duplicate_policy: self.server.duplicate_policy,
            admin_username: self.server.admin_username.clone(),
            admin_password: self.server.admin_password.clone(),
        })
    }

    /// Client settings
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            host: self.client.host.clone(),
            notify_port: self.client.port,
            api_port: self.client.api_port,
            request_timeout: Duration::from_secs(self.client.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.client.connect_timeout_secs),
            reconnect_backoff: Duration::from_secs(self.client.reconnect_backoff_secs),
            ..ClientConfig::default()
        }
    }
}
