//! Configuration management for the cluster node.
//!
//! Loads the TOML file, applies command-line overrides and converts the
//! result into the library's [`ServerConfig`].

use crate::cli::CliArgs;
use anyhow::{anyhow, Context, Result};
use cluster_net::{ServerConfig, ServerRole};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Node and listener settings
    #[serde(default)]
    pub server: ServerSettings,
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Node-level settings.
///
/// Empty addresses disable the matching listener or the uplink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Node role: master, game or gate
    pub role: ServerRole,
    /// TCP listen address
    pub tcp_addr: String,
    /// WebSocket listen address
    pub ws_addr: String,
    /// Master node address, dialed by non-master roles
    pub master_addr: String,
    /// Maximum number of concurrent connections per listener
    pub max_conn_num: usize,
    /// Outbound messages buffered per connection
    pub pending_write_num: usize,
    /// Largest accepted message body in bytes
    pub max_msg_len: u32,
    /// TCP length prefix width in bytes
    pub len_msg_len: usize,
    /// Little-endian length prefixes and numeric codes
    pub little_endian: bool,
    /// WebSocket handshake timeout in seconds
    pub http_timeout_secs: u64,
    /// Delay between uplink dial attempts in seconds
    pub connect_interval_secs: u64,
    /// PEM certificate chain for `wss`, set together with `key_file`
    pub cert_file: String,
    /// PEM private key for `wss`
    pub key_file: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            role: ServerRole::Game,
            tcp_addr: "127.0.0.1:3563".to_string(),
            ws_addr: String::new(),
            master_addr: String::new(),
            max_conn_num: 1000,
            pending_write_num: 100,
            max_msg_len: 4096,
            len_msg_len: 2,
            little_endian: false,
            http_timeout_secs: 10,
            connect_interval_secs: 3,
            cert_file: String::new(),
            key_file: String::new(),
        }
    }
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration there and
    /// returns it.
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Applies command-line overrides on top of the file settings.
    pub fn apply_cli(&mut self, args: &CliArgs) -> Result<()> {
        if let Some(role) = &args.role {
            self.server.role = role.parse::<ServerRole>().map_err(|e: String| anyhow!(e))?;
        }
        if let Some(tcp_addr) = &args.tcp_addr {
            self.server.tcp_addr = tcp_addr.clone();
        }
        if let Some(ws_addr) = &args.ws_addr {
            self.server.ws_addr = ws_addr.clone();
        }
        if let Some(master_addr) = &args.master_addr {
            self.server.master_addr = master_addr.clone();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
        Ok(())
    }

    /// Validates the configuration for consistency and correctness.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.tcp_addr.is_empty() && self.server.ws_addr.is_empty() && self.server.master_addr.is_empty()
        {
            return Err("At least one of tcp_addr, ws_addr or master_addr must be set".to_string());
        }
        if self.server.role.is_master() && !self.server.master_addr.is_empty() {
            return Err("A master node cannot dial another master".to_string());
        }
        if self.server.connect_interval_secs == 0 {
            return Err("connect_interval_secs must be greater than 0".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        self.to_server_config().validate()
    }

    /// Converts the file settings into the library configuration.
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            max_conn_num: self.server.max_conn_num,
            pending_write_num: self.server.pending_write_num,
            max_msg_len: self.server.max_msg_len,
            ws_addr: self.server.ws_addr.clone(),
            http_timeout: Duration::from_secs(self.server.http_timeout_secs),
            cert_file: self.server.cert_file.clone(),
            key_file: self.server.key_file.clone(),
            tcp_addr: self.server.tcp_addr.clone(),
            len_msg_len: self.server.len_msg_len,
            little_endian: self.server.little_endian,
            master_addr: self.server.master_addr.clone(),
            role: self.server.role,
            connect_interval: Duration::from_secs(self.server.connect_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.server.role, ServerRole::Game);
        assert_eq!(config.server.tcp_addr, "127.0.0.1:3563");
        assert_eq!(config.server.len_msg_len, 2);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_from_nonexistent_file_creates_it() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.server.tcp_addr, "127.0.0.1:3563");
        assert!(path.exists());

        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded.server.max_conn_num, config.server.max_conn_num);
    }

    #[tokio::test]
    async fn test_load_from_existing_file() {
        let toml_content = r#"
[server]
role = "master"
tcp_addr = "0.0.0.0:4000"
ws_addr = "0.0.0.0:4001"
max_conn_num = 20
len_msg_len = 4
little_endian = true
connect_interval_secs = 5

[logging]
level = "debug"
json_format = true
"#;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.toml");
        tokio::fs::write(&path, toml_content).await.unwrap();

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.server.role, ServerRole::Master);
        assert_eq!(config.server.ws_addr, "0.0.0.0:4001");
        assert_eq!(config.server.max_conn_num, 20);
        // Omitted keys fall back to defaults.
        assert_eq!(config.server.pending_write_num, 100);
        assert!(config.logging.json_format);

        let server_config = config.to_server_config();
        assert_eq!(server_config.len_msg_len, 4);
        assert!(server_config.little_endian);
        assert_eq!(server_config.connect_interval, Duration::from_secs(5));
        assert!(!server_config.wants_uplink());
    }

    #[tokio::test]
    async fn test_load_invalid_toml_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        tokio::fs::write(&path, "[server\nrole = ").await.unwrap();

        assert!(AppConfig::load_from_file(&path).await.is_err());
    }

    #[test]
    fn test_apply_cli_overrides() {
        let mut config = AppConfig::default();
        let args = CliArgs {
            role: Some("Gate".to_string()),
            master_addr: Some("10.0.0.1:3563".to_string()),
            log_level: Some("warn".to_string()),
            json_logs: true,
            ..CliArgs::default()
        };

        config.apply_cli(&args).unwrap();
        assert_eq!(config.server.role, ServerRole::Gate);
        assert_eq!(config.server.master_addr, "10.0.0.1:3563");
        assert_eq!(config.logging.level, "warn");
        assert!(config.logging.json_format);
        assert!(config.to_server_config().wants_uplink());
    }

    #[test]
    fn test_apply_cli_rejects_unknown_role() {
        let mut config = AppConfig::default();
        let args = CliArgs {
            role: Some("observer".to_string()),
            ..CliArgs::default()
        };
        assert!(config.apply_cli(&args).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = AppConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.len_msg_len = 3;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.role = ServerRole::Master;
        config.server.master_addr = "127.0.0.1:3563".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.tcp_addr.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.key_file = "node.key".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_certificate_pair_enables_tls() {
        let mut config = AppConfig::default();
        config.server.ws_addr = "0.0.0.0:3653".to_string();
        config.server.cert_file = "node.crt".to_string();
        config.server.key_file = "node.key".to_string();

        assert!(config.validate().is_ok());
        assert!(config.to_server_config().uses_tls());
    }
}
