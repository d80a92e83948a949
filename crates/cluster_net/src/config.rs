//! Server configuration types and defaults.
//!
//! [`ServerConfig`] is the supervisor's immutable setup. It is built once,
//! usually from the node's TOML file, and handed to [`Server`](crate::Server)
//! which reads it while starting listeners and never mutates it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Byte order used by length prefixes and numeric frame codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

impl ByteOrder {
    pub fn from_little_endian(little_endian: bool) -> Self {
        if little_endian {
            ByteOrder::LittleEndian
        } else {
            ByteOrder::BigEndian
        }
    }

    pub fn is_little_endian(self) -> bool {
        self == ByteOrder::LittleEndian
    }

    pub fn u16_to_bytes(self, value: u16) -> [u8; 2] {
        match self {
            ByteOrder::BigEndian => value.to_be_bytes(),
            ByteOrder::LittleEndian => value.to_le_bytes(),
        }
    }

    pub fn u16_from_bytes(self, bytes: [u8; 2]) -> u16 {
        match self {
            ByteOrder::BigEndian => u16::from_be_bytes(bytes),
            ByteOrder::LittleEndian => u16::from_le_bytes(bytes),
        }
    }

    pub fn u32_to_bytes(self, value: u32) -> [u8; 4] {
        match self {
            ByteOrder::BigEndian => value.to_be_bytes(),
            ByteOrder::LittleEndian => value.to_le_bytes(),
        }
    }

    pub fn u32_from_bytes(self, bytes: [u8; 4]) -> u32 {
        match self {
            ByteOrder::BigEndian => u32::from_be_bytes(bytes),
            ByteOrder::LittleEndian => u32::from_le_bytes(bytes),
        }
    }
}

/// Role of this node in the cluster.
///
/// Only non-master roles dial the master uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    Master,
    #[default]
    Game,
    Gate,
}

impl ServerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerRole::Master => "master",
            ServerRole::Game => "game",
            ServerRole::Gate => "gate",
        }
    }

    pub fn is_master(self) -> bool {
        self == ServerRole::Master
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "master" => Ok(ServerRole::Master),
            "game" => Ok(ServerRole::Game),
            "gate" => Ok(ServerRole::Gate),
            other => Err(format!("unknown server role: {other}")),
        }
    }
}

/// Configuration structure for the cluster server.
///
/// Empty addresses disable the matching listener or the uplink.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of concurrent connections per listener
    pub max_conn_num: usize,

    /// Outbound messages buffered per connection before it is dropped
    pub pending_write_num: usize,

    /// Largest accepted message body in bytes
    pub max_msg_len: u32,

    /// WebSocket listen address
    pub ws_addr: String,

    /// Upper bound on the WebSocket upgrade handshake
    pub http_timeout: Duration,

    /// Certificate path for encrypted WebSocket transport
    pub cert_file: String,

    /// Key path for encrypted WebSocket transport
    pub key_file: String,

    /// TCP listen address
    pub tcp_addr: String,

    /// Size of the TCP length prefix: 1, 2 or 4 bytes
    pub len_msg_len: usize,

    /// Byte order of length prefixes and numeric codes
    pub little_endian: bool,

    /// Address of the master node
    pub master_addr: String,

    /// Role of this node
    pub role: ServerRole,

    /// Delay between failed uplink dial attempts
    pub connect_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_conn_num: 1000,
            pending_write_num: 100,
            max_msg_len: 4096,
            ws_addr: String::new(),
            http_timeout: Duration::from_secs(10),
            cert_file: String::new(),
            key_file: String::new(),
            tcp_addr: String::new(),
            len_msg_len: 2,
            little_endian: false,
            master_addr: String::new(),
            role: ServerRole::default(),
            connect_interval: Duration::from_secs(3),
        }
    }
}

impl ServerConfig {
    pub fn byte_order(&self) -> ByteOrder {
        ByteOrder::from_little_endian(self.little_endian)
    }

    /// Whether this node should dial the master.
    pub fn wants_uplink(&self) -> bool {
        !self.role.is_master() && !self.master_addr.is_empty()
    }

    /// Checks the settings the listeners cannot work without.
    pub fn validate(&self) -> Result<(), String> {
        if !matches!(self.len_msg_len, 1 | 2 | 4) {
            return Err(format!(
                "len_msg_len must be 1, 2 or 4, got {}",
                self.len_msg_len
            ));
        }
        if self.max_conn_num == 0 {
            return Err("max_conn_num must be greater than 0".to_string());
        }
        if self.pending_write_num == 0 {
            return Err("pending_write_num must be greater than 0".to_string());
        }
        if self.max_msg_len == 0 {
            return Err("max_msg_len must be greater than 0".to_string());
        }
        if self.cert_file.is_empty() != self.key_file.is_empty() {
            return Err("cert_file and key_file must be set together".to_string());
        }
        Ok(())
    }

    /// Whether the WebSocket listener serves `wss` with `cert_file`/`key_file`.
    pub fn uses_tls(&self) -> bool {
        !self.cert_file.is_empty() && !self.key_file.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_order_encoding() {
        assert_eq!(ByteOrder::BigEndian.u16_to_bytes(0x0102), [1, 2]);
        assert_eq!(ByteOrder::LittleEndian.u16_to_bytes(0x0102), [2, 1]);
        assert_eq!(ByteOrder::LittleEndian.u32_from_bytes([1, 0, 0, 0]), 1);
        assert_eq!(ByteOrder::BigEndian.u32_from_bytes([0, 0, 0, 1]), 1);
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("Master".parse::<ServerRole>(), Ok(ServerRole::Master));
        assert_eq!("gate".parse::<ServerRole>(), Ok(ServerRole::Gate));
        assert!("lobby".parse::<ServerRole>().is_err());
    }

    #[test]
    fn test_uplink_gated_by_role() {
        let mut config = ServerConfig {
            master_addr: "127.0.0.1:3563".to_string(),
            ..Default::default()
        };
        assert!(config.wants_uplink());

        config.role = ServerRole::Master;
        assert!(!config.wants_uplink());
    }

    #[test]
    fn test_validate() {
        assert!(ServerConfig::default().validate().is_ok());

        let bad_prefix = ServerConfig {
            len_msg_len: 3,
            ..Default::default()
        };
        assert!(bad_prefix.validate().is_err());

        let half_tls = ServerConfig {
            cert_file: "server.crt".to_string(),
            ..Default::default()
        };
        assert!(half_tls.validate().is_err());
        assert!(!half_tls.uses_tls());

        let tls = ServerConfig {
            cert_file: "server.crt".to_string(),
            key_file: "server.key".to_string(),
            ..Default::default()
        };
        assert!(tls.validate().is_ok());
        assert!(tls.uses_tls());
    }
}
