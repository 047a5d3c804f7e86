//! Service configuration
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [input]
//! server_address = "tcp://0.0.0.0:502"
//! byte_order = "ABCD"
//! max_clients = 10
//! timeout_secs = 30
//!
//! [[input.metrics]]
//! name = "plc"
//! tags = { line = "a" }
//! fields = [
//!   { register = "coil", address = 0, name = "running" },
//!   { register = "holding", address = 40001, name = "temperature", type = "FLOAT32" },
//! ]
//! ```

use modbus_memory::{ByteOrder, DataType, RegisterKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, ServerError};
use crate::server::ServerOptions;

/// Prefix of environment overrides, e.g. `MODBUS_SERVER_INPUT__BYTE_ORDER`
pub const ENV_PREFIX: &str = "MODBUS_SERVER_";

/// Used when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = "config/modbus-server.toml";

pub const DEFAULT_SERVER_ADDRESS: &str = "tcp://localhost:502";

fn default_server_address() -> String {
    DEFAULT_SERVER_ADDRESS.to_string()
}

fn default_byte_order() -> String {
    "ABCD".to_string()
}

pub const DEFAULT_MAX_CLIENTS: usize = 10;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

fn default_max_clients() -> usize {
    DEFAULT_MAX_CLIENTS
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Register file whose edits are published as metrics
    #[serde(default)]
    pub input: Option<ModbusServerConfig>,
    /// Register file fed from inbound metrics
    #[serde(default)]
    pub output: Option<ModbusServerConfig>,
}

impl AgentConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(common::config_loader::load_config(path, ENV_PREFIX)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for daily log files
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusServerConfig {
    #[serde(default = "default_server_address")]
    pub server_address: String,
    #[serde(default = "default_byte_order")]
    pub byte_order: String,
    /// Concurrent clients; 0 means unlimited
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Seconds a client may stay silent before it is disconnected; 0 disables
    #[serde(default = "default_timeout_secs", alias = "timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub metrics: Vec<MetricDefinition>,
}

impl Default for ModbusServerConfig {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            byte_order: default_byte_order(),
            max_clients: default_max_clients(),
            timeout_secs: default_timeout_secs(),
            metrics: Vec::new(),
        }
    }
}

impl ModbusServerConfig {
    pub fn byte_order(&self) -> Result<ByteOrder> {
        Ok(self.byte_order.parse::<ByteOrder>()?)
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            max_clients: self.max_clients,
            idle_timeout: (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs)),
        }
    }

    /// `host:port` part of a `tcp://host:port` address
    pub fn listen_address(&self) -> Result<String> {
        let invalid = || ServerError::InvalidServerAddress(self.server_address.clone());
        let rest = self
            .server_address
            .strip_prefix("tcp://")
            .ok_or_else(invalid)?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(invalid());
        }
        Ok(rest.to_string())
    }
}

/// One measurement: a name, its tags and the fields laid out in memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub fields: Vec<MetricSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSchema {
    /// `coil`, `holding` or `register`
    pub register: RegisterKind,
    pub address: u16,
    pub name: String,
    /// Required for registers, ignored for coils
    #[serde(rename = "type", default)]
    pub data_type: Option<DataType>,
    #[serde(default)]
    pub bit: u8,
    #[serde(default)]
    pub scale: f64,
    #[serde(default)]
    pub length: u16,
    #[serde(default)]
    pub coil_initial_value: bool,
}
