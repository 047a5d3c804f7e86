//! Modbus TCP server plugins
//!
//! - [`ModbusServerInput`]: clients write the register file, every edit is
//!   decoded and published as metrics
//! - [`ModbusServerOutput`]: inbound metrics are encoded into the register
//!   file, clients read them back

pub mod checks;
pub mod config;
pub mod error;
pub mod input;
pub mod output;
pub mod server;
pub mod sink;

pub use checks::{check_config, check_measurement, CheckedConfig, MeasurementGroup};
pub use config::{AgentConfig, LoggingConfig, MetricDefinition, MetricSchema, ModbusServerConfig};
pub use error::{Result, ServerError};
pub use input::{decode_metrics, ModbusServerInput};
pub use output::ModbusServerOutput;
pub use server::{spawn_tcp_server, ModbusService, ServerHandle, ServerOptions};
pub use sink::{CollectingSink, MetricSink};
