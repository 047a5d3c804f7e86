//! Output plugin: a Modbus server whose register file is fed from metrics
//!
//! Each inbound metric is matched to its register region by the hash of its
//! name and tags; its field values are encoded and written into that region.

use std::net::SocketAddr;
use std::sync::Arc;

use modbus_memory::{
    cast_to_type, fit_string_words, parse_metric, DataType, FieldValue, HashIdGenerator,
    MemoryEntry, Metric, RequestHandler, Value,
};
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::checks::{check_config, CheckedConfig};
use crate::config::ModbusServerConfig;
use crate::error::{Result, ServerError};
use crate::server::{spawn_tcp_server, ServerHandle};

type RegionMap = FxHashMap<u64, FxHashMap<String, MemoryEntry>>;

pub struct ModbusServerOutput {
    config: ModbusServerConfig,
    /// Seeded at `init`
    generator: Option<HashIdGenerator>,
    checked: Option<CheckedConfig>,
    regions: RegionMap,
    handler: Option<Arc<RequestHandler>>,
    cancel: CancellationToken,
    server: Option<ServerHandle>,
}

impl ModbusServerOutput {
    pub fn new(config: ModbusServerConfig) -> Self {
        Self {
            config,
            generator: None,
            checked: None,
            regions: RegionMap::default(),
            handler: None,
            cancel: CancellationToken::new(),
            server: None,
        }
    }

    /// Validate the configuration, build the register file and the region map.
    ///
    /// Every call draws a fresh hash seed.
    pub fn init(&mut self) -> Result<()> {
        let generator = HashIdGenerator::new();
        let checked = check_config(&self.config, Some(&generator))?;
        let handler = RequestHandler::from_layout(&checked.layout)?;
        self.regions = checked.layout.get_memory_mapped_by_hash_id();
        info!(
            "Output register file: {} fields in {} regions",
            checked.layout.len(),
            self.regions.len()
        );
        self.generator = Some(generator);
        self.checked = Some(checked);
        self.handler = Some(Arc::new(handler));
        Ok(())
    }

    pub fn handler(&self) -> Option<Arc<RequestHandler>> {
        self.handler.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(ServerHandle::local_addr)
    }

    fn initialized(&self) -> Result<(&CheckedConfig, &Arc<RequestHandler>)> {
        match (&self.checked, &self.handler) {
            (Some(checked), Some(handler)) => Ok((checked, handler)),
            _ => Err(ServerError::StateError(
                "output plugin used before init".to_string(),
            )),
        }
    }

    /// Apply configured coil initial values.
    pub fn init_coil_values(&self) -> Result<()> {
        let (checked, handler) = self.initialized()?;
        for entry in checked.layout.iter() {
            if entry.kind.is_coil() && entry.coil_initial_value {
                handler.write_coils(entry.address, &[true])?;
            }
        }
        Ok(())
    }

    /// Apply coil initial values and start serving clients.
    pub async fn connect(&mut self) -> Result<()> {
        self.init_coil_values()?;
        let (checked, handler) = self.initialized()?;
        let server = spawn_tcp_server(
            &checked.listen_address,
            Arc::clone(handler),
            checked.server_options,
            self.cancel.child_token(),
        )
        .await?;
        self.server = Some(server);
        Ok(())
    }

    /// Write every metric into its register region.
    ///
    /// A metric without a region fails the call; metrics before it in the
    /// batch stay written.
    pub fn write(&self, metrics: &[Metric]) -> Result<()> {
        let (checked, handler) = self.initialized()?;
        let generator = self.generator.as_ref().ok_or_else(|| {
            ServerError::StateError("output plugin used before init".to_string())
        })?;

        for metric in metrics {
            let hash_id = generator.hash_id(&metric.name, &metric.tags);
            let region = self
                .regions
                .get(&hash_id)
                .ok_or_else(|| ServerError::NoMatchingRegion {
                    measurement: metric.name.clone(),
                    tags: format!("{:?}", metric.tags),
                })?;

            for (field, value) in &metric.fields {
                let Some(entry) = region.get(field) else {
                    debug!("Field '{}' of '{}' has no register, skipped", field, metric.name);
                    continue;
                };
                write_field(handler, checked, entry, value)?;
            }
        }
        Ok(())
    }

    /// Stop serving clients.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(server) = self.server.take() {
            server.shutdown().await;
        }
        info!("Output plugin closed");
    }
}

fn write_field(
    handler: &RequestHandler,
    checked: &CheckedConfig,
    entry: &MemoryEntry,
    value: &FieldValue,
) -> Result<()> {
    if entry.kind.is_coil() {
        let state = matches!(cast_to_type(value, DataType::Bit)?, Value::Bool(true));
        handler.write_coils(entry.address, &[state])?;
        return Ok(());
    }

    match entry.data_type {
        Some(DataType::Bit) => {
            let state = matches!(cast_to_type(value, DataType::Bit)?, Value::Bool(true));
            handler.write_bit_to_holding_register(entry.address, state, entry.bit)?;
        },
        Some(data_type) => {
            let mut words = parse_metric(checked.byte_order, value, data_type, entry.scale)?;
            if data_type == DataType::String {
                words = fit_string_words(words, entry.length);
            }
            handler.write_holding_registers(entry.address, &words)?;
        },
        None => {
            return Err(ServerError::ConfigError(format!(
                "field '{}' at register {} has no type",
                entry.field, entry.address
            )))
        },
    }
    Ok(())
}
