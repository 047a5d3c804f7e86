//! Input plugin: a Modbus server whose register file is published as metrics
//!
//! Clients write coils and holding registers; every edit wakes a consumer task
//! that decodes the whole layout from one snapshot and emits one metric per
//! configured measurement.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use modbus_memory::{
    parse_memory, ByteOrder, EditReceiver, FieldValue, MemorySnapshot, Metric, RequestHandler,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checks::{check_config, CheckedConfig, MeasurementGroup};
use crate::config::ModbusServerConfig;
use crate::error::{Result, ServerError};
use crate::server::{spawn_tcp_server, ServerHandle};
use crate::sink::MetricSink;

/// Decode every measurement from one register file snapshot.
///
/// Fields that fail to decode are logged and left out; a measurement without
/// any decodable field produces no metric.
pub fn decode_metrics(
    groups: &[MeasurementGroup],
    byte_order: ByteOrder,
    snapshot: &MemorySnapshot,
    timestamp: DateTime<Utc>,
) -> Vec<Metric> {
    let mut metrics = Vec::with_capacity(groups.len());
    for group in groups {
        let mut metric = Metric::new(group.name.clone(), timestamp);
        metric.tags = group.tags.clone();

        for entry in &group.entries {
            match parse_memory(
                byte_order,
                entry,
                snapshot.coil_offset,
                snapshot.register_offset,
                &snapshot.coils,
                &snapshot.registers,
            ) {
                Ok(value) => {
                    metric
                        .fields
                        .insert(entry.field.clone(), FieldValue::from(value));
                },
                Err(e) => warn!(
                    "Failed to decode field '{}' of '{}': {}",
                    entry.field, group.name, e
                ),
            }
        }

        if !metric.fields.is_empty() {
            metrics.push(metric);
        }
    }
    metrics
}

async fn consume_edits<S: MetricSink>(
    handler: Arc<RequestHandler>,
    checked: Arc<CheckedConfig>,
    mut edits: EditReceiver,
    sink: S,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            edit = edits.changed() => {
                let Some(timestamp) = edit else {
                    debug!("Edit mailbox closed");
                    break;
                };
                let snapshot = handler.snapshot();
                for metric in decode_metrics(&checked.groups, checked.byte_order, &snapshot, timestamp) {
                    sink.add_metric(metric);
                }
            },
        }
    }
    debug!("Edit consumer stopped");
}

pub struct ModbusServerInput {
    config: ModbusServerConfig,
    checked: Option<Arc<CheckedConfig>>,
    handler: Option<Arc<RequestHandler>>,
    cancel: CancellationToken,
    server: Option<ServerHandle>,
    consumer: Option<JoinHandle<()>>,
}

impl ModbusServerInput {
    pub fn new(config: ModbusServerConfig) -> Self {
        Self {
            config,
            checked: None,
            handler: None,
            cancel: CancellationToken::new(),
            server: None,
            consumer: None,
        }
    }

    /// Validate the configuration and build the register file.
    pub fn init(&mut self) -> Result<()> {
        let checked = check_config(&self.config, None)?;
        let handler = RequestHandler::from_layout(&checked.layout)?;
        info!(
            "Input register file: {} fields, coils at {}, registers at {}",
            checked.layout.len(),
            handler.coil_offset(),
            handler.register_offset()
        );
        self.checked = Some(Arc::new(checked));
        self.handler = Some(Arc::new(handler));
        Ok(())
    }

    pub fn handler(&self) -> Option<Arc<RequestHandler>> {
        self.handler.clone()
    }

    /// Address the server is bound to once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(ServerHandle::local_addr)
    }

    fn initialized(&self) -> Result<(Arc<CheckedConfig>, Arc<RequestHandler>)> {
        match (&self.checked, &self.handler) {
            (Some(checked), Some(handler)) => Ok((Arc::clone(checked), Arc::clone(handler))),
            _ => Err(ServerError::StateError(
                "input plugin used before init".to_string(),
            )),
        }
    }

    /// Start serving clients and publishing edits into `sink`.
    pub async fn start<S: MetricSink>(&mut self, sink: S) -> Result<()> {
        let (checked, handler) = self.initialized()?;

        // Subscribe before the server accepts its first client
        let edits = handler.subscribe();
        let server = spawn_tcp_server(
            &checked.listen_address,
            Arc::clone(&handler),
            checked.server_options,
            self.cancel.child_token(),
        )
        .await?;
        self.server = Some(server);

        self.consumer = Some(tokio::spawn(consume_edits(
            handler,
            checked,
            edits,
            sink,
            self.cancel.child_token(),
        )));
        Ok(())
    }

    /// Metrics are pushed on edits; polling has nothing to add.
    pub fn gather<S: MetricSink>(&self, _sink: &S) -> Result<()> {
        Ok(())
    }

    /// Decode the current register file.
    pub fn get_metrics(&self, timestamp: DateTime<Utc>) -> Result<Vec<Metric>> {
        let (checked, handler) = self.initialized()?;
        Ok(decode_metrics(
            &checked.groups,
            checked.byte_order,
            &handler.snapshot(),
            timestamp,
        ))
    }

    /// Stop the server and the consumer task.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(consumer) = self.consumer.take() {
            if let Err(e) = consumer.await {
                error!("Edit consumer failed: {}", e);
            }
        }
        if let Some(server) = self.server.take() {
            server.shutdown().await;
        }
        info!("Input plugin stopped");
    }
}
