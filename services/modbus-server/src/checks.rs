//! Configuration checks shared by the input and output plugins
//!
//! Turns measurement definitions into a validated [`MemoryLayout`]. Hard errors
//! stop the plugin from starting; overlaps are only logged.

use modbus_memory::{
    ByteOrder, DataType, HashIdGenerator, MemoryEntry, MemoryLayout, RegisterKind,
};
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::config::{MetricDefinition, ModbusServerConfig};
use crate::error::{Result, ServerError};
use crate::server::ServerOptions;

/// Entries of one measurement, in configuration order
#[derive(Debug, Clone)]
pub struct MeasurementGroup {
    pub name: String,
    pub tags: std::collections::BTreeMap<String, String>,
    pub entries: Vec<MemoryEntry>,
}

/// Result of a successful [`check_config`]
#[derive(Debug, Clone)]
pub struct CheckedConfig {
    pub byte_order: ByteOrder,
    pub listen_address: String,
    pub server_options: ServerOptions,
    pub layout: MemoryLayout,
    pub groups: Vec<MeasurementGroup>,
}

/// Build the entries of one measurement, rejecting duplicate field names and
/// untyped registers.
pub fn check_measurement(definition: &MetricDefinition, hash_id: u64) -> Result<Vec<MemoryEntry>> {
    let mut seen: FxHashSet<&str> = FxHashSet::default();
    let mut entries = Vec::with_capacity(definition.fields.len());

    for schema in &definition.fields {
        if !seen.insert(schema.name.as_str()) {
            return Err(ServerError::DuplicateField {
                measurement: definition.name.clone(),
                field: schema.name.clone(),
            });
        }

        if schema.register == RegisterKind::Register && schema.data_type.is_none() {
            return Err(ServerError::ConfigError(format!(
                "field '{}' of measurement '{}' at register {} has no type",
                schema.name, definition.name, schema.address
            )));
        }

        let data_type = match schema.register {
            RegisterKind::Coil => None,
            RegisterKind::Register => schema.data_type,
        };

        // A zero-length string has no footprint and would spill into its neighbours
        if data_type == Some(DataType::String) && schema.length == 0 {
            return Err(ServerError::ConfigError(format!(
                "STRING field '{}' of measurement '{}' at register {} needs a length",
                schema.name, definition.name, schema.address
            )));
        }

        if schema.scale != 0.0 && matches!(data_type, None | Some(DataType::Bit | DataType::String)) {
            return Err(ServerError::ConfigError(format!(
                "field '{}' of measurement '{}' cannot be scaled: {} values are not numeric",
                schema.name,
                definition.name,
                data_type.map_or("coil", |t| t.as_str())
            )));
        }

        entries.push(MemoryEntry {
            address: schema.address,
            kind: schema.register,
            data_type,
            bit: schema.bit,
            scale: schema.scale,
            length: schema.length,
            coil_initial_value: schema.coil_initial_value,
            hash_id,
            field: schema.name.clone(),
            measurement: definition.name.clone(),
        });
    }

    Ok(entries)
}

/// Validate a plugin configuration and build its memory layout.
///
/// With a generator, every entry carries the hash ID of its measurement name
/// and tags; without one the hash ID stays zero.
pub fn check_config(
    config: &ModbusServerConfig,
    generator: Option<&HashIdGenerator>,
) -> Result<CheckedConfig> {
    let byte_order = config.byte_order()?;
    let listen_address = config.listen_address()?;

    let mut layout = MemoryLayout::default();
    let mut groups = Vec::with_capacity(config.metrics.len());
    for definition in &config.metrics {
        let hash_id = generator
            .map(|g| g.hash_id(&definition.name, &definition.tags))
            .unwrap_or(0);
        let entries = check_measurement(definition, hash_id)?;
        for entry in &entries {
            layout.push(entry.clone());
        }
        groups.push(MeasurementGroup {
            name: definition.name.clone(),
            tags: definition.tags.clone(),
            entries,
        });
    }

    let (overlap, diagnostics) = layout.has_overlap()?;
    if overlap {
        for diagnostic in &diagnostics {
            warn!("Overlapping fields: {}", diagnostic);
        }
    }
    layout.check_address_space()?;

    debug!(
        "Checked {} measurements, {} fields, byte order {}",
        groups.len(),
        layout.len(),
        byte_order
    );

    Ok(CheckedConfig {
        byte_order,
        listen_address,
        server_options: config.server_options(),
        layout,
        groups,
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::MetricSchema;
    use modbus_memory::MemoryError;
    use tracing_test::traced_test;

    fn schema(register: RegisterKind, address: u16, name: &str, data_type: Option<DataType>) -> MetricSchema {
        MetricSchema {
            register,
            address,
            name: name.to_string(),
            data_type,
            bit: 0,
            scale: 0.0,
            length: 0,
            coil_initial_value: false,
        }
    }

    fn config(fields: Vec<MetricSchema>) -> ModbusServerConfig {
        ModbusServerConfig {
            metrics: vec![MetricDefinition {
                name: "plc".to_string(),
                tags: [("line".to_string(), "a".to_string())].into_iter().collect(),
                fields,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_duplicate_field_is_fatal() {
        let config = config(vec![
            schema(RegisterKind::Coil, 0, "x", None),
            schema(RegisterKind::Register, 1, "x", Some(DataType::Int16)),
        ]);
        assert!(matches!(
            check_config(&config, None),
            Err(ServerError::DuplicateField { field, .. }) if field == "x"
        ));
    }

    #[test]
    fn test_untyped_register_is_fatal() {
        let config = config(vec![schema(RegisterKind::Register, 1, "x", None)]);
        assert!(matches!(
            check_config(&config, None),
            Err(ServerError::ConfigError(_))
        ));
    }

    #[test]
    fn test_string_without_length_is_fatal() {
        let config = config(vec![
            schema(RegisterKind::Register, 20, "label", Some(DataType::String)),
            schema(RegisterKind::Register, 21, "count", Some(DataType::Uint16)),
        ]);
        assert!(matches!(
            check_config(&config, None),
            Err(ServerError::ConfigError(msg)) if msg.contains("needs a length")
        ));

        let mut label = schema(RegisterKind::Register, 20, "label", Some(DataType::String));
        label.length = 1;
        let config = self::config(vec![
            label,
            schema(RegisterKind::Register, 21, "count", Some(DataType::Uint16)),
        ]);
        assert!(check_config(&config, None).is_ok());
    }

    #[test]
    fn test_scale_on_non_numeric_field_is_fatal() {
        let mut coil = schema(RegisterKind::Coil, 0, "on", None);
        coil.scale = 0.1;
        let mut flag = schema(RegisterKind::Register, 1, "flag", Some(DataType::Bit));
        flag.scale = 10.0;
        let mut label = schema(RegisterKind::Register, 2, "label", Some(DataType::String));
        label.length = 2;
        label.scale = 2.0;

        for field in [coil, flag, label] {
            assert!(matches!(
                check_config(&config(vec![field]), None),
                Err(ServerError::ConfigError(msg)) if msg.contains("cannot be scaled")
            ));
        }

        let mut power = schema(RegisterKind::Register, 1, "power", Some(DataType::Int16));
        power.scale = 0.1;
        assert!(check_config(&config(vec![power]), None).is_ok());
    }

    #[test]
    fn test_bit_index_with_length_is_fatal() {
        let mut field = schema(RegisterKind::Register, 1, "flag", Some(DataType::Bit));
        field.bit = 20;
        field.length = 1;
        assert!(matches!(
            check_config(&config(vec![field]), None),
            Err(ServerError::Memory(MemoryError::BitOutOfRange { bit: 20, .. }))
        ));
    }

    #[test]
    fn test_bit_index_out_of_range_is_fatal() {
        let mut field = schema(RegisterKind::Register, 1, "flag", Some(DataType::Bit));
        field.bit = 16;
        assert!(matches!(
            check_config(&config(vec![field]), None),
            Err(ServerError::Memory(MemoryError::BitOutOfRange { bit: 16, .. }))
        ));
    }

    #[test]
    fn test_address_space_overflow_is_fatal() {
        let config = config(vec![schema(
            RegisterKind::Register,
            65535,
            "wide",
            Some(DataType::Float32),
        )]);
        assert!(matches!(
            check_config(&config, None),
            Err(ServerError::Memory(MemoryError::AddressSpaceExceeded { .. }))
        ));
    }

    #[test]
    #[traced_test]
    fn test_overlap_is_only_logged() {
        let config = config(vec![
            schema(RegisterKind::Register, 10, "a", Some(DataType::Float32)),
            schema(RegisterKind::Register, 11, "b", Some(DataType::Uint16)),
        ]);
        let checked = check_config(&config, None).unwrap();
        assert_eq!(checked.layout.len(), 2);
        assert!(logs_contain("Overlapping fields"));
    }

    #[test]
    fn test_hash_ids_follow_measurement_identity() {
        let generator = HashIdGenerator::with_seeds(1, 2, 3, 4);
        let mut config = config(vec![schema(RegisterKind::Coil, 0, "on", None)]);
        let mut second = config.metrics[0].clone();
        second.tags.insert("line".to_string(), "b".to_string());
        second.fields = vec![schema(RegisterKind::Coil, 1, "on", None)];
        config.metrics.push(second);

        let checked = check_config(&config, Some(&generator)).unwrap();
        let expected_a = generator.hash_id("plc", [("line", "a")]);
        let expected_b = generator.hash_id("plc", [("line", "b")]);
        assert_eq!(checked.groups[0].entries[0].hash_id, expected_a);
        assert_eq!(checked.groups[1].entries[0].hash_id, expected_b);
        assert_eq!(checked.layout.get_memory_mapped_by_hash_id().len(), 2);
    }

    #[test]
    fn test_invalid_byte_order_is_fatal() {
        let mut config = config(vec![schema(RegisterKind::Coil, 0, "on", None)]);
        config.byte_order = "ZZZZ".to_string();
        assert!(matches!(
            check_config(&config, None),
            Err(ServerError::Memory(MemoryError::InvalidByteOrder(_)))
        ));
    }
}
