//! Register file behaviour under concurrent clients, and the layout/codec
//! pipeline on top of it.

// Allow unwrap() in tests for cleaner test code
#![allow(clippy::disallowed_methods)]

use std::sync::Arc;

use modbus_memory::{
    parse_memory, parse_metric, ByteOrder, DataType, FieldValue, HandlerRequest, MemoryEntry,
    MemoryLayout, ModbusHandler, RequestHandler, Value,
};

fn plc_layout() -> MemoryLayout {
    MemoryLayout::new(vec![
        MemoryEntry::coil(0).with_field("plc", "field_coil"),
        MemoryEntry::register(40001, DataType::Float32).with_field("plc", "field_float"),
    ])
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_on_disjoint_registers() {
    let handler = Arc::new(RequestHandler::new(0, u16::MAX, 64, 100).unwrap());

    let mut tasks = Vec::new();
    for worker in 0..8u16 {
        let handler = Arc::clone(&handler);
        tasks.push(tokio::spawn(async move {
            for round in 0..100u16 {
                let base = 100 + worker * 8;
                let values: Vec<u16> = (0..8).map(|i| round * 10 + i).collect();
                let written = handler.write_holding_registers(base, &values).unwrap();
                assert_eq!(written.len(), 8);
                let read = handler.read_holding_registers(base, 8).unwrap();
                assert_eq!(read.len(), 8);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for worker in 0..8u16 {
        let read = handler.read_holding_registers(100 + worker * 8, 8).unwrap();
        let expected: Vec<u16> = (0..8).map(|i| 99 * 10 + i).collect();
        assert_eq!(read, expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_bit_writers_do_not_lose_updates() {
    let handler = Arc::new(RequestHandler::new(0, u16::MAX, 1, 0).unwrap());

    let mut tasks = Vec::new();
    for bit in 0..16u8 {
        let handler = Arc::clone(&handler);
        tasks.push(tokio::spawn(async move {
            for _ in 0..50 {
                handler.write_bit_to_holding_register(0, true, bit).unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(handler.read_holding_registers(0, 1).unwrap(), vec![0xffff]);
}

#[tokio::test]
async fn test_consumer_wakes_after_client_write() {
    let handler = Arc::new(RequestHandler::new(1, 0, 1, 0).unwrap());
    let mut edits = handler.subscribe();

    let writer = Arc::clone(&handler);
    tokio::spawn(async move {
        writer
            .handle_coils(&HandlerRequest::write(0, vec![true]))
            .unwrap();
    });

    let stamp = tokio::time::timeout(std::time::Duration::from_secs(1), edits.changed())
        .await
        .unwrap();
    assert!(stamp.is_some());
    assert_eq!(handler.read_coils(0, 1).unwrap(), vec![true]);
}

// ============================================================================
// Layout + codec over the register file
// ============================================================================

#[test]
fn test_coil_and_float_scenario() {
    let layout = plc_layout();
    assert!(!layout.has_overlap().unwrap().0);

    let handler = RequestHandler::from_layout(&layout).unwrap();
    assert_eq!(handler.coil_offset(), 0);
    assert_eq!(handler.register_offset(), 40001);

    let snapshot = handler.snapshot();
    let before = parse_memory(
        ByteOrder::BigEndian,
        &layout.entries()[0],
        snapshot.coil_offset,
        snapshot.register_offset,
        &snapshot.coils,
        &snapshot.registers,
    )
    .unwrap();
    assert_eq!(before, Value::Bool(false));

    handler.write_coils(0, &[true]).unwrap();
    handler
        .write_holding_registers(40001, &[0x3f80, 0x0000])
        .unwrap();

    let snapshot = handler.snapshot();
    let decoded: Vec<Value> = layout
        .iter()
        .map(|entry| {
            parse_memory(
                ByteOrder::BigEndian,
                entry,
                snapshot.coil_offset,
                snapshot.register_offset,
                &snapshot.coils,
                &snapshot.registers,
            )
            .unwrap()
        })
        .collect();
    assert_eq!(decoded, vec![Value::Bool(true), Value::F32(1.0)]);
}

#[test]
fn test_encoded_metric_lands_in_register_file() {
    for (order, expected) in [
        (ByteOrder::BigEndian, [0x3f80, 0x0000]),
        (ByteOrder::LittleEndianSwap, [0x3f80, 0x0000]),
        (ByteOrder::BigEndianSwap, [0x0000, 0x3f80]),
        (ByteOrder::LittleEndian, [0x0000, 0x3f80]),
    ] {
        let layout = plc_layout();
        let handler = RequestHandler::from_layout(&layout).unwrap();
        let words = parse_metric(order, &FieldValue::Float(1.0), DataType::Float32, 0.0).unwrap();
        handler.write_holding_registers(40001, &words).unwrap();

        assert_eq!(
            handler.read_holding_registers(40001, 2).unwrap(),
            expected.to_vec(),
            "{}",
            order
        );

        let (registers, offset) = handler.get_registers_and_offset();
        let decoded =
            parse_memory(order, &layout.entries()[1], 0, offset, &[], &registers).unwrap();
        assert_eq!(decoded, Value::F32(1.0));
    }
}

#[test]
fn test_sparse_layout_sizes_register_file() {
    let layout = MemoryLayout::new(vec![
        MemoryEntry::coil(1),
        MemoryEntry::coil(3),
        MemoryEntry::register(40000, DataType::Bit),
        MemoryEntry::register(40000, DataType::Bit).with_bit(1),
        MemoryEntry::register(40001, DataType::Uint32),
        MemoryEntry::register(40003, DataType::Uint32),
    ]);
    let handler = RequestHandler::from_layout(&layout).unwrap();

    assert!(handler.read_coils(1, 3).is_ok());
    assert!(handler.read_coils(1, 4).is_err());
    assert!(handler.read_holding_registers(40000, 5).is_ok());
    assert!(handler.read_holding_registers(40000, 6).is_err());
}
