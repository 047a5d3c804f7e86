//! Register file shared by all Modbus client connections
//!
//! Coils and holding registers live in two zero-based arrays guarded by a
//! single reader/writer lock, which serialises coil traffic against register
//! traffic as well. Reads are all-or-nothing; writes are partial and report the
//! values that actually landed. Every non-empty write publishes the current
//! time into a single-slot edit mailbox.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::ops::Range;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{MemoryError, Result};
use crate::layout::MemoryLayout;

// ============================================================================
// Request contract
// ============================================================================

/// A read or write request for one table
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerRequest<T> {
    pub address: u16,
    pub quantity: u16,
    pub is_write: bool,
    /// Values to write; empty for reads
    pub args: Vec<T>,
}

impl<T> HandlerRequest<T> {
    pub fn read(address: u16, quantity: u16) -> Self {
        Self {
            address,
            quantity,
            is_write: false,
            args: Vec::new(),
        }
    }

    pub fn write(address: u16, args: Vec<T>) -> Self {
        Self {
            address,
            quantity: args.len() as u16,
            is_write: true,
            args,
        }
    }
}

/// Table-level contract called by a Modbus transport
pub trait ModbusHandler: Send + Sync {
    fn handle_coils(&self, request: &HandlerRequest<bool>) -> Result<Vec<bool>>;

    fn handle_holding_registers(&self, request: &HandlerRequest<u16>) -> Result<Vec<u16>>;

    fn handle_discrete_inputs(&self, _request: &HandlerRequest<bool>) -> Result<Vec<bool>> {
        Err(MemoryError::IllegalFunction(
            "discrete inputs are not supported".to_string(),
        ))
    }

    fn handle_input_registers(&self, _request: &HandlerRequest<u16>) -> Result<Vec<u16>> {
        Err(MemoryError::IllegalFunction(
            "input registers are not supported".to_string(),
        ))
    }
}

// ============================================================================
// Edit mailbox
// ============================================================================

/// Receiving side of the edit mailbox
///
/// Holds at most one pending timestamp; rapid edits coalesce into the latest.
#[derive(Debug, Clone)]
pub struct EditReceiver {
    rx: watch::Receiver<Option<DateTime<Utc>>>,
}

impl EditReceiver {
    /// Wait for the next edit.
    ///
    /// Returns `None` once the register file has been dropped.
    pub async fn changed(&mut self) -> Option<DateTime<Utc>> {
        self.rx.changed().await.ok()?;
        *self.rx.borrow_and_update()
    }

    /// Timestamp of the most recent edit, if any, without waiting
    pub fn latest(&self) -> Option<DateTime<Utc>> {
        *self.rx.borrow()
    }
}

// ============================================================================
// Register file
// ============================================================================

/// Copy of both arrays taken under one lock acquisition
#[derive(Debug, Clone, PartialEq)]
pub struct MemorySnapshot {
    pub coils: Vec<bool>,
    pub coil_offset: u16,
    pub registers: Vec<u16>,
    pub register_offset: u16,
}

#[derive(Debug)]
struct Memory {
    coils: Vec<bool>,
    registers: Vec<u16>,
}

#[derive(Debug)]
pub struct RequestHandler {
    memory: RwLock<Memory>,
    coil_offset: u16,
    register_offset: u16,
    last_edit: watch::Sender<Option<DateTime<Utc>>>,
}

/// Index range for `[address, address + quantity)` or an address error
fn checked_range(offset: u16, len: usize, address: u16, quantity: u16) -> Result<Range<usize>> {
    let out_of_range = || MemoryError::AddressOutOfRange { address, quantity };
    let start = usize::from(address.checked_sub(offset).ok_or_else(out_of_range)?);
    let end = start + usize::from(quantity);
    if end > len {
        return Err(out_of_range());
    }
    Ok(start..end)
}

/// Write every value whose address falls inside the array; return those values.
fn write_partial<T: Copy>(memory: &mut [T], offset: u16, address: u16, values: &[T]) -> Vec<T> {
    let offset = u32::from(offset);
    let mut written = Vec::with_capacity(values.len());
    for (i, value) in values.iter().enumerate() {
        let absolute = u32::from(address) + i as u32;
        let Some(index) = absolute.checked_sub(offset) else {
            continue;
        };
        if let Some(slot) = memory.get_mut(index as usize) {
            *slot = *value;
            written.push(*value);
        }
    }
    written
}

impl RequestHandler {
    /// Create a zeroed register file.
    ///
    /// At least one of the two arrays must be non-empty.
    pub fn new(
        coils_len: usize,
        coil_offset: u16,
        registers_len: usize,
        register_offset: u16,
    ) -> Result<Self> {
        if coils_len == 0 && registers_len == 0 {
            return Err(MemoryError::EmptyRegisterFile);
        }
        let (last_edit, _) = watch::channel(None);
        debug!(
            "Register file: {} coils at {}, {} registers at {}",
            coils_len, coil_offset, registers_len, register_offset
        );
        Ok(Self {
            memory: RwLock::new(Memory {
                coils: vec![false; coils_len],
                registers: vec![0; registers_len],
            }),
            coil_offset,
            register_offset,
            last_edit,
        })
    }

    /// Size and position the register file to cover every entry of `layout`.
    pub fn from_layout(layout: &MemoryLayout) -> Result<Self> {
        let (coil_offset, register_offset) = layout.get_memory_offsets();
        let (coils, registers) = layout.get_coils_and_registers();
        Self::new(coils.len(), coil_offset, registers.len(), register_offset)
    }

    pub fn coil_offset(&self) -> u16 {
        self.coil_offset
    }

    pub fn register_offset(&self) -> u16 {
        self.register_offset
    }

    // ------------------------------------------------------------------------
    // Coils
    // ------------------------------------------------------------------------

    pub fn read_coils(&self, address: u16, quantity: u16) -> Result<Vec<bool>> {
        let memory = self.memory.read();
        let range = checked_range(self.coil_offset, memory.coils.len(), address, quantity)?;
        Ok(memory.coils[range].to_vec())
    }

    /// Write coils starting at `address`, skipping values outside the array.
    pub fn write_coils(&self, address: u16, values: &[bool]) -> Result<Vec<bool>> {
        let written = {
            let mut memory = self.memory.write();
            write_partial(&mut memory.coils, self.coil_offset, address, values)
        };
        debug!(
            "Wrote {}/{} coils at {}",
            written.len(),
            values.len(),
            address
        );
        if !written.is_empty() {
            self.notify_edit();
        }
        Ok(written)
    }

    // ------------------------------------------------------------------------
    // Holding registers
    // ------------------------------------------------------------------------

    pub fn read_holding_registers(&self, address: u16, quantity: u16) -> Result<Vec<u16>> {
        let memory = self.memory.read();
        let range = checked_range(
            self.register_offset,
            memory.registers.len(),
            address,
            quantity,
        )?;
        Ok(memory.registers[range].to_vec())
    }

    /// Write registers starting at `address`, skipping values outside the array.
    pub fn write_holding_registers(&self, address: u16, values: &[u16]) -> Result<Vec<u16>> {
        let written = {
            let mut memory = self.memory.write();
            write_partial(&mut memory.registers, self.register_offset, address, values)
        };
        debug!(
            "Wrote {}/{} registers at {}",
            written.len(),
            values.len(),
            address
        );
        if !written.is_empty() {
            self.notify_edit();
        }
        Ok(written)
    }

    /// Set or clear one bit of a holding register and return the new word.
    ///
    /// The read-modify-write runs under a single write lock.
    pub fn write_bit_to_holding_register(&self, address: u16, value: bool, bit: u8) -> Result<u16> {
        if bit >= 16 {
            return Err(MemoryError::BitOutOfRange { address, bit });
        }
        let written = {
            let mut memory = self.memory.write();
            let range = checked_range(self.register_offset, memory.registers.len(), address, 1)?;
            let current = memory.registers[range.start];
            let updated = if value {
                current | (1 << bit)
            } else {
                current & !(1 << bit)
            };
            write_partial(&mut memory.registers, self.register_offset, address, &[updated])
        };
        debug!("Set bit {} of register {} to {}", bit, address, value);
        match written.first() {
            Some(word) => {
                self.notify_edit();
                Ok(*word)
            },
            None => Ok(0),
        }
    }

    // ------------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------------

    pub fn get_coils_and_offset(&self) -> (Vec<bool>, u16) {
        (self.memory.read().coils.clone(), self.coil_offset)
    }

    pub fn get_registers_and_offset(&self) -> (Vec<u16>, u16) {
        (self.memory.read().registers.clone(), self.register_offset)
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let memory = self.memory.read();
        MemorySnapshot {
            coils: memory.coils.clone(),
            coil_offset: self.coil_offset,
            registers: memory.registers.clone(),
            register_offset: self.register_offset,
        }
    }

    // ------------------------------------------------------------------------
    // Edit mailbox
    // ------------------------------------------------------------------------

    /// Replace any pending edit timestamp with the current time. Never blocks.
    pub fn notify_edit(&self) {
        self.last_edit.send_replace(Some(Utc::now()));
    }

    /// Subscribe to edits made after this call.
    pub fn subscribe(&self) -> EditReceiver {
        EditReceiver {
            rx: self.last_edit.subscribe(),
        }
    }
}

impl ModbusHandler for RequestHandler {
    fn handle_coils(&self, request: &HandlerRequest<bool>) -> Result<Vec<bool>> {
        if request.is_write {
            self.write_coils(request.address, &request.args)
        } else {
            self.read_coils(request.address, request.quantity)
        }
    }

    fn handle_holding_registers(&self, request: &HandlerRequest<u16>) -> Result<Vec<u16>> {
        if request.is_write {
            self.write_holding_registers(request.address, &request.args)
        } else {
            self.read_holding_registers(request.address, request.quantity)
        }
    }
}
