//! Error types for modbus-memory

use thiserror::Error;

/// Modbus exception codes surfaced to clients when a request cannot be served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusException {
    /// 0x01 - function not supported by this register file
    IllegalFunction,
    /// 0x02 - requested range is outside the configured address space
    IllegalDataAddress,
    /// 0x03 - request payload cannot be applied
    IllegalDataValue,
    /// 0x04 - unrecoverable failure while serving the request
    ServerDeviceFailure,
}

impl ModbusException {
    /// Wire value of the exception code
    pub fn code(&self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::ServerDeviceFailure => 0x04,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MemoryError {
    #[error("Unsupported type '{type_name}' at address {address}")]
    UnsupportedType { address: u16, type_name: String },

    #[error("Bit index {bit} out of range (0-15) at address {address}")]
    BitOutOfRange { address: u16, bit: u8 },

    #[error("Invalid byte order: {0}")]
    InvalidByteOrder(String),

    #[error("Address out of range: {address} (quantity {quantity})")]
    AddressOutOfRange { address: u16, quantity: u16 },

    #[error("Field at address {address} ends at {end}, beyond the 16-bit address space")]
    AddressSpaceExceeded { address: u16, end: u32 },

    #[error("Register file needs at least one coil or one holding register")]
    EmptyRegisterFile,

    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("Illegal function: {0}")]
    IllegalFunction(String),
}

impl MemoryError {
    /// Exception code reported to a Modbus client for this error
    pub fn exception(&self) -> ModbusException {
        match self {
            Self::AddressOutOfRange { .. } | Self::AddressSpaceExceeded { .. } => {
                ModbusException::IllegalDataAddress
            },
            Self::IllegalFunction(_) => ModbusException::IllegalFunction,
            Self::BitOutOfRange { .. } | Self::Conversion(_) => ModbusException::IllegalDataValue,
            Self::UnsupportedType { .. }
            | Self::InvalidByteOrder(_)
            | Self::EmptyRegisterFile => ModbusException::ServerDeviceFailure,
        }
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;
