//! Register kinds and primitive data types of the memory layout

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MemoryError;

/// Address space a field lives in
///
/// Coils and holding registers are disjoint: a coil at address 1 never
/// collides with a register at address 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RegisterKind {
    /// Single read/write bit
    Coil,
    /// 16-bit holding register
    #[default]
    Register,
}

impl RegisterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coil => "coil",
            Self::Register => "register",
        }
    }

    pub fn is_coil(&self) -> bool {
        matches!(self, Self::Coil)
    }
}

impl FromStr for RegisterKind {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "coil" | "coils" => Ok(Self::Coil),
            "register" | "holding" | "holding_register" | "holding_registers" => {
                Ok(Self::Register)
            },
            other => Err(MemoryError::Conversion(format!(
                "unknown register kind '{}'",
                other
            ))),
        }
    }
}

impl TryFrom<String> for RegisterKind {
    type Error = MemoryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RegisterKind> for String {
    fn from(kind: RegisterKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primitive type stored at a register address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DataType {
    Bit,
    Int8L,
    Int8H,
    Uint8L,
    Uint8H,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float16,
    Float32,
    Float64,
    String,
}

impl DataType {
    pub const ALL: [DataType; 15] = [
        Self::Bit,
        Self::Int8L,
        Self::Int8H,
        Self::Uint8L,
        Self::Uint8H,
        Self::Int16,
        Self::Uint16,
        Self::Int32,
        Self::Uint32,
        Self::Int64,
        Self::Uint64,
        Self::Float16,
        Self::Float32,
        Self::Float64,
        Self::String,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bit => "BIT",
            Self::Int8L => "INT8L",
            Self::Int8H => "INT8H",
            Self::Uint8L => "UINT8L",
            Self::Uint8H => "UINT8H",
            Self::Int16 => "INT16",
            Self::Uint16 => "UINT16",
            Self::Int32 => "INT32",
            Self::Uint32 => "UINT32",
            Self::Int64 => "INT64",
            Self::Uint64 => "UINT64",
            Self::Float16 => "FLOAT16",
            Self::Float32 => "FLOAT32",
            Self::Float64 => "FLOAT64",
            Self::String => "STRING",
        }
    }

    /// Width in 16-bit words
    ///
    /// `STRING` has no intrinsic width; its footprint is the entry's `length`.
    pub fn word_width(&self) -> u16 {
        match self {
            Self::Bit
            | Self::Int8L
            | Self::Int8H
            | Self::Uint8L
            | Self::Uint8H
            | Self::Int16
            | Self::Uint16
            | Self::Float16 => 1,
            Self::Int32 | Self::Uint32 | Self::Float32 => 2,
            Self::Int64 | Self::Uint64 | Self::Float64 => 4,
            Self::String => 0,
        }
    }

}

impl FromStr for DataType {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_uppercase();
        Self::ALL
            .iter()
            .find(|t| t.as_str() == upper)
            .copied()
            .ok_or_else(|| MemoryError::Conversion(format!("unknown data type '{}'", s)))
    }
}

impl TryFrom<String> for DataType {
    type Error = MemoryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DataType> for String {
    fn from(data_type: DataType) -> Self {
        data_type.as_str().to_string()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
