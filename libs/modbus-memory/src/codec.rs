//! Register codec
//!
//! Converts between raw holding-register words and typed values. Every
//! multi-word value goes through the same two stages:
//!
//! 1. each 16-bit word is marshalled to two bytes (big-endian for `ABCD`/`CDAB`,
//!    little-endian for `DCBA`/`BADC`) and the bytes are concatenated in
//!    address order
//! 2. the buffer is reordered into canonical big-endian form (identity for
//!    `ABCD`, pair swap for `BADC`, word reversal for `CDAB`, full reversal for
//!    `DCBA`)
//!
//! Both stages are involutions, so encoding runs the same reordering backwards
//! and `parse_memory(parse_metric(v)) == v` holds for every order.

use half::f16;
use std::fmt;
use std::str::FromStr;

use crate::error::{MemoryError, Result};
use crate::layout::MemoryEntry;
use crate::metric::FieldValue;
use crate::types::{DataType, RegisterKind};

// ============================================================================
// Byte order
// ============================================================================

/// Byte/word order of multi-register values
///
/// For the 32-bit value `0x3F800000` (1.0f32) stored in two registers:
/// - `BigEndian (ABCD)`: `[0x3F80, 0x0000]`
/// - `LittleEndian (DCBA)`: `[0x0000, 0x3F80]`
/// - `BigEndianSwap (CDAB)`: `[0x0000, 0x3F80]`
/// - `LittleEndianSwap (BADC)`: `[0x3F80, 0x0000]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ByteOrder {
    /// ABCD
    #[default]
    BigEndian,
    /// DCBA
    LittleEndian,
    /// CDAB
    BigEndianSwap,
    /// BADC
    LittleEndianSwap,
}

impl ByteOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BigEndian => "ABCD",
            Self::LittleEndian => "DCBA",
            Self::BigEndianSwap => "CDAB",
            Self::LittleEndianSwap => "BADC",
        }
    }

    fn marshal_word(&self, word: u16) -> [u8; 2] {
        match self {
            Self::BigEndian | Self::BigEndianSwap => word.to_be_bytes(),
            Self::LittleEndian | Self::LittleEndianSwap => word.to_le_bytes(),
        }
    }

    fn unmarshal_word(&self, bytes: [u8; 2]) -> u16 {
        match self {
            Self::BigEndian | Self::BigEndianSwap => u16::from_be_bytes(bytes),
            Self::LittleEndian | Self::LittleEndianSwap => u16::from_le_bytes(bytes),
        }
    }

    /// Reorder a marshalled buffer to or from canonical big-endian form.
    fn reorder(&self, bytes: &mut Vec<u8>) {
        match self {
            Self::BigEndian => {},
            Self::LittleEndianSwap => {
                for pair in bytes.chunks_exact_mut(2) {
                    pair.swap(0, 1);
                }
            },
            Self::BigEndianSwap => {
                *bytes = bytes.chunks(2).rev().flatten().copied().collect();
            },
            Self::LittleEndian => bytes.reverse(),
        }
    }

    /// Words in address order to canonical big-endian bytes
    pub fn words_to_bytes(&self, words: &[u16]) -> Vec<u8> {
        let mut bytes: Vec<u8> = words
            .iter()
            .flat_map(|w| self.marshal_word(*w))
            .collect();
        self.reorder(&mut bytes);
        bytes
    }

    /// Canonical big-endian bytes to words in address order
    ///
    /// The buffer length must be even.
    pub fn bytes_to_words(&self, bytes: &[u8]) -> Vec<u16> {
        let mut bytes = bytes.to_vec();
        self.reorder(&mut bytes);
        bytes
            .chunks_exact(2)
            .map(|c| self.unmarshal_word([c[0], c[1]]))
            .collect()
    }
}

impl FromStr for ByteOrder {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().replace('-', "").as_str() {
            "ABCD" => Ok(Self::BigEndian),
            "DCBA" => Ok(Self::LittleEndian),
            "CDAB" => Ok(Self::BigEndianSwap),
            "BADC" => Ok(Self::LittleEndianSwap),
            _ => Err(MemoryError::InvalidByteOrder(s.to_string())),
        }
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Decoded values
// ============================================================================

/// Typed value decoded from (or cast for) the register file
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
}

impl Value {
    /// Numeric view used by scaling; `None` for booleans and strings
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::I8(v) => Some(f64::from(*v)),
            Self::U8(v) => Some(f64::from(*v)),
            Self::I16(v) => Some(f64::from(*v)),
            Self::U16(v) => Some(f64::from(*v)),
            Self::I32(v) => Some(f64::from(*v)),
            Self::U32(v) => Some(f64::from(*v)),
            Self::I64(v) => Some(*v as f64),
            Self::U64(v) => Some(*v as f64),
            Self::F32(v) => Some(f64::from(*v)),
            Self::F64(v) => Some(*v),
            Self::Bool(_) | Self::Str(_) => None,
        }
    }

    /// Canonical big-endian bytes of a cast value
    fn to_be_bytes(&self, data_type: DataType) -> Vec<u8> {
        match self {
            Self::Bool(b) => u16::from(*b).to_be_bytes().to_vec(),
            Self::I8(v) => v.to_be_bytes().to_vec(),
            Self::U8(v) => v.to_be_bytes().to_vec(),
            Self::I16(v) => v.to_be_bytes().to_vec(),
            Self::U16(v) => v.to_be_bytes().to_vec(),
            Self::I32(v) => v.to_be_bytes().to_vec(),
            Self::U32(v) => v.to_be_bytes().to_vec(),
            Self::I64(v) => v.to_be_bytes().to_vec(),
            Self::U64(v) => v.to_be_bytes().to_vec(),
            Self::F32(v) if data_type == DataType::Float16 => {
                f16::from_f32(*v).to_bits().to_be_bytes().to_vec()
            },
            Self::F32(v) => v.to_be_bytes().to_vec(),
            Self::F64(v) => v.to_be_bytes().to_vec(),
            Self::Str(s) => s.as_bytes().to_vec(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::I8(v) => write!(f, "{}", v),
            Self::U8(v) => write!(f, "{}", v),
            Self::I16(v) => write!(f, "{}", v),
            Self::U16(v) => write!(f, "{}", v),
            Self::I32(v) => write!(f, "{}", v),
            Self::U32(v) => write!(f, "{}", v),
            Self::I64(v) => write!(f, "{}", v),
            Self::U64(v) => write!(f, "{}", v),
            Self::F32(v) => write!(f, "{}", v),
            Self::F64(v) => write!(f, "{}", v),
            Self::Str(v) => f.write_str(v),
        }
    }
}

// ============================================================================
// Decode
// ============================================================================

fn take<const N: usize>(bytes: &[u8], address: u16) -> Result<[u8; N]> {
    bytes
        .get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| {
            MemoryError::Conversion(format!(
                "need {} bytes at address {}, got {}",
                N,
                address,
                bytes.len()
            ))
        })
}

/// Decode one entry from a register file snapshot.
///
/// `coils` and `registers` are zero-based arrays whose index 0 corresponds to
/// `coil_offset` / `register_offset` in the external address space.
///
/// `STRING` entries read `length` words. Every other type reads exactly its
/// own word width; a `length` on those entries only widens the footprint used
/// for overlap and sizing, so the words past the type width are reserved but
/// never decoded.
pub fn parse_memory(
    order: ByteOrder,
    entry: &MemoryEntry,
    coil_offset: u16,
    register_offset: u16,
    coils: &[bool],
    registers: &[u16],
) -> Result<Value> {
    let out_of_range = |quantity: u16| MemoryError::AddressOutOfRange {
        address: entry.address,
        quantity,
    };

    if entry.kind == RegisterKind::Coil {
        let index = entry
            .address
            .checked_sub(coil_offset)
            .ok_or_else(|| out_of_range(1))?;
        return coils
            .get(usize::from(index))
            .copied()
            .map(Value::Bool)
            .ok_or_else(|| out_of_range(1));
    }

    let data_type = entry.data_type.ok_or_else(|| MemoryError::UnsupportedType {
        address: entry.address,
        type_name: String::new(),
    })?;

    let width = match data_type {
        DataType::String => entry.length,
        other => other.word_width(),
    };
    let start = usize::from(
        entry
            .address
            .checked_sub(register_offset)
            .ok_or_else(|| out_of_range(width))?,
    );
    let words = registers
        .get(start..start + usize::from(width))
        .ok_or_else(|| out_of_range(width))?;

    decode_words(order, data_type, entry.bit, entry.scale, entry.address, words)
}

fn decode_numeric(
    order: ByteOrder,
    data_type: DataType,
    address: u16,
    words: &[u16],
) -> Result<Value> {
    let bytes = order.words_to_bytes(words);
    Ok(match data_type {
        DataType::Int16 => Value::I16(i16::from_be_bytes(take(&bytes, address)?)),
        DataType::Uint16 => Value::U16(u16::from_be_bytes(take(&bytes, address)?)),
        DataType::Int32 => Value::I32(i32::from_be_bytes(take(&bytes, address)?)),
        DataType::Uint32 => Value::U32(u32::from_be_bytes(take(&bytes, address)?)),
        DataType::Int64 => Value::I64(i64::from_be_bytes(take(&bytes, address)?)),
        DataType::Uint64 => Value::U64(u64::from_be_bytes(take(&bytes, address)?)),
        DataType::Float16 => {
            Value::F32(f16::from_bits(u16::from_be_bytes(take(&bytes, address)?)).to_f32())
        },
        DataType::Float32 => Value::F32(f32::from_be_bytes(take(&bytes, address)?)),
        DataType::Float64 => Value::F64(f64::from_be_bytes(take(&bytes, address)?)),
        other => {
            return Err(MemoryError::UnsupportedType {
                address,
                type_name: other.to_string(),
            })
        },
    })
}

/// Decode a typed value from the words spanning one field.
pub fn decode_words(
    order: ByteOrder,
    data_type: DataType,
    bit: u8,
    scale: f64,
    address: u16,
    words: &[u16],
) -> Result<Value> {
    let first = || {
        words.first().copied().ok_or_else(|| {
            MemoryError::Conversion(format!("no register data at address {}", address))
        })
    };

    let raw = match data_type {
        DataType::Bit => {
            if bit >= 16 {
                return Err(MemoryError::BitOutOfRange { address, bit });
            }
            return Ok(Value::Bool((first()? >> bit) & 1 != 0));
        },
        DataType::String => {
            // Characters are stored in address order regardless of byte order
            let mut bytes = ByteOrder::BigEndian.words_to_bytes(words);
            while bytes.last() == Some(&0) {
                bytes.pop();
            }
            let s = String::from_utf8(bytes).map_err(|e| {
                MemoryError::Conversion(format!("invalid string at address {}: {}", address, e))
            })?;
            return Ok(Value::Str(s));
        },
        DataType::Int8L => Value::I8((first()? & 0x00ff) as u8 as i8),
        DataType::Int8H => Value::I8((first()? >> 8) as u8 as i8),
        DataType::Uint8L => Value::U8((first()? & 0x00ff) as u8),
        DataType::Uint8H => Value::U8((first()? >> 8) as u8),
        numeric => decode_numeric(order, numeric, address, words)?,
    };

    if scale != 0.0 {
        if let Some(v) = raw.as_f64() {
            return Ok(Value::F64(v * scale));
        }
    }
    Ok(raw)
}

// ============================================================================
// Encode
// ============================================================================

fn conversion(value: &FieldValue, data_type: DataType) -> MemoryError {
    MemoryError::Conversion(format!("cannot convert {:?} to {}", value, data_type))
}

fn float_to_int<T: TryFrom<i128>>(v: f64, value: &FieldValue, data_type: DataType) -> Result<T> {
    if !v.is_finite() {
        return Err(conversion(value, data_type));
    }
    T::try_from(v.round() as i128).map_err(|_| conversion(value, data_type))
}

fn to_int<T: TryFrom<i128>>(value: &FieldValue, data_type: DataType) -> Result<T> {
    let wide: i128 = match value {
        FieldValue::Bool(b) => i128::from(*b),
        FieldValue::Int(v) => i128::from(*v),
        FieldValue::UInt(v) => i128::from(*v),
        FieldValue::Float(v) => return float_to_int(*v, value, data_type),
        FieldValue::String(s) => {
            let s = s.trim();
            match s.parse::<i128>() {
                Ok(v) => v,
                Err(_) => {
                    let v = s.parse::<f64>().map_err(|_| conversion(value, data_type))?;
                    return float_to_int(v, value, data_type);
                },
            }
        },
    };
    T::try_from(wide).map_err(|_| conversion(value, data_type))
}

fn to_float(value: &FieldValue, data_type: DataType) -> Result<f64> {
    match value {
        FieldValue::Bool(b) => Ok(f64::from(u8::from(*b))),
        FieldValue::Int(v) => Ok(*v as f64),
        FieldValue::UInt(v) => Ok(*v as f64),
        FieldValue::Float(v) => Ok(*v),
        FieldValue::String(s) => s.trim().parse().map_err(|_| conversion(value, data_type)),
    }
}

/// Cast an inbound field value to the native representation of `data_type`.
///
/// Integer targets round floats and reject values outside the target range.
pub fn cast_to_type(value: &FieldValue, data_type: DataType) -> Result<Value> {
    Ok(match data_type {
        DataType::Bit => match value {
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "on" => Value::Bool(true),
                "false" | "off" => Value::Bool(false),
                _ => Value::Bool(to_int::<i64>(value, data_type)? != 0),
            },
            _ => Value::Bool(to_float(value, data_type)? != 0.0),
        },
        DataType::Int8L | DataType::Int8H => Value::I8(to_int(value, data_type)?),
        DataType::Uint8L | DataType::Uint8H => Value::U8(to_int(value, data_type)?),
        DataType::Int16 => Value::I16(to_int(value, data_type)?),
        DataType::Uint16 => Value::U16(to_int(value, data_type)?),
        DataType::Int32 => Value::I32(to_int(value, data_type)?),
        DataType::Uint32 => Value::U32(to_int(value, data_type)?),
        DataType::Int64 => Value::I64(to_int(value, data_type)?),
        DataType::Uint64 => Value::U64(to_int(value, data_type)?),
        DataType::Float16 | DataType::Float32 => Value::F32(to_float(value, data_type)? as f32),
        DataType::Float64 => Value::F64(to_float(value, data_type)?),
        DataType::String => match value {
            FieldValue::String(s) => Value::Str(s.clone()),
            other => Value::Str(other.to_string()),
        },
    })
}

/// Encode a field value into the register words for `data_type`.
///
/// A non-zero `scale` divides the value before the cast, undoing the
/// multiplication applied by [`parse_memory`]. `BIT` values produce a single
/// word with only `bit` 0 set or cleared; callers that must preserve the
/// other bits of the register use
/// [`RequestHandler::write_bit_to_holding_register`](crate::RequestHandler::write_bit_to_holding_register).
pub fn parse_metric(
    order: ByteOrder,
    value: &FieldValue,
    data_type: DataType,
    scale: f64,
) -> Result<Vec<u16>> {
    let scaled;
    let value = if scale != 0.0 && !matches!(data_type, DataType::Bit | DataType::String) {
        scaled = FieldValue::Float(to_float(value, data_type)? / scale);
        &scaled
    } else {
        value
    };

    let cast = cast_to_type(value, data_type)?;
    let mut bytes = cast.to_be_bytes(data_type);

    Ok(match data_type {
        DataType::Bit => vec![u16::from(bytes.last().copied().unwrap_or(0) != 0)],
        DataType::Int8L | DataType::Uint8L => vec![u16::from(bytes.first().copied().unwrap_or(0))],
        DataType::Int8H | DataType::Uint8H => {
            vec![u16::from(bytes.first().copied().unwrap_or(0)) << 8]
        },
        DataType::String => {
            if bytes.len() % 2 == 1 {
                bytes.push(0);
            }
            ByteOrder::BigEndian.bytes_to_words(&bytes)
        },
        _ => order.bytes_to_words(&bytes),
    })
}

/// Fit encoded string words to a configured register `length`.
///
/// Longer strings are truncated, shorter ones are zero-padded. A `length` of
/// zero leaves the words untouched.
pub fn fit_string_words(mut words: Vec<u16>, length: u16) -> Vec<u16> {
    if length > 0 {
        words.resize(usize::from(length), 0);
    }
    words
}
