//! Modbus register/coil memory engine
//!
//! Lays typed fields out over a coil space and a holding-register space,
//! validates the layout, serves concurrent reads and writes from Modbus
//! clients, and converts between raw register words and metric fields.
//!
//! ```text
//! config -> MemoryLayout -> RequestHandler (coils[], registers[])
//!   read path:  snapshot -> parse_memory -> Metric
//!   write path: Metric -> HashIdGenerator lookup -> parse_metric -> write
//! ```

pub mod codec;
pub mod error;
pub mod handler;
pub mod hash_id;
pub mod layout;
pub mod metric;
pub mod types;

pub use codec::{
    cast_to_type, decode_words, fit_string_words, parse_memory, parse_metric, ByteOrder, Value,
};
pub use error::{MemoryError, ModbusException, Result};
pub use handler::{
    EditReceiver, HandlerRequest, MemorySnapshot, ModbusHandler, RequestHandler,
};
pub use hash_id::HashIdGenerator;
pub use layout::{MemoryEntry, MemoryLayout};
pub use metric::{FieldValue, Metric};
pub use types::{DataType, RegisterKind};
