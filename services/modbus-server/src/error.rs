//! Error handling for the Modbus server plugins

use modbus_memory::MemoryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration file or value errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Two fields of one measurement share a name
    #[error("Duplicate field '{field}' in measurement '{measurement}'")]
    DuplicateField { measurement: String, field: String },

    /// Inbound metric with no configured register region
    #[error("No register region for metric '{measurement}' with tags {tags}")]
    NoMatchingRegion { measurement: String, tags: String },

    #[error("Invalid server address '{0}': expected tcp://host:port")]
    InvalidServerAddress(String),

    /// Plugin used before `init`
    #[error("State error: {0}")]
    StateError(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<common::Error> for ServerError {
    fn from(err: common::Error) -> Self {
        ServerError::ConfigError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
