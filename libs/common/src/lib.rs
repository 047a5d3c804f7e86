//! Basic library shared by the workspace services
//!
//! - logging bootstrap
//! - configuration file loading
//! - command-line arguments
//! - graceful shutdown

pub mod bootstrap_args;
pub mod config_loader;
pub mod error;
pub mod logging;
pub mod shutdown;

pub use bootstrap_args::ServiceArgs;
pub use error::{Error, Result};
