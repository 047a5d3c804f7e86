//! Command-line arguments shared by the workspace services

use clap::Parser;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Parser)]
#[clap(author, version, about)]
pub struct ServiceArgs {
    /// Configuration file (TOML, YAML or JSON); each service has its own default
    #[clap(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the configured level
    #[clap(short = 'l', long)]
    pub log_level: Option<String>,

    /// Disable colored output (useful for log files)
    #[clap(long)]
    pub no_color: bool,

    /// Only validate configuration without starting the service
    #[clap(long)]
    pub validate: bool,
}

impl ServiceArgs {
    /// Configuration path, falling back to the service default
    pub fn config_path<'a>(&'a self, default: &'a Path) -> &'a Path {
        self.config.as_deref().unwrap_or(default)
    }

    /// Log level from the command line, falling back to `configured`
    pub fn log_level_or<'a>(&'a self, configured: &'a str) -> &'a str {
        self.log_level.as_deref().unwrap_or(configured)
    }
}
