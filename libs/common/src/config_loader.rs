//! Configuration file loading
//!
//! A file (TOML, YAML or JSON, chosen by extension) is merged with environment
//! overrides. Environment keys use the given prefix and `__` to separate
//! nested keys, e.g. `MODBUS_SERVER_INPUT__BYTE_ORDER=CDAB`.

use std::path::Path;

use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Error, Result};

/// Figment for `path` plus `env_prefix` overrides
pub fn figment_for<P: AsRef<Path>>(path: P, env_prefix: &str) -> Result<Figment> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::Config(format!(
            "Config file not found: {}",
            path.display()
        )));
    }

    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Config("Config file must have an extension".to_string()))?;

    let figment = match extension {
        "toml" => Figment::new().merge(Toml::file(path)),
        "yaml" | "yml" => Figment::new().merge(Yaml::file(path)),
        "json" => Figment::new().merge(Json::file(path)),
        other => {
            return Err(Error::Config(format!(
                "Unsupported config file format: {}",
                other
            )))
        },
    };

    Ok(figment.merge(Env::prefixed(env_prefix).split("__")))
}

/// Load and deserialize a configuration file with environment overrides.
pub fn load_config<T, P>(path: P, env_prefix: &str) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    debug!("Loading configuration from {}", path.display());
    figment_for(path, env_prefix)?
        .extract()
        .map_err(|e| Error::Config(format!("Failed to load {}: {}", path.display(), e)))
}
