//! `config.json` and the JSON file helpers shared with [`crate::metadata`]

use crate::error::ConfigError;
use log::info;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CONFIG_FILE: &str = "config.json";

/// Settings read from `config.json` in the data directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Game server address clients must report in their handshake
    pub game_address: String,
    /// Whether only allow-listed players may connect
    pub whitelist: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            game_address: "localhost:25565".to_string(),
            whitelist: true,
        }
    }
}

impl ServerConfig {
    /// Loads `config.json` from `data_dir`, writing the defaults if it is missing
    pub async fn load_or_create(data_dir: &Path) -> Result<Self, ConfigError> {
        let path = data_dir.join(CONFIG_FILE);
        match read_json(&path).await? {
            Some(config) => Ok(config),
            None => {
                let config = Self::default();
                info!("Writing default config to {}", path.display());
                write_json(&path, &config).await?;
                Ok(config)
            }
        }
    }
}

/// Reads and parses a JSON file; `Ok(None)` if it does not exist
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ConfigError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| ConfigError::Json {
            path: path.display().to_string(),
            source,
        })
}

/// Writes a value as pretty-printed JSON
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    let json = serde_json::to_vec_pretty(value).map_err(|source| ConfigError::Json {
        path: path.display().to_string(),
        source,
    })?;

    tokio::fs::write(path, json)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })
}
