//! TOML configuration for the storage service and its peers.

use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub const DEFAULT_AE_TITLE: &str = "STORESCP";
pub const DEFAULT_PORT: u16 = 11112;
pub const DEFAULT_STORAGE_ROOT: &str = "DICOMStorage";
pub const DEFAULT_MAX_PDU_LENGTH: u32 = 16384;
/// AE titles are at most 16 characters.
const MAX_AE_TITLE_LENGTH: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scp: ScpConfig,
    pub peer: PeerConfig,
}

/// The local storage service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScpConfig {
    /// Called AE title this service answers to.
    pub ae_title: String,
    pub port: u16,
    pub storage_root: PathBuf,
    pub max_pdu_length: u32,
    /// Reject PDUs longer than `max_pdu_length`.
    pub strict: bool,
}

impl Default for ScpConfig {
    fn default() -> Self {
        Self {
            ae_title: DEFAULT_AE_TITLE.to_string(),
            port: DEFAULT_PORT,
            storage_root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            max_pdu_length: DEFAULT_MAX_PDU_LENGTH,
            strict: false,
        }
    }
}

/// A remote node for outbound operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub host: String,
    pub port: u16,
    /// Called AE title of the peer.
    pub ae_title: String,
    /// Our AE title towards the peer.
    pub calling_ae_title: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            ae_title: "ANY-SCP".to_string(),
            calling_ae_title: "DICOM-SLICER".to_string(),
        }
    }
}

impl PeerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Config {
    /// Load from a TOML file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, title) in [
            ("scp.ae_title", &self.scp.ae_title),
            ("peer.ae_title", &self.peer.ae_title),
            ("peer.calling_ae_title", &self.peer.calling_ae_title),
        ] {
            let title = title.trim();
            if title.is_empty() || title.len() > MAX_AE_TITLE_LENGTH {
                return Err(ConfigError::Invalid(format!(
                    "{field} must be 1 to {MAX_AE_TITLE_LENGTH} characters"
                )));
            }
        }
        if self.scp.max_pdu_length != 0 && self.scp.max_pdu_length < 4096 {
            return Err(ConfigError::Invalid(
                "scp.max_pdu_length must be 0 (unlimited) or at least 4096".to_string(),
            ));
        }
        Ok(())
    }
}
