//! Session configuration
//!
//! Stored as pretty-printed JSON. Every field has a default so a config file
//! only needs the values it changes, e.g. `{"link": {"port_name": "/dev/ttyUSB1"}}`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::protocol::{LinkDescriptor, ProtocolError, ProtocolProfile, Strictness};
use crate::waveform::DacReference;

/// Everything a [`Session`](crate::protocol::Session) needs besides the link itself
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Link to open
    pub link: LinkDescriptor,
    /// Firmware protocol profile
    pub profile: ProtocolProfile,
    /// Handling of register fields that do not fit
    pub strictness: Strictness,
    /// DC DAC reference
    pub dac_reference: DacReference,
}

impl SessionConfig {
    pub fn new(link: LinkDescriptor, profile: ProtocolProfile) -> Self {
        Self {
            link,
            profile,
            ..Self::default()
        }
    }

    /// Load from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ProtocolError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ProtocolError> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| ProtocolError::Config(e.to_string()))?;
        config.profile.validate()?;
        Ok(config)
    }

    /// Save as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ProtocolError> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| ProtocolError::Config(e.to_string()))?;
        fs::write(path.as_ref(), content)?;
        Ok(())
    }
}
