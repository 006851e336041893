//! Session configuration
//!
//! Static per-deployment settings shared by both roles:
//! - the three GATT identifiers (service, read characteristic, write characteristic)
//! - the MTU assumed before negotiation and the per-packet protocol overhead
//! - whether inbound data is echoed back to the peer
//!
//! Stored as pretty JSON when persisted.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::transport::ble::gatt::{
    ATT_OVERHEAD_BYTES, DEFAULT_MTU, GATT_SERVICE_UUID, READ_CHARACTERISTIC_UUID,
    WRITE_CHARACTERISTIC_UUID,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid MTU: {mtu} must exceed the {overhead}-byte protocol overhead")]
    InvalidMtu { mtu: u16, overhead: usize },

    #[error("Identifier {0} is used more than once")]
    DuplicateIdentifier(Uuid),
}

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Fixed identifiers of the published service and its characteristics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentifiers {
    pub service: Uuid,
    pub read_characteristic: Uuid,
    pub write_characteristic: Uuid,
}

impl Default for ServiceIdentifiers {
    fn default() -> Self {
        Self {
            service: GATT_SERVICE_UUID,
            read_characteristic: READ_CHARACTERISTIC_UUID,
            write_characteristic: WRITE_CHARACTERISTIC_UUID,
        }
    }
}

// ============================================================================
// SESSION CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub service: ServiceIdentifiers,

    /// ATT MTU assumed until the link negotiates another one
    pub default_mtu: u16,

    /// Bytes of each packet reserved for the transport's own header
    pub overhead_bytes: usize,

    /// Send every inbound packet straight back to the peer
    pub echo_inbound: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service: ServiceIdentifiers::default(),
            default_mtu: DEFAULT_MTU,
            overhead_bytes: ATT_OVERHEAD_BYTES,
            echo_inbound: false,
        }
    }
}

impl SessionConfig {
    pub fn with_service(mut self, service: ServiceIdentifiers) -> Self {
        self.service = service;
        self
    }

    pub fn with_default_mtu(mut self, mtu: u16) -> Self {
        self.default_mtu = mtu;
        self
    }

    pub fn with_echo(mut self, echo_inbound: bool) -> Self {
        self.echo_inbound = echo_inbound;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if (self.default_mtu as usize) <= self.overhead_bytes {
            return Err(ConfigError::InvalidMtu {
                mtu: self.default_mtu,
                overhead: self.overhead_bytes,
            });
        }

        let ids = &self.service;
        if ids.service == ids.read_characteristic || ids.service == ids.write_characteristic {
            return Err(ConfigError::DuplicateIdentifier(ids.service));
        }
        if ids.read_characteristic == ids.write_characteristic {
            return Err(ConfigError::DuplicateIdentifier(ids.read_characteristic));
        }

        Ok(())
    }

    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: SessionConfig =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        config.validate().context("Invalid session config")?;
        Ok(config)
    }

    /// Load the config at `path`, writing the defaults there first if it is missing
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }

        let config = Self::default();
        config.save(path)?;
        info!("Wrote default session config to {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
