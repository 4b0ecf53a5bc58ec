//! Node configuration.
//!
//! Loaded from a JSON file; every field has a default so a partial file (or
//! none at all) is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bluetooth::protocol::{BROADCAST_CHANNEL, REQUESTED_MTU};
use crate::bluetooth::session::SessionSettings;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name advertised to peers and carried in private frames.
    pub display_name: String,
    pub requested_mtu: u16,
    pub connect_timeout_secs: u64,
    pub operation_timeout_secs: u64,
    pub scan_restart_secs: u64,
    /// SQLite file for message history. Kept in memory when unset.
    pub database_path: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            display_name: random_display_name(),
            requested_mtu: REQUESTED_MTU,
            connect_timeout_secs: 10,
            operation_timeout_secs: 10,
            scan_restart_secs: 30,
            database_path: None,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: NodeConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would break framing or session setup.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.display_name.trim().is_empty(), "display_name must not be blank");
        anyhow::ensure!(
            !self.display_name.contains('|'),
            "display_name must not contain '|'"
        );
        anyhow::ensure!(
            self.display_name != BROADCAST_CHANNEL,
            "display_name must not be the reserved name {}",
            BROADCAST_CHANNEL
        );
        anyhow::ensure!(self.requested_mtu >= 23, "requested_mtu must be at least 23");
        Ok(())
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            requested_mtu: self.requested_mtu,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            operation_timeout: Duration::from_secs(self.operation_timeout_secs),
        }
    }

    pub fn scan_restart_interval(&self) -> Duration {
        Duration::from_secs(self.scan_restart_secs)
    }
}

fn random_display_name() -> String {
    let id = rand::random::<[u8; 2]>();
    format!("User{:02X}{:02X}", id[0], id[1])
}
