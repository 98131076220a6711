//! Layout manager configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::device::DeviceTargets;
use crate::error::{LayoutError, Result};
use crate::layout::{FlexFileLayout, RawStripeMap, StripeMap};
use crate::types::{DeviceId, LayoutType};

/// A device registered at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Numeric device id (expanded into the low 8 bytes of the 16-byte id)
    pub id: u64,
    /// Layout type served by the device
    pub layout_type: LayoutType,
    /// Addressing and credential flavors
    #[serde(flatten)]
    pub targets: DeviceTargets,
}

impl DeviceConfig {
    /// The 16-byte device id.
    pub fn device_id(&self) -> DeviceId {
        DeviceId::from_u64(self.id)
    }
}

/// Configuration for the layout manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutManagerConfig {
    /// Layout types this deployment hands out
    pub layout_types: Vec<LayoutType>,
    /// Whether granted segments are released automatically on close
    pub return_on_close: bool,
    /// Stripe geometry for newly placed files
    pub stripe: RawStripeMap,
    /// How long a client has to honor a recall before it is revoked
    pub recall_timeout_ms: u64,
    /// How long a blacklisted client is refused layouts
    pub blacklist_duration_ms: u64,
    /// Misbehavior strikes tolerated before blacklisting
    pub misbehavior_threshold: u32,
    /// Interval of the background recall sweep
    pub sweep_interval_ms: u64,
    /// Devices registered at startup
    pub devices: Vec<DeviceConfig>,
    /// Default tracing filter when RUST_LOG is unset
    pub log_level: String,
}

impl Default for LayoutManagerConfig {
    fn default() -> Self {
        Self {
            layout_types: vec![LayoutType::ObjectsV2, LayoutType::FlexFiles],
            return_on_close: false,
            stripe: RawStripeMap {
                stripe_unit: Some(65536),
                group_width: Some(0),
                group_depth: Some(0),
                mirror_count: Some(0),
                raid_algorithm: Some(1),
            },
            recall_timeout_ms: 30_000,
            blacklist_duration_ms: 60_000,
            misbehavior_threshold: 7,
            sweep_interval_ms: 1_000,
            devices: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

impl LayoutManagerConfig {
    /// Loads a configuration file, choosing the format by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: LayoutManagerConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.layout_types.is_empty() {
            return Err(LayoutError::invalid_argument(
                "at least one layout type must be enabled",
            ));
        }

        let geometry = self.stripe.decode()?;
        if self.layout_types.contains(&LayoutType::FlexFiles)
            && !FlexFileLayout::is_valid_stripe_unit(geometry.stripe_unit)
        {
            return Err(LayoutError::invalid_argument(
                "flex files stripe_unit must be power of 2 and >= 4096",
            ));
        }

        if self.recall_timeout_ms == 0 {
            return Err(LayoutError::invalid_argument("recall_timeout_ms must be > 0"));
        }
        if self.sweep_interval_ms == 0 {
            return Err(LayoutError::invalid_argument("sweep_interval_ms must be > 0"));
        }

        for (i, d) in self.devices.iter().enumerate() {
            if self.devices[..i].iter().any(|o| o.id == d.id) {
                return Err(LayoutError::invalid_argument(format!(
                    "device {} listed twice",
                    d.id
                )));
            }
        }
        Ok(())
    }

    /// Whether a layout type is enabled.
    pub fn enables(&self, layout_type: LayoutType) -> bool {
        self.layout_types.contains(&layout_type)
    }

    /// Decoded stripe geometry.
    pub fn geometry(&self) -> Result<StripeMap> {
        self.stripe.decode()
    }

    /// Recall deadline as a Duration.
    pub fn recall_timeout(&self) -> Duration {
        Duration::from_millis(self.recall_timeout_ms)
    }

    /// Blacklist duration as a Duration.
    pub fn blacklist_duration(&self) -> Duration {
        Duration::from_millis(self.blacklist_duration_ms)
    }

    /// Sweep interval as a Duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
