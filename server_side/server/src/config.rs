use std::{collections::HashSet, path::Path, time::Duration};

use anyhow::{anyhow, Context};
use gcode::InterpreterConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cnc::controller::{ControllerKind, ControllerOptions};
use crate::cnc::machine_writer::GRBL_RX_BUFFER;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortFilter {
    pub vendor_id: u16,
    #[serde(default)]
    pub product_id: Option<u16>,
}
impl PortFilter {
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id.map_or(true, |id| id == product_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub controllers: Vec<String>,
    /// When empty, websocket clients need no token.
    pub access_tokens: Vec<String>,
    pub port_filters: Vec<PortFilter>,
    pub baud_rate: u32,
    pub status_interval_ms: u64,
    pub interpreter: InterpreterConfig,
}
impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            controllers: vec!["Grbl".to_string()],
            access_tokens: Vec::new(),
            port_filters: vec![
                // Arduino
                PortFilter { vendor_id: 0x2341, product_id: None },
                // CH340
                PortFilter { vendor_id: 0x1a86, product_id: Some(0x7523) },
                // FTDI
                PortFilter { vendor_id: 0x0403, product_id: Some(0x6001) },
            ],
            baud_rate: 115200,
            status_interval_ms: 250,
            interpreter: InterpreterConfig::default(),
        }
    }
}
impl HubConfig {
    pub fn load(path: &Path) -> anyhow::Result<HubConfig> {
        let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Failed while parsing config {}", path.display()))
    }
    /// Unknown names are skipped with a warning. Having none left is fatal.
    pub fn enabled_kinds(&self) -> anyhow::Result<HashSet<ControllerKind>> {
        let mut kinds = HashSet::new();
        for name in &self.controllers {
            match name.parse::<ControllerKind>() {
                Ok(kind) => { kinds.insert(kind); },
                Err(error) => warn!("Ignoring controller {:?}: {}", name, error),
            }
        }
        if kinds.is_empty() {
            return Err(anyhow!("No valid controller type configured (got {:?})", self.controllers));
        }
        Ok(kinds)
    }
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            status_interval: Duration::from_millis(self.status_interval_ms.max(10)),
            rx_buffer_size: GRBL_RX_BUFFER,
        }
    }
}

pub fn validate_interpreter(config: &InterpreterConfig) -> Result<(), String> {
    if config.max_rates.iter().any(|rate| !rate.is_finite() || *rate <= 0.0) {
        return Err("max_rates must all be positive".to_string());
    }
    if !config.acceleration.is_finite() || config.acceleration <= 0.0 {
        return Err("acceleration must be positive".to_string());
    }
    if !(config.min_feed_rate > 0.0 && config.min_feed_rate <= config.max_feed_rate && config.max_feed_rate.is_finite()) {
        return Err("feed rate limits must satisfy 0 < min_feed_rate <= max_feed_rate".to_string());
    }
    if config.arc_points == 0 || config.curve_points == 0 {
        return Err("arc_points and curve_points must be at least 1".to_string());
    }
    Ok(())
}
