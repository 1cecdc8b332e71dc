// src/config.rs - Scan, device and alarm rule configuration

use crate::{
    alarms::AlarmRule,
    error::{PlcError, Result},
    scan_plan::{self, TagNode},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Largest block a single holding register request may ask for.
pub const MAX_PROTOCOL_BLOCK: u16 = 125;

// ============================================================================
// MAIN CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scan: ScanConfig,

    pub devices: Vec<DeviceConfig>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PlcError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.scan.validate()?;

        if self.devices.is_empty() {
            return Err(PlcError::Config("No devices configured".into()));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name.as_str()) {
                return Err(PlcError::Config(format!(
                    "Duplicate device name: {}",
                    device.name
                )));
            }
            device.validate()?;
        }

        Ok(())
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }
}

// ============================================================================
// SCAN CONFIGURATION
// ============================================================================

/// Block merge limits and polling cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Registers per block read
    #[serde(default = "default_max_block_size")]
    pub max_block_size: u16,

    /// Unused registers tolerated between merged footprints
    #[serde(default = "default_max_gap")]
    pub max_gap: u16,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_block_size: default_max_block_size(),
            max_gap: default_max_gap(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<()> {
        if !(scan_plan::MIN_BLOCK_SIZE..=MAX_PROTOCOL_BLOCK).contains(&self.max_block_size) {
            return Err(PlcError::Config(format!(
                "max_block_size must be between {} and {}, got {}",
                scan_plan::MIN_BLOCK_SIZE,
                MAX_PROTOCOL_BLOCK, self.max_block_size
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(PlcError::Config("poll_interval_ms must be greater than 0".into()));
        }
        Ok(())
    }
}

// ============================================================================
// DEVICE CONFIGURATION
// ============================================================================

/// Connection descriptor, tag tree and alarm rules of one PLC.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Bound on each connect or request attempt
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Retries after the first attempt
    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default)]
    pub tags: TagNode,

    #[serde(default)]
    pub alarm_rules: Vec<AlarmRule>,
}

impl DeviceConfig {
    /// Descriptor with default connection settings and no tags.
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: default_port(),
            unit_id: default_unit_id(),
            timeout_ms: default_timeout(),
            retries: default_retries(),
            backoff_ms: default_backoff(),
            max_backoff_ms: default_max_backoff(),
            tags: TagNode::default(),
            alarm_rules: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PlcError::Config("Device name cannot be empty".into()));
        }
        if self.host.trim().is_empty() {
            return Err(PlcError::Config(format!(
                "Device '{}' has an empty host",
                self.name
            )));
        }

        let tags = scan_plan::flatten(&self.tags)
            .map_err(|e| PlcError::Config(format!("Device '{}': {}", self.name, e)))?;
        let keys: HashSet<String> = tags.iter().map(|t| t.key()).collect();

        let mut rule_ids = HashSet::new();
        for rule in &self.alarm_rules {
            if !rule_ids.insert(rule.id.as_str()) {
                return Err(PlcError::Config(format!(
                    "Device '{}': duplicate alarm rule id '{}'",
                    self.name, rule.id
                )));
            }
            if !keys.contains(&rule.tag) {
                return Err(PlcError::Config(format!(
                    "Device '{}': alarm rule '{}' references unknown tag '{}'",
                    self.name, rule.id, rule.tag
                )));
            }
        }

        Ok(())
    }
}

// Default value functions
fn default_max_block_size() -> u16 { 120 }
fn default_max_gap() -> u16 { 2 }
fn default_poll_interval() -> u64 { 1000 }
fn default_port() -> u16 { 502 }
fn default_unit_id() -> u8 { 1 }
fn default_timeout() -> u64 { 3000 }
fn default_retries() -> u32 { 2 }
fn default_backoff() -> u64 { 200 }
fn default_max_backoff() -> u64 { 2000 }

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
scan:
  max_gap: 4
devices:
  - name: main_plc
    host: 192.168.1.10
    tags:
      compressors:
        comp_1:
          suction_pressure: { address: 41226, type: REAL, unit: bar }
          status: { address: 40100, type: DIGITAL, bits: { "BIT 9": PUMP ON } }
    alarm_rules:
      - id: sp_high
        name: Suction pressure high
        tag: compressors/comp_1/suction_pressure
        comparison: above
        warning_enabled: true
        warning_threshold: 75
        alarm_threshold: 80
"#;

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.scan.max_block_size, 120);
        assert_eq!(config.scan.max_gap, 4);
        assert_eq!(config.scan.poll_interval_ms, 1000);

        let device = config.device("main_plc").unwrap();
        assert_eq!(device.port, 502);
        assert_eq!(device.unit_id, 1);
        assert_eq!(device.timeout_ms, 3000);
        assert_eq!(device.retries, 2);
        assert_eq!(device.backoff_ms, 200);
        assert_eq!(device.max_backoff_ms, 2000);
        assert_eq!(device.alarm_rules.len(), 1);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.devices[0].name, "main_plc");

        assert!(matches!(
            Config::from_file("/nonexistent/regscan.yaml"),
            Err(PlcError::Config(_))
        ));
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let yaml = r#"
devices:
  - { name: plc, host: a }
  - { name: plc, host: b }
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate device name"));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(Config::from_yaml("devices: []").is_err());
        assert!(Config::from_yaml("devices: [{ name: plc, host: '' }]").is_err());
        assert!(Config::from_yaml(
            "scan: { max_block_size: 126 }\ndevices: [{ name: plc, host: a }]"
        )
        .is_err());
        assert!(Config::from_yaml(
            "scan: { poll_interval_ms: 0 }\ndevices: [{ name: plc, host: a }]"
        )
        .is_err());
    }

    #[test]
    fn test_rule_must_reference_a_tag() {
        let yaml = SAMPLE.replace(
            "tag: compressors/comp_1/suction_pressure",
            "tag: compressors/comp_9/missing",
        );
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("unknown tag"));
    }
}
