//! Configuration management for HapticLink
//!
//! Handles loading, parsing, and validation of the YAML configuration file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::device::DeviceTimings;
use crate::driver::{OutputType, SimulationConfig};
use crate::effect::{
    EffectProperties, PlayStrategy, MAX_BOOST, MAX_PRIORITY, MAX_REPEAT_COUNT, MAX_SPEED,
    MAX_VOLUME, MIN_BOOST, MIN_PRIORITY, MIN_REPEAT_COUNT, MIN_SPEED, MIN_VOLUME,
};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub patterns: Vec<PatternConfig>,
    #[serde(default)]
    pub accumulation: Vec<AccumulationConfig>,
    #[serde(default)]
    pub effects: Vec<EffectConfig>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Which driver implementation backs a device
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    Simulated,
    Native,
}

/// One haptic device
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default)]
    pub driver: DriverKind,
    /// Path or name of the SDK shared library (native driver only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,
    #[serde(default)]
    pub output: OutputType,
    /// Serial number to connect to, 0 for the first device found
    #[serde(default)]
    pub serial: u32,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_boost: Option<i32>,
    /// Patterns loaded as soon as the device is created
    #[serde(default)]
    pub preload: Vec<String>,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// A pattern file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PatternConfig {
    pub path: PathBuf,
    /// Defaults to the file stem
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl PatternConfig {
    pub fn resolved_name(&self) -> Option<String> {
        self.name.clone().or_else(|| {
            self.path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string)
        })
    }
}

/// Accumulation rule applied on a device at startup
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccumulationConfig {
    pub device: String,
    pub main: String,
    pub fallback: String,
    pub time_window: f32,
    /// 0 removes the limit
    #[serde(default)]
    pub max_accumulation: i32,
}

/// A named effect
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EffectConfig {
    pub name: String,
    pub device: String,
    pub pattern: String,
    #[serde(default)]
    pub strategy: PlayStrategy,
    #[serde(default)]
    pub properties: EffectProperties,
}

/// Timing of the main loop and of the asynchronous driver routines
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_status_poll_ms")]
    pub status_poll_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            status_poll_ms: default_status_poll_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            scan_timeout_ms: default_scan_timeout_ms(),
        }
    }
}

impl RuntimeConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn timings(&self) -> DeviceTimings {
        DeviceTimings {
            status_poll: Duration::from_millis(self.status_poll_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            disconnect_timeout: Duration::from_millis(self.disconnect_timeout_ms),
            scan_timeout: Duration::from_millis(self.scan_timeout_ms),
        }
    }
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            anyhow::bail!("At least one device must be defined");
        }

        let mut device_names = HashSet::new();
        for (idx, device) in self.devices.iter().enumerate() {
            if device.name.is_empty() {
                anyhow::bail!("Device {} name cannot be empty", idx);
            }
            if !device_names.insert(device.name.as_str()) {
                anyhow::bail!("Duplicate device name '{}'", device.name);
            }
        }

        let mut pattern_names = HashSet::new();
        for (idx, pattern) in self.patterns.iter().enumerate() {
            let name = pattern
                .resolved_name()
                .filter(|n| !n.is_empty())
                .with_context(|| format!("Pattern {} has no name and no file stem", idx))?;
            if !pattern_names.insert(name.clone()) {
                anyhow::bail!("Duplicate pattern name '{}'", name);
            }
        }

        for device in &self.devices {
            self.validate_device(device, &pattern_names)
                .with_context(|| format!("Invalid device '{}'", device.name))?;
        }

        for rule in &self.accumulation {
            if !device_names.contains(rule.device.as_str()) {
                anyhow::bail!("Accumulation rule references unknown device '{}'", rule.device);
            }
            for pattern in [&rule.main, &rule.fallback] {
                if !pattern_names.contains(pattern) {
                    anyhow::bail!("Accumulation rule references unknown pattern '{}'", pattern);
                }
            }
            if rule.time_window < 0.0 {
                anyhow::bail!(
                    "Accumulation rule for '{}' has negative time window {}",
                    rule.main, rule.time_window
                );
            }
            if rule.max_accumulation < 0 {
                anyhow::bail!(
                    "Accumulation rule for '{}' has negative max_accumulation {}",
                    rule.main, rule.max_accumulation
                );
            }
        }

        let mut effect_names = HashSet::new();
        for effect in &self.effects {
            if effect.name.is_empty() {
                anyhow::bail!("Effect name cannot be empty");
            }
            if !effect_names.insert(effect.name.as_str()) {
                anyhow::bail!("Duplicate effect name '{}'", effect.name);
            }
            if !device_names.contains(effect.device.as_str()) {
                anyhow::bail!("Effect '{}' references unknown device '{}'", effect.name, effect.device);
            }
            if !pattern_names.contains(&effect.pattern) {
                anyhow::bail!("Effect '{}' references unknown pattern '{}'", effect.name, effect.pattern);
            }
            validate_properties(&effect.properties)
                .with_context(|| format!("Invalid properties for effect '{}'", effect.name))?;
        }

        if self.runtime.tick_ms == 0 {
            anyhow::bail!("runtime.tick_ms must be greater than 0");
        }
        if self.runtime.status_poll_ms == 0 {
            anyhow::bail!("runtime.status_poll_ms must be greater than 0");
        }

        Ok(())
    }

    fn validate_device(&self, device: &DeviceConfig, patterns: &HashSet<String>) -> Result<()> {
        if device.driver == DriverKind::Native
            && device.library.as_deref().map_or(true, str::is_empty)
        {
            anyhow::bail!("Native driver requires 'library'");
        }
        if let Some(boost) = device.global_boost {
            if !(0..=100).contains(&boost) {
                anyhow::bail!("global_boost {} out of range (must be 0-100)", boost);
            }
        }
        for name in &device.preload {
            if !patterns.contains(name) {
                anyhow::bail!("Preload references unknown pattern '{}'", name);
            }
        }
        if device.driver == DriverKind::Simulated && device.simulation.slots == 0 {
            anyhow::bail!("simulation.slots must be greater than 0");
        }
        Ok(())
    }
}

fn validate_properties(p: &EffectProperties) -> Result<()> {
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&p.priority) {
        anyhow::bail!("priority {} out of range (must be {}-{})", p.priority, MIN_PRIORITY, MAX_PRIORITY);
    }
    if !(MIN_VOLUME..=MAX_VOLUME).contains(&p.volume) {
        anyhow::bail!("volume {} out of range (must be {}-{})", p.volume, MIN_VOLUME, MAX_VOLUME);
    }
    if !(MIN_SPEED..=MAX_SPEED).contains(&p.speed) {
        anyhow::bail!("speed {} out of range (must be {}-{})", p.speed, MIN_SPEED, MAX_SPEED);
    }
    if !(MIN_REPEAT_COUNT..=MAX_REPEAT_COUNT).contains(&p.repeat_count) {
        anyhow::bail!(
            "repeat_count {} out of range (must be {}-{})",
            p.repeat_count, MIN_REPEAT_COUNT, MAX_REPEAT_COUNT
        );
    }
    if !(MIN_BOOST..=MAX_BOOST).contains(&p.effect_boost) {
        anyhow::bail!("effect_boost {} out of range (must be {}-{})", p.effect_boost, MIN_BOOST, MAX_BOOST);
    }
    for (field, value) in [
        ("repeat_delay", p.repeat_delay),
        ("play_at_time", p.play_at_time),
        ("max_duration", p.max_duration),
    ] {
        if value < 0.0 {
            anyhow::bail!("{} cannot be negative ({})", field, value);
        }
    }
    Ok(())
}

// Default value functions
fn default_true() -> bool { true }
fn default_tick_ms() -> u64 { 16 }
fn default_status_poll_ms() -> u64 { 50 }
fn default_connect_timeout_ms() -> u64 { 10_000 }
fn default_disconnect_timeout_ms() -> u64 { 5_000 }
fn default_scan_timeout_ms() -> u64 { 10_000 }

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
devices:
  - name: vest
    output: bluetooth
    global_boost: 20
    preload: [impact]
    simulation:
      connect_delay_ms: 50
      slots: 2
patterns:
  - path: patterns/impact.spn
  - path: patterns/soft.spn
    name: impact_soft
accumulation:
  - { device: vest, main: impact, fallback: impact_soft, time_window: 0.2, max_accumulation: 3 }
effects:
  - name: hit
    device: vest
    pattern: impact
    strategy: pulled
    properties: { priority: 3, volume: 120 }
"#;

    fn make_test_config() -> AppConfig {
        serde_yaml::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_sample_parses_with_defaults() {
        let config = make_test_config();
        config.validate().unwrap();

        let vest = config.device("vest").unwrap();
        assert_eq!(vest.driver, DriverKind::Simulated);
        assert_eq!(vest.output, OutputType::Bluetooth);
        assert_eq!(vest.serial, 0);
        assert!(vest.auto_connect);
        assert_eq!(vest.simulation.slots, 2);
        assert_eq!(vest.simulation.scan_delay_ms, 200);

        assert_eq!(config.patterns[0].resolved_name().as_deref(), Some("impact"));
        assert_eq!(config.patterns[1].resolved_name().as_deref(), Some("impact_soft"));
        assert_eq!(config.effects[0].strategy, PlayStrategy::Pulled);
        assert_eq!(config.effects[0].properties.speed, 1.0);
        assert_eq!(config.runtime.tick_ms, 16);
        assert_eq!(config.runtime.timings().status_poll, Duration::from_millis(50));
    }

    #[test]
    fn test_rejects_unknown_references() {
        let mut config = make_test_config();
        config.effects[0].pattern = "missing".into();
        assert!(config.validate().is_err());

        let mut config = make_test_config();
        config.accumulation[0].device = "gloves".into();
        assert!(config.validate().is_err());

        let mut config = make_test_config();
        config.devices[0].preload.push("missing".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let mut config = make_test_config();
        config.effects[0].properties.priority = 11;
        let err = config.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("priority 11"));

        let mut config = make_test_config();
        config.effects[0].properties.volume = 251.0;
        assert!(config.validate().is_err());

        let mut config = make_test_config();
        config.devices[0].global_boost = Some(120);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_native_driver_requires_library() {
        let mut config = make_test_config();
        config.devices[0].driver = DriverKind::Native;
        assert!(config.validate().is_err());

        config.devices[0].library = Some("SkineticSDK".into());
        config.validate().unwrap();
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut config = make_test_config();
        config.devices.push(config.devices[0].clone());
        assert!(config.validate().is_err());

        let mut config = make_test_config();
        config.patterns.push(PatternConfig {
            path: "other/impact.spn".into(),
            name: None,
        });
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, SAMPLE)?;

        let config = AppConfig::load(&path).await?;
        assert_eq!(config.devices.len(), 1);

        std::fs::write(&path, "devices: []\n")?;
        let err = AppConfig::load(&path).await.unwrap_err();
        assert!(err.to_string().contains("At least one device"));
        Ok(())
    }

    #[test]
    fn test_bundled_config_is_valid() {
        let config: AppConfig = serde_yaml::from_str(include_str!("../../config.yaml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.effects.len(), 3);
        assert_eq!(config.effects[2].strategy, PlayStrategy::Pulled);
    }
}
