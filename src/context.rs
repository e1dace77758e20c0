//! Application context
//!
//! Holds every device, pattern and effect of a session together with the
//! main-thread dispatcher. Components receive the context (or the pieces
//! they need) explicitly; there is no global instance.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, DeviceConfig, DriverKind};
use crate::device::SkineticDevice;
use crate::dispatch::MainThreadDispatcher;
use crate::driver::{ConnectionState, HapticDriver, NativeDriver, OutputType, SimulatedDriver};
use crate::effect::HapticEffect;
use crate::error::DriverError;
use crate::pattern::PatternAsset;

/// A device and where to connect it
pub struct DeviceEntry {
    pub device: Arc<SkineticDevice>,
    pub output: OutputType,
    pub serial: u32,
    pub auto_connect: bool,
}

pub struct HapticContext {
    devices: BTreeMap<String, DeviceEntry>,
    patterns: BTreeMap<String, Arc<PatternAsset>>,
    effects: BTreeMap<String, HapticEffect>,
    dispatcher: MainThreadDispatcher,
    tick: Duration,
}

impl HapticContext {
    /// Build the session described by `config`
    ///
    /// Relative pattern paths are resolved against `base_dir`. Individual
    /// preload, boost and accumulation failures are logged and skipped.
    pub async fn from_config(config: &AppConfig, base_dir: &Path) -> Result<Self> {
        let mut patterns = BTreeMap::new();
        for entry in &config.patterns {
            let path = base_dir.join(&entry.path);
            let name = entry.resolved_name();
            let asset = PatternAsset::load(&path, name.as_deref()).await?;
            debug!("Pattern '{}' read from {}", asset.name, path.display());
            patterns.insert(asset.name.clone(), Arc::new(asset));
        }
        info!("📂 {} pattern(s) read", patterns.len());

        let mut devices = BTreeMap::new();
        for device_config in &config.devices {
            let device = build_device(device_config, config, base_dir)?;

            let preload: Vec<_> = device_config
                .preload
                .iter()
                .filter_map(|name| patterns.get(name).cloned())
                .collect();
            let loaded = device.preload(&preload);
            if loaded < preload.len() {
                warn!(
                    "⚠️ {}: {} of {} preloaded patterns failed",
                    device.name(),
                    preload.len() - loaded,
                    preload.len()
                );
            }

            if let Some(boost) = device_config.global_boost {
                // Failure already logged by the device
                let _ = device.set_global_boost(boost);
            }

            devices.insert(
                device_config.name.clone(),
                DeviceEntry {
                    device,
                    output: device_config.output,
                    serial: device_config.serial,
                    auto_connect: device_config.auto_connect,
                },
            );
        }

        for rule in &config.accumulation {
            let (Some(entry), Some(main), Some(fallback)) = (
                devices.get(&rule.device),
                patterns.get(&rule.main),
                patterns.get(&rule.fallback),
            ) else {
                continue;
            };
            let device = &entry.device;
            let applied = device
                .load_pattern(main)
                .and_then(|_| device.load_pattern(fallback))
                .and_then(|_| {
                    device.set_accumulation_window(
                        &rule.main,
                        &rule.fallback,
                        rule.time_window,
                        rule.max_accumulation,
                    )
                });
            if applied.is_ok() {
                debug!(device = %rule.device, main = %rule.main, fallback = %rule.fallback, "Accumulation rule applied");
            }
        }

        let mut effects = BTreeMap::new();
        for effect_config in &config.effects {
            let (Some(entry), Some(pattern)) = (
                devices.get(&effect_config.device),
                patterns.get(&effect_config.pattern),
            ) else {
                continue;
            };
            // Effects need their pattern on the device before they can play
            let _ = entry.device.load_pattern(pattern);

            let effect = HapticEffect::new(&effect_config.name)
                .with_strategy(effect_config.strategy)
                .with_properties(effect_config.properties)
                .with_pattern(Arc::clone(pattern))
                .with_device(Arc::clone(&entry.device));
            effects.insert(effect_config.name.clone(), effect);
        }

        info!(
            "✅ Session ready: {} device(s), {} effect(s)",
            devices.len(),
            effects.len()
        );

        Ok(Self {
            devices,
            patterns,
            effects,
            dispatcher: MainThreadDispatcher::new(),
            tick: config.runtime.tick(),
        })
    }

    pub fn device(&self, name: &str) -> Option<&Arc<SkineticDevice>> {
        self.devices.get(name).map(|e| &e.device)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceEntry> {
        self.devices.values()
    }

    pub fn pattern(&self, name: &str) -> Option<&Arc<PatternAsset>> {
        self.patterns.get(name)
    }

    pub fn patterns(&self) -> impl Iterator<Item = &Arc<PatternAsset>> {
        self.patterns.values()
    }

    pub fn effect(&self, name: &str) -> Option<&HapticEffect> {
        self.effects.get(name)
    }

    pub fn effect_mut(&mut self, name: &str) -> Option<&mut HapticEffect> {
        self.effects.get_mut(name)
    }

    pub fn effect_names(&self) -> impl Iterator<Item = &str> {
        self.effects.keys().map(String::as_str)
    }

    pub fn dispatcher(&self) -> &MainThreadDispatcher {
        &self.dispatcher
    }

    /// Interval between two [`tick`](Self::tick) calls
    pub fn tick_interval(&self) -> Duration {
        self.tick
    }

    /// Run the work queued for the primary thread; call once per tick
    pub fn tick(&self) -> usize {
        self.dispatcher.drain()
    }

    /// Observe connection changes of `device` on the primary thread
    ///
    /// `handler` runs during the next [`tick`](Self::tick), never on the
    /// driver's thread.
    pub fn on_connection_change_main<F>(&self, device: &str, handler: F) -> Result<()>
    where
        F: Fn(ConnectionState, Option<DriverError>, u32) + Send + Sync + 'static,
    {
        let entry = self
            .devices
            .get(device)
            .with_context(|| format!("Unknown device '{}'", device))?;

        let handler = Arc::new(handler);
        let dispatcher = self.dispatcher.clone();
        entry
            .device
            .connection()
            .subscribe(Arc::new(move |state, error, serial| {
                let handler = Arc::clone(&handler);
                dispatcher.enqueue(move || handler(state, error, serial));
            }));
        Ok(())
    }

    /// Connect every device flagged `auto_connect`; failures are logged
    pub async fn connect_all(&self) -> usize {
        let mut connected = 0;
        for (name, entry) in &self.devices {
            if !entry.auto_connect {
                continue;
            }
            match entry.device.connect_and_wait(entry.output, entry.serial).await {
                Ok(()) => connected += 1,
                Err(e) => warn!("⚠️ {}: auto-connect failed: {}", name, e),
            }
        }
        connected
    }

    /// Stop all effects and disconnect every device
    pub async fn shutdown(&self) {
        for (name, entry) in &self.devices {
            let device = &entry.device;
            if device.connection_status() == ConnectionState::Disconnected {
                continue;
            }
            let _ = device.stop_all();
            match device.disconnect_and_wait().await {
                Ok(()) => info!("👋 {} disconnected", name),
                Err(e) => warn!("⚠️ {}: disconnect failed: {}", name, e),
            }
        }
    }
}

fn build_device(
    device_config: &DeviceConfig,
    config: &AppConfig,
    base_dir: &Path,
) -> Result<Arc<SkineticDevice>> {
    let driver: Arc<dyn HapticDriver> = match device_config.driver {
        DriverKind::Simulated => Arc::new(SimulatedDriver::new(device_config.simulation.clone())),
        DriverKind::Native => {
            let library = device_config
                .library
                .as_deref()
                .with_context(|| format!("Device '{}' has no SDK library", device_config.name))?;
            let candidate = base_dir.join(library);
            let path = if candidate.exists() {
                candidate
            } else {
                // Let the platform loader search for it
                library.into()
            };
            Arc::new(NativeDriver::load(path)?)
        }
    };

    let device = SkineticDevice::new(&device_config.name, driver, config.runtime.timings())
        .with_context(|| format!("Failed to create device '{}'", device_config.name))?;
    Ok(Arc::new(device))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::EffectState;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    const CONFIG: &str = r#"
devices:
  - name: vest
    global_boost: 30
    preload: [impact]
    simulation:
      connect_delay_ms: 10
      scan_delay_ms: 10
patterns:
  - path: impact.spn
  - path: soft.spn
  - path: ping.spn
accumulation:
  - { device: vest, main: impact, fallback: soft, time_window: 0.5, max_accumulation: 2 }
effects:
  - name: hit
    device: vest
    pattern: impact
    strategy: force
  - name: pings
    device: vest
    pattern: ping
    strategy: pulled
    properties: { repeat_count: 0 }
runtime:
  status_poll_ms: 5
  connect_timeout_ms: 2000
  disconnect_timeout_ms: 2000
"#;

    async fn make_test_context() -> (TempDir, HapticContext) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("impact.spn"), r#"{"boost": 10, "duration": 500}"#).unwrap();
        std::fs::write(dir.path().join("soft.spn"), r#"{"duration": 200}"#).unwrap();
        std::fs::write(dir.path().join("ping.spn"), r#"{"duration": 100}"#).unwrap();

        let config: AppConfig = serde_yaml::from_str(CONFIG).unwrap();
        config.validate().unwrap();
        let context = HapticContext::from_config(&config, dir.path()).await.unwrap();
        (dir, context)
    }

    #[tokio::test]
    async fn test_context_wires_devices_patterns_and_effects() {
        let (_dir, context) = make_test_context().await;
        let vest = context.device("vest").unwrap();

        assert_eq!(vest.global_boost().unwrap(), 30);
        assert!(vest.is_pattern_loaded("impact"));
        assert!(vest.is_pattern_loaded("soft"));
        assert!(vest.is_pattern_loaded("ping"));
        assert_eq!(vest.pattern_boost("impact"), 10);
        assert_eq!(vest.accumulation_rule("impact").unwrap().fallback, "soft");

        let names: Vec<_> = context.effect_names().collect();
        assert_eq!(names, vec!["hit", "pings"]);
    }

    #[tokio::test]
    async fn test_connection_handler_runs_on_tick() {
        let (_dir, context) = make_test_context().await;
        let seen = Arc::new(AtomicBool::new(false));
        let seen_clone = Arc::clone(&seen);
        context
            .on_connection_change_main("vest", move |state, _, _| {
                if state == ConnectionState::Connected {
                    seen_clone.store(true, Ordering::SeqCst);
                }
            })
            .unwrap();

        assert_eq!(context.connect_all().await, 1);
        for _ in 0..100 {
            if context.dispatcher().pending() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!seen.load(Ordering::SeqCst));

        assert_eq!(context.tick(), 1);
        assert!(seen.load(Ordering::SeqCst));

        context.shutdown().await;
        assert_eq!(
            context.device("vest").unwrap().connection_status(),
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_effects_play_through_context() {
        let (_dir, mut context) = make_test_context().await;
        context.connect_all().await;

        let pings = context.effect_mut("pings").unwrap();
        for _ in 0..3 {
            pings.play().unwrap();
        }
        assert_eq!(pings.instances().len(), 3);
        assert_eq!(pings.state(), EffectState::Play);
        pings.stop(0.0).unwrap();
        assert!(pings.instances().is_empty());

        let hit = context.effect_mut("hit").unwrap();
        hit.play().unwrap();
        hit.play().unwrap();
        assert_eq!(hit.instances().len(), 1);

        context.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_device_subscription_fails() {
        let (_dir, context) = make_test_context().await;
        assert!(context.on_connection_change_main("gloves", |_, _, _| {}).is_err());
    }

    #[tokio::test]
    async fn test_bundled_session_builds() {
        let base = Path::new(env!("CARGO_MANIFEST_DIR"));
        let config = AppConfig::load(base.join("config.yaml")).await.unwrap();
        let context = HapticContext::from_config(&config, base).await.unwrap();

        let vest = context.device("vest").unwrap();
        assert_eq!(vest.global_boost().unwrap(), 25);
        assert_eq!(vest.pattern_boost("heartbeat"), -10);
        assert_eq!(context.patterns().count(), 3);
        assert!(context.effect("heart").is_some());
    }
}
