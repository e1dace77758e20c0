//! Pattern registry owned by a device
//!
//! Keeps the name -> driver ID map and the ordered list of loaded assets
//! in lockstep, plus a mirror of the accumulation rule configured for each
//! main pattern.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::SkineticDevice;
use crate::driver::PatternId;
use crate::error::HapticError;
use crate::pattern::PatternAsset;

/// Fallback substitution configured for a main pattern
#[derive(Debug, Clone, PartialEq)]
pub struct AccumulationRule {
    pub fallback: String,
    pub time_window: f32,
    pub max_accumulation: i32,
}

#[derive(Debug, Default)]
pub struct PatternRegistry {
    ids: HashMap<String, PatternId>,
    /// Load order
    loaded: Vec<Arc<PatternAsset>>,
    rules: HashMap<String, AccumulationRule>,
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id_of(&self, name: &str) -> Option<PatternId> {
        self.ids.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ids.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }

    /// Loaded assets, in load order
    pub fn loaded(&self) -> &[Arc<PatternAsset>] {
        &self.loaded
    }

    pub(crate) fn insert(&mut self, asset: Arc<PatternAsset>, id: PatternId) {
        self.ids.insert(asset.name.clone(), id);
        self.loaded.push(asset);
    }

    /// Remove a pattern from both mappings and drop its accumulation rule
    pub(crate) fn remove(&mut self, name: &str) -> Result<PatternId, HapticError> {
        let id = self.ids.remove(name);
        let position = self.loaded.iter().position(|p| p.name == name);

        match (id, position) {
            (Some(id), Some(index)) => {
                self.loaded.remove(index);
                self.rules.remove(name);
                Ok(id)
            }
            (id, position) => {
                error!(
                    "Pattern registry out of sync for '{}' (id: {:?}, listed: {})",
                    name,
                    id,
                    position.is_some()
                );
                // Leave no half entry behind
                if let Some(index) = position {
                    self.loaded.remove(index);
                }
                self.rules.remove(name);
                Err(HapticError::RegistryInconsistent(name.to_string()))
            }
        }
    }

    pub fn rule(&self, main: &str) -> Option<&AccumulationRule> {
        self.rules.get(main)
    }

    /// Record the rule for `main`, replacing any previous one
    pub(crate) fn set_rule(&mut self, main: &str, rule: AccumulationRule) {
        self.rules.insert(main.to_string(), rule);
    }

    pub(crate) fn erase_rule(&mut self, main: &str) -> Option<AccumulationRule> {
        self.rules.remove(main)
    }
}

impl SkineticDevice {
    /// Load a pattern on the driver
    ///
    /// Idempotent: a pattern already loaded returns its ID without calling
    /// the driver again. On failure nothing is recorded.
    pub fn load_pattern(&self, pattern: &Arc<PatternAsset>) -> Result<PatternId, HapticError> {
        let mut registry = self.patterns.lock();
        if let Some(id) = registry.id_of(&pattern.name) {
            debug!(device = %self.name, pattern = %pattern.name, %id, "Pattern already loaded");
            return Ok(id);
        }

        let id = self
            .driver
            .load_pattern_from_json(&pattern.json)
            .map_err(|e| self.driver_failure(&format!("load pattern '{}'", pattern.name), e))?;
        registry.insert(Arc::clone(pattern), id);

        info!("📥 Pattern '{}' loaded on {} as {}", pattern.name, self.name, id);
        Ok(id)
    }

    /// Unload a pattern; fails if it was never loaded
    ///
    /// Running instances derived from the pattern are not affected.
    pub fn unload_pattern(&self, name: &str) -> Result<(), HapticError> {
        let mut registry = self.patterns.lock();
        let id = registry
            .id_of(name)
            .ok_or_else(|| HapticError::PatternNotLoaded(name.to_string()))?;

        self.driver
            .unload_pattern(id)
            .map_err(|e| self.driver_failure(&format!("unload pattern '{}'", name), e))?;
        registry.remove(name)?;

        info!("📤 Pattern '{}' unloaded from {}", name, self.name);
        Ok(())
    }

    /// Load each pattern, skipping the ones that fail; returns how many are loaded
    pub fn preload(&self, patterns: &[Arc<PatternAsset>]) -> usize {
        patterns
            .iter()
            .filter(|p| self.load_pattern(p).is_ok())
            .count()
    }

    pub fn pattern_id(&self, name: &str) -> Option<PatternId> {
        self.patterns.lock().id_of(name)
    }

    pub fn is_pattern_loaded(&self, name: &str) -> bool {
        self.patterns.lock().contains(name)
    }

    /// Loaded patterns, in load order
    pub fn loaded_patterns(&self) -> Vec<Arc<PatternAsset>> {
        self.patterns.lock().loaded().to_vec()
    }

    /// Default boost of a loaded pattern
    ///
    /// Returns 0 for a pattern that is not loaded, which is also a valid
    /// boost value: callers cannot tell the two apart from the result.
    pub fn pattern_boost(&self, name: &str) -> i32 {
        match self.pattern_id(name) {
            Some(id) => self.driver.pattern_intensity_boost(id),
            None => 0,
        }
    }

    /// Configure `fallback` to replace `main` while `main` is already playing
    ///
    /// Replaces any rule previously set for `main`. Both patterns must be
    /// loaded. `max_accumulation` of 0 removes the limit.
    pub fn set_accumulation_window(
        &self,
        main: &str,
        fallback: &str,
        time_window: f32,
        max_accumulation: i32,
    ) -> Result<(), HapticError> {
        let mut registry = self.patterns.lock();
        let main_id = registry
            .id_of(main)
            .ok_or_else(|| HapticError::PatternNotLoaded(main.to_string()))?;
        let fallback_id = registry
            .id_of(fallback)
            .ok_or_else(|| HapticError::PatternNotLoaded(fallback.to_string()))?;

        self.driver
            .set_accumulation_window(main_id, fallback_id, time_window, max_accumulation)
            .map_err(|e| self.driver_failure("set accumulation window", e))?;

        if let Some(previous) = registry.rule(main) {
            debug!(device = %self.name, main, replaced = ?previous, "Accumulation rule replaced");
        }
        registry.set_rule(
            main,
            AccumulationRule {
                fallback: fallback.to_string(),
                time_window,
                max_accumulation,
            },
        );
        Ok(())
    }

    pub fn erase_accumulation_window(&self, main: &str) -> Result<(), HapticError> {
        let mut registry = self.patterns.lock();
        let main_id = registry
            .id_of(main)
            .ok_or_else(|| HapticError::PatternNotLoaded(main.to_string()))?;

        self.driver
            .erase_accumulation_window(main_id)
            .map_err(|e| self.driver_failure("erase accumulation window", e))?;
        if registry.erase_rule(main).is_none() {
            warn!("{}: no accumulation rule was set for '{}'", self.name, main);
        }
        Ok(())
    }

    /// Rule currently configured for `main`
    pub fn accumulation_rule(&self, main: &str) -> Option<AccumulationRule> {
        self.patterns.lock().rule(main).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::make_test_device;
    use crate::driver::{EffectId, HapticDriver};
    use crate::effect::EffectProperties;
    use crate::error::DriverError;
    use proptest::prelude::*;

    fn asset(name: &str) -> Arc<PatternAsset> {
        Arc::new(PatternAsset::new(name, "{}"))
    }

    #[test]
    fn test_insert_keeps_load_order() {
        let mut registry = PatternRegistry::new();
        registry.insert(asset("b"), PatternId(4));
        registry.insert(asset("a"), PatternId(7));

        let names: Vec<_> = registry.loaded().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(registry.id_of("a"), Some(PatternId(7)));
    }

    #[test]
    fn test_remove_clears_both_maps_and_rule() {
        let mut registry = PatternRegistry::new();
        registry.insert(asset("impact"), PatternId(1));
        registry.set_rule(
            "impact",
            AccumulationRule {
                fallback: "soft".into(),
                time_window: 0.2,
                max_accumulation: 3,
            },
        );

        assert_eq!(registry.remove("impact").unwrap(), PatternId(1));
        assert!(registry.is_empty());
        assert!(!registry.contains("impact"));
        assert!(registry.rule("impact").is_none());
    }

    #[test]
    fn test_remove_unknown_is_inconsistent() {
        let mut registry = PatternRegistry::new();
        registry.insert(asset("kept"), PatternId(0));

        assert!(matches!(
            registry.remove("ghost"),
            Err(HapticError::RegistryInconsistent(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_rule_is_last_write_wins() {
        let mut registry = PatternRegistry::new();
        let first = AccumulationRule {
            fallback: "soft".into(),
            time_window: 0.1,
            max_accumulation: 2,
        };
        let second = AccumulationRule {
            fallback: "softer".into(),
            time_window: 0.5,
            max_accumulation: 0,
        };
        registry.set_rule("impact", first);
        registry.set_rule("impact", second.clone());
        assert_eq!(registry.rule("impact"), Some(&second));
    }

    #[test]
    fn test_load_twice_calls_driver_once() {
        let (driver, device) = make_test_device();
        let impact = asset("impact");

        let first = device.load_pattern(&impact).unwrap();
        let second = device.load_pattern(&impact).unwrap();
        assert_eq!(first, second);
        assert_eq!(driver.load_calls(), 1);
        assert_eq!(device.loaded_patterns().len(), 1);
    }

    #[test]
    fn test_failed_load_records_nothing() {
        let (_driver, device) = make_test_device();
        let broken = Arc::new(PatternAsset::new("broken", "not json"));

        let err = device.load_pattern(&broken).unwrap_err();
        assert!(matches!(err, HapticError::Driver(DriverError::InvalidDescription)));
        assert!(!device.is_pattern_loaded("broken"));
        assert!(device.loaded_patterns().is_empty());
    }

    #[test]
    fn test_unload_unknown_pattern_fails_without_change() {
        let (driver, device) = make_test_device();
        device.load_pattern(&asset("impact")).unwrap();

        assert!(matches!(
            device.unload_pattern("ghost"),
            Err(HapticError::PatternNotLoaded(_))
        ));
        assert_eq!(device.loaded_patterns().len(), 1);
        assert_eq!(driver.unload_calls(), 0);
    }

    #[test]
    fn test_unload_keeps_running_instances() {
        let (driver, device) = make_test_device();
        let id = device.load_pattern(&asset("impact")).unwrap();
        let effect = driver
            .play_effect(id, &EffectProperties { repeat_count: 0, ..Default::default() })
            .unwrap();

        device.unload_pattern("impact").unwrap();
        assert!(!device.is_pattern_loaded("impact"));
        assert_ne!(driver.effect_state(effect), crate::effect::EffectState::Stop);
        assert_eq!(driver.effect_state(EffectId(effect.0 + 100)), crate::effect::EffectState::Stop);
    }

    #[test]
    fn test_driver_unload_failure_keeps_registry() {
        let (driver, device) = make_test_device();
        device.load_pattern(&asset("impact")).unwrap();
        driver.fail_next(DriverError::PatternInUse);

        assert!(device.unload_pattern("impact").is_err());
        assert!(device.is_pattern_loaded("impact"));
    }

    #[test]
    fn test_pattern_boost_defaults_to_zero() {
        let (_driver, device) = make_test_device();
        let boosted = Arc::new(PatternAsset::new("boosted", r#"{"boost": 35}"#));
        device.load_pattern(&boosted).unwrap();

        assert_eq!(device.pattern_boost("boosted"), 35);
        assert_eq!(device.pattern_boost("missing"), 0);
    }

    #[test]
    fn test_second_accumulation_rule_replaces_first() {
        let (driver, device) = make_test_device();
        for name in ["impact", "soft", "softer"] {
            device.load_pattern(&asset(name)).unwrap();
        }
        let main = device.pattern_id("impact").unwrap();

        device.set_accumulation_window("impact", "soft", 0.1, 2).unwrap();
        device.set_accumulation_window("impact", "softer", 0.5, 4).unwrap();

        let rule = device.accumulation_rule("impact").unwrap();
        assert_eq!(rule.fallback, "softer");
        assert_eq!(rule.time_window, 0.5);
        assert_eq!(rule.max_accumulation, 4);

        let (fallback, window, max) = driver.accumulation_for(main).unwrap();
        assert_eq!(fallback, device.pattern_id("softer").unwrap());
        assert_eq!(window, 0.5);
        assert_eq!(max, 4);
    }

    #[test]
    fn test_accumulation_requires_loaded_patterns() {
        let (_driver, device) = make_test_device();
        device.load_pattern(&asset("impact")).unwrap();
        assert!(matches!(
            device.set_accumulation_window("impact", "soft", 0.1, 0),
            Err(HapticError::PatternNotLoaded(name)) if name == "soft"
        ));

        device.load_pattern(&asset("soft")).unwrap();
        device.set_accumulation_window("impact", "soft", 0.1, 0).unwrap();
        device.erase_accumulation_window("impact").unwrap();
        assert!(device.accumulation_rule("impact").is_none());
    }

    #[test]
    fn test_preload_skips_failures() {
        let (_driver, device) = make_test_device();
        let loaded = device.preload(&[
            asset("a"),
            Arc::new(PatternAsset::new("bad", "{")),
            asset("b"),
        ]);
        assert_eq!(loaded, 2);
        let names: Vec<_> = device
            .loaded_patterns()
            .iter()
            .map(|p| p.name.clone())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    proptest! {
        #[test]
        fn prop_repeated_loads_hit_driver_once(name in "[a-z]{1,12}", repeats in 1usize..8) {
            let (driver, device) = make_test_device();
            let pattern = asset(&name);
            for _ in 0..repeats {
                prop_assert!(device.load_pattern(&pattern).is_ok());
            }
            prop_assert_eq!(driver.load_calls(), 1);
            prop_assert_eq!(device.loaded_patterns().len(), 1);
        }
    }
}
