//! Effect instance management
//!
//! Each [`HapticEffect`] tracks the driver instances backing it. The play
//! strategy decides what a new play does to the instances already there;
//! the driver stays the authority on whether an instance still exists.

use std::sync::Arc;

use tracing::{debug, warn};

use super::SkineticDevice;
use crate::driver::EffectId;
use crate::effect::{EffectState, HapticEffect, PlayStrategy};
use crate::error::HapticError;

impl SkineticDevice {
    /// Start a new instance of `effect`
    ///
    /// The effect's pattern must be loaded on this device. On success the new
    /// instance ID is appended to the effect's instance list.
    pub fn play_effect(&self, effect: &mut HapticEffect) -> Result<EffectId, HapticError> {
        match effect.target_device() {
            Some(target) if std::ptr::eq(Arc::as_ptr(target), self) => {}
            _ => return Err(HapticError::NoTargetDevice),
        }
        let pattern = effect
            .target_pattern()
            .ok_or(HapticError::NoTargetPattern)?
            .name
            .clone();
        let pattern_id = self
            .pattern_id(&pattern)
            .ok_or_else(|| HapticError::PatternNotLoaded(pattern.clone()))?;

        match effect.strategy() {
            PlayStrategy::Default => {
                let driver = &self.driver;
                effect
                    .instances_mut()
                    .retain(|id| driver.effect_state(*id) != EffectState::Stop);
                if !effect.instances().is_empty() {
                    debug!(effect = effect.name(), "Play refused, effect already playing");
                    return Err(HapticError::AlreadyPlaying);
                }
            }
            PlayStrategy::Force => {
                let instances = std::mem::take(effect.instances_mut());
                self.stop_instances(effect.name(), instances, 0.0);
            }
            PlayStrategy::Pulled => {}
        }

        let id = self
            .driver
            .play_effect(pattern_id, effect.properties())
            .map_err(|e| self.driver_failure(&format!("play '{}'", effect.name()), e))?;
        effect.instances_mut().push(id);

        debug!(
            device = %self.name,
            effect = effect.name(),
            pattern = %pattern,
            instance = %id,
            live = effect.instances().len(),
            "Effect played"
        );
        Ok(id)
    }

    /// Stop every tracked instance of `effect` with a fadeout in seconds
    ///
    /// All instances are attempted even when some fail, and the instance list
    /// is cleared either way.
    pub fn stop_effect(&self, effect: &mut HapticEffect, fadeout: f32) -> Result<(), HapticError> {
        if effect.instances().is_empty() {
            return Err(HapticError::NoActiveInstances);
        }

        let instances = std::mem::take(effect.instances_mut());
        let (attempted, failed) = self.stop_instances(effect.name(), instances, fadeout);

        debug!(effect = effect.name(), attempted, failed, fadeout, "Effect stopped");
        if failed > 0 {
            return Err(HapticError::StopFailed { failed, attempted });
        }
        Ok(())
    }

    /// Stop the instances still alive, returning `(attempted, failed)`
    fn stop_instances(&self, name: &str, instances: Vec<EffectId>, fadeout: f32) -> (usize, usize) {
        let mut attempted = 0;
        let mut failed = 0;
        for id in instances {
            if self.driver.effect_state(id) == EffectState::Stop {
                continue;
            }
            attempted += 1;
            if let Err(e) = self.driver.stop_effect(id, fadeout) {
                warn!("⚠️ {}: stop {} of '{}' failed: {}", self.name, id, name, e);
                failed += 1;
            }
        }
        (attempted, failed)
    }

    /// Current state of `effect`
    ///
    /// `Pulled` effects report the highest state among their instances and
    /// forget the stopped ones. A `Stop` result clears the instance list.
    pub fn effect_state(&self, effect: &mut HapticEffect) -> EffectState {
        let state = match effect.strategy() {
            PlayStrategy::Default | PlayStrategy::Force => match effect.instances().first() {
                Some(id) => self.driver.effect_state(*id),
                None => EffectState::Stop,
            },
            PlayStrategy::Pulled => {
                let driver = &self.driver;
                let mut highest = EffectState::Stop;
                effect.instances_mut().retain(|id| {
                    let state = driver.effect_state(*id);
                    highest = highest.max(state);
                    state != EffectState::Stop
                });
                highest
            }
        };

        if state == EffectState::Stop {
            effect.instances_mut().clear();
        }
        state
    }
}
