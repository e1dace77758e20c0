//! Haptic effect descriptors
//!
//! A [`HapticEffect`] is the user-authored, playable description of an
//! effect: which pattern to render, on which device, how (play strategy)
//! and with which variations ([`EffectProperties`]). It also tracks the
//! IDs of the driver-side instances currently backing it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::device::SkineticDevice;
use crate::driver::EffectId;
use crate::error::HapticError;
use crate::pattern::PatternAsset;

pub const MIN_VOLUME: f32 = 0.0;
pub const MAX_VOLUME: f32 = 250.0;
pub const MIN_SPEED: f32 = 0.01;
pub const MAX_SPEED: f32 = 100.0;
pub const MIN_REPEAT_COUNT: i32 = 0;
pub const MAX_REPEAT_COUNT: i32 = 255;
pub const MIN_REPEAT_DELAY: f32 = 0.0;
pub const MIN_PLAY_AT: f32 = 0.0;
pub const MIN_MAX_DURATION: f32 = 0.0;
pub const MIN_BOOST: i32 = -100;
pub const MAX_BOOST: i32 = 100;
pub const MIN_PRIORITY: i32 = 1;
pub const MAX_PRIORITY: i32 = 10;

/// State of an effect instance
///
/// Variants are declared in ascending order so that `Ord` gives
/// `Stop < Initialized < Mute < Play`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectState {
    /// Stopped, or the instance no longer exists
    Stop,
    /// Created and waiting to be rendered
    Initialized,
    /// Running but not rendered (lost priority arbitration)
    Mute,
    /// Rendering
    Play,
}

impl EffectState {
    pub fn from_code(code: i32) -> Self {
        match code {
            2 => EffectState::Play,
            1 => EffectState::Mute,
            0 => EffectState::Initialized,
            _ => EffectState::Stop,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            EffectState::Stop => -1,
            EffectState::Initialized => 0,
            EffectState::Mute => 1,
            EffectState::Play => 2,
        }
    }
}

impl std::fmt::Display for EffectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EffectState::Stop => write!(f, "stop"),
            EffectState::Initialized => write!(f, "initialized"),
            EffectState::Mute => write!(f, "mute"),
            EffectState::Play => write!(f, "play"),
        }
    }
}

/// Behavior of `play` while earlier instances of the same effect may still run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayStrategy {
    /// Play once; calls made while an instance is alive are refused
    #[default]
    Default,
    /// Stop the running instance immediately and start a new one
    Force,
    /// Every call starts an independent instance; stop ends them all
    Pulled,
}

/// How an effect instance reproduces its pattern
///
/// Spatial transforms are applied in order: tilting, heading, height.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectProperties {
    /// Priority level in [1; 10], 1 is the highest
    pub priority: i32,
    /// Percentage of the base volume in [0; 250]
    pub volume: f32,
    /// Time scale in [0.01; 100]
    pub speed: f32,
    /// Number of repetitions, 0 repeats until stopped or `max_duration`
    pub repeat_count: i32,
    /// Pause in seconds between repetitions (not affected by speed)
    pub repeat_delay: f32,
    /// Time in the pattern at which the effect starts
    pub play_at_time: f32,
    /// Maximum duration in seconds, 0 removes the limit
    pub max_duration: f32,
    /// Boost in [-100; 100] used instead of the pattern's when overriding
    pub effect_boost: i32,
    pub override_pattern_boost: bool,
    /// Normalized height in [-1; 1], positive translates upwards
    pub height: f32,
    /// Rotation in the horizontal plane, degrees, positive to the left of the vest
    pub heading: f32,
    /// Rotation in the sagittal plane, degrees, positive upwards front to back
    pub tilting: f32,
    pub front_back_inversion: bool,
    pub up_down_inversion: bool,
    pub right_left_inversion: bool,
    /// Overrides `front_back_inversion`
    pub front_back_addition: bool,
    /// Overrides `up_down_inversion`
    pub up_down_addition: bool,
    /// Overrides `right_left_inversion`
    pub right_left_addition: bool,
}

impl Default for EffectProperties {
    fn default() -> Self {
        Self {
            priority: 5,
            volume: 100.0,
            speed: 1.0,
            repeat_count: 1,
            repeat_delay: 0.0,
            play_at_time: 0.0,
            max_duration: 0.0,
            effect_boost: 0,
            override_pattern_boost: false,
            height: 0.0,
            heading: 0.0,
            tilting: 0.0,
            front_back_inversion: false,
            up_down_inversion: false,
            right_left_inversion: false,
            front_back_addition: false,
            up_down_addition: false,
            right_left_addition: false,
        }
    }
}

impl EffectProperties {
    /// Copy of these properties with every bounded field clamped to its range
    pub fn clamped(mut self) -> Self {
        self.priority = self.priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
        self.volume = self.volume.clamp(MIN_VOLUME, MAX_VOLUME);
        self.speed = self.speed.clamp(MIN_SPEED, MAX_SPEED);
        self.repeat_count = self.repeat_count.clamp(MIN_REPEAT_COUNT, MAX_REPEAT_COUNT);
        self.repeat_delay = self.repeat_delay.max(MIN_REPEAT_DELAY);
        self.play_at_time = self.play_at_time.max(MIN_PLAY_AT);
        self.max_duration = self.max_duration.max(MIN_MAX_DURATION);
        self.effect_boost = self.effect_boost.clamp(MIN_BOOST, MAX_BOOST);
        self
    }
}

/// A playable effect bound to a pattern and a device
pub struct HapticEffect {
    name: String,
    strategy: PlayStrategy,
    properties: EffectProperties,
    target_pattern: Option<Arc<PatternAsset>>,
    target_device: Option<Arc<SkineticDevice>>,
    /// Driver instance IDs currently backing this effect
    instances: Vec<EffectId>,
}

impl HapticEffect {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            strategy: PlayStrategy::Default,
            properties: EffectProperties::default(),
            target_pattern: None,
            target_device: None,
            instances: Vec::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: PlayStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_properties(mut self, properties: EffectProperties) -> Self {
        self.properties = properties.clamped();
        self
    }

    pub fn with_pattern(mut self, pattern: Arc<PatternAsset>) -> Self {
        self.target_pattern = Some(pattern);
        self
    }

    pub fn with_device(mut self, device: Arc<SkineticDevice>) -> Self {
        self.target_device = Some(device);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> PlayStrategy {
        self.strategy
    }

    pub fn set_strategy(&mut self, strategy: PlayStrategy) {
        self.strategy = strategy;
    }

    pub fn properties(&self) -> &EffectProperties {
        &self.properties
    }

    /// Replace all properties at once (values are clamped)
    pub fn set_properties(&mut self, properties: EffectProperties) {
        self.properties = properties.clamped();
    }

    pub fn target_pattern(&self) -> Option<&Arc<PatternAsset>> {
        self.target_pattern.as_ref()
    }

    pub fn set_target_pattern(&mut self, pattern: Option<Arc<PatternAsset>>) {
        self.target_pattern = pattern;
    }

    pub fn target_device(&self) -> Option<&Arc<SkineticDevice>> {
        self.target_device.as_ref()
    }

    pub fn set_target_device(&mut self, device: Option<Arc<SkineticDevice>>) {
        self.target_device = device;
    }

    /// Instance IDs currently tracked for this effect
    pub fn instances(&self) -> &[EffectId] {
        &self.instances
    }

    pub(crate) fn instances_mut(&mut self) -> &mut Vec<EffectId> {
        &mut self.instances
    }

    pub fn set_priority(&mut self, priority: i32) {
        self.properties.priority = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.properties.volume = volume.clamp(MIN_VOLUME, MAX_VOLUME);
    }

    pub fn set_speed(&mut self, speed: f32) {
        self.properties.speed = speed.clamp(MIN_SPEED, MAX_SPEED);
    }

    pub fn set_repeat_count(&mut self, repeat_count: i32) {
        self.properties.repeat_count = repeat_count.clamp(MIN_REPEAT_COUNT, MAX_REPEAT_COUNT);
    }

    pub fn set_repeat_delay(&mut self, seconds: f32) {
        self.properties.repeat_delay = seconds.max(MIN_REPEAT_DELAY);
    }

    pub fn set_play_at_time(&mut self, seconds: f32) {
        self.properties.play_at_time = seconds.max(MIN_PLAY_AT);
    }

    pub fn set_max_duration(&mut self, seconds: f32) {
        self.properties.max_duration = seconds.max(MIN_MAX_DURATION);
    }

    /// Use `boost` instead of the pattern's default boost
    pub fn set_effect_boost(&mut self, boost: i32) {
        self.properties.effect_boost = boost.clamp(MIN_BOOST, MAX_BOOST);
        self.properties.override_pattern_boost = true;
    }

    /// Go back to the pattern's default boost
    pub fn clear_effect_boost(&mut self) {
        self.properties.override_pattern_boost = false;
    }

    pub fn set_height_translation(&mut self, height: f32) {
        self.properties.height = height;
    }

    /// Heading rotation in degrees around the vertical axis, positive to the right
    ///
    /// The driver counts heading positive to the left, so it is stored negated.
    pub fn heading_rotation(&self) -> f32 {
        -self.properties.heading
    }

    pub fn set_heading_rotation(&mut self, degrees: f32) {
        self.properties.heading = -degrees;
    }

    pub fn set_tilting_rotation(&mut self, degrees: f32) {
        self.properties.tilting = degrees;
    }

    /// Play on the target device
    pub fn play(&mut self) -> Result<EffectId, HapticError> {
        let device = self.bound_device()?;
        device.play_effect(self)
    }

    /// Stop every instance with a fadeout of `fadeout` seconds
    pub fn stop(&mut self, fadeout: f32) -> Result<(), HapticError> {
        let device = self.bound_device()?;
        device.stop_effect(self, fadeout)
    }

    /// Current state; `Stop` when the effect is not bound to a device and pattern
    pub fn state(&mut self) -> EffectState {
        match self.bound_device() {
            Ok(device) => device.effect_state(self),
            Err(_) => EffectState::Stop,
        }
    }

    fn bound_device(&self) -> Result<Arc<SkineticDevice>, HapticError> {
        let device = self
            .target_device
            .clone()
            .ok_or(HapticError::NoTargetDevice)?;
        if self.target_pattern.is_none() {
            return Err(HapticError::NoTargetPattern);
        }
        Ok(device)
    }
}

impl std::fmt::Debug for HapticEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HapticEffect")
            .field("name", &self.name)
            .field("strategy", &self.strategy)
            .field("properties", &self.properties)
            .field("pattern", &self.target_pattern.as_ref().map(|p| &p.name))
            .field("device", &self.target_device.as_ref().map(|d| d.name()))
            .field("instances", &self.instances)
            .finish()
    }
}
