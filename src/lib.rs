//! HapticLink - session layer for Skinetic haptic vests
//!
//! Manages the device connection lifecycle, the per-device pattern registry
//! and the effect instances spawned by each [`effect::HapticEffect`]. The
//! vendor SDK sits behind the [`driver::HapticDriver`] trait, with a native
//! (shared library) and a simulated implementation.

pub mod config;
pub mod context;
pub mod device;
pub mod dispatch;
pub mod driver;
pub mod effect;
pub mod error;
pub mod pattern;

pub use context::HapticContext;
pub use device::SkineticDevice;
pub use effect::{EffectProperties, EffectState, HapticEffect, PlayStrategy};
pub use error::{DriverError, HapticError};
