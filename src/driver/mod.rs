//! Device driver capability boundary
//!
//! The vendor SDK is consumed through the [`HapticDriver`] trait. Two
//! implementations exist:
//! - [`NativeDriver`] loads the desktop SDK shared library at runtime
//! - [`SimulatedDriver`] emulates a device in-process (tests, demos, CI)
//!
//! The variant is picked at startup from the device configuration.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::effect::{EffectProperties, EffectState};
use crate::error::DriverError;

pub mod native;
pub mod simulated;

pub use native::NativeDriver;
pub use simulated::{SimulatedDevice, SimulatedDriver, SimulationConfig};

/// Serial number value meaning "connect to the first device found"
pub const ANY_SERIAL_NUMBER: u32 = 0;

/// Serial number reported by the driver when no device is connected
pub const NO_SERIAL_NUMBER: u32 = 0xFFFF_FFFF;

/// Transport used to reach the device
///
/// `Autodetect` tries Bluetooth, then USB, then WiFi.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum OutputType {
    #[default]
    Autodetect = 0,
    Bluetooth = 1,
    Usb = 2,
    Wifi = 3,
}

impl OutputType {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(OutputType::Autodetect),
            1 => Some(OutputType::Bluetooth),
            2 => Some(OutputType::Usb),
            3 => Some(OutputType::Wifi),
            _ => None,
        }
    }
}

impl std::str::FromStr for OutputType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "autodetect" | "auto" => Ok(OutputType::Autodetect),
            "bluetooth" | "bt" => Ok(OutputType::Bluetooth),
            "usb" => Ok(OutputType::Usb),
            "wifi" => Ok(OutputType::Wifi),
            other => Err(format!("unknown output type '{}'", other)),
        }
    }
}

impl std::fmt::Display for OutputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputType::Autodetect => write!(f, "autodetect"),
            OutputType::Bluetooth => write!(f, "bluetooth"),
            OutputType::Usb => write!(f, "usb"),
            OutputType::Wifi => write!(f, "wifi"),
        }
    }
}

/// Hardware family of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Unknown,
    SkineticVest,
    HsdMk2,
}

impl DeviceType {
    const SKINETIC_VEST_CODE: u32 = 0x0110_0101;
    const HSD_MK2_CODE: u32 = 0x0122_FFFF;

    pub fn from_code(code: u32) -> Self {
        match code {
            Self::SKINETIC_VEST_CODE => DeviceType::SkineticVest,
            Self::HSD_MK2_CODE => DeviceType::HsdMk2,
            _ => DeviceType::Unknown,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            DeviceType::Unknown => !0,
            DeviceType::SkineticVest => Self::SKINETIC_VEST_CODE,
            DeviceType::HsdMk2 => Self::HSD_MK2_CODE,
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Unknown => write!(f, "unknown"),
            DeviceType::SkineticVest => write!(f, "Skinetic vest"),
            DeviceType::HsdMk2 => write!(f, "HSD mk.II"),
        }
    }
}

/// Connection lifecycle of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Device is disconnected
    Disconnected,
    /// Connection routine is active
    Connecting,
    /// Device is connected
    Connected,
    /// Releasing all resources
    Disconnecting,
    /// Link was broken, driver is trying to restore it
    Reconnecting,
}

impl ConnectionState {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ConnectionState::Connected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Disconnecting,
            3 => ConnectionState::Reconnecting,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            ConnectionState::Disconnected => -1,
            ConnectionState::Connected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Disconnecting => 2,
            ConnectionState::Reconnecting => 3,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Progress of the asynchronous scan routine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Ongoing,
    Completed,
}

/// Description of a device found during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub output_type: OutputType,
    pub serial_number: u32,
    pub device_type: DeviceType,
    pub device_version: String,
}

/// Pattern ID assigned by the driver on load (always non-negative)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatternId(pub i32);

/// Effect instance ID assigned by the driver on play (always non-negative)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EffectId(pub i32);

impl std::fmt::Display for PatternId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pattern#{}", self.0)
    }
}

impl std::fmt::Display for EffectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "effect#{}", self.0)
    }
}

/// Callback fired by the driver on connection changes
///
/// Invoked on a driver-owned thread with (state, error, serial number).
/// Fired at the end of each connection routine, whether it succeeded or
/// not, and whenever the link fails afterwards.
pub type ConnectionCallback = Arc<dyn Fn(ConnectionState, Option<DriverError>, u32) + Send + Sync>;

/// Driver trait - the vendor SDK surface as seen by the session layer
///
/// Note: All methods take &self so drivers can be shared as `Arc<dyn HapticDriver>`
/// between the primary thread and the driver's own callback thread.
/// Implementations use interior mutability for their state.
pub trait HapticDriver: Send + Sync {
    /// Short driver name for logs (e.g., "native", "simulated")
    fn name(&self) -> &str;

    /// Create the SDK instance. Calling twice is a no-op.
    fn init_instance(&self) -> Result<(), DriverError>;

    /// Release the SDK instance. Calling on an uninitialised driver is a no-op.
    fn deinit_instance(&self);

    /// Format a serial number the way the vendor prints it
    fn serial_number_to_string(&self, serial_number: u32) -> String;

    /// Start the asynchronous scan routine
    fn scan_devices(&self, output: OutputType) -> Result<(), DriverError>;

    /// Status of the scan routine; an error terminates the routine
    fn scan_status(&self) -> Result<ScanStatus, DriverError>;

    /// Devices found by the last completed scan
    fn scanned_devices(&self) -> Vec<DeviceInfo>;

    /// Start the asynchronous connection routine
    ///
    /// With [`ANY_SERIAL_NUMBER`] the first device matching `output` is used.
    fn connect(&self, output: OutputType, serial_number: u32) -> Result<(), DriverError>;

    /// Start releasing the device; effective once the status reads `Disconnected`
    fn disconnect(&self) -> Result<(), DriverError>;

    /// Current connection state, never blocks
    fn connection_status(&self) -> ConnectionState;

    /// Replace the connection callback
    fn set_connection_callback(&self, callback: ConnectionCallback) -> Result<(), DriverError>;

    fn sdk_version(&self) -> String;

    /// Firmware version of the connected device, or an error message
    fn device_version(&self) -> String;

    /// Serial number of the connected device, [`NO_SERIAL_NUMBER`] otherwise
    fn device_serial_number(&self) -> u32;

    fn device_serial_number_as_string(&self) -> String;

    fn device_type(&self) -> DeviceType;

    fn global_intensity_boost(&self) -> Result<i32, DriverError>;

    fn set_global_intensity_boost(&self, boost: i32) -> Result<(), DriverError>;

    /// Load a pattern from its JSON description
    fn load_pattern_from_json(&self, json: &str) -> Result<PatternId, DriverError>;

    fn unload_pattern(&self, pattern: PatternId) -> Result<(), DriverError>;

    /// Default boost of a pattern in [-100; 100], 0 if the ID is invalid
    fn pattern_intensity_boost(&self, pattern: PatternId) -> i32;

    /// Associate a fallback pattern used while `main` is already playing
    ///
    /// A later call for the same `main` overrides the previous association.
    /// `max_accumulation` of 0 removes the limit.
    fn set_accumulation_window(
        &self,
        main: PatternId,
        fallback: PatternId,
        time_window: f32,
        max_accumulation: i32,
    ) -> Result<(), DriverError>;

    fn erase_accumulation_window(&self, main: PatternId) -> Result<(), DriverError>;

    /// Start a new effect instance of a loaded pattern
    fn play_effect(
        &self,
        pattern: PatternId,
        properties: &EffectProperties,
    ) -> Result<EffectId, DriverError>;

    /// Stop an instance with a fadeout of `fadeout` seconds (0 = immediate)
    fn stop_effect(&self, effect: EffectId, fadeout: f32) -> Result<(), DriverError>;

    /// State of an instance; unknown IDs report `Stop`
    fn effect_state(&self, effect: EffectId) -> EffectState;

    fn pause_all(&self) -> Result<(), DriverError>;

    fn resume_all(&self) -> Result<(), DriverError>;

    fn stop_all(&self) -> Result<(), DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_codes() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnecting,
            ConnectionState::Reconnecting,
        ] {
            assert_eq!(ConnectionState::from_code(state.code()), state);
        }
        assert_eq!(ConnectionState::from_code(-7), ConnectionState::Disconnected);
    }

    #[test]
    fn test_device_type_codes() {
        assert_eq!(DeviceType::from_code(0x0110_0101), DeviceType::SkineticVest);
        assert_eq!(DeviceType::from_code(0x0122_FFFF), DeviceType::HsdMk2);
        assert_eq!(DeviceType::from_code(0xFFFF_FFFF), DeviceType::Unknown);
        assert_eq!(DeviceType::Unknown.code(), 0xFFFF_FFFF);
    }

    #[test]
    fn test_output_type_serde_names() {
        let parsed: OutputType = serde_yaml::from_str("bluetooth").unwrap();
        assert_eq!(parsed, OutputType::Bluetooth);
        assert_eq!(OutputType::from_code(2), Some(OutputType::Usb));
        assert_eq!(OutputType::from_code(9), None);
    }
}
