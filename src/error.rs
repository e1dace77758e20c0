//! Error types for the haptic session layer
//!
//! `DriverError` mirrors the fixed code space returned by the device SDK.
//! `HapticError` is what the wrapper layer hands back to callers.

use thiserror::Error;

/// Error codes reported by the device driver
///
/// Codes `-1..=-16` come from the device layer, `-50` from the platform
/// binding, `-93..=-100` from the rendering core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum DriverError {
    #[error("Other")]
    Other,
    #[error("Invalid parameter")]
    InvalidParameter,
    #[error("No device connected")]
    NoDeviceConnected,
    #[error("Output is not supported on this platform")]
    UnsupportedOutput,
    #[error("Invalid Json")]
    InvalidDescription,
    #[error("Device not reachable")]
    DeviceUnreachable,
    #[error("A priority command is waiting to be processed")]
    PriorityCommandPending,
    #[error("No available slot on the board")]
    NoAvailableSlot,
    #[error("No Skinetic instance created")]
    NoInstance,
    #[error("Received an invalid message")]
    InvalidMessage,
    #[error("Process is already running")]
    ProcessAlreadyRunning,
    #[error("A device is already connected")]
    DeviceAlreadyConnected,
    #[error("The initialization of the device has been interrupted")]
    InitializationInterrupted,
    #[error("Play was ignored due to overall trigger strategy")]
    PlayIgnoredByStrategy,
    #[error("PortAudio raised an error")]
    AudioBackendError,
    #[error("An error happened with the socket")]
    SocketError,
    #[error("Error in the platform binding layer")]
    BindingLayer,
    #[error("Core Error: Invalid argument")]
    InvalidArgument,
    #[error("Core Error: Invalid spn")]
    InvalidDescriptionFile,
    #[error("Core Error: Invalid layout")]
    InvalidLayout,
    #[error("Core Error: ID already allocated")]
    IdAlreadyAllocated,
    #[error("Core Error: Invalid sequence ID")]
    InvalidSequenceId,
    #[error("Core Error: Invalid pattern ID")]
    InvalidPatternId,
    #[error("Core Error: Pattern in use")]
    PatternInUse,
    #[error("Core Error: Sequence already set to play")]
    SequenceAlreadyPlaying,
    #[error("Unknown error ({0})")]
    Unknown(i32),
}

impl DriverError {
    /// Map a raw driver return code to an error
    ///
    /// Returns `None` for zero and positive values, which the driver uses
    /// for success (or for an ID on allocation calls).
    pub fn from_code(code: i32) -> Option<Self> {
        let err = match code {
            c if c >= 0 => return None,
            -1 => DriverError::Other,
            -2 => DriverError::InvalidParameter,
            -3 => DriverError::NoDeviceConnected,
            -4 => DriverError::UnsupportedOutput,
            -5 => DriverError::InvalidDescription,
            -6 => DriverError::DeviceUnreachable,
            -7 => DriverError::PriorityCommandPending,
            -8 => DriverError::NoAvailableSlot,
            -9 => DriverError::NoInstance,
            -10 => DriverError::InvalidMessage,
            -11 => DriverError::ProcessAlreadyRunning,
            -12 => DriverError::DeviceAlreadyConnected,
            -13 => DriverError::InitializationInterrupted,
            -14 => DriverError::PlayIgnoredByStrategy,
            -15 => DriverError::AudioBackendError,
            -16 => DriverError::SocketError,
            -50 => DriverError::BindingLayer,
            -100 => DriverError::InvalidArgument,
            -99 => DriverError::InvalidDescriptionFile,
            -98 => DriverError::InvalidLayout,
            -97 => DriverError::IdAlreadyAllocated,
            -96 => DriverError::InvalidSequenceId,
            -95 => DriverError::InvalidPatternId,
            -94 => DriverError::PatternInUse,
            -93 => DriverError::SequenceAlreadyPlaying,
            other => DriverError::Unknown(other),
        };
        Some(err)
    }

    /// Raw code of this error, as the driver reports it
    pub fn code(&self) -> i32 {
        match self {
            DriverError::Other => -1,
            DriverError::InvalidParameter => -2,
            DriverError::NoDeviceConnected => -3,
            DriverError::UnsupportedOutput => -4,
            DriverError::InvalidDescription => -5,
            DriverError::DeviceUnreachable => -6,
            DriverError::PriorityCommandPending => -7,
            DriverError::NoAvailableSlot => -8,
            DriverError::NoInstance => -9,
            DriverError::InvalidMessage => -10,
            DriverError::ProcessAlreadyRunning => -11,
            DriverError::DeviceAlreadyConnected => -12,
            DriverError::InitializationInterrupted => -13,
            DriverError::PlayIgnoredByStrategy => -14,
            DriverError::AudioBackendError => -15,
            DriverError::SocketError => -16,
            DriverError::BindingLayer => -50,
            DriverError::InvalidArgument => -100,
            DriverError::InvalidDescriptionFile => -99,
            DriverError::InvalidLayout => -98,
            DriverError::IdAlreadyAllocated => -97,
            DriverError::InvalidSequenceId => -96,
            DriverError::InvalidPatternId => -95,
            DriverError::PatternInUse => -94,
            DriverError::SequenceAlreadyPlaying => -93,
            DriverError::Unknown(code) => *code,
        }
    }

    /// True for errors raised by the rendering core rather than the device layer
    pub fn is_core_error(&self) -> bool {
        (-100..=-93).contains(&self.code())
    }
}

/// Convert a raw driver return value into a typed result
///
/// Non-negative values pass through unchanged (IDs, status values).
pub fn check(code: i32) -> Result<i32, DriverError> {
    match DriverError::from_code(code) {
        Some(err) => Err(err),
        None => Ok(code),
    }
}

/// Errors surfaced by the device handle and effect manager
#[derive(Debug, Error)]
pub enum HapticError {
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("pattern '{0}' is not loaded on this device")]
    PatternNotLoaded(String),

    #[error("effect has no target device")]
    NoTargetDevice,

    #[error("effect has no target pattern")]
    NoTargetPattern,

    #[error("effect is already playing")]
    AlreadyPlaying,

    #[error("effect has no active instances")]
    NoActiveInstances,

    #[error("{failed} of {attempted} effect instances failed to stop")]
    StopFailed { failed: usize, attempted: usize },

    #[error("invalid connection state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: crate::driver::ConnectionState,
    },

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("connection failed{}", .0.as_ref().map(|e| format!(": {}", e)).unwrap_or_default())]
    ConnectionFailed(Option<DriverError>),

    #[error("pattern registry inconsistent for '{0}'")]
    RegistryInconsistent(String),

    #[error("global boost {0} out of range [0; 100]")]
    BoostOutOfRange(i32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_codes_are_not_errors() {
        assert_eq!(DriverError::from_code(0), None);
        assert_eq!(DriverError::from_code(42), None);
        assert_eq!(check(7), Ok(7));
    }

    #[test]
    fn test_device_codes_map_back_and_forth() {
        for code in (-16..=-1).chain([-50]).chain(-100..=-93) {
            let err = DriverError::from_code(code).unwrap();
            assert_eq!(err.code(), code);
            assert!(!matches!(err, DriverError::Unknown(_)), "code {} unmapped", code);
        }
    }

    #[test]
    fn test_unknown_code_is_preserved() {
        let err = DriverError::from_code(-42).unwrap();
        assert_eq!(err, DriverError::Unknown(-42));
        assert_eq!(err.code(), -42);
        assert_eq!(err.to_string(), "Unknown error (-42)");
    }

    #[test]
    fn test_core_errors_are_flagged() {
        assert!(DriverError::PatternInUse.is_core_error());
        assert!(DriverError::InvalidArgument.is_core_error());
        assert!(!DriverError::NoDeviceConnected.is_core_error());
        assert!(!DriverError::BindingLayer.is_core_error());
    }

    #[test]
    fn test_messages_match_vendor_taxonomy() {
        assert_eq!(DriverError::InvalidDescription.to_string(), "Invalid Json");
        assert_eq!(
            DriverError::NoAvailableSlot.to_string(),
            "No available slot on the board"
        );
        let err = HapticError::ConnectionFailed(Some(DriverError::DeviceUnreachable));
        assert_eq!(err.to_string(), "connection failed: Device not reachable");
        assert_eq!(
            HapticError::ConnectionFailed(None).to_string(),
            "connection failed"
        );
    }
}
