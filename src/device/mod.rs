//! Device handle
//!
//! A [`SkineticDevice`] wraps one driver instance: it owns the connection
//! monitor and the pattern registry, and every effect played on the unit
//! goes through it. Driver failures are logged here, once, and surfaced as
//! [`HapticError`].
//!
//! Method groups live in submodules:
//! - `connection`: state monitor and awaitable transitions
//! - `patterns`: pattern load/unload and accumulation rules
//! - `effects`: play/stop/state per play strategy

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::driver::{
    ConnectionState, DeviceInfo, DeviceType, HapticDriver, OutputType, ScanStatus,
};
use crate::error::{DriverError, HapticError};

pub mod connection;
mod effects;
pub mod patterns;

pub use connection::ConnectionMonitor;
pub use patterns::{AccumulationRule, PatternRegistry};

/// Polling cadence and upper bounds for asynchronous driver routines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTimings {
    pub status_poll: Duration,
    pub connect_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub scan_timeout: Duration,
}

impl Default for DeviceTimings {
    fn default() -> Self {
        Self {
            status_poll: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(5),
            scan_timeout: Duration::from_secs(10),
        }
    }
}

/// Handle to one haptic device
pub struct SkineticDevice {
    name: String,
    driver: Arc<dyn HapticDriver>,
    connection: ConnectionMonitor,
    patterns: Mutex<PatternRegistry>,
    timings: DeviceTimings,
}

impl SkineticDevice {
    /// Initialise the driver instance and hook its connection callback
    pub fn new(
        name: impl Into<String>,
        driver: Arc<dyn HapticDriver>,
        timings: DeviceTimings,
    ) -> Result<Self, HapticError> {
        let name = name.into();
        driver.init_instance().map_err(|e| {
            warn!("⚠️ {}: driver instance creation failed: {} ({})", name, e, e.code());
            HapticError::Driver(e)
        })?;

        let connection = ConnectionMonitor::new(&name);
        connection.publish(driver.connection_status());

        let monitor = connection.clone();
        if let Err(e) = driver.set_connection_callback(Arc::new(move |state, err, serial| {
            monitor.handle_event(state, err, serial)
        })) {
            warn!("⚠️ {}: connection callback not registered: {}", name, e);
            driver.deinit_instance();
            return Err(HapticError::Driver(e));
        }

        info!("🦺 Device '{}' ready ({} driver, SDK {})", name, driver.name(), driver.sdk_version());

        Ok(Self {
            name,
            driver,
            connection,
            patterns: Mutex::new(PatternRegistry::new()),
            timings,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> &Arc<dyn HapticDriver> {
        &self.driver
    }

    /// Monitor publishing connection changes for this device
    pub fn connection(&self) -> &ConnectionMonitor {
        &self.connection
    }

    pub fn timings(&self) -> DeviceTimings {
        self.timings
    }

    /// Log a driver failure and wrap it
    pub(crate) fn driver_failure(&self, op: &str, err: DriverError) -> HapticError {
        warn!("⚠️ {}: {} failed: {} ({})", self.name, op, err, err.code());
        HapticError::Driver(err)
    }

    // ===== Connection =====

    /// Current connection state, straight from the driver
    pub fn connection_status(&self) -> ConnectionState {
        self.driver.connection_status()
    }

    /// Start the connection routine
    ///
    /// Valid only while disconnected. `serial_number` of
    /// [`ANY_SERIAL_NUMBER`](crate::driver::ANY_SERIAL_NUMBER) picks the first
    /// device found on `output`. Completion is reported through the
    /// connection callback; see [`wait_for_connection`](Self::wait_for_connection).
    pub fn connect(&self, output: OutputType, serial_number: u32) -> Result<(), HapticError> {
        let status = self.connection_status();
        if status != ConnectionState::Disconnected {
            return Err(HapticError::InvalidState {
                expected: "disconnected",
                actual: status,
            });
        }

        info!("🔌 Connecting {} over {} (serial {})", self.name, output, serial_number);
        // Published first: a fast driver may resolve before connect() returns
        self.connection.publish(ConnectionState::Connecting);
        if let Err(e) = self.driver.connect(output, serial_number) {
            self.connection.publish(status);
            return Err(self.driver_failure("connect", e));
        }
        Ok(())
    }

    /// Start releasing the device; valid from any state but `Disconnected`
    pub fn disconnect(&self) -> Result<(), HapticError> {
        let status = self.connection_status();
        if status == ConnectionState::Disconnected {
            return Err(HapticError::InvalidState {
                expected: "connected, connecting or reconnecting",
                actual: status,
            });
        }

        info!("🔌 Disconnecting {}", self.name);
        self.connection.publish(ConnectionState::Disconnecting);
        if let Err(e) = self.driver.disconnect() {
            self.connection.publish(status);
            return Err(self.driver_failure("disconnect", e));
        }
        Ok(())
    }

    /// Resolve once the connection routine terminates
    ///
    /// `Ok` when connected, `ConnectionFailed` (with the driver's error, if
    /// any) when the routine falls back to `Disconnected`.
    pub async fn wait_for_connection(&self) -> Result<(), HapticError> {
        let state = self
            .connection
            .wait_until(
                || self.driver.connection_status(),
                |s| matches!(s, ConnectionState::Connected | ConnectionState::Disconnected),
                self.timings.status_poll,
                self.timings.connect_timeout,
                "connection",
            )
            .await?;

        match state {
            ConnectionState::Connected => Ok(()),
            _ => Err(HapticError::ConnectionFailed(self.connection.last_error())),
        }
    }

    pub async fn connect_and_wait(
        &self,
        output: OutputType,
        serial_number: u32,
    ) -> Result<(), HapticError> {
        self.connect(output, serial_number)?;
        self.wait_for_connection().await
    }

    /// Disconnect and resolve once the driver reports `Disconnected`
    pub async fn disconnect_and_wait(&self) -> Result<(), HapticError> {
        if self.connection_status() == ConnectionState::Disconnected {
            return Ok(());
        }
        if self.connection_status() != ConnectionState::Disconnecting {
            self.disconnect()?;
        }

        self.connection
            .wait_until(
                || self.driver.connection_status(),
                |s| s == ConnectionState::Disconnected,
                self.timings.status_poll,
                self.timings.disconnect_timeout,
                "disconnection",
            )
            .await?;
        Ok(())
    }

    /// Scan for devices on `output` and return what was found
    pub async fn scan(&self, output: OutputType) -> Result<Vec<DeviceInfo>, HapticError> {
        info!("🔍 Scanning for devices over {}", output);
        self.driver
            .scan_devices(output)
            .map_err(|e| self.driver_failure("scan", e))?;

        let poll = async {
            let mut ticker = interval(self.timings.status_poll);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.driver.scan_status() {
                    Ok(ScanStatus::Completed) => return Ok(()),
                    Ok(ScanStatus::Ongoing) => continue,
                    Err(e) => return Err(self.driver_failure("scan", e)),
                }
            }
        };

        timeout(self.timings.scan_timeout, poll)
            .await
            .map_err(|_| HapticError::Timeout("scan"))??;

        let found = self.driver.scanned_devices();
        info!("🔍 Scan complete: {} device(s) found", found.len());
        Ok(found)
    }

    // ===== Device information =====

    pub fn sdk_version(&self) -> String {
        self.driver.sdk_version()
    }

    pub fn device_version(&self) -> String {
        self.driver.device_version()
    }

    pub fn serial_number(&self) -> u32 {
        self.driver.device_serial_number()
    }

    pub fn serial_number_as_string(&self) -> String {
        self.driver.device_serial_number_as_string()
    }

    pub fn device_type(&self) -> DeviceType {
        self.driver.device_type()
    }

    pub fn serial_number_to_string(&self, serial_number: u32) -> String {
        self.driver.serial_number_to_string(serial_number)
    }

    // ===== Global playback =====

    pub fn global_boost(&self) -> Result<i32, HapticError> {
        self.driver
            .global_intensity_boost()
            .map_err(|e| self.driver_failure("get global boost", e))
    }

    /// Set the global intensity boost, in [0; 100]
    pub fn set_global_boost(&self, boost: i32) -> Result<(), HapticError> {
        if !(0..=100).contains(&boost) {
            return Err(HapticError::BoostOutOfRange(boost));
        }
        self.driver
            .set_global_intensity_boost(boost)
            .map_err(|e| self.driver_failure("set global boost", e))?;
        debug!(device = %self.name, boost, "Global boost set");
        Ok(())
    }

    pub fn pause_all(&self) -> Result<(), HapticError> {
        self.driver
            .pause_all()
            .map_err(|e| self.driver_failure("pause all", e))
    }

    pub fn resume_all(&self) -> Result<(), HapticError> {
        self.driver
            .resume_all()
            .map_err(|e| self.driver_failure("resume all", e))
    }

    pub fn stop_all(&self) -> Result<(), HapticError> {
        self.driver
            .stop_all()
            .map_err(|e| self.driver_failure("stop all", e))
    }
}

impl Drop for SkineticDevice {
    fn drop(&mut self) {
        debug!("Releasing driver instance for {}", self.name);
        self.driver.deinit_instance();
    }
}

impl std::fmt::Debug for SkineticDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkineticDevice")
            .field("name", &self.name)
            .field("driver", &self.driver.name())
            .field("state", &self.connection.current())
            .finish()
    }
}
