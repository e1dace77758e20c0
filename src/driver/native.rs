//! Native driver - the desktop SDK shared library, loaded at runtime
//!
//! Every trait call is forwarded across the vendor C ABI. The connection
//! callback goes through an `extern "C"` trampoline that recovers the Rust
//! closure from the `user_data` pointer and never lets a panic unwind into
//! foreign frames.

use anyhow::{Context, Result};
use libloading::{Library, Symbol};
use parking_lot::Mutex;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use super::{
    ConnectionCallback, ConnectionState, DeviceInfo, DeviceType, EffectId, HapticDriver,
    OutputType, PatternId, ScanStatus,
};
use crate::dispatch::panic_message;
use crate::effect::{EffectProperties, EffectState};
use crate::error::{check, DriverError};

/// Effect properties as laid out by the SDK
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct CEffectProperties {
    priority: c_int,
    volume: f32,
    speed: f32,
    repeat_count: c_int,
    repeat_delay: f32,
    play_at_time: f32,
    max_duration: f32,
    effect_boost: c_int,
    override_pattern_boost: bool,
    height: f32,
    heading: f32,
    tilting: f32,
    front_back_inversion: bool,
    up_down_inversion: bool,
    right_left_inversion: bool,
    front_back_addition: bool,
    up_down_addition: bool,
    right_left_addition: bool,
}

impl From<&EffectProperties> for CEffectProperties {
    fn from(p: &EffectProperties) -> Self {
        Self {
            priority: p.priority,
            volume: p.volume,
            speed: p.speed,
            repeat_count: p.repeat_count,
            repeat_delay: p.repeat_delay,
            play_at_time: p.play_at_time,
            max_duration: p.max_duration,
            effect_boost: p.effect_boost,
            override_pattern_boost: p.override_pattern_boost,
            height: p.height,
            heading: p.heading,
            tilting: p.tilting,
            front_back_inversion: p.front_back_inversion,
            up_down_inversion: p.up_down_inversion,
            right_left_inversion: p.right_left_inversion,
            front_back_addition: p.front_back_addition,
            up_down_addition: p.up_down_addition,
            right_left_addition: p.right_left_addition,
        }
    }
}

/// Scanned device node, a singly linked list owned by the SDK
#[repr(C)]
struct CDeviceInfo {
    output_type: c_int,
    serial_number: u32,
    device_type: u32,
    device_version: *const c_char,
    next: *const CDeviceInfo,
}

/// Empty log file name: SDK file logging disabled
const NO_LOG_FILE: &[u8] = b"\0";

type RawCallback = extern "C" fn(c_int, c_int, u32, *mut c_void);

/// Function table resolved from the library
///
/// Plain fn pointers copied out of their symbols; valid as long as the
/// `Library` they came from stays loaded.
struct SdkApi {
    serial_number_to_string: unsafe extern "C" fn(u32) -> *const c_char,
    create_instance: unsafe extern "C" fn(*const c_char) -> c_int,
    free_instance: unsafe extern "C" fn(c_int),
    scan_devices: unsafe extern "C" fn(c_int, c_int) -> c_int,
    scan_status: unsafe extern "C" fn(c_int) -> c_int,
    first_scanned_device: unsafe extern "C" fn(c_int) -> *const CDeviceInfo,
    connect_device: unsafe extern "C" fn(c_int, c_int, u32) -> c_int,
    disconnect_device: unsafe extern "C" fn(c_int) -> c_int,
    connection_status: unsafe extern "C" fn(c_int) -> c_int,
    set_connection_callback: unsafe extern "C" fn(c_int, RawCallback, *mut c_void) -> c_int,
    sdk_version: unsafe extern "C" fn(c_int) -> *const c_char,
    serial_number: unsafe extern "C" fn(c_int) -> u32,
    serial_number_as_string: unsafe extern "C" fn(c_int) -> *const c_char,
    device_version: unsafe extern "C" fn(c_int) -> *const c_char,
    device_type: unsafe extern "C" fn(c_int) -> u32,
    get_global_boost: unsafe extern "C" fn(c_int) -> c_int,
    set_global_boost: unsafe extern "C" fn(c_int, c_int) -> c_int,
    load_pattern: unsafe extern "C" fn(c_int, *const c_char) -> c_int,
    unload_pattern: unsafe extern "C" fn(c_int, c_int) -> c_int,
    pattern_boost: unsafe extern "C" fn(c_int, c_int) -> c_int,
    set_accumulation: unsafe extern "C" fn(c_int, c_int, c_int, f32, c_int) -> c_int,
    erase_accumulation: unsafe extern "C" fn(c_int, c_int) -> c_int,
    play_effect: unsafe extern "C" fn(c_int, c_int, CEffectProperties) -> c_int,
    stop_effect: unsafe extern "C" fn(c_int, c_int, f32) -> c_int,
    effect_state: unsafe extern "C" fn(c_int, c_int) -> c_int,
    pause_all: unsafe extern "C" fn(c_int) -> c_int,
    resume_all: unsafe extern "C" fn(c_int) -> c_int,
    stop_all: unsafe extern "C" fn(c_int) -> c_int,
}

/// Copy a function pointer out of the library
///
/// # Safety
/// `T` must be the exact fn type the SDK header declares for `name`.
unsafe fn resolve<T: Copy>(lib: &Library, path: &Path, name: &str) -> Result<T> {
    let symbol_name = format!("{}\0", name);
    let symbol: Symbol<T> = lib
        .get(symbol_name.as_bytes())
        .with_context(|| format!("missing symbol `{}` in {}", name, path.display()))?;
    Ok(*symbol)
}

impl SdkApi {
    fn resolve(lib: &Library, path: &Path) -> Result<Self> {
        // SAFETY: Each field's fn type matches the SDK header for its symbol.
        unsafe {
            Ok(Self {
                serial_number_to_string: resolve(lib, path, "ski_serialNumberToString")?,
                create_instance: resolve(lib, path, "ski_createSDKInstance")?,
                free_instance: resolve(lib, path, "ski_freeSDKInstance")?,
                scan_devices: resolve(lib, path, "ski_scanDevices")?,
                scan_status: resolve(lib, path, "ski_scanStatus")?,
                first_scanned_device: resolve(lib, path, "ski_getFirstScannedDevice")?,
                connect_device: resolve(lib, path, "ski_connectDevice")?,
                disconnect_device: resolve(lib, path, "ski_disconnectDevice")?,
                connection_status: resolve(lib, path, "ski_connectionStatus")?,
                set_connection_callback: resolve(lib, path, "ski_setConnectionCallback")?,
                sdk_version: resolve(lib, path, "ski_getSDKVersion")?,
                serial_number: resolve(lib, path, "ski_getSkineticSerialNumber")?,
                serial_number_as_string: resolve(lib, path, "ski_getSkineticSerialNumberAsString")?,
                device_version: resolve(lib, path, "ski_getSkineticVersion")?,
                device_type: resolve(lib, path, "ski_getSkineticType")?,
                get_global_boost: resolve(lib, path, "ski_getGlobalIntensityBoost")?,
                set_global_boost: resolve(lib, path, "ski_setGlobalIntensityBoost")?,
                load_pattern: resolve(lib, path, "ski_loadPatternFromJSON")?,
                unload_pattern: resolve(lib, path, "ski_unloadPattern")?,
                pattern_boost: resolve(lib, path, "ski_getPatternIntensityBoost")?,
                set_accumulation: resolve(lib, path, "ski_setAccumulationWindowToPattern")?,
                erase_accumulation: resolve(lib, path, "ski_eraseAccumulationWindowToPattern")?,
                play_effect: resolve(lib, path, "ski_playEffect")?,
                stop_effect: resolve(lib, path, "ski_stopEffect")?,
                effect_state: resolve(lib, path, "ski_effectState")?,
                pause_all: resolve(lib, path, "ski_pauseAll")?,
                resume_all: resolve(lib, path, "ski_resumeAll")?,
                stop_all: resolve(lib, path, "ski_stopAll")?,
            })
        }
    }
}

/// Read an SDK-owned C string; null reads as empty
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that stays valid
/// for the duration of the call.
unsafe fn read_c_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

extern "C" fn connection_trampoline(status: c_int, error: c_int, serial: u32, user_data: *mut c_void) {
    if user_data.is_null() {
        return;
    }
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        // SAFETY: user_data is the address of the boxed callback registered in
        // set_connection_callback, kept alive until the instance is freed.
        let callback = unsafe { &*(user_data as *const ConnectionCallback) };
        callback(
            ConnectionState::from_code(status),
            DriverError::from_code(error),
            serial,
        );
    }));
    if let Err(payload) = outcome {
        error!("💥 Panic in connection callback: {}", panic_message(payload));
    }
}

/// Driver backed by the vendor shared library
pub struct NativeDriver {
    api: SdkApi,
    path: PathBuf,
    instance: Mutex<Option<c_int>>,
    /// Boxed so its address can be handed to the SDK as user data
    callback: Mutex<Option<Box<ConnectionCallback>>>,
    // Declared last so it unloads after everything that points into it
    _library: Library,
}

impl NativeDriver {
    /// Load the SDK library and resolve its symbols
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        // SAFETY: Loading a foreign library runs its initialisers; the SDK is trusted.
        let library = unsafe { Library::new(&path) }
            .with_context(|| format!("failed to load haptics SDK from {}", path.display()))?;
        let api = SdkApi::resolve(&library, &path)?;

        info!("📚 Haptics SDK loaded from {}", path.display());
        Ok(Self {
            api,
            path,
            instance: Mutex::new(None),
            callback: Mutex::new(None),
            _library: library,
        })
    }

    pub fn library_path(&self) -> &Path {
        &self.path
    }

    fn sdk_id(&self) -> Result<c_int, DriverError> {
        (*self.instance.lock()).ok_or(DriverError::NoInstance)
    }

    /// SDK ID, or -1 for the queries that report their own failure
    fn sdk_id_or_invalid(&self) -> c_int {
        (*self.instance.lock()).unwrap_or(-1)
    }
}

impl HapticDriver for NativeDriver {
    fn name(&self) -> &str {
        "native"
    }

    fn init_instance(&self) -> Result<(), DriverError> {
        let mut instance = self.instance.lock();
        if instance.is_some() {
            return Ok(());
        }
        // SAFETY: Empty log file name is accepted and disables SDK file logging.
        let id = check(unsafe { (self.api.create_instance)(NO_LOG_FILE.as_ptr().cast()) })?;
        debug!(sdk_id = id, "SDK instance created");
        *instance = Some(id);
        Ok(())
    }

    fn deinit_instance(&self) {
        let Some(id) = self.instance.lock().take() else {
            return;
        };
        // SAFETY: id came from create_instance and is freed exactly once.
        unsafe { (self.api.free_instance)(id) };
        // The SDK no longer calls back once the instance is freed
        self.callback.lock().take();
        debug!(sdk_id = id, "SDK instance freed");
    }

    fn serial_number_to_string(&self, serial_number: u32) -> String {
        // SAFETY: Returns a static or SDK-owned string.
        unsafe { read_c_string((self.api.serial_number_to_string)(serial_number)) }
    }

    fn scan_devices(&self, output: OutputType) -> Result<(), DriverError> {
        let id = self.sdk_id()?;
        // SAFETY: Plain value arguments.
        check(unsafe { (self.api.scan_devices)(id, output as c_int) }).map(|_| ())
    }

    fn scan_status(&self) -> Result<ScanStatus, DriverError> {
        let id = self.sdk_id()?;
        // SAFETY: Plain value arguments.
        match check(unsafe { (self.api.scan_status)(id) })? {
            0 => Ok(ScanStatus::Completed),
            _ => Ok(ScanStatus::Ongoing),
        }
    }

    fn scanned_devices(&self) -> Vec<DeviceInfo> {
        let Ok(id) = self.sdk_id() else {
            return Vec::new();
        };
        let mut found = Vec::new();
        // SAFETY: The list belongs to the SDK and stays valid until the next scan.
        unsafe {
            let mut node = (self.api.first_scanned_device)(id);
            while let Some(info) = node.as_ref() {
                found.push(DeviceInfo {
                    output_type: OutputType::from_code(info.output_type).unwrap_or_default(),
                    serial_number: info.serial_number,
                    device_type: DeviceType::from_code(info.device_type),
                    device_version: read_c_string(info.device_version),
                });
                node = info.next;
            }
        }
        found
    }

    fn connect(&self, output: OutputType, serial_number: u32) -> Result<(), DriverError> {
        let id = self.sdk_id()?;
        // SAFETY: Plain value arguments.
        check(unsafe { (self.api.connect_device)(id, output as c_int, serial_number) }).map(|_| ())
    }

    fn disconnect(&self) -> Result<(), DriverError> {
        let id = self.sdk_id()?;
        // SAFETY: Plain value arguments.
        check(unsafe { (self.api.disconnect_device)(id) }).map(|_| ())
    }

    fn connection_status(&self) -> ConnectionState {
        let Ok(id) = self.sdk_id() else {
            return ConnectionState::Disconnected;
        };
        // SAFETY: Plain value arguments.
        ConnectionState::from_code(unsafe { (self.api.connection_status)(id) })
    }

    fn set_connection_callback(&self, callback: ConnectionCallback) -> Result<(), DriverError> {
        let id = self.sdk_id()?;
        let mut slot = self.callback.lock();
        let boxed = Box::new(callback);
        let user_data = &*boxed as *const ConnectionCallback as *mut c_void;

        // SAFETY: The trampoline matches the SDK callback signature, and
        // user_data stays valid: the box is kept in `slot` until deinit.
        check(unsafe { (self.api.set_connection_callback)(id, connection_trampoline, user_data) })?;
        *slot = Some(boxed);
        Ok(())
    }

    fn sdk_version(&self) -> String {
        // SAFETY: Returns an SDK-owned string.
        unsafe { read_c_string((self.api.sdk_version)(self.sdk_id_or_invalid())) }
    }

    fn device_version(&self) -> String {
        // SAFETY: Returns an SDK-owned string (an error message when not connected).
        unsafe { read_c_string((self.api.device_version)(self.sdk_id_or_invalid())) }
    }

    fn device_serial_number(&self) -> u32 {
        // SAFETY: Plain value arguments.
        unsafe { (self.api.serial_number)(self.sdk_id_or_invalid()) }
    }

    fn device_serial_number_as_string(&self) -> String {
        // SAFETY: Returns an SDK-owned string.
        unsafe { read_c_string((self.api.serial_number_as_string)(self.sdk_id_or_invalid())) }
    }

    fn device_type(&self) -> DeviceType {
        // SAFETY: Plain value arguments.
        DeviceType::from_code(unsafe { (self.api.device_type)(self.sdk_id_or_invalid()) })
    }

    fn global_intensity_boost(&self) -> Result<i32, DriverError> {
        let id = self.sdk_id()?;
        // SAFETY: Plain value arguments.
        check(unsafe { (self.api.get_global_boost)(id) })
    }

    fn set_global_intensity_boost(&self, boost: i32) -> Result<(), DriverError> {
        let id = self.sdk_id()?;
        // SAFETY: Plain value arguments.
        check(unsafe { (self.api.set_global_boost)(id, boost) }).map(|_| ())
    }

    fn load_pattern_from_json(&self, json: &str) -> Result<PatternId, DriverError> {
        let id = self.sdk_id()?;
        let json = CString::new(json).map_err(|_| DriverError::InvalidDescription)?;
        // SAFETY: json is NUL-terminated and outlives the call.
        check(unsafe { (self.api.load_pattern)(id, json.as_ptr()) }).map(PatternId)
    }

    fn unload_pattern(&self, pattern: PatternId) -> Result<(), DriverError> {
        let id = self.sdk_id()?;
        // SAFETY: Plain value arguments.
        check(unsafe { (self.api.unload_pattern)(id, pattern.0) }).map(|_| ())
    }

    fn pattern_intensity_boost(&self, pattern: PatternId) -> i32 {
        let Ok(id) = self.sdk_id() else {
            return 0;
        };
        // SAFETY: Plain value arguments.
        unsafe { (self.api.pattern_boost)(id, pattern.0) }
    }

    fn set_accumulation_window(
        &self,
        main: PatternId,
        fallback: PatternId,
        time_window: f32,
        max_accumulation: i32,
    ) -> Result<(), DriverError> {
        let id = self.sdk_id()?;
        // SAFETY: Plain value arguments.
        check(unsafe {
            (self.api.set_accumulation)(id, main.0, fallback.0, time_window, max_accumulation)
        })
        .map(|_| ())
    }

    fn erase_accumulation_window(&self, main: PatternId) -> Result<(), DriverError> {
        let id = self.sdk_id()?;
        // SAFETY: Plain value arguments.
        check(unsafe { (self.api.erase_accumulation)(id, main.0) }).map(|_| ())
    }

    fn play_effect(
        &self,
        pattern: PatternId,
        properties: &EffectProperties,
    ) -> Result<EffectId, DriverError> {
        let id = self.sdk_id()?;
        let properties = CEffectProperties::from(properties);
        // SAFETY: Properties are passed by value in the SDK layout.
        check(unsafe { (self.api.play_effect)(id, pattern.0, properties) }).map(EffectId)
    }

    fn stop_effect(&self, effect: EffectId, fadeout: f32) -> Result<(), DriverError> {
        let id = self.sdk_id()?;
        // SAFETY: Plain value arguments.
        check(unsafe { (self.api.stop_effect)(id, effect.0, fadeout) }).map(|_| ())
    }

    fn effect_state(&self, effect: EffectId) -> EffectState {
        let Ok(id) = self.sdk_id() else {
            return EffectState::Stop;
        };
        // SAFETY: Plain value arguments.
        EffectState::from_code(unsafe { (self.api.effect_state)(id, effect.0) })
    }

    fn pause_all(&self) -> Result<(), DriverError> {
        let id = self.sdk_id()?;
        // SAFETY: Plain value arguments.
        check(unsafe { (self.api.pause_all)(id) }).map(|_| ())
    }

    fn resume_all(&self) -> Result<(), DriverError> {
        let id = self.sdk_id()?;
        // SAFETY: Plain value arguments.
        check(unsafe { (self.api.resume_all)(id) }).map(|_| ())
    }

    fn stop_all(&self) -> Result<(), DriverError> {
        let id = self.sdk_id()?;
        // SAFETY: Plain value arguments.
        check(unsafe { (self.api.stop_all)(id) }).map(|_| ())
    }
}

impl Drop for NativeDriver {
    fn drop(&mut self) {
        self.deinit_instance();
    }
}
