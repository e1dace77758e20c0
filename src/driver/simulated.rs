//! Simulated driver - an in-process stand-in for the vendor SDK
//!
//! Emulates what the session layer can observe of a real device:
//! - scan and connection routines resolving on a driver-owned thread
//! - pattern descriptions validated as JSON, with `boost` and `duration` fields
//! - effect instances with a lifetime derived from their properties
//! - priority arbitration over a fixed number of rendering slots
//! - accumulation-window fallback substitution
//! - global pause/resume
//!
//! Test hooks (call counters, scripted connection events, forced instance
//! states, one-shot failure injection) let tests drive the driver side.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{
    ConnectionCallback, ConnectionState, DeviceInfo, DeviceType, EffectId, HapticDriver,
    OutputType, PatternId, ScanStatus, ANY_SERIAL_NUMBER, NO_SERIAL_NUMBER,
};
use crate::effect::{EffectProperties, EffectState};
use crate::error::DriverError;

/// A device the simulation pretends to find
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedDevice {
    pub serial: u32,
    pub output: OutputType,
    pub device_type: DeviceType,
    pub version: String,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self {
            serial: 1234,
            output: OutputType::Bluetooth,
            device_type: DeviceType::SkineticVest,
            version: "1.3.0".to_string(),
        }
    }
}

impl SimulatedDevice {
    fn reachable_over(&self, output: OutputType) -> bool {
        output == OutputType::Autodetect || output == self.output
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            output_type: self.output,
            serial_number: self.serial,
            device_type: self.device_type,
            device_version: self.version.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Resolve scan/connect/disconnect on a background thread; when false
    /// the routines stay pending until a test emits the outcome
    pub auto_resolve: bool,
    pub connect_delay_ms: u64,
    pub scan_delay_ms: u64,
    /// Number of instances rendered at once; the rest are muted
    pub slots: usize,
    /// Duration of a pattern whose description has no `duration` field
    pub default_pattern_duration_ms: u64,
    pub devices: Vec<SimulatedDevice>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            auto_resolve: true,
            connect_delay_ms: 200,
            scan_delay_ms: 200,
            slots: 4,
            default_pattern_duration_ms: 1000,
            devices: vec![SimulatedDevice::default()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanPhase {
    Idle,
    Running,
    Done,
}

struct Link {
    initialized: bool,
    status: ConnectionState,
    connected: Option<SimulatedDevice>,
    scan: ScanPhase,
    scanned: Vec<DeviceInfo>,
    global_boost: i32,
    /// Bumped on every new routine so stale resolutions are dropped
    generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct SimPattern {
    boost: i32,
    duration: Duration,
}

#[derive(Debug, Clone, Copy)]
struct SimInstance {
    pattern: i32,
    priority: i32,
    seq: u64,
    started: Instant,
    /// Pause time accumulated before this instance started
    pause_offset: Duration,
    lifetime: Option<Duration>,
    stop_after: Option<Duration>,
    forced: Option<EffectState>,
    /// Main-pattern instance this one substitutes for
    accumulated_on: Option<i32>,
}

#[derive(Debug, Clone, Copy)]
struct AccumulationWindow {
    fallback: i32,
    time_window: f32,
    max_accumulation: i32,
}

#[derive(Default)]
struct Clock {
    paused_since: Option<Instant>,
    paused_total: Duration,
}

#[derive(Default)]
struct Counters {
    load: AtomicUsize,
    unload: AtomicUsize,
    play: AtomicUsize,
    stop: AtomicUsize,
}

struct Inner {
    config: SimulationConfig,
    link: Mutex<Link>,
    callback: RwLock<Option<ConnectionCallback>>,
    patterns: DashMap<i32, SimPattern>,
    instances: DashMap<i32, SimInstance>,
    accumulation: DashMap<i32, AccumulationWindow>,
    clock: Mutex<Clock>,
    next_pattern: AtomicI32,
    next_effect: AtomicI32,
    next_seq: AtomicU64,
    injected: Mutex<Option<DriverError>>,
    counters: Counters,
}

impl Inner {
    fn fire(&self, state: ConnectionState, error: Option<DriverError>, serial: u32) {
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(state, error, serial);
        }
    }

    fn resolve_connection(&self, generation: u64, output: OutputType, serial: u32) {
        let outcome = {
            let mut link = self.link.lock();
            if link.generation != generation || link.status != ConnectionState::Connecting {
                return;
            }
            let found = self
                .config
                .devices
                .iter()
                .find(|d| d.reachable_over(output) && (serial == ANY_SERIAL_NUMBER || d.serial == serial))
                .cloned();
            match found {
                Some(device) => {
                    let serial = device.serial;
                    link.status = ConnectionState::Connected;
                    link.connected = Some(device);
                    (ConnectionState::Connected, None, serial)
                }
                None => {
                    link.status = ConnectionState::Disconnected;
                    (ConnectionState::Disconnected, Some(DriverError::DeviceUnreachable), serial)
                }
            }
        };
        self.fire(outcome.0, outcome.1, outcome.2);
    }

    fn resolve_disconnection(&self, generation: u64) {
        let serial = {
            let mut link = self.link.lock();
            if link.generation != generation || link.status != ConnectionState::Disconnecting {
                return;
            }
            link.status = ConnectionState::Disconnected;
            link.connected
                .take()
                .map(|d| d.serial)
                .unwrap_or(NO_SERIAL_NUMBER)
        };
        self.fire(ConnectionState::Disconnected, None, serial);
    }

    fn finish_scan(&self, generation: u64, found: Vec<DeviceInfo>) {
        let mut link = self.link.lock();
        if link.generation == generation && link.scan == ScanPhase::Running {
            link.scan = ScanPhase::Done;
            link.scanned = found;
        }
    }

    /// Play time of an instance, excluding paused periods
    fn elapsed(&self, instance: &SimInstance) -> Duration {
        let clock = self.clock.lock();
        let now = clock.paused_since.unwrap_or_else(Instant::now);
        let paused = clock.paused_total.saturating_sub(instance.pause_offset);
        now.saturating_duration_since(instance.started)
            .saturating_sub(paused)
    }

    fn is_alive(&self, instance: &SimInstance) -> bool {
        if instance.forced == Some(EffectState::Stop) {
            return false;
        }
        let elapsed = self.elapsed(instance);
        !(instance.lifetime.is_some_and(|l| elapsed >= l)
            || instance.stop_after.is_some_and(|s| elapsed >= s))
    }

    /// Drop finished instances, returning the live ones
    fn live_instances(&self) -> Vec<(i32, SimInstance)> {
        let snapshot: Vec<(i32, SimInstance)> =
            self.instances.iter().map(|e| (*e.key(), *e.value())).collect();
        let mut live = Vec::with_capacity(snapshot.len());
        for (id, instance) in snapshot {
            if self.is_alive(&instance) {
                live.push((id, instance));
            } else {
                self.instances.remove(&id);
            }
        }
        live
    }

    fn start_instance(
        &self,
        pattern: i32,
        duration: Duration,
        properties: &EffectProperties,
        accumulated_on: Option<i32>,
    ) -> EffectId {
        let id = self.next_effect.fetch_add(1, Ordering::SeqCst);
        let instance = SimInstance {
            pattern,
            priority: properties.priority,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            started: Instant::now(),
            pause_offset: self.clock.lock().paused_total,
            lifetime: instance_lifetime(duration, properties),
            stop_after: None,
            forced: None,
            accumulated_on,
        };
        self.instances.insert(id, instance);
        EffectId(id)
    }
}

/// How long an instance renders before ending on its own, `None` if it never does
fn instance_lifetime(pattern: Duration, properties: &EffectProperties) -> Option<Duration> {
    let speed = properties.speed.max(f32::EPSILON);
    let pass = (pattern.as_secs_f32() / speed - properties.play_at_time / speed).max(0.0);
    let max = (properties.max_duration > 0.0).then_some(properties.max_duration);

    let natural = match properties.repeat_count {
        0 => None,
        n => {
            let n = n as f32;
            Some(pass * n + properties.repeat_delay.max(0.0) * (n - 1.0))
        }
    };

    // Lifetimes too long for a Duration never end
    match (natural, max) {
        (Some(natural), Some(max)) => Duration::try_from_secs_f32(natural.min(max)).ok(),
        (Some(natural), None) => Duration::try_from_secs_f32(natural).ok(),
        (None, Some(max)) => Duration::try_from_secs_f32(max).ok(),
        (None, None) => None,
    }
}

/// In-process device emulator
pub struct SimulatedDriver {
    inner: Arc<Inner>,
}

impl SimulatedDriver {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                link: Mutex::new(Link {
                    initialized: false,
                    status: ConnectionState::Disconnected,
                    connected: None,
                    scan: ScanPhase::Idle,
                    scanned: Vec::new(),
                    global_boost: 0,
                    generation: 0,
                }),
                callback: RwLock::new(None),
                patterns: DashMap::new(),
                instances: DashMap::new(),
                accumulation: DashMap::new(),
                clock: Mutex::new(Clock::default()),
                next_pattern: AtomicI32::new(0),
                next_effect: AtomicI32::new(0),
                next_seq: AtomicU64::new(0),
                injected: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.inner.config
    }

    /// Consume the injected failure, then require an initialised instance
    fn ensure_ready(&self) -> Result<(), DriverError> {
        if let Some(err) = self.inner.injected.lock().take() {
            return Err(err);
        }
        if !self.inner.link.lock().initialized {
            return Err(DriverError::NoInstance);
        }
        Ok(())
    }

    fn spawn_resolution<F>(&self, label: &str, delay_ms: u64, job: F) -> Result<(), DriverError>
    where
        F: FnOnce(&Inner) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name(format!("sim-{}", label))
            .spawn(move || {
                thread::sleep(Duration::from_millis(delay_ms));
                job(&inner);
            })
            .map(|_| ())
            .map_err(|e| {
                warn!("Simulated {} thread failed to start: {}", label, e);
                DriverError::Other
            })
    }

    // ===== Test hooks =====

    /// Make the next fallible driver call fail with `err`
    pub fn fail_next(&self, err: DriverError) {
        *self.inner.injected.lock() = Some(err);
    }

    /// Apply a connection event as if the device reported it, firing the callback
    pub fn emit_connection(&self, state: ConnectionState, error: Option<DriverError>, serial: u32) {
        {
            let mut link = self.inner.link.lock();
            link.generation += 1;
            link.status = state;
            match state {
                ConnectionState::Connected => {
                    let device = self
                        .inner
                        .config
                        .devices
                        .iter()
                        .find(|d| d.serial == serial)
                        .cloned()
                        .unwrap_or(SimulatedDevice {
                            serial,
                            ..SimulatedDevice::default()
                        });
                    link.connected = Some(device);
                }
                ConnectionState::Disconnected => link.connected = None,
                _ => {}
            }
        }
        self.inner.fire(state, error, serial);
    }

    /// Pin the state an instance reports; `Stop` also ends it
    pub fn set_effect_state(&self, effect: EffectId, state: EffectState) {
        if let Some(mut instance) = self.inner.instances.get_mut(&effect.0) {
            instance.forced = Some(state);
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.link.lock().initialized
    }

    pub fn load_calls(&self) -> usize {
        self.inner.counters.load.load(Ordering::SeqCst)
    }

    pub fn unload_calls(&self) -> usize {
        self.inner.counters.unload.load(Ordering::SeqCst)
    }

    pub fn play_calls(&self) -> usize {
        self.inner.counters.play.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.inner.counters.stop.load(Ordering::SeqCst)
    }

    /// Accumulation rule active for `main`: (fallback, time window, max)
    pub fn accumulation_for(&self, main: PatternId) -> Option<(PatternId, f32, i32)> {
        self.inner
            .accumulation
            .get(&main.0)
            .map(|w| (PatternId(w.fallback), w.time_window, w.max_accumulation))
    }

    /// Pattern an instance actually renders (differs from the requested one
    /// when an accumulation fallback kicked in)
    pub fn instance_pattern(&self, effect: EffectId) -> Option<PatternId> {
        self.inner
            .instances
            .get(&effect.0)
            .map(|i| PatternId(i.pattern))
    }

    pub fn live_instance_count(&self) -> usize {
        self.inner.live_instances().len()
    }
}

impl HapticDriver for SimulatedDriver {
    fn name(&self) -> &str {
        "simulated"
    }

    fn init_instance(&self) -> Result<(), DriverError> {
        let mut link = self.inner.link.lock();
        if !link.initialized {
            link.initialized = true;
            debug!("Simulated SDK instance created");
        }
        Ok(())
    }

    fn deinit_instance(&self) {
        let mut link = self.inner.link.lock();
        if !link.initialized {
            return;
        }
        link.initialized = false;
        link.status = ConnectionState::Disconnected;
        link.connected = None;
        link.scan = ScanPhase::Idle;
        link.generation += 1;
        drop(link);

        *self.inner.callback.write() = None;
        self.inner.instances.clear();
        self.inner.patterns.clear();
        self.inner.accumulation.clear();
        debug!("Simulated SDK instance released");
    }

    fn serial_number_to_string(&self, serial_number: u32) -> String {
        format!("{:010}", serial_number)
    }

    fn scan_devices(&self, output: OutputType) -> Result<(), DriverError> {
        self.ensure_ready()?;
        let found: Vec<DeviceInfo> = self
            .inner
            .config
            .devices
            .iter()
            .filter(|d| d.reachable_over(output))
            .map(SimulatedDevice::info)
            .collect();

        let generation = {
            let mut link = self.inner.link.lock();
            if link.scan == ScanPhase::Running {
                return Err(DriverError::ProcessAlreadyRunning);
            }
            if !self.inner.config.auto_resolve {
                link.scan = ScanPhase::Done;
                link.scanned = found;
                return Ok(());
            }
            link.scan = ScanPhase::Running;
            link.generation += 1;
            link.generation
        };

        self.spawn_resolution("scan", self.inner.config.scan_delay_ms, move |inner| {
            inner.finish_scan(generation, found)
        })
    }

    fn scan_status(&self) -> Result<ScanStatus, DriverError> {
        match self.inner.link.lock().scan {
            ScanPhase::Running => Ok(ScanStatus::Ongoing),
            ScanPhase::Idle | ScanPhase::Done => Ok(ScanStatus::Completed),
        }
    }

    fn scanned_devices(&self) -> Vec<DeviceInfo> {
        self.inner.link.lock().scanned.clone()
    }

    fn connect(&self, output: OutputType, serial_number: u32) -> Result<(), DriverError> {
        self.ensure_ready()?;
        let generation = {
            let mut link = self.inner.link.lock();
            if link.status != ConnectionState::Disconnected {
                return Err(DriverError::DeviceAlreadyConnected);
            }
            link.status = ConnectionState::Connecting;
            link.generation += 1;
            link.generation
        };

        if !self.inner.config.auto_resolve {
            return Ok(());
        }
        self.spawn_resolution("connect", self.inner.config.connect_delay_ms, move |inner| {
            inner.resolve_connection(generation, output, serial_number)
        })
    }

    fn disconnect(&self) -> Result<(), DriverError> {
        if let Some(err) = self.inner.injected.lock().take() {
            return Err(err);
        }
        let generation = {
            let mut link = self.inner.link.lock();
            if link.status == ConnectionState::Disconnected {
                return Err(DriverError::NoDeviceConnected);
            }
            link.status = ConnectionState::Disconnecting;
            link.generation += 1;
            link.generation
        };
        self.inner.instances.clear();

        if !self.inner.config.auto_resolve {
            return Ok(());
        }
        self.spawn_resolution("disconnect", self.inner.config.connect_delay_ms / 2, move |inner| {
            inner.resolve_disconnection(generation)
        })
    }

    fn connection_status(&self) -> ConnectionState {
        self.inner.link.lock().status
    }

    fn set_connection_callback(&self, callback: ConnectionCallback) -> Result<(), DriverError> {
        self.ensure_ready()?;
        *self.inner.callback.write() = Some(callback);
        Ok(())
    }

    fn sdk_version(&self) -> String {
        format!("simulated-{}", env!("CARGO_PKG_VERSION"))
    }

    fn device_version(&self) -> String {
        match &self.inner.link.lock().connected {
            Some(device) => device.version.clone(),
            None => DriverError::NoDeviceConnected.to_string(),
        }
    }

    fn device_serial_number(&self) -> u32 {
        self.inner
            .link
            .lock()
            .connected
            .as_ref()
            .map(|d| d.serial)
            .unwrap_or(NO_SERIAL_NUMBER)
    }

    fn device_serial_number_as_string(&self) -> String {
        match self.device_serial_number() {
            NO_SERIAL_NUMBER => DriverError::NoDeviceConnected.to_string(),
            serial => self.serial_number_to_string(serial),
        }
    }

    fn device_type(&self) -> DeviceType {
        self.inner
            .link
            .lock()
            .connected
            .as_ref()
            .map(|d| d.device_type)
            .unwrap_or(DeviceType::Unknown)
    }

    fn global_intensity_boost(&self) -> Result<i32, DriverError> {
        self.ensure_ready()?;
        Ok(self.inner.link.lock().global_boost)
    }

    fn set_global_intensity_boost(&self, boost: i32) -> Result<(), DriverError> {
        self.ensure_ready()?;
        if !(0..=100).contains(&boost) {
            return Err(DriverError::InvalidParameter);
        }
        self.inner.link.lock().global_boost = boost;
        Ok(())
    }

    fn load_pattern_from_json(&self, json: &str) -> Result<PatternId, DriverError> {
        self.inner.counters.load.fetch_add(1, Ordering::SeqCst);
        self.ensure_ready()?;

        let description: serde_json::Value =
            serde_json::from_str(json).map_err(|_| DriverError::InvalidDescription)?;
        let description = description
            .as_object()
            .ok_or(DriverError::InvalidDescription)?;

        let boost = description
            .get("boost")
            .and_then(|v| v.as_i64())
            .map(|b| b.clamp(-100, 100) as i32)
            .unwrap_or(0);
        let duration = description
            .get("duration")
            .and_then(|v| v.as_f64())
            .filter(|d| *d >= 0.0)
            .map(|ms| Duration::try_from_secs_f64(ms / 1000.0))
            .transpose()
            .map_err(|_| DriverError::InvalidDescription)?
            .unwrap_or(Duration::from_millis(self.inner.config.default_pattern_duration_ms));

        let id = self.inner.next_pattern.fetch_add(1, Ordering::SeqCst);
        self.inner.patterns.insert(id, SimPattern { boost, duration });
        debug!(pattern = id, boost, ?duration, "Simulated pattern loaded");
        Ok(PatternId(id))
    }

    fn unload_pattern(&self, pattern: PatternId) -> Result<(), DriverError> {
        self.inner.counters.unload.fetch_add(1, Ordering::SeqCst);
        self.ensure_ready()?;
        self.inner
            .patterns
            .remove(&pattern.0)
            .ok_or(DriverError::InvalidPatternId)?;
        self.inner.accumulation.remove(&pattern.0);
        Ok(())
    }

    fn pattern_intensity_boost(&self, pattern: PatternId) -> i32 {
        self.inner
            .patterns
            .get(&pattern.0)
            .map(|p| p.boost)
            .unwrap_or(0)
    }

    fn set_accumulation_window(
        &self,
        main: PatternId,
        fallback: PatternId,
        time_window: f32,
        max_accumulation: i32,
    ) -> Result<(), DriverError> {
        self.ensure_ready()?;
        if !self.inner.patterns.contains_key(&main.0) || !self.inner.patterns.contains_key(&fallback.0) {
            return Err(DriverError::InvalidPatternId);
        }
        if time_window < 0.0 || max_accumulation < 0 {
            return Err(DriverError::InvalidParameter);
        }
        self.inner.accumulation.insert(
            main.0,
            AccumulationWindow {
                fallback: fallback.0,
                time_window,
                max_accumulation,
            },
        );
        Ok(())
    }

    fn erase_accumulation_window(&self, main: PatternId) -> Result<(), DriverError> {
        self.ensure_ready()?;
        if !self.inner.patterns.contains_key(&main.0) {
            return Err(DriverError::InvalidPatternId);
        }
        self.inner.accumulation.remove(&main.0);
        Ok(())
    }

    fn play_effect(
        &self,
        pattern: PatternId,
        properties: &EffectProperties,
    ) -> Result<EffectId, DriverError> {
        self.inner.counters.play.fetch_add(1, Ordering::SeqCst);
        self.ensure_ready()?;

        let main = *self
            .inner
            .patterns
            .get(&pattern.0)
            .ok_or(DriverError::InvalidPatternId)?;
        let properties = properties.clamped();

        let window = self.inner.accumulation.get(&pattern.0).map(|w| *w);
        if let Some(window) = window {
            let live = self.inner.live_instances();
            let recent = live
                .iter()
                .filter(|(_, i)| {
                    i.pattern == pattern.0
                        && i.accumulated_on.is_none()
                        && self.inner.elapsed(i).as_secs_f32() <= window.time_window
                })
                .max_by_key(|(_, i)| i.seq)
                .map(|(id, _)| *id);

            if let Some(main_instance) = recent {
                let accumulated = live
                    .iter()
                    .filter(|(_, i)| i.accumulated_on == Some(main_instance))
                    .count();
                if window.max_accumulation > 0 && accumulated >= window.max_accumulation as usize {
                    return Err(DriverError::PlayIgnoredByStrategy);
                }
                let fallback = *self
                    .inner
                    .patterns
                    .get(&window.fallback)
                    .ok_or(DriverError::InvalidPatternId)?;
                let id = self.inner.start_instance(
                    window.fallback,
                    fallback.duration,
                    &properties,
                    Some(main_instance),
                );
                debug!(effect = %id, main = %pattern, "Accumulation fallback played");
                return Ok(id);
            }
        }

        let id = self
            .inner
            .start_instance(pattern.0, main.duration, &properties, None);
        debug!(effect = %id, %pattern, priority = properties.priority, "Simulated effect played");
        Ok(id)
    }

    fn stop_effect(&self, effect: EffectId, fadeout: f32) -> Result<(), DriverError> {
        self.inner.counters.stop.fetch_add(1, Ordering::SeqCst);
        self.ensure_ready()?;

        if fadeout <= 0.0 {
            return self
                .inner
                .instances
                .remove(&effect.0)
                .map(|_| ())
                .ok_or(DriverError::InvalidSequenceId);
        }

        let instance = self
            .inner
            .instances
            .get(&effect.0)
            .map(|i| *i)
            .ok_or(DriverError::InvalidSequenceId)?;
        let Some(stop_after) = Duration::try_from_secs_f32(fadeout)
            .ok()
            .and_then(|fade| self.inner.elapsed(&instance).checked_add(fade))
        else {
            debug!(effect = effect.0, fadeout, "Fadeout not representable, instance ends on its own");
            return Ok(());
        };
        if let Some(mut instance) = self.inner.instances.get_mut(&effect.0) {
            instance.stop_after = Some(stop_after);
        }
        Ok(())
    }

    fn effect_state(&self, effect: EffectId) -> EffectState {
        let Some(instance) = self.inner.instances.get(&effect.0).map(|i| *i) else {
            return EffectState::Stop;
        };
        if let Some(forced) = instance.forced {
            return forced;
        }

        let mut live = self.inner.live_instances();
        if !live.iter().any(|(id, _)| *id == effect.0) {
            return EffectState::Stop;
        }

        live.sort_by_key(|(_, i)| (i.priority, Reverse(i.seq)));
        let rank = live
            .iter()
            .position(|(id, _)| *id == effect.0)
            .unwrap_or(usize::MAX);
        if rank < self.inner.config.slots {
            EffectState::Play
        } else {
            EffectState::Mute
        }
    }

    fn pause_all(&self) -> Result<(), DriverError> {
        self.ensure_ready()?;
        let mut clock = self.inner.clock.lock();
        if clock.paused_since.is_none() {
            clock.paused_since = Some(Instant::now());
            info!("⏸️ Simulated playback paused");
        }
        Ok(())
    }

    fn resume_all(&self) -> Result<(), DriverError> {
        self.ensure_ready()?;
        let mut clock = self.inner.clock.lock();
        if let Some(since) = clock.paused_since.take() {
            clock.paused_total += since.elapsed();
            info!("▶️ Simulated playback resumed");
        }
        Ok(())
    }

    fn stop_all(&self) -> Result<(), DriverError> {
        self.ensure_ready()?;
        let stopped = self.inner.instances.len();
        self.inner.instances.clear();
        debug!(stopped, "Simulated effects stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_driver(config: SimulationConfig) -> SimulatedDriver {
        let driver = SimulatedDriver::new(config);
        driver.init_instance().unwrap();
        driver
    }

    fn looping() -> EffectProperties {
        EffectProperties {
            repeat_count: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_calls_require_instance() {
        let driver = SimulatedDriver::new(SimulationConfig::default());
        assert_eq!(
            driver.load_pattern_from_json("{}"),
            Err(DriverError::NoInstance)
        );
        assert_eq!(
            driver.connect(OutputType::Autodetect, 0),
            Err(DriverError::NoInstance)
        );
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        let driver = make_test_driver(SimulationConfig::default());
        assert_eq!(
            driver.load_pattern_from_json("{ not json"),
            Err(DriverError::InvalidDescription)
        );
        assert_eq!(
            driver.load_pattern_from_json("[1, 2]"),
            Err(DriverError::InvalidDescription)
        );
        assert!(driver.load_pattern_from_json(r#"{"boost": 500}"#).is_ok());
    }

    #[test]
    fn test_pattern_boost_from_description() {
        let driver = make_test_driver(SimulationConfig::default());
        let id = driver.load_pattern_from_json(r#"{"boost": 500}"#).unwrap();
        assert_eq!(driver.pattern_intensity_boost(id), 100);
        assert_eq!(driver.pattern_intensity_boost(PatternId(77)), 0);
    }

    #[test]
    fn test_priority_arbitration_mutes_overflow() {
        let driver = make_test_driver(SimulationConfig {
            slots: 1,
            ..SimulationConfig::default()
        });
        let pattern = driver.load_pattern_from_json("{}").unwrap();

        let low = driver
            .play_effect(pattern, &EffectProperties { priority: 8, ..looping() })
            .unwrap();
        let high = driver
            .play_effect(pattern, &EffectProperties { priority: 1, ..looping() })
            .unwrap();

        assert_eq!(driver.effect_state(high), EffectState::Play);
        assert_eq!(driver.effect_state(low), EffectState::Mute);

        driver.stop_effect(high, 0.0).unwrap();
        assert_eq!(driver.effect_state(high), EffectState::Stop);
        assert_eq!(driver.effect_state(low), EffectState::Play);
    }

    #[test]
    fn test_most_recent_wins_priority_tie() {
        let driver = make_test_driver(SimulationConfig {
            slots: 1,
            ..SimulationConfig::default()
        });
        let pattern = driver.load_pattern_from_json("{}").unwrap();
        let older = driver.play_effect(pattern, &looping()).unwrap();
        let newer = driver.play_effect(pattern, &looping()).unwrap();

        assert_eq!(driver.effect_state(newer), EffectState::Play);
        assert_eq!(driver.effect_state(older), EffectState::Mute);
    }

    #[test]
    fn test_instance_ends_after_its_lifetime() {
        let driver = make_test_driver(SimulationConfig::default());
        let pattern = driver.load_pattern_from_json(r#"{"duration": 20}"#).unwrap();
        let id = driver
            .play_effect(pattern, &EffectProperties::default())
            .unwrap();
        assert_eq!(driver.effect_state(id), EffectState::Play);

        thread::sleep(Duration::from_millis(60));
        assert_eq!(driver.effect_state(id), EffectState::Stop);
        assert_eq!(driver.live_instance_count(), 0);
    }

    #[test]
    fn test_lifetime_accounts_for_speed_and_repeats() {
        let pattern = Duration::from_secs(1);
        let props = EffectProperties {
            speed: 2.0,
            repeat_count: 3,
            repeat_delay: 0.5,
            ..Default::default()
        };
        assert_eq!(
            instance_lifetime(pattern, &props),
            Some(Duration::from_secs_f32(2.5))
        );

        let capped = EffectProperties {
            max_duration: 1.0,
            ..props
        };
        assert_eq!(
            instance_lifetime(pattern, &capped),
            Some(Duration::from_secs_f32(1.0))
        );
        assert_eq!(instance_lifetime(pattern, &looping()), None);
    }

    #[test]
    fn test_fadeout_keeps_instance_until_elapsed() {
        let driver = make_test_driver(SimulationConfig::default());
        let pattern = driver.load_pattern_from_json("{}").unwrap();
        let id = driver.play_effect(pattern, &looping()).unwrap();

        driver.stop_effect(id, 0.05).unwrap();
        assert_eq!(driver.effect_state(id), EffectState::Play);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(driver.effect_state(id), EffectState::Stop);
    }

    #[test]
    fn test_unbounded_fadeout_lets_instance_run() {
        let driver = make_test_driver(SimulationConfig::default());
        let pattern = driver.load_pattern_from_json("{}").unwrap();
        let id = driver.play_effect(pattern, &looping()).unwrap();

        driver.stop_effect(id, 1e30).unwrap();
        driver.stop_effect(id, f32::INFINITY).unwrap();
        driver.stop_effect(id, f32::NAN).unwrap();
        assert_eq!(driver.effect_state(id), EffectState::Play);
        assert_eq!(driver.live_instance_count(), 1);
    }

    #[test]
    fn test_oversized_pattern_duration_is_invalid() {
        let driver = make_test_driver(SimulationConfig::default());
        assert_eq!(
            driver.load_pattern_from_json(r#"{"duration": 1e300}"#),
            Err(DriverError::InvalidDescription)
        );
        assert!(driver.load_pattern_from_json(r#"{"duration": 250}"#).is_ok());
    }

    #[test]
    fn test_overflowing_lifetime_never_ends() {
        let pattern = Duration::from_secs(u64::MAX / 2);
        let props = EffectProperties {
            speed: 0.01,
            repeat_count: 255,
            ..Default::default()
        };
        assert_eq!(instance_lifetime(pattern, &props), None);
    }

    #[test]
    fn test_accumulation_substitutes_fallback_up_to_max() {
        let driver = make_test_driver(SimulationConfig::default());
        let main = driver.load_pattern_from_json("{}").unwrap();
        let fallback = driver.load_pattern_from_json("{}").unwrap();
        driver.set_accumulation_window(main, fallback, 5.0, 2).unwrap();

        let first = driver.play_effect(main, &looping()).unwrap();
        let second = driver.play_effect(main, &looping()).unwrap();
        let third = driver.play_effect(main, &looping()).unwrap();

        assert_eq!(driver.instance_pattern(first), Some(main));
        assert_eq!(driver.instance_pattern(second), Some(fallback));
        assert_eq!(driver.instance_pattern(third), Some(fallback));
        assert_eq!(
            driver.play_effect(main, &looping()),
            Err(DriverError::PlayIgnoredByStrategy)
        );
    }

    #[test]
    fn test_accumulation_rule_is_replaced() {
        let driver = make_test_driver(SimulationConfig::default());
        let main = driver.load_pattern_from_json("{}").unwrap();
        let a = driver.load_pattern_from_json("{}").unwrap();
        let b = driver.load_pattern_from_json("{}").unwrap();

        driver.set_accumulation_window(main, a, 0.1, 1).unwrap();
        driver.set_accumulation_window(main, b, 0.3, 0).unwrap();
        assert_eq!(driver.accumulation_for(main), Some((b, 0.3, 0)));

        driver.unload_pattern(main).unwrap();
        assert_eq!(driver.accumulation_for(main), None);
    }

    #[test]
    fn test_pause_freezes_lifetime() {
        let driver = make_test_driver(SimulationConfig::default());
        let pattern = driver.load_pattern_from_json(r#"{"duration": 40}"#).unwrap();
        let id = driver
            .play_effect(pattern, &EffectProperties::default())
            .unwrap();

        driver.pause_all().unwrap();
        thread::sleep(Duration::from_millis(80));
        assert_ne!(driver.effect_state(id), EffectState::Stop);

        driver.resume_all().unwrap();
        thread::sleep(Duration::from_millis(80));
        assert_eq!(driver.effect_state(id), EffectState::Stop);
    }

    #[test]
    fn test_connect_resolves_on_driver_thread() {
        let driver = make_test_driver(SimulationConfig {
            connect_delay_ms: 10,
            ..SimulationConfig::default()
        });
        let (tx, rx) = std::sync::mpsc::channel();
        driver
            .set_connection_callback(Arc::new(move |state, err, serial| {
                let _ = tx.send((state, err, serial, thread::current().name().map(str::to_string)));
            }))
            .unwrap();

        driver.connect(OutputType::Bluetooth, 0).unwrap();
        assert_eq!(driver.connection_status(), ConnectionState::Connecting);
        assert_eq!(
            driver.connect(OutputType::Bluetooth, 0),
            Err(DriverError::DeviceAlreadyConnected)
        );

        let (state, err, serial, thread_name) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(state, ConnectionState::Connected);
        assert_eq!(err, None);
        assert_eq!(serial, 1234);
        assert_eq!(thread_name.as_deref(), Some("sim-connect"));
        assert_eq!(driver.device_serial_number_as_string(), "0000001234");
    }

    #[test]
    fn test_connect_over_wrong_output_fails() {
        let driver = make_test_driver(SimulationConfig {
            connect_delay_ms: 0,
            ..SimulationConfig::default()
        });
        let (tx, rx) = std::sync::mpsc::channel();
        driver
            .set_connection_callback(Arc::new(move |state, err, _| {
                let _ = tx.send((state, err));
            }))
            .unwrap();

        driver.connect(OutputType::Wifi, 0).unwrap();
        let (state, err) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(state, ConnectionState::Disconnected);
        assert_eq!(err, Some(DriverError::DeviceUnreachable));
        assert_eq!(driver.device_serial_number(), NO_SERIAL_NUMBER);
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let driver = make_test_driver(SimulationConfig::default());
        driver.fail_next(DriverError::SocketError);
        assert_eq!(driver.stop_all(), Err(DriverError::SocketError));
        assert_eq!(driver.stop_all(), Ok(()));
    }

    #[test]
    fn test_deinit_clears_state() {
        let driver = make_test_driver(SimulationConfig::default());
        let pattern = driver.load_pattern_from_json("{}").unwrap();
        driver.play_effect(pattern, &looping()).unwrap();

        driver.deinit_instance();
        assert!(!driver.is_initialized());
        assert_eq!(driver.live_instance_count(), 0);
        assert_eq!(driver.pattern_intensity_boost(pattern), 0);
        // Second release is a no-op
        driver.deinit_instance();
    }
}
