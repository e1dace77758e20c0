//! Connection state monitor
//!
//! The driver reports connection changes from its own thread. The monitor
//! publishes the latest state on a watch channel (readable from anywhere
//! without blocking), fans the raw event out to subscribers, and lets async
//! callers await a transition instead of spinning on the status query.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::driver::{ConnectionCallback, ConnectionState, NO_SERIAL_NUMBER};
use crate::error::{DriverError, HapticError};

#[derive(Clone)]
pub struct ConnectionMonitor {
    device: Arc<str>,
    state: Arc<watch::Sender<ConnectionState>>,
    last_error: Arc<RwLock<Option<DriverError>>>,
    last_serial: Arc<RwLock<u32>>,
    subscribers: Arc<RwLock<Vec<ConnectionCallback>>>,
}

impl ConnectionMonitor {
    pub fn new(device: &str) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            device: Arc::from(device),
            state: Arc::new(state),
            last_error: Arc::new(RwLock::new(None)),
            last_serial: Arc::new(RwLock::new(NO_SERIAL_NUMBER)),
            subscribers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Last published state
    pub fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn last_error(&self) -> Option<DriverError> {
        *self.last_error.read()
    }

    /// Serial number carried by the last driver event
    pub fn last_serial(&self) -> u32 {
        *self.last_serial.read()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self, callback: ConnectionCallback) {
        self.subscribers.write().push(callback);
    }

    /// Update the published state without notifying subscribers
    ///
    /// Used for transitions this side initiates (connect, disconnect) and for
    /// states discovered by polling.
    pub(crate) fn publish(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(device = %self.device, from = %previous, to = %state, "Connection state published");
        }
    }

    /// Entry point for the driver's connection callback
    ///
    /// Runs on the driver's thread. Subscribers are invoked synchronously here,
    /// so anything that touches primary-thread state must hand off through the
    /// dispatcher.
    pub(crate) fn handle_event(&self, state: ConnectionState, error: Option<DriverError>, serial: u32) {
        *self.last_error.write() = error;
        *self.last_serial.write() = serial;
        self.state.send_replace(state);

        match (state, error) {
            (ConnectionState::Connected, _) => {
                info!("✅ {} connected (serial {})", self.device, serial)
            }
            (ConnectionState::Reconnecting, _) => {
                warn!("🔄 {} link lost, reconnecting", self.device)
            }
            (ConnectionState::Disconnected, Some(err)) => {
                warn!("❌ {} connection failed: {} ({})", self.device, err, err.code())
            }
            (ConnectionState::Disconnected, None) => info!("🔌 {} disconnected", self.device),
            (other, _) => debug!(device = %self.device, state = %other, "Connection event"),
        }

        let subscribers = self.subscribers.read().clone();
        for callback in subscribers.iter() {
            callback(state, error, serial);
        }
    }

    /// Wait until `done` accepts the state, re-polling `poll` every `every`
    ///
    /// The watch channel wakes the wait as soon as a driver event arrives; the
    /// periodic poll covers drivers that change state without a callback.
    pub(crate) async fn wait_until<P, D>(
        &self,
        poll: P,
        done: D,
        every: Duration,
        limit: Duration,
        what: &'static str,
    ) -> Result<ConnectionState, HapticError>
    where
        P: Fn() -> ConnectionState,
        D: Fn(ConnectionState) -> bool,
    {
        let mut rx = self.state.subscribe();
        let wait = async {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let state = *rx.borrow_and_update();
                if done(state) {
                    return state;
                }
                tokio::select! {
                    Ok(()) = rx.changed() => {}
                    _ = ticker.tick() => {
                        let polled = poll();
                        if polled != self.current() {
                            self.publish(polled);
                        }
                    }
                }
            }
        };

        timeout(limit, wait).await.map_err(|_| {
            warn!("⏱️ {} timed out waiting for {}", self.device, what);
            HapticError::Timeout(what)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_event_updates_state_and_notifies_once() {
        let monitor = ConnectionMonitor::new("vest");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(RwLock::new(None));

        let calls_clone = Arc::clone(&calls);
        let seen_clone = Arc::clone(&seen);
        monitor.subscribe(Arc::new(move |state, err, serial| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            *seen_clone.write() = Some((state, err, serial));
        }));

        monitor.publish(ConnectionState::Connecting);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        monitor.handle_event(ConnectionState::Connected, None, 1234);
        assert_eq!(monitor.current(), ConnectionState::Connected);
        assert_eq!(monitor.last_serial(), 1234);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.read(), Some((ConnectionState::Connected, None, 1234)));
    }

    #[tokio::test]
    async fn test_wait_resolves_on_event() {
        let monitor = ConnectionMonitor::new("vest");
        monitor.publish(ConnectionState::Connecting);

        let emitter = monitor.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            emitter.handle_event(ConnectionState::Connected, None, 7);
        });

        let state = monitor
            .wait_until(
                || ConnectionState::Connecting,
                |s| s == ConnectionState::Connected,
                Duration::from_millis(5),
                Duration::from_secs(2),
                "connection",
            )
            .await
            .unwrap();
        assert_eq!(state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_wait_picks_up_polled_state() {
        let monitor = ConnectionMonitor::new("vest");
        monitor.publish(ConnectionState::Disconnecting);

        let state = monitor
            .wait_until(
                || ConnectionState::Disconnected,
                |s| s == ConnectionState::Disconnected,
                Duration::from_millis(5),
                Duration::from_secs(2),
                "disconnection",
            )
            .await
            .unwrap();
        assert_eq!(state, ConnectionState::Disconnected);
        assert_eq!(monitor.current(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let monitor = ConnectionMonitor::new("vest");
        let result = monitor
            .wait_until(
                || ConnectionState::Disconnected,
                |s| s == ConnectionState::Connected,
                Duration::from_millis(5),
                Duration::from_millis(30),
                "connection",
            )
            .await;
        assert!(matches!(result, Err(HapticError::Timeout("connection"))));
    }
}
