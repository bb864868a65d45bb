//! Event bridge: native notifications to state updates and typed events
//!
//! The bridge is the only writer of the [`StateStore`]. Every notification is
//! processed in three steps, strictly in arrival order:
//!
//! 1. decode it and update the store,
//! 2. resolve pending operations whose terminal condition it satisfies,
//! 3. fan the typed event out to the subscribers registered at that moment.
//!
//! Notifications that arrive while another one is being processed (from a
//! different thread, or re-entrantly from a subscriber) are queued and handled
//! by the thread already draining the queue.

use std::{
    collections::VecDeque,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::watch;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    backend::NativeNotification,
    core::{
        error::ErrorKind,
        events::{
            BackgroundScanFinished, ConnectionStateChanged, DeviceStateChanged,
            RssiLevelChanged, ScanStateChanged, WifiEvent,
        },
        sequencer::{Completion, PendingTable},
        store::{Field, StateSnapshot, StateStore, StateWriter, state_store},
        types::{ConnectionState, DeviceState, RssiLevel, ScanState},
    },
};

/// Event handler registered by a subscriber
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Token returned on subscription, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Subscriber<T> {
    id: SubscriptionId,
    handler: Handler<T>,
    active: AtomicBool,
}

type SubscriberList<T> = Arc<Vec<Arc<Subscriber<T>>>>;

/// Copy-on-write subscriber list for one event category
///
/// Publishing iterates the list as it was when delivery started, so a
/// subscriber added during delivery only sees later events. A subscriber
/// removed during delivery is deactivated at once and skipped.
pub struct Subscribers<T> {
    name: &'static str,
    list: RwLock<SubscriberList<T>>,
}

impl<T> Subscribers<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            list: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn add(&self, handler: Handler<T>) -> SubscriptionId {
        let id = SubscriptionId::new();
        let mut list = self.list.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::with_capacity(list.len() + 1);
        next.extend(list.iter().cloned());
        next.push(Arc::new(Subscriber {
            id,
            handler,
            active: AtomicBool::new(true),
        }));
        *list = Arc::new(next);
        id
    }

    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut list = self.list.write().unwrap_or_else(PoisonError::into_inner);
        let Some(found) = list.iter().find(|s| s.id == id) else {
            return false;
        };
        found.active.store(false, Ordering::SeqCst);

        let next = list.iter().filter(|s| s.id != id).cloned().collect();
        *list = Arc::new(next);
        true
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> SubscriberList<T> {
        self.list
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn publish(&self, event: &T) {
        for subscriber in self.snapshot().iter() {
            if !subscriber.active.load(Ordering::SeqCst) {
                continue;
            }
            let handler = &subscriber.handler;
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(events = self.name, subscriber = %subscriber.id, "Event subscriber panicked");
            }
        }
    }
}

#[derive(Debug, Default)]
struct DispatchQueue {
    pending: VecDeque<NativeNotification>,
    draining: bool,
}

/// Translates native notifications into state and events
pub struct EventBridge {
    writer: StateWriter,
    store: StateStore,
    pending: Arc<PendingTable>,
    queue: Mutex<DispatchQueue>,
    device_state: Subscribers<DeviceStateChanged>,
    connection_state: Subscribers<ConnectionStateChanged>,
    rssi_level: Subscribers<RssiLevelChanged>,
    scan_state: Subscribers<ScanStateChanged>,
    background_scan: Subscribers<BackgroundScanFinished>,
    any: Subscribers<WifiEvent>,
}

impl EventBridge {
    pub fn new(initial: StateSnapshot, pending: Arc<PendingTable>) -> Self {
        let (writer, store) = state_store(initial);
        Self {
            writer,
            store,
            pending,
            queue: Mutex::new(DispatchQueue::default()),
            device_state: Subscribers::new("device_state"),
            connection_state: Subscribers::new("connection_state"),
            rssi_level: Subscribers::new("rssi_level"),
            scan_state: Subscribers::new("scan_state"),
            background_scan: Subscribers::new("background_scan"),
            any: Subscribers::new("all"),
        }
    }

    /// Read handle on the state store
    pub fn store(&self) -> StateStore {
        self.store.clone()
    }

    pub fn watch(&self) -> watch::Receiver<StateSnapshot> {
        self.store.watch()
    }

    /// Install the state read from the device right after acquisition
    pub fn seed(&self, snapshot: StateSnapshot) {
        let seeded = self.writer.seed(snapshot);
        debug!(queried = ?snapshot, ?seeded, "Seeded device state");
    }

    pub fn device_state_events(&self) -> &Subscribers<DeviceStateChanged> {
        &self.device_state
    }

    pub fn connection_state_events(&self) -> &Subscribers<ConnectionStateChanged> {
        &self.connection_state
    }

    pub fn rssi_level_events(&self) -> &Subscribers<RssiLevelChanged> {
        &self.rssi_level
    }

    pub fn scan_state_events(&self) -> &Subscribers<ScanStateChanged> {
        &self.scan_state
    }

    pub fn background_scan_events(&self) -> &Subscribers<BackgroundScanFinished> {
        &self.background_scan
    }

    /// Every event, after the category specific subscribers
    pub fn all_events(&self) -> &Subscribers<WifiEvent> {
        &self.any
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.device_state.remove(id)
            || self.connection_state.remove(id)
            || self.rssi_level.remove(id)
            || self.scan_state.remove(id)
            || self.background_scan.remove(id)
            || self.any.remove(id)
    }

    fn queue(&self) -> MutexGuard<'_, DispatchQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Entry point for native callbacks
    pub fn deliver(&self, notification: NativeNotification) {
        {
            let mut queue = self.queue();
            queue.pending.push_back(notification);
            if queue.draining {
                return;
            }
            queue.draining = true;
        }

        loop {
            let next = {
                let mut queue = self.queue();
                match queue.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            self.dispatch(next);
        }
    }

    fn dispatch(&self, notification: NativeNotification) {
        match notification {
            NativeNotification::DeviceState { code } => {
                let Ok(state) = DeviceState::try_from(code) else {
                    warn!(code, "Dropping undecodable device state notification");
                    return;
                };
                let previous = self.store.device_state();
                self.writer.update(&[Field::DeviceState], |s| s.device_state = state);
                debug!(?previous, current = ?state, "Device state changed");

                self.pending.resolve(&Completion::Device {
                    previous,
                    current: state,
                });
                let event = DeviceStateChanged { state };
                self.device_state.publish(&event);
                self.any.publish(&WifiEvent::DeviceStateChanged(event));
            }
            NativeNotification::ConnectionState { code, essid } => {
                let Ok(state) = ConnectionState::try_from(code) else {
                    warn!(code, "Dropping undecodable connection state notification");
                    return;
                };
                let link_lost = matches!(
                    state,
                    ConnectionState::Disconnected | ConnectionState::Failure
                );
                let fields: &[Field] = if link_lost {
                    &[Field::ConnectionState, Field::Rssi]
                } else {
                    &[Field::ConnectionState]
                };
                self.writer.update(fields, |s| {
                    s.connection_state = state;
                    if link_lost {
                        s.rssi = None;
                    }
                });
                debug!(?state, ?essid, "Connection state changed");

                self.pending.resolve(&Completion::Connection {
                    state,
                    essid: essid.as_deref(),
                });
                let event = ConnectionStateChanged { state, essid };
                self.connection_state.publish(&event);
                self.any.publish(&WifiEvent::ConnectionStateChanged(event));
            }
            NativeNotification::RssiLevel { code } => {
                let Ok(level) = RssiLevel::try_from(code) else {
                    warn!(code, "Dropping undecodable RSSI notification");
                    return;
                };
                self.writer.update(&[Field::Rssi], |s| s.rssi = Some(level));

                let event = RssiLevelChanged { level };
                self.rssi_level.publish(&event);
                self.any.publish(&WifiEvent::RssiLevelChanged(event));
            }
            NativeNotification::ScanState { code } => {
                let Ok(state) = ScanState::try_from(code) else {
                    warn!(code, "Dropping undecodable scan state notification");
                    return;
                };
                self.writer.update(&[Field::ScanState], |s| s.scan_state = state);
                debug!(?state, "Scan state changed");

                self.pending.resolve(&Completion::Scan { state });
                let event = ScanStateChanged { state };
                self.scan_state.publish(&event);
                self.any.publish(&WifiEvent::ScanStateChanged(event));
            }
            NativeNotification::BackgroundScanFinished { code } => {
                let event = BackgroundScanFinished {
                    error: ErrorKind::from_native_code(code),
                };
                self.background_scan.publish(&event);
                self.any.publish(&WifiEvent::BackgroundScanFinished(event));
            }
            NativeNotification::RequestResult { token, code } => {
                self.pending.resolve(&Completion::Request {
                    token,
                    error: ErrorKind::from_native_code(code),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::core::events::Category;

    fn bridge() -> Arc<EventBridge> {
        Arc::new(EventBridge::new(
            StateSnapshot::default(),
            Arc::new(PendingTable::new()),
        ))
    }

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, Handler<T>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: Handler<T> = Arc::new(move |event: &T| sink.lock().unwrap().push(event.clone()));
        (seen, handler)
    }

    #[test]
    fn test_notification_updates_store_and_publishes() {
        let bridge = bridge();
        let (seen, handler) = recorder::<DeviceStateChanged>();
        bridge.device_state_events().add(handler);

        bridge.deliver(NativeNotification::DeviceState { code: 1 });
        bridge.deliver(NativeNotification::DeviceState { code: 2 });

        assert_eq!(bridge.store().device_state(), DeviceState::Activated);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                DeviceStateChanged {
                    state: DeviceState::Activating
                },
                DeviceStateChanged {
                    state: DeviceState::Activated
                },
            ]
        );
    }

    #[test]
    fn test_undecodable_notification_is_dropped() {
        let bridge = bridge();
        let (seen, handler) = recorder::<ScanStateChanged>();
        bridge.scan_state_events().add(handler);

        bridge.deliver(NativeNotification::ScanState { code: 7 });
        bridge.deliver(NativeNotification::DeviceState { code: -1 });

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(bridge.store().snapshot(), StateSnapshot::default());
    }

    #[test]
    fn test_subscriber_sees_state_current_at_delivery() {
        let bridge = bridge();
        let store = bridge.store();
        let mismatches = Arc::new(AtomicUsize::new(0));
        let counter = mismatches.clone();
        bridge
            .device_state_events()
            .add(Arc::new(move |event: &DeviceStateChanged| {
                if store.device_state() != event.state {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }));

        for code in [1, 2, 3, 0, 1, 2] {
            bridge.deliver(NativeNotification::DeviceState { code });
        }
        assert_eq!(mismatches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let bridge = bridge();
        bridge
            .rssi_level_events()
            .add(Arc::new(|_: &RssiLevelChanged| panic!("subscriber failure")));
        let (seen, handler) = recorder::<RssiLevelChanged>();
        bridge.rssi_level_events().add(handler);

        bridge.deliver(NativeNotification::RssiLevel { code: 3 });
        bridge.deliver(NativeNotification::RssiLevel { code: 4 });

        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(bridge.store().rssi(), Some(RssiLevel::Level4));
    }

    #[test]
    fn test_subscriber_added_during_fanout_misses_current_event() {
        let bridge = bridge();
        let (late_seen, late_handler) = recorder::<ScanStateChanged>();

        let inner = bridge.clone();
        let once = Arc::new(Mutex::new(Some(late_handler)));
        bridge
            .scan_state_events()
            .add(Arc::new(move |_: &ScanStateChanged| {
                if let Some(handler) = once.lock().unwrap().take() {
                    inner.scan_state_events().add(handler);
                }
            }));

        bridge.deliver(NativeNotification::ScanState { code: 1 });
        assert!(late_seen.lock().unwrap().is_empty());

        bridge.deliver(NativeNotification::ScanState { code: 0 });
        assert_eq!(
            *late_seen.lock().unwrap(),
            vec![ScanStateChanged {
                state: ScanState::NotScanning
            }]
        );
    }

    #[test]
    fn test_subscriber_removed_during_fanout_misses_current_event() {
        let bridge = bridge();
        let (seen, handler) = recorder::<ScanStateChanged>();

        // The remover is registered first and unsubscribes the recorder
        // before the recorder's turn in the same delivery.
        let victim = Arc::new(Mutex::new(None::<SubscriptionId>));
        let inner = bridge.clone();
        let target = victim.clone();
        bridge
            .scan_state_events()
            .add(Arc::new(move |_: &ScanStateChanged| {
                if let Some(id) = target.lock().unwrap().take() {
                    inner.unsubscribe(id);
                }
            }));
        *victim.lock().unwrap() = Some(bridge.scan_state_events().add(handler));

        bridge.deliver(NativeNotification::ScanState { code: 1 });
        bridge.deliver(NativeNotification::ScanState { code: 0 });

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(bridge.scan_state_events().len(), 1);
    }

    #[test]
    fn test_reentrant_notification_is_queued_in_order() {
        let bridge = bridge();
        let (seen, handler) = recorder::<WifiEvent>();
        bridge.all_events().add(handler);

        let inner = bridge.clone();
        bridge
            .device_state_events()
            .add(Arc::new(move |event: &DeviceStateChanged| {
                if event.state == DeviceState::Activated {
                    inner.deliver(NativeNotification::ScanState { code: 1 });
                }
            }));

        bridge.deliver(NativeNotification::DeviceState { code: 2 });

        let categories: Vec<_> = seen.lock().unwrap().iter().map(|e| e.category()).collect();
        assert_eq!(categories, vec![Category::DeviceState, Category::ScanState]);
    }

    #[test]
    fn test_disconnect_clears_rssi() {
        let bridge = bridge();
        bridge.deliver(NativeNotification::ConnectionState {
            code: 3,
            essid: Some("home-ap".into()),
        });
        bridge.deliver(NativeNotification::RssiLevel { code: 2 });
        assert_eq!(bridge.store().rssi(), Some(RssiLevel::Level2));

        bridge.deliver(NativeNotification::ConnectionState {
            code: 0,
            essid: None,
        });
        assert_eq!(bridge.store().rssi(), None);
        assert_eq!(
            bridge.store().connection_state(),
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn test_unsubscribe_unknown_id() {
        let bridge = bridge();
        assert!(!bridge.unsubscribe(SubscriptionId::new()));
    }
}
