//! Device state store
//!
//! Single source of truth for device, connection and scan state. The event
//! bridge owns the only [`StateWriter`]; everyone else reads through a
//! [`StateStore`].

use std::{
    collections::HashSet,
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::core::types::{ConnectionState, DeviceState, RssiLevel, ScanState};

/// Consistent view of the device at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub device_state: DeviceState,
    pub connection_state: ConnectionState,
    pub scan_state: ScanState,
    /// Last reported signal level of the connected AP
    pub rssi: Option<RssiLevel>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            device_state: DeviceState::Deactivated,
            connection_state: ConnectionState::Disconnected,
            scan_state: ScanState::NotScanning,
            rssi: None,
        }
    }
}

impl StateSnapshot {
    pub fn is_active(&self) -> bool {
        self.device_state == DeviceState::Activated
    }
}

/// One field of a [`StateSnapshot`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    DeviceState,
    ConnectionState,
    ScanState,
    Rssi,
}

/// Create a connected writer/reader pair
pub fn state_store(initial: StateSnapshot) -> (StateWriter, StateStore) {
    let (tx, rx) = watch::channel(initial);
    let writer = StateWriter {
        tx,
        written: Mutex::new(HashSet::new()),
    };
    (writer, StateStore { rx })
}

/// Write half of the store
#[derive(Debug)]
pub struct StateWriter {
    tx: watch::Sender<StateSnapshot>,
    /// Fields set by device notifications; seeding never overwrites them
    written: Mutex<HashSet<Field>>,
}

impl StateWriter {
    fn written(&self) -> MutexGuard<'_, HashSet<Field>> {
        self.written.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `update` to `fields` atomically and return the resulting snapshot
    pub fn update(
        &self,
        fields: &[Field],
        update: impl FnOnce(&mut StateSnapshot),
    ) -> StateSnapshot {
        let mut written = self.written();
        written.extend(fields.iter().copied());

        let mut current = StateSnapshot::default();
        self.tx.send_modify(|state| {
            update(state);
            current = *state;
        });
        current
    }

    /// Fill in the fields no notification has set yet
    pub fn seed(&self, seeded: StateSnapshot) -> StateSnapshot {
        let written = self.written();
        let fresh = |field: Field| !written.contains(&field);

        let mut current = seeded;
        self.tx.send_modify(|state| {
            if fresh(Field::DeviceState) {
                state.device_state = seeded.device_state;
            }
            if fresh(Field::ConnectionState) {
                state.connection_state = seeded.connection_state;
            }
            if fresh(Field::ScanState) {
                state.scan_state = seeded.scan_state;
            }
            if fresh(Field::Rssi) {
                state.rssi = seeded.rssi;
            }
            current = *state;
        });
        current
    }
}

/// Read half of the store
#[derive(Debug, Clone)]
pub struct StateStore {
    rx: watch::Receiver<StateSnapshot>,
}

impl StateStore {
    pub fn snapshot(&self) -> StateSnapshot {
        *self.rx.borrow()
    }

    pub fn device_state(&self) -> DeviceState {
        self.rx.borrow().device_state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.rx.borrow().connection_state
    }

    pub fn scan_state(&self) -> ScanState {
        self.rx.borrow().scan_state
    }

    pub fn rssi(&self) -> Option<RssiLevel> {
        self.rx.borrow().rssi
    }

    /// Receiver that can await changes
    pub fn watch(&self) -> watch::Receiver<StateSnapshot> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_starts_with_initial_snapshot() {
        let (_writer, store) = state_store(StateSnapshot::default());
        assert_eq!(store.device_state(), DeviceState::Deactivated);
        assert_eq!(store.connection_state(), ConnectionState::Disconnected);
        assert_eq!(store.scan_state(), ScanState::NotScanning);
        assert_eq!(store.rssi(), None);
        assert!(!store.snapshot().is_active());
    }

    #[test]
    fn test_update_is_visible_as_a_whole() {
        let (writer, store) = state_store(StateSnapshot::default());
        let applied = writer.update(
            &[Field::DeviceState, Field::ConnectionState, Field::Rssi],
            |s| {
                s.device_state = DeviceState::Activated;
                s.connection_state = ConnectionState::Connected;
                s.rssi = Some(RssiLevel::Level3);
            },
        );

        assert_eq!(store.snapshot(), applied);
        assert!(store.snapshot().is_active());
        assert_eq!(store.rssi(), Some(RssiLevel::Level3));
    }

    #[test]
    fn test_seed_keeps_fields_set_by_notifications() {
        let (writer, store) = state_store(StateSnapshot::default());
        writer.update(&[Field::DeviceState], |s| {
            s.device_state = DeviceState::Deactivated;
        });

        let seeded = writer.seed(StateSnapshot {
            device_state: DeviceState::Activated,
            connection_state: ConnectionState::Connected,
            scan_state: ScanState::NotScanning,
            rssi: Some(RssiLevel::Level2),
        });

        assert_eq!(seeded, store.snapshot());
        assert_eq!(store.device_state(), DeviceState::Deactivated);
        assert_eq!(store.connection_state(), ConnectionState::Connected);
        assert_eq!(store.rssi(), Some(RssiLevel::Level2));
    }

    #[tokio::test]
    async fn test_watch_observes_changes() {
        let (writer, store) = state_store(StateSnapshot::default());
        let mut rx = store.watch();

        writer.update(&[Field::ScanState], |s| s.scan_state = ScanState::Scanning);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().scan_state, ScanState::Scanning);
    }
}
