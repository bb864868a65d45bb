//! Device handle lifecycle and execution context affinity

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, ThreadId},
};

use tracing::{debug, info, warn};

use crate::{
    backend::{DeviceBackend, NotificationCallback, RawHandle},
    core::{
        bridge::EventBridge,
        error::{DeviceError, DeviceResult},
        events::Category,
    },
};

/// Identity of an execution context (the OS thread driving the device session)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(ThreadId);

impl ContextId {
    pub fn current() -> Self {
        Self(thread::current().id())
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Live device handle, bound to the context that created it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandle {
    raw: RawHandle,
    owner: ContextId,
}

impl DeviceHandle {
    pub fn raw(&self) -> RawHandle {
        self.raw
    }

    pub fn owner(&self) -> ContextId {
        self.owner
    }
}

#[derive(Debug)]
struct LiveHandle {
    handle: DeviceHandle,
    refs: usize,
    workers: HashSet<ContextId>,
}

impl LiveHandle {
    fn check_context(&self) -> DeviceResult<DeviceHandle> {
        let current = ContextId::current();
        if current == self.handle.owner || self.workers.contains(&current) {
            Ok(self.handle)
        } else {
            warn!(%current, owner = %self.handle.owner, "Rejecting handle use from foreign context");
            Err(DeviceError::InvalidContext)
        }
    }
}

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Empty,
    Live(LiveHandle),
    Released,
}

/// Owns the single native handle of a device backend
///
/// The handle is created on the first [`acquire`](HandleGuard::acquire),
/// shared through a reference count, and released exactly once: on the last
/// [`release`](HandleGuard::release), on [`teardown`](HandleGuard::teardown),
/// or when the guard is dropped.
pub struct HandleGuard<B: DeviceBackend> {
    backend: Arc<B>,
    bridge: Arc<EventBridge>,
    slot: Mutex<Slot>,
}

impl<B: DeviceBackend> HandleGuard<B> {
    pub fn new(backend: Arc<B>, bridge: Arc<EventBridge>) -> Self {
        Self {
            backend,
            bridge,
            slot: Mutex::new(Slot::Empty),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the live handle, creating it on first use
    ///
    /// Each successful call takes one reference that is given back with
    /// [`release`](Self::release).
    pub fn acquire(&self) -> DeviceResult<DeviceHandle> {
        let mut slot = self.slot();
        match &mut *slot {
            Slot::Live(live) => {
                let handle = live.check_context()?;
                live.refs += 1;
                Ok(handle)
            }
            Slot::Released => Err(DeviceError::InvalidState(
                "device handle already released".into(),
            )),
            Slot::Empty => {
                let raw = self.backend.create_handle()?;
                if let Err(e) = self.register_callbacks(raw) {
                    self.backend.release_handle(raw);
                    return Err(e);
                }

                let handle = DeviceHandle {
                    raw,
                    owner: ContextId::current(),
                };
                info!(?raw, owner = %handle.owner, "Device handle created");
                *slot = Slot::Live(LiveHandle {
                    handle,
                    refs: 1,
                    workers: HashSet::new(),
                });
                Ok(handle)
            }
        }
    }

    fn register_callbacks(&self, raw: RawHandle) -> DeviceResult<()> {
        for (index, category) in Category::ALL.iter().enumerate() {
            let bridge = self.bridge.clone();
            let callback: NotificationCallback = Arc::new(move |notification| {
                bridge.deliver(notification);
            });

            if let Err(e) = self.backend.register_callback(raw, *category, callback) {
                warn!(?category, "Failed to register notification callback: {}", e);
                for registered in &Category::ALL[..index] {
                    self.backend.unregister_callback(raw, *registered);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// The live handle if one exists, validated against the calling context
    pub fn current(&self) -> DeviceResult<Option<DeviceHandle>> {
        match &*self.slot() {
            Slot::Live(live) => live.check_context().map(Some),
            Slot::Empty => Ok(None),
            Slot::Released => Err(DeviceError::InvalidState(
                "device handle already released".into(),
            )),
        }
    }

    /// The live handle, validated against the calling context
    pub fn validate(&self) -> DeviceResult<DeviceHandle> {
        self.current()?
            .ok_or_else(|| DeviceError::InvalidState("device handle not acquired".into()))
    }

    /// Give back one reference; the last one releases the native handle
    pub fn release(&self) -> DeviceResult<()> {
        let mut slot = self.slot();
        let Slot::Live(live) = &mut *slot else {
            return Ok(());
        };
        live.check_context()?;

        live.refs = live.refs.saturating_sub(1);
        if live.refs == 0 {
            let raw = live.handle.raw;
            *slot = Slot::Released;
            drop(slot);
            self.release_native(raw);
        }
        Ok(())
    }

    /// Release the native handle regardless of outstanding references
    pub fn teardown(&self) {
        let previous = std::mem::replace(&mut *self.slot(), Slot::Released);
        if let Slot::Live(live) = previous {
            self.release_native(live.handle.raw);
        }
    }

    fn release_native(&self, raw: RawHandle) {
        for category in Category::ALL {
            self.backend.unregister_callback(raw, category);
        }
        self.backend.release_handle(raw);
        info!(?raw, "Device handle released");
    }

    /// Bind an additional context to the handle; owner only
    pub fn authorize_worker(&self, worker: ContextId) -> DeviceResult<()> {
        let mut slot = self.slot();
        let Slot::Live(live) = &mut *slot else {
            return Err(DeviceError::InvalidState("device handle not acquired".into()));
        };
        if ContextId::current() != live.handle.owner {
            return Err(DeviceError::InvalidContext);
        }
        debug!(%worker, "Authorizing worker context");
        live.workers.insert(worker);
        Ok(())
    }

    pub fn revoke_worker(&self, worker: ContextId) -> DeviceResult<()> {
        let mut slot = self.slot();
        let Slot::Live(live) = &mut *slot else {
            return Ok(());
        };
        if ContextId::current() != live.handle.owner {
            return Err(DeviceError::InvalidContext);
        }
        live.workers.remove(&worker);
        Ok(())
    }

    pub fn is_live(&self) -> bool {
        matches!(&*self.slot(), Slot::Live(_))
    }
}

impl<B: DeviceBackend> Drop for HandleGuard<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::MockDeviceBackend,
        core::{error::ErrorKind, sequencer::PendingTable, store::StateSnapshot},
    };

    fn guard() -> (Arc<MockDeviceBackend>, HandleGuard<MockDeviceBackend>) {
        let backend = Arc::new(MockDeviceBackend::new());
        let bridge = Arc::new(EventBridge::new(
            StateSnapshot::default(),
            Arc::new(PendingTable::new()),
        ));
        (backend.clone(), HandleGuard::new(backend, bridge))
    }

    #[test]
    fn test_acquire_creates_once_and_registers_callbacks() {
        let (backend, guard) = guard();
        assert!(guard.current().unwrap().is_none());

        let first = guard.acquire().unwrap();
        let second = guard.acquire().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.owner(), ContextId::current());
        assert_eq!(backend.created_handles(), 1);
        assert_eq!(backend.registered_categories().len(), Category::ALL.len());
    }

    #[test]
    fn test_release_is_reference_counted_and_idempotent() {
        let (backend, guard) = guard();
        let handle = guard.acquire().unwrap();
        guard.acquire().unwrap();

        guard.release().unwrap();
        assert!(guard.is_live());
        assert!(backend.released_handles().is_empty());

        guard.release().unwrap();
        assert!(!guard.is_live());
        assert_eq!(backend.released_handles(), vec![handle.raw()]);
        assert!(backend.registered_categories().is_empty());

        // Further releases are no-ops
        guard.release().unwrap();
        guard.teardown();
        assert_eq!(backend.released_handles().len(), 1);

        // A released session cannot be reopened
        assert_eq!(guard.acquire().unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_creation_failures_are_reported() {
        for kind in [
            ErrorKind::NotSupported,
            ErrorKind::PermissionDenied,
            ErrorKind::OutOfResources,
        ] {
            let (backend, guard) = guard();
            backend.fail_handle_creation(Some(kind));
            assert_eq!(guard.acquire().unwrap_err().kind(), kind);
            assert!(!guard.is_live());
        }
    }

    #[test]
    fn test_foreign_context_is_rejected() {
        let (_backend, guard) = guard();
        guard.acquire().unwrap();
        let guard = Arc::new(guard);

        let remote = guard.clone();
        let result = std::thread::spawn(move || remote.validate())
            .join()
            .unwrap();
        assert_eq!(result, Err(DeviceError::InvalidContext));
        assert!(guard.validate().is_ok());
    }

    #[test]
    fn test_authorized_worker_may_use_handle() {
        let (_backend, guard) = guard();
        guard.acquire().unwrap();
        let guard = Arc::new(guard);

        let (tx, rx) = std::sync::mpsc::channel();
        let (go_tx, go_rx) = std::sync::mpsc::channel::<()>();
        let remote = guard.clone();
        let worker = std::thread::spawn(move || {
            tx.send(ContextId::current()).unwrap();
            go_rx.recv().unwrap();
            remote.validate().map(|h| h.raw())
        });

        let worker_id = rx.recv().unwrap();
        guard.authorize_worker(worker_id).unwrap();
        go_tx.send(()).unwrap();
        assert!(worker.join().unwrap().is_ok());
    }

    #[test]
    fn test_drop_releases_native_handle() {
        let (backend, guard) = guard();
        let handle = guard.acquire().unwrap();
        drop(guard);
        assert_eq!(backend.released_handles(), vec![handle.raw()]);
    }
}
