//! Operation sequencer
//!
//! Turns "issue a native request, then wait for its terminal notification"
//! into one awaitable per operation. At most one operation per
//! [`ExclusivityClass`] is outstanding; a second request in the same class is
//! rejected with [`DeviceError::OperationInProgress`] instead of being queued
//! or merged.
//!
//! Every reserved operation gets a fresh generation. Completions are matched
//! on kind and generation, so a notification that arrives after its operation
//! timed out or was cancelled can never settle a newer request.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{
    backend::RawHandle,
    core::{
        error::{DeviceError, DeviceResult, ErrorKind},
        handle::DeviceHandle,
        store::{StateSnapshot, StateStore},
        types::{
            ConnectionState, DeviceState, ExclusivityClass, OperationKind, RequestToken, ScanState,
        },
    },
};

/// Decoded notification relevant to pending operations
#[derive(Debug, Clone, Copy)]
pub enum Completion<'a> {
    Device {
        previous: DeviceState,
        current: DeviceState,
    },
    Connection {
        state: ConnectionState,
        essid: Option<&'a str>,
    },
    Scan {
        state: ScanState,
    },
    Request {
        token: RequestToken,
        error: Option<ErrorKind>,
    },
}

#[derive(Debug)]
struct Slot {
    token: RequestToken,
    target: Option<String>,
    tx: oneshot::Sender<DeviceResult<()>>,
}

impl Slot {
    fn targets(&self, essid: Option<&str>) -> bool {
        match (self.target.as_deref(), essid) {
            (Some(target), Some(essid)) => target == essid,
            _ => true,
        }
    }
}

/// Outstanding operations, one slot per exclusivity class
#[derive(Debug, Default)]
pub struct PendingTable {
    slots: Mutex<HashMap<ExclusivityClass, Slot>>,
    next_generation: AtomicU64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<ExclusivityClass, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the slot of `kind`'s class
    pub fn reserve(
        self: &Arc<Self>,
        kind: OperationKind,
        target: Option<String>,
    ) -> DeviceResult<PendingOperation> {
        let mut slots = self.slots();
        if let Some(existing) = slots.get(&kind.class()) {
            debug!(requested = %kind, outstanding = %existing.token, "Rejecting overlapping request");
            return Err(DeviceError::OperationInProgress(existing.token.kind));
        }

        let token = RequestToken {
            kind,
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed) + 1,
        };
        let (tx, rx) = oneshot::channel();
        slots.insert(kind.class(), Slot { token, target, tx });

        Ok(PendingOperation {
            token,
            rx,
            table: self.clone(),
        })
    }

    /// Token of the operation outstanding in `class`
    pub fn outstanding(&self, class: ExclusivityClass) -> Option<RequestToken> {
        self.slots().get(&class).map(|slot| slot.token)
    }

    /// Drop the slot held by `token`, if it still holds it
    fn release(&self, token: RequestToken) -> bool {
        let mut slots = self.slots();
        match slots.get(&token.kind.class()) {
            Some(slot) if slot.token == token => {
                slots.remove(&token.kind.class());
                true
            }
            _ => false,
        }
    }

    fn settle(
        &self,
        class: ExclusivityClass,
        decide: impl FnOnce(&Slot) -> Option<DeviceResult<()>>,
    ) {
        let (slot, result) = {
            let mut slots = self.slots();
            let Some(result) = slots.get(&class).and_then(decide) else {
                return;
            };
            match slots.remove(&class) {
                Some(slot) => (slot, result),
                None => return,
            }
        };

        debug!(token = %slot.token, ok = result.is_ok(), "Operation resolved");
        if slot.tx.send(result).is_err() {
            debug!(token = %slot.token, "Resolved operation no longer awaited");
        }
    }

    /// Resolve whatever pending operation `completion` terminates
    pub fn resolve(&self, completion: &Completion<'_>) {
        match *completion {
            Completion::Request { token, error } => {
                let matched = self
                    .outstanding(token.kind.class())
                    .is_some_and(|current| current == token);
                if !matched {
                    debug!(%token, "Discarding completion for stale request");
                    return;
                }
                self.settle(token.kind.class(), |slot| {
                    (slot.token == token).then(|| match error {
                        None => Ok(()),
                        Some(kind) => Err(DeviceError::from_native(kind, token.kind)),
                    })
                });
            }
            Completion::Device { previous, current } => {
                self.settle(ExclusivityClass::Power, |slot| {
                    match (slot.token.kind, current) {
                        (OperationKind::Activate, DeviceState::Activated) => Some(Ok(())),
                        (OperationKind::Activate, DeviceState::Deactivated)
                            if previous == DeviceState::Activating =>
                        {
                            Some(Err(DeviceError::Unknown("activation aborted by device".into())))
                        }
                        (OperationKind::Deactivate, DeviceState::Deactivated) => Some(Ok(())),
                        (OperationKind::Deactivate, DeviceState::Activated)
                            if previous == DeviceState::Deactivating =>
                        {
                            Some(Err(DeviceError::Unknown(
                                "deactivation aborted by device".into(),
                            )))
                        }
                        _ => None,
                    }
                });
            }
            Completion::Scan { state } => {
                if state == ScanState::NotScanning {
                    self.settle(ExclusivityClass::Scan, |_| Some(Ok(())));
                }
            }
            Completion::Connection { state, essid } => {
                self.settle(ExclusivityClass::Link, |slot| {
                    match (slot.token.kind, state) {
                        (OperationKind::Connect, ConnectionState::Connected)
                            if slot.targets(essid) =>
                        {
                            Some(Ok(()))
                        }
                        (OperationKind::Connect, ConnectionState::Failure)
                            if slot.targets(essid) =>
                        {
                            Some(Err(DeviceError::Unknown(format!(
                                "association with {} failed",
                                slot.target.as_deref().unwrap_or("access point")
                            ))))
                        }
                        (OperationKind::Disconnect, ConnectionState::Disconnected) => Some(Ok(())),
                        _ => None,
                    }
                });
            }
        }
    }

    /// Fail every outstanding operation, used on teardown
    pub fn abort_all(&self, reason: &str) {
        let drained: Vec<Slot> = self.slots().drain().map(|(_, slot)| slot).collect();
        for slot in drained {
            debug!(token = %slot.token, reason, "Aborting pending operation");
            let _ = slot
                .tx
                .send(Err(DeviceError::InvalidState(reason.to_string())));
        }
    }
}

/// Awaitable handle on a reserved operation
///
/// Dropping it before completion cancels the operation: the slot is freed
/// for new requests and a later completion for this generation is discarded.
#[derive(Debug)]
pub struct PendingOperation {
    token: RequestToken,
    rx: oneshot::Receiver<DeviceResult<()>>,
    table: Arc<PendingTable>,
}

impl PendingOperation {
    pub fn token(&self) -> RequestToken {
        self.token
    }

    /// Wait for the terminal notification, or until `timeout` expires
    pub async fn wait(mut self, timeout: Option<Duration>) -> DeviceResult<()> {
        let kind = self.token.kind;
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut self.rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(token = %self.token, ?limit, "Operation timed out");
                    return Err(DeviceError::TimedOut(kind));
                }
            },
            None => (&mut self.rx).await,
        };

        outcome.unwrap_or_else(|_| {
            Err(DeviceError::InvalidState(
                "device session closed before completion".into(),
            ))
        })
    }
}

impl Drop for PendingOperation {
    fn drop(&mut self) {
        if self.table.release(self.token) {
            debug!(token = %self.token, "Pending operation abandoned");
        }
    }
}

/// Issues requests and awaits their completion
pub struct OperationSequencer {
    pending: Arc<PendingTable>,
    store: StateStore,
}

impl OperationSequencer {
    pub fn new(pending: Arc<PendingTable>, store: StateStore) -> Self {
        Self { pending, store }
    }

    pub fn pending(&self) -> &Arc<PendingTable> {
        &self.pending
    }

    /// Reject requests the current device state cannot accept
    fn check_preconditions(kind: OperationKind, state: &StateSnapshot) -> DeviceResult<()> {
        match kind {
            OperationKind::Activate if state.device_state == DeviceState::Activated => Err(
                DeviceError::InvalidState("device is already activated".into()),
            ),
            OperationKind::Deactivate if state.device_state == DeviceState::Deactivated => Err(
                DeviceError::InvalidState("device is already deactivated".into()),
            ),
            _ if kind.is_scan() && state.scan_state == ScanState::Scanning => {
                Err(DeviceError::OperationInProgress(kind))
            }
            OperationKind::Disconnect
                if state.connection_state == ConnectionState::Disconnected =>
            {
                Err(DeviceError::InvalidState("no active connection".into()))
            }
            _ if kind.is_scan() || kind == OperationKind::Connect => {
                if state.device_state == DeviceState::Activated {
                    Ok(())
                } else {
                    Err(DeviceError::InvalidState("device is not activated".into()))
                }
            }
            _ => Ok(()),
        }
    }

    /// Reserve `kind`, issue the native request and await its completion
    ///
    /// `issue` performs the native call; its result only says whether the
    /// request was accepted. Completion is driven by notifications.
    pub async fn run<F, Fut>(
        &self,
        handle: DeviceHandle,
        kind: OperationKind,
        target: Option<String>,
        timeout: Option<Duration>,
        issue: F,
    ) -> DeviceResult<()>
    where
        F: FnOnce(RawHandle, RequestToken) -> Fut,
        Fut: Future<Output = DeviceResult<()>>,
    {
        Self::check_preconditions(kind, &self.store.snapshot())?;
        let operation = self.pending.reserve(kind, target)?;

        let token = operation.token();
        debug!(%token, "Issuing device request");
        if let Err(e) = issue(handle.raw(), token).await {
            warn!(%token, "Device subsystem rejected request: {}", e);
            return Err(e);
        }

        operation.wait(timeout).await
    }
}
