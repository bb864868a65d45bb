//! Manager facade
//!
//! [`WifiManager`] is the public surface of the crate. Property reads come
//! straight from the state store, actions go through the operation sequencer
//! and subscriptions are forwarded to the event bridge. The device handle is
//! acquired lazily on the first call that needs it.

use std::{future::Future, sync::Arc, time::Duration};

use futures::{Stream, stream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    backend::{DeviceBackend, RawHandle},
    config::Settings,
    core::{
        bridge::{EventBridge, Handler, SubscriptionId},
        error::{DeviceError, DeviceResult},
        events::{
            BackgroundScanFinished, ConnectionStateChanged, DeviceStateChanged, RssiLevelChanged,
            ScanStateChanged, WifiEvent,
        },
        handle::{ContextId, DeviceHandle, HandleGuard},
        sequencer::{OperationSequencer, PendingTable},
        store::{StateSnapshot, StateStore},
        types::{
            AccessPoint, AutoScanMode, ConnectTarget, ConnectionState, DeviceState,
            OperationKind, RequestToken, RssiLevel, ScanState, SecurityType, WiFiConfiguration,
            frequency_to_channel,
        },
    },
};

const MAX_ESSID_LEN: usize = 32;

fn validate_essid(essid: &str) -> DeviceResult<()> {
    if essid.is_empty() {
        return Err(DeviceError::InvalidArgument("ESSID must not be empty".into()));
    }
    if essid.len() > MAX_ESSID_LEN {
        return Err(DeviceError::InvalidArgument(format!(
            "ESSID longer than {MAX_ESSID_LEN} bytes"
        )));
    }
    Ok(())
}

fn is_hex(value: &str) -> bool {
    hex::decode(value).is_ok()
}

fn validate_passphrase(security: SecurityType, passphrase: Option<&str>) -> DeviceResult<()> {
    if security == SecurityType::Eap {
        return Err(DeviceError::NotSupported(
            "enterprise (EAP) networks".into(),
        ));
    }
    if !security.needs_passphrase() {
        return Ok(());
    }

    let Some(passphrase) = passphrase else {
        return Err(DeviceError::InvalidArgument(format!(
            "{security:?} network requires a passphrase"
        )));
    };
    let valid = match security {
        SecurityType::Wep => match passphrase.len() {
            5 | 13 => true,
            10 | 26 => is_hex(passphrase),
            _ => false,
        },
        _ => match passphrase.len() {
            8..=63 => true,
            64 => is_hex(passphrase),
            _ => false,
        },
    };
    if valid {
        Ok(())
    } else {
        Err(DeviceError::InvalidArgument(format!(
            "malformed {security:?} passphrase"
        )))
    }
}

fn validate_bssid(bssid: &str) -> DeviceResult<()> {
    let octets: Vec<&str> = bssid.split(':').collect();
    if octets.len() == 6 && octets.iter().all(|o| o.len() == 2 && is_hex(o)) {
        Ok(())
    } else {
        Err(DeviceError::InvalidArgument(format!("malformed BSSID {bssid}")))
    }
}

fn validate_target(target: &ConnectTarget) -> DeviceResult<()> {
    validate_essid(&target.essid)?;
    if let Some(bssid) = &target.bssid {
        validate_bssid(bssid)?;
    }
    validate_passphrase(target.security, target.passphrase.as_deref())
}

fn validate_frequencies(frequencies: &[u32]) -> DeviceResult<()> {
    if frequencies.is_empty() {
        return Err(DeviceError::InvalidArgument(
            "multi scan needs at least one frequency".into(),
        ));
    }
    match frequencies.iter().find(|f| frequency_to_channel(**f) == 0) {
        Some(f) => Err(DeviceError::InvalidArgument(format!(
            "{f} MHz is not a WiFi channel frequency"
        ))),
        None => Ok(()),
    }
}

/// WiFi device manager
///
/// All actions must run on the context that first touched the device (or a
/// worker authorized with [`authorize_worker`](Self::authorize_worker)).
pub struct WifiManager<B: DeviceBackend> {
    backend: Arc<B>,
    bridge: Arc<EventBridge>,
    guard: HandleGuard<B>,
    sequencer: OperationSequencer,
    store: StateStore,
    settings: Settings,
}

impl<B: DeviceBackend> WifiManager<B> {
    pub fn new(backend: Arc<B>, settings: Settings) -> Self {
        let pending = Arc::new(PendingTable::new());
        let bridge = Arc::new(EventBridge::new(StateSnapshot::default(), pending.clone()));
        let store = bridge.store();

        Self {
            guard: HandleGuard::new(backend.clone(), bridge.clone()),
            sequencer: OperationSequencer::new(pending, store.clone()),
            backend,
            bridge,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Validated device handle, opening the session on first use
    async fn handle(&self) -> DeviceResult<DeviceHandle> {
        if let Some(handle) = self.guard.current()? {
            return Ok(handle);
        }

        let handle = self.guard.acquire()?;
        match self.backend.query_state(handle.raw()).await {
            Ok(snapshot) => self.bridge.seed(snapshot),
            Err(e) => warn!("Failed to query initial device state: {}", e),
        }
        Ok(handle)
    }

    /// Run an operation under the configured deadline for its kind
    async fn execute<F, Fut>(
        &self,
        kind: OperationKind,
        target: Option<String>,
        issue: F,
    ) -> DeviceResult<()>
    where
        F: FnOnce(RawHandle, RequestToken) -> Fut,
        Fut: Future<Output = DeviceResult<()>>,
    {
        let timeout = self.settings.timeouts.for_kind(kind);
        self.execute_with_timeout(kind, target, timeout, issue).await
    }

    async fn execute_with_timeout<F, Fut>(
        &self,
        kind: OperationKind,
        target: Option<String>,
        timeout: Option<Duration>,
        issue: F,
    ) -> DeviceResult<()>
    where
        F: FnOnce(RawHandle, RequestToken) -> Fut,
        Fut: Future<Output = DeviceResult<()>>,
    {
        let handle = self.handle().await?;
        let result = self
            .sequencer
            .run(handle, kind, target, timeout, issue)
            .await;

        match &result {
            Ok(()) => info!(%kind, "Operation completed"),
            Err(e) => warn!(%kind, "Operation failed: {}", e),
        }
        result
    }

    // Properties

    pub fn snapshot(&self) -> StateSnapshot {
        self.store.snapshot()
    }

    pub fn device_state(&self) -> DeviceState {
        self.store.device_state()
    }

    pub fn is_active(&self) -> bool {
        self.store.snapshot().is_active()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.store.connection_state()
    }

    pub fn scan_state(&self) -> ScanState {
        self.store.scan_state()
    }

    /// Signal level of the current connection, if any was reported
    pub fn rssi_level(&self) -> Option<RssiLevel> {
        self.store.rssi()
    }

    pub async fn mac_address(&self) -> DeviceResult<String> {
        let handle = self.handle().await?;
        self.backend.mac_address(handle.raw()).await
    }

    pub async fn interface_name(&self) -> DeviceResult<String> {
        let handle = self.handle().await?;
        self.backend.interface_name(handle.raw()).await
    }

    // Actions

    pub async fn activate(&self) -> DeviceResult<()> {
        info!("Activating WiFi device");
        self.execute(
            OperationKind::Activate,
            None,
            |raw, token| self.backend.request_activate(raw, token, false),
        )
        .await
    }

    /// Activate after letting the user pick a network in the platform UI
    pub async fn activate_with_picker(&self) -> DeviceResult<()> {
        info!("Activating WiFi device with picker");
        self.execute(
            OperationKind::Activate,
            None,
            |raw, token| self.backend.request_activate(raw, token, true),
        )
        .await
    }

    pub async fn deactivate(&self) -> DeviceResult<()> {
        info!("Deactivating WiFi device");
        self.execute(
            OperationKind::Deactivate,
            None,
            |raw, token| self.backend.request_deactivate(raw, token),
        )
        .await
    }

    pub async fn scan(&self) -> DeviceResult<()> {
        self.execute(
            OperationKind::Scan,
            None,
            |raw, token| self.backend.request_scan(raw, token),
        )
        .await
    }

    pub async fn scan_specific_ap(&self, essid: &str) -> DeviceResult<()> {
        validate_essid(essid)?;
        self.execute(
            OperationKind::ScanSpecific,
            Some(essid.to_string()),
            |raw, token| self.backend.request_scan_specific(raw, token, essid),
        )
        .await
    }

    pub async fn bssid_scan(&self) -> DeviceResult<()> {
        self.execute(
            OperationKind::BssidScan,
            None,
            |raw, token| self.backend.request_bssid_scan(raw, token),
        )
        .await
    }

    /// Scan only the given channel frequencies (MHz)
    pub async fn multi_scan(&self, frequencies: &[u32]) -> DeviceResult<()> {
        validate_frequencies(frequencies)?;
        self.execute(
            OperationKind::MultiScan,
            None,
            |raw, token| self.backend.request_multi_scan(raw, token, frequencies),
        )
        .await
    }

    pub async fn connect(&self, target: &ConnectTarget) -> DeviceResult<()> {
        let timeout = self.settings.timeouts.for_kind(OperationKind::Connect);
        self.connect_with_timeout(target, timeout).await
    }

    pub async fn connect_with_timeout(
        &self,
        target: &ConnectTarget,
        timeout: Option<Duration>,
    ) -> DeviceResult<()> {
        validate_target(target)?;
        info!(essid = %target.essid, hidden = target.hidden, "Connecting");
        self.execute_with_timeout(
            OperationKind::Connect,
            Some(target.essid.clone()),
            timeout,
            |raw, token| self.backend.request_connect(raw, token, target),
        )
        .await
    }

    /// Connect to a network that does not broadcast its ESSID
    pub async fn connect_hidden_ap(
        &self,
        essid: &str,
        security: SecurityType,
        passphrase: Option<&str>,
    ) -> DeviceResult<()> {
        let target = ConnectTarget {
            essid: essid.to_string(),
            bssid: None,
            security,
            passphrase: passphrase.map(str::to_string),
            hidden: true,
        };
        self.connect(&target).await
    }

    pub async fn disconnect(&self) -> DeviceResult<()> {
        info!("Disconnecting");
        self.execute(
            OperationKind::Disconnect,
            None,
            |raw, token| self.backend.request_disconnect(raw, token),
        )
        .await
    }

    // Queries

    /// Access points found by the last full or multi-frequency scan
    pub async fn found_aps(&self) -> DeviceResult<Vec<AccessPoint>> {
        let handle = self.handle().await?;
        self.backend.found_aps(handle.raw()).await
    }

    /// Access points found by the last specific AP scan
    pub async fn found_specific_aps(&self) -> DeviceResult<Vec<AccessPoint>> {
        let handle = self.handle().await?;
        self.backend.found_specific_aps(handle.raw()).await
    }

    pub async fn found_bssids(&self) -> DeviceResult<Vec<AccessPoint>> {
        let handle = self.handle().await?;
        self.backend.found_bssids(handle.raw()).await
    }

    /// The access point of the current connection
    pub async fn connected_ap(&self) -> DeviceResult<AccessPoint> {
        let handle = self.handle().await?;
        if self.store.connection_state() != ConnectionState::Connected {
            return Err(DeviceError::InvalidState("not connected".into()));
        }
        self.backend
            .connected_ap(handle.raw())
            .await?
            .ok_or_else(|| DeviceError::InvalidState("no connected access point".into()))
    }

    pub async fn configurations(&self) -> DeviceResult<Vec<WiFiConfiguration>> {
        let handle = self.handle().await?;
        self.backend.list_configurations(handle.raw()).await
    }

    pub async fn save_configuration(&self, configuration: &WiFiConfiguration) -> DeviceResult<()> {
        validate_essid(&configuration.essid)?;
        validate_passphrase(configuration.security, configuration.passphrase.as_deref())?;
        let handle = self.handle().await?;
        debug!(essid = %configuration.essid, "Saving configuration");
        self.backend
            .save_configuration(handle.raw(), configuration)
            .await
    }

    pub async fn remove_configuration(&self, essid: &str) -> DeviceResult<()> {
        validate_essid(essid)?;
        let handle = self.handle().await?;
        debug!(%essid, "Removing configuration");
        self.backend.remove_configuration(handle.raw(), essid).await
    }

    pub async fn set_auto_scan_mode(&self, mode: AutoScanMode) -> DeviceResult<()> {
        let handle = self.handle().await?;
        self.backend.set_auto_scan_mode(handle.raw(), mode).await
    }

    // Subscriptions

    pub fn on_device_state_changed(
        &self,
        handler: impl Fn(&DeviceStateChanged) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let handler: Handler<DeviceStateChanged> = Arc::new(handler);
        self.bridge.device_state_events().add(handler)
    }

    pub fn on_connection_state_changed(
        &self,
        handler: impl Fn(&ConnectionStateChanged) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let handler: Handler<ConnectionStateChanged> = Arc::new(handler);
        self.bridge.connection_state_events().add(handler)
    }

    pub fn on_rssi_level_changed(
        &self,
        handler: impl Fn(&RssiLevelChanged) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let handler: Handler<RssiLevelChanged> = Arc::new(handler);
        self.bridge.rssi_level_events().add(handler)
    }

    pub fn on_scan_state_changed(
        &self,
        handler: impl Fn(&ScanStateChanged) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let handler: Handler<ScanStateChanged> = Arc::new(handler);
        self.bridge.scan_state_events().add(handler)
    }

    pub fn on_background_scan_finished(
        &self,
        handler: impl Fn(&BackgroundScanFinished) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let handler: Handler<BackgroundScanFinished> = Arc::new(handler);
        self.bridge.background_scan_events().add(handler)
    }

    /// Every event, in delivery order
    pub fn on_event(
        &self,
        handler: impl Fn(&WifiEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let handler: Handler<WifiEvent> = Arc::new(handler);
        self.bridge.all_events().add(handler)
    }

    /// Remove a subscription; `false` if `id` is unknown
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bridge.unsubscribe(id)
    }

    pub fn watch_state(&self) -> watch::Receiver<StateSnapshot> {
        self.bridge.watch()
    }

    /// Stream of state snapshots, one per store update
    pub fn state_changes(&self) -> impl Stream<Item = StateSnapshot> + Send + 'static {
        stream::unfold(self.bridge.watch(), |mut rx| async move {
            rx.changed().await.ok()?;
            let snapshot = *rx.borrow_and_update();
            Some((snapshot, rx))
        })
    }

    // Handle management

    /// Take an extra reference on the device handle
    pub async fn device_handle(&self) -> DeviceResult<DeviceHandle> {
        self.handle().await?;
        self.guard.acquire()
    }

    /// Give back a reference taken with [`device_handle`](Self::device_handle)
    pub fn release_device_handle(&self) -> DeviceResult<()> {
        self.guard.release()
    }

    pub fn authorize_worker(&self, worker: ContextId) -> DeviceResult<()> {
        self.guard.authorize_worker(worker)
    }

    pub fn revoke_worker(&self, worker: ContextId) -> DeviceResult<()> {
        self.guard.revoke_worker(worker)
    }

    /// Fail outstanding operations and release the device handle
    pub fn shutdown(&self) {
        self.sequencer.pending().abort_all("device manager shut down");
        if self.guard.is_live() {
            info!("Shutting down WiFi device manager");
        }
        self.guard.teardown();
    }
}

impl<B: DeviceBackend> Drop for WifiManager<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use tokio_test::{assert_pending, assert_ready, assert_ready_ok, task};

    use super::*;
    use crate::{
        backend::MockDeviceBackend,
        config::OperationTimeouts,
        core::error::ErrorKind,
    };

    fn manager_with(
        initial: StateSnapshot,
    ) -> (Arc<MockDeviceBackend>, WifiManager<MockDeviceBackend>) {
        let backend = Arc::new(MockDeviceBackend::new());
        backend.set_initial_state(initial);
        let manager = WifiManager::new(backend.clone(), Settings::default());
        (backend, manager)
    }

    fn activated() -> StateSnapshot {
        StateSnapshot {
            device_state: DeviceState::Activated,
            ..StateSnapshot::default()
        }
    }

    fn ap(essid: &str, bssid: &str) -> AccessPoint {
        AccessPoint {
            essid: essid.to_string(),
            bssid: bssid.to_string(),
            security: SecurityType::Wpa2Psk,
            rssi: -55,
            frequency: 2437,
        }
    }

    #[tokio::test]
    async fn test_activate_completes_on_activated_notification() {
        let (backend, manager) = manager_with(StateSnapshot::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.on_device_state_changed(move |e| sink.lock().unwrap().push(e.state));

        let mut activate = task::spawn(manager.activate());
        assert_pending!(activate.poll());
        assert!(backend.last_request(OperationKind::Activate).is_some());

        backend.emit_device_state(DeviceState::Activating);
        assert_eq!(manager.device_state(), DeviceState::Activating);
        assert_pending!(activate.poll());

        // A second activation while the first is in flight is rejected
        let mut second = task::spawn(manager.activate());
        let err = assert_ready!(second.poll()).unwrap_err();
        assert_eq!(err, DeviceError::OperationInProgress(OperationKind::Activate));
        assert_eq!(backend.requests().len(), 1);

        backend.emit_device_state(DeviceState::Activated);
        assert_ready_ok!(activate.poll());
        assert!(manager.is_active());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![DeviceState::Activating, DeviceState::Activated]
        );
    }

    #[tokio::test]
    async fn test_notification_during_initial_query_wins_over_queried_state() {
        let (backend, manager) = manager_with(StateSnapshot {
            device_state: DeviceState::Activated,
            connection_state: ConnectionState::Connected,
            ..StateSnapshot::default()
        });
        backend.notify_during_query(crate::backend::NativeNotification::DeviceState {
            code: DeviceState::Deactivating.into(),
        });

        manager.device_handle().await.unwrap();
        assert_eq!(manager.device_state(), DeviceState::Deactivating);
        assert_eq!(manager.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_overlapping_scans_are_rejected() {
        let (backend, manager) = manager_with(activated());

        let mut scan = task::spawn(manager.scan());
        assert_pending!(scan.poll());

        let mut specific = task::spawn(manager.scan_specific_ap("home-ap"));
        let err = assert_ready!(specific.poll()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OperationInProgress);

        backend.emit_scan_state(ScanState::Scanning);
        for kind in [OperationKind::BssidScan, OperationKind::MultiScan] {
            let result = match kind {
                OperationKind::BssidScan => manager.bssid_scan().await,
                _ => manager.multi_scan(&[2412]).await,
            };
            assert_eq!(result.unwrap_err().kind(), ErrorKind::OperationInProgress);
        }

        backend.emit_scan_state(ScanState::NotScanning);
        assert_ready_ok!(scan.poll());

        let mut specific = task::spawn(manager.scan_specific_ap("home-ap"));
        assert_pending!(specific.poll());
        let request = backend.last_request(OperationKind::ScanSpecific).unwrap();
        assert_eq!(request.argument.as_deref(), Some("home-ap"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out_and_late_notification_is_discarded() {
        let (backend, manager) = manager_with(activated());
        let target = ConnectTarget::secured("apX", SecurityType::Wpa2Psk, "password123");

        let mut connect =
            task::spawn(manager.connect_with_timeout(&target, Some(Duration::from_secs(2))));
        assert_pending!(connect.poll());
        let stale = backend.last_request(OperationKind::Connect).unwrap().token;

        tokio::time::advance(Duration::from_millis(1999)).await;
        assert_pending!(connect.poll());
        tokio::time::advance(Duration::from_millis(1)).await;
        let err = assert_ready!(connect.poll()).unwrap_err();
        assert_eq!(err, DeviceError::TimedOut(OperationKind::Connect));

        // A new connect to another AP takes the freed slot
        let other = ConnectTarget::open("apY");
        let mut retry = task::spawn(manager.connect(&other));
        assert_pending!(retry.poll());
        let current = backend.last_request(OperationKind::Connect).unwrap().token;
        assert!(current.generation > stale.generation);

        tokio::time::advance(Duration::from_millis(500)).await;
        backend.emit_connection_state(ConnectionState::Connected, Some("apX"));
        backend.emit_request_result(stale, Some(ErrorKind::Unknown));
        assert_pending!(retry.poll());

        backend.emit_connection_state(ConnectionState::Connected, Some("apY"));
        assert_ready_ok!(retry.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_variants_share_the_configured_scan_deadline() {
        let backend = Arc::new(MockDeviceBackend::new());
        backend.set_initial_state(activated());
        let settings = Settings {
            timeouts: OperationTimeouts {
                scan: Some(Duration::from_secs(3)),
                ..OperationTimeouts::NONE
            },
            ..Settings::default()
        };
        let manager = WifiManager::new(backend.clone(), settings);

        let mut bssid_scan = task::spawn(manager.bssid_scan());
        assert_pending!(bssid_scan.poll());
        tokio::time::advance(Duration::from_secs(3)).await;
        let err = assert_ready!(bssid_scan.poll()).unwrap_err();
        assert_eq!(err, DeviceError::TimedOut(OperationKind::BssidScan));

        // Deactivation has no deadline here
        let mut deactivate = task::spawn(manager.deactivate());
        assert_pending!(deactivate.poll());
        tokio::time::advance(Duration::from_secs(600)).await;
        assert_pending!(deactivate.poll());
    }

    #[tokio::test]
    async fn test_cancelled_operation_does_not_resolve_newer_one() {
        let (backend, manager) = manager_with(activated());
        let target = ConnectTarget::open("cafe");

        let mut first = task::spawn(manager.connect(&target));
        assert_pending!(first.poll());
        let cancelled = backend.last_request(OperationKind::Connect).unwrap().token;
        drop(first);

        let mut second = task::spawn(manager.connect(&target));
        assert_pending!(second.poll());
        let current = backend.last_request(OperationKind::Connect).unwrap().token;

        backend.emit_request_result(cancelled, None);
        assert_pending!(second.poll());

        backend.emit_request_result(current, Some(ErrorKind::PermissionDenied));
        let err = assert_ready!(second.poll()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_foreign_context_is_rejected_before_native_call() {
        let (backend, manager) = manager_with(activated());
        manager.device_handle().await.unwrap();
        let manager = Arc::new(manager);

        let remote = manager.clone();
        let result = std::thread::spawn(move || tokio_test::block_on(remote.scan()))
            .join()
            .unwrap();

        assert_eq!(result, Err(DeviceError::InvalidContext));
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_arguments_fail_before_handle_creation() {
        let (backend, manager) = manager_with(activated());

        let cases = [
            ConnectTarget::open(""),
            ConnectTarget::open("x".repeat(33)),
            ConnectTarget::secured("home", SecurityType::Wpa2Psk, "short"),
            ConnectTarget {
                bssid: Some("00:11:22".to_string()),
                ..ConnectTarget::open("home")
            },
        ];
        for target in &cases {
            let err = manager.connect(target).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{target:?}");
        }

        let eap = ConnectTarget::secured("corp", SecurityType::Eap, "irrelevant");
        assert_eq!(
            manager.connect(&eap).await.unwrap_err().kind(),
            ErrorKind::NotSupported
        );
        assert_eq!(
            manager.multi_scan(&[]).await.unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            manager.multi_scan(&[1234]).await.unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            manager.scan_specific_ap("").await.unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(backend.created_handles(), 0);
    }

    #[tokio::test]
    async fn test_state_preconditions() {
        let (_backend, manager) = manager_with(StateSnapshot::default());

        assert_eq!(
            manager.scan().await.unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            manager.deactivate().await.unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            manager.disconnect().await.unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            manager
                .connect(&ConnectTarget::open("home"))
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidState
        );
    }

    #[tokio::test]
    async fn test_rejected_request_frees_scan_slot() {
        let (backend, manager) = manager_with(activated());
        backend.reject_requests(OperationKind::Scan, ErrorKind::NotSupported);

        assert_eq!(
            manager.scan().await.unwrap_err().kind(),
            ErrorKind::NotSupported
        );

        let mut bssid_scan = task::spawn(manager.bssid_scan());
        assert_pending!(bssid_scan.poll());
    }

    #[tokio::test]
    async fn test_connected_ap_requires_connection() {
        let (backend, manager) = manager_with(activated());
        assert_eq!(
            manager.connected_ap().await.unwrap_err().kind(),
            ErrorKind::InvalidState
        );

        let home = ap("home", "00:11:22:33:44:55");
        backend.set_connected_ap(Some(home.clone()));
        backend.emit_connection_state(ConnectionState::Connected, Some("home"));
        assert_eq!(manager.connected_ap().await.unwrap(), home);
    }

    #[tokio::test]
    async fn test_scan_results_are_read_from_backend() {
        let (backend, manager) = manager_with(activated());
        backend.set_found_aps(vec![ap("home", "00:11:22:33:44:55")]);
        backend.set_bssids(vec![
            ap("home", "00:11:22:33:44:55"),
            ap("home", "00:11:22:33:44:66"),
        ]);

        assert_eq!(manager.found_aps().await.unwrap().len(), 1);
        assert_eq!(manager.found_bssids().await.unwrap().len(), 2);
        assert!(manager.found_specific_aps().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_configurations_round_trip_through_backend() {
        let (backend, manager) = manager_with(activated());
        let config = WiFiConfiguration::new("home", SecurityType::Wpa2Psk).with_passphrase("password123");

        manager.save_configuration(&config).await.unwrap();
        assert_eq!(manager.configurations().await.unwrap(), vec![config]);

        manager.remove_configuration("home").await.unwrap();
        assert!(manager.configurations().await.unwrap().is_empty());
        assert_eq!(
            manager.remove_configuration("home").await.unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        manager
            .set_auto_scan_mode(AutoScanMode::Exponential)
            .await
            .unwrap();
        assert_eq!(backend.auto_scan_mode(), Some(AutoScanMode::Exponential));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let (backend, manager) = manager_with(activated());
        manager.device_handle().await.unwrap();

        let levels = Arc::new(Mutex::new(Vec::new()));
        let sink = levels.clone();
        let id = manager.on_rssi_level_changed(move |e| sink.lock().unwrap().push(e.level));

        backend.emit(crate::backend::NativeNotification::RssiLevel { code: 3 });
        assert!(manager.unsubscribe(id));
        backend.emit(crate::backend::NativeNotification::RssiLevel { code: 1 });

        assert_eq!(*levels.lock().unwrap(), vec![RssiLevel::Level3]);
        assert_eq!(manager.rssi_level(), Some(RssiLevel::Level1));
        assert!(!manager.unsubscribe(id));
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_and_releases_handle() {
        let (backend, manager) = manager_with(StateSnapshot::default());

        let mut activate = task::spawn(manager.activate());
        assert_pending!(activate.poll());

        manager.shutdown();
        let err = assert_ready!(activate.poll()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(backend.released_handles().len(), 1);
        drop(activate);

        assert_eq!(
            manager.scan().await.unwrap_err().kind(),
            ErrorKind::InvalidState
        );
    }

    #[tokio::test]
    async fn test_picker_and_hidden_connect_reach_backend() {
        let backend = Arc::new(MockDeviceBackend::simulated());
        let manager = WifiManager::new(backend.clone(), Settings::default());

        manager.activate_with_picker().await.unwrap();
        let request = backend.last_request(OperationKind::Activate).unwrap();
        assert_eq!(request.argument.as_deref(), Some("picker"));

        manager
            .connect_hidden_ap("stealth", SecurityType::Wpa2Psk, Some("password123"))
            .await
            .unwrap();
        let request = backend.last_request(OperationKind::Connect).unwrap();
        assert_eq!(request.argument.as_deref(), Some("stealth"));

        assert_eq!(
            manager
                .connect_hidden_ap("stealth", SecurityType::Wpa2Psk, None)
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(manager.interface_name().await.unwrap(), "wlan0");
    }

    #[tokio::test]
    async fn test_simulated_session() {
        let backend = Arc::new(MockDeviceBackend::simulated());
        let settings = Settings {
            timeouts: OperationTimeouts::NONE,
            ..Settings::default()
        };
        let manager = WifiManager::new(backend.clone(), settings);
        let mut changes = Box::pin(manager.state_changes());

        manager.activate().await.unwrap();
        manager.scan().await.unwrap();
        manager
            .connect(&ConnectTarget::secured("home", SecurityType::Sae, "password123"))
            .await
            .unwrap();
        assert_eq!(manager.connection_state(), ConnectionState::Connected);

        manager.disconnect().await.unwrap();
        manager.deactivate().await.unwrap();
        assert_eq!(manager.snapshot(), StateSnapshot::default());

        // watch coalesces intermediate values; the latest one is observed
        assert_eq!(changes.next().await, Some(StateSnapshot::default()));
    }
}
