//! Mock device backend for testing and simulation

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::debug;

use crate::{
    backend::{DeviceBackend, NativeNotification, NotificationCallback, RawHandle},
    core::{
        error::{DeviceError, DeviceResult, ErrorKind},
        events::Category,
        store::StateSnapshot,
        types::{
            AccessPoint, AutoScanMode, ConnectTarget, ConnectionState, DeviceState, OperationKind,
            RequestToken, ScanState, WiFiConfiguration,
        },
    },
};

/// A request the mock accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRequest {
    pub token: RequestToken,
    /// ESSID, frequency list or picker flag, depending on the request
    pub argument: Option<String>,
}

/// Internal state for the mock backend
struct MockState {
    next_handle: u64,
    live: Option<RawHandle>,
    created: usize,
    released: Vec<RawHandle>,
    callbacks: HashMap<Category, NotificationCallback>,
    requests: Vec<MockRequest>,
    rejections: HashMap<OperationKind, ErrorKind>,
    create_failure: Option<ErrorKind>,
    initial: StateSnapshot,
    found_aps: Vec<AccessPoint>,
    specific_aps: Vec<AccessPoint>,
    bssids: Vec<AccessPoint>,
    connected: Option<AccessPoint>,
    configurations: Vec<WiFiConfiguration>,
    auto_scan_mode: Option<AutoScanMode>,
    auto_complete: bool,
    query_notification: Option<NativeNotification>,
}

/// Mock device backend
///
/// Records every call and lets tests inject notifications with
/// [`emit`](MockDeviceBackend::emit). With auto-complete enabled, accepted
/// requests immediately play back the notification sequence a real device
/// would produce.
#[derive(Clone)]
pub struct MockDeviceBackend {
    inner: Arc<Mutex<MockState>>,
}

impl MockDeviceBackend {
    /// Create a new mock backend with default state
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockState {
                next_handle: 1,
                live: None,
                created: 0,
                released: vec![],
                callbacks: HashMap::new(),
                requests: vec![],
                rejections: HashMap::new(),
                create_failure: None,
                initial: StateSnapshot::default(),
                found_aps: vec![],
                specific_aps: vec![],
                bssids: vec![],
                connected: None,
                configurations: vec![],
                auto_scan_mode: None,
                auto_complete: false,
                query_notification: None,
            })),
        }
    }

    /// Mock that completes every accepted request on its own
    pub fn simulated() -> Self {
        let mock = Self::new();
        mock.state().auto_complete = true;
        mock
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver a notification through the registered callback
    ///
    /// Returns `false` when no callback is registered for its category.
    pub fn emit(&self, notification: NativeNotification) -> bool {
        let callback = self.state().callbacks.get(&notification.category()).cloned();
        match callback {
            Some(callback) => {
                callback(notification);
                true
            }
            None => false,
        }
    }

    pub fn emit_device_state(&self, state: DeviceState) -> bool {
        self.emit(NativeNotification::DeviceState { code: state.into() })
    }

    pub fn emit_connection_state(&self, state: ConnectionState, essid: Option<&str>) -> bool {
        self.emit(NativeNotification::ConnectionState {
            code: state.into(),
            essid: essid.map(str::to_string),
        })
    }

    pub fn emit_scan_state(&self, state: ScanState) -> bool {
        self.emit(NativeNotification::ScanState { code: state.into() })
    }

    pub fn emit_request_result(&self, token: RequestToken, error: Option<ErrorKind>) -> bool {
        self.emit(NativeNotification::RequestResult {
            token,
            code: error.map(ErrorKind::native_code).unwrap_or(0),
        })
    }

    /// Configure mock to fail handle creation
    pub fn fail_handle_creation(&self, error: Option<ErrorKind>) {
        self.state().create_failure = error;
    }

    /// Configure mock to reject requests of `kind`
    pub fn reject_requests(&self, kind: OperationKind, error: ErrorKind) {
        self.state().rejections.insert(kind, error);
    }

    /// State reported right after the handle is created
    pub fn set_initial_state(&self, snapshot: StateSnapshot) {
        self.state().initial = snapshot;
    }

    /// Notification delivered while the initial state query is in flight
    pub fn notify_during_query(&self, notification: NativeNotification) {
        self.state().query_notification = Some(notification);
    }

    pub fn set_found_aps(&self, aps: Vec<AccessPoint>) {
        self.state().found_aps = aps;
    }

    pub fn set_specific_aps(&self, aps: Vec<AccessPoint>) {
        self.state().specific_aps = aps;
    }

    pub fn set_bssids(&self, aps: Vec<AccessPoint>) {
        self.state().bssids = aps;
    }

    pub fn set_connected_ap(&self, ap: Option<AccessPoint>) {
        self.state().connected = ap;
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        self.state().requests.clone()
    }

    /// Most recent accepted request of `kind`
    pub fn last_request(&self, kind: OperationKind) -> Option<MockRequest> {
        self.state()
            .requests
            .iter()
            .rev()
            .find(|r| r.token.kind == kind)
            .cloned()
    }

    pub fn created_handles(&self) -> usize {
        self.state().created
    }

    pub fn released_handles(&self) -> Vec<RawHandle> {
        self.state().released.clone()
    }

    pub fn registered_categories(&self) -> Vec<Category> {
        self.state().callbacks.keys().copied().collect()
    }

    pub fn auto_scan_mode(&self) -> Option<AutoScanMode> {
        self.state().auto_scan_mode
    }

    fn check_handle(state: &MockState, handle: RawHandle) -> DeviceResult<()> {
        if state.live == Some(handle) {
            Ok(())
        } else {
            Err(DeviceError::InvalidState(format!(
                "unknown device handle {}",
                handle.0
            )))
        }
    }

    fn accept(
        &self,
        handle: RawHandle,
        token: RequestToken,
        argument: Option<String>,
    ) -> DeviceResult<bool> {
        let mut state = self.state();
        Self::check_handle(&state, handle)?;
        if let Some(error) = state.rejections.get(&token.kind) {
            return Err(DeviceError::from_native(*error, token.kind));
        }
        debug!(%token, ?argument, "Mock accepted request");
        state.requests.push(MockRequest { token, argument });
        Ok(state.auto_complete)
    }

    /// Play back the notifications completing `token`
    fn play(&self, token: RequestToken, essid: Option<&str>) {
        match token.kind {
            OperationKind::Activate => {
                self.emit_device_state(DeviceState::Activating);
                self.emit_device_state(DeviceState::Activated);
            }
            OperationKind::Deactivate => {
                self.emit_device_state(DeviceState::Deactivating);
                self.emit_device_state(DeviceState::Deactivated);
            }
            OperationKind::Scan
            | OperationKind::ScanSpecific
            | OperationKind::BssidScan
            | OperationKind::MultiScan => {
                self.emit_scan_state(ScanState::Scanning);
                self.emit_scan_state(ScanState::NotScanning);
            }
            OperationKind::Connect => {
                self.emit_connection_state(ConnectionState::Association, essid);
                self.emit_connection_state(ConnectionState::Configuration, essid);
                self.emit_connection_state(ConnectionState::Connected, essid);
            }
            OperationKind::Disconnect => {
                self.emit_connection_state(ConnectionState::Disconnecting, None);
                self.emit_connection_state(ConnectionState::Disconnected, None);
            }
        }
    }

    fn submit(
        &self,
        handle: RawHandle,
        token: RequestToken,
        argument: Option<String>,
    ) -> DeviceResult<()> {
        let essid = argument.clone();
        if self.accept(handle, token, argument)? {
            let essid = match token.kind {
                OperationKind::Connect => essid,
                _ => None,
            };
            self.play(token, essid.as_deref());
        }
        Ok(())
    }
}

impl Default for MockDeviceBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for MockDeviceBackend {
    fn create_handle(&self) -> DeviceResult<RawHandle> {
        let mut state = self.state();
        if let Some(error) = state.create_failure {
            return Err(match error {
                ErrorKind::NotSupported => DeviceError::NotSupported("mock WiFi feature".into()),
                ErrorKind::PermissionDenied => {
                    DeviceError::PermissionDenied("mock privilege missing".into())
                }
                _ => DeviceError::OutOfResources("mock handle allocation failed".into()),
            });
        }
        if state.live.is_some() {
            return Err(DeviceError::OutOfResources(
                "device handle already open".into(),
            ));
        }

        let handle = RawHandle(state.next_handle);
        state.next_handle += 1;
        state.created += 1;
        state.live = Some(handle);
        Ok(handle)
    }

    fn release_handle(&self, handle: RawHandle) {
        let mut state = self.state();
        if state.live == Some(handle) {
            state.live = None;
        }
        state.released.push(handle);
    }

    fn register_callback(
        &self,
        handle: RawHandle,
        category: Category,
        callback: NotificationCallback,
    ) -> DeviceResult<()> {
        let mut state = self.state();
        Self::check_handle(&state, handle)?;
        state.callbacks.insert(category, callback);
        Ok(())
    }

    fn unregister_callback(&self, _handle: RawHandle, category: Category) {
        self.state().callbacks.remove(&category);
    }

    async fn query_state(&self, handle: RawHandle) -> DeviceResult<StateSnapshot> {
        let (initial, racing) = {
            let mut state = self.state();
            Self::check_handle(&state, handle)?;
            (state.initial, state.query_notification.take())
        };
        if let Some(notification) = racing {
            self.emit(notification);
        }
        Ok(initial)
    }

    async fn request_activate(
        &self,
        handle: RawHandle,
        token: RequestToken,
        with_picker: bool,
    ) -> DeviceResult<()> {
        let argument = with_picker.then(|| "picker".to_string());
        self.submit(handle, token, argument)
    }

    async fn request_deactivate(&self, handle: RawHandle, token: RequestToken) -> DeviceResult<()> {
        self.submit(handle, token, None)
    }

    async fn request_scan(&self, handle: RawHandle, token: RequestToken) -> DeviceResult<()> {
        self.submit(handle, token, None)
    }

    async fn request_scan_specific(
        &self,
        handle: RawHandle,
        token: RequestToken,
        essid: &str,
    ) -> DeviceResult<()> {
        self.submit(handle, token, Some(essid.to_string()))
    }

    async fn request_bssid_scan(&self, handle: RawHandle, token: RequestToken) -> DeviceResult<()> {
        self.submit(handle, token, None)
    }

    async fn request_multi_scan(
        &self,
        handle: RawHandle,
        token: RequestToken,
        frequencies: &[u32],
    ) -> DeviceResult<()> {
        let list = frequencies
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.submit(handle, token, Some(list))
    }

    async fn request_connect(
        &self,
        handle: RawHandle,
        token: RequestToken,
        target: &ConnectTarget,
    ) -> DeviceResult<()> {
        self.submit(handle, token, Some(target.essid.clone()))
    }

    async fn request_disconnect(&self, handle: RawHandle, token: RequestToken) -> DeviceResult<()> {
        self.submit(handle, token, None)
    }

    async fn found_aps(&self, handle: RawHandle) -> DeviceResult<Vec<AccessPoint>> {
        let state = self.state();
        Self::check_handle(&state, handle)?;
        Ok(state.found_aps.clone())
    }

    async fn found_specific_aps(&self, handle: RawHandle) -> DeviceResult<Vec<AccessPoint>> {
        let state = self.state();
        Self::check_handle(&state, handle)?;
        Ok(state.specific_aps.clone())
    }

    async fn found_bssids(&self, handle: RawHandle) -> DeviceResult<Vec<AccessPoint>> {
        let state = self.state();
        Self::check_handle(&state, handle)?;
        Ok(state.bssids.clone())
    }

    async fn connected_ap(&self, handle: RawHandle) -> DeviceResult<Option<AccessPoint>> {
        let state = self.state();
        Self::check_handle(&state, handle)?;
        Ok(state.connected.clone())
    }

    async fn list_configurations(&self, handle: RawHandle) -> DeviceResult<Vec<WiFiConfiguration>> {
        let state = self.state();
        Self::check_handle(&state, handle)?;
        Ok(state.configurations.clone())
    }

    async fn save_configuration(
        &self,
        handle: RawHandle,
        configuration: &WiFiConfiguration,
    ) -> DeviceResult<()> {
        let mut state = self.state();
        Self::check_handle(&state, handle)?;
        state
            .configurations
            .retain(|existing| existing.essid != configuration.essid);
        state.configurations.push(configuration.clone());
        Ok(())
    }

    async fn remove_configuration(&self, handle: RawHandle, essid: &str) -> DeviceResult<()> {
        let mut state = self.state();
        Self::check_handle(&state, handle)?;
        let before = state.configurations.len();
        state.configurations.retain(|existing| existing.essid != essid);
        if state.configurations.len() == before {
            return Err(DeviceError::InvalidArgument(format!(
                "no stored configuration for {essid}"
            )));
        }
        Ok(())
    }

    async fn set_auto_scan_mode(&self, handle: RawHandle, mode: AutoScanMode) -> DeviceResult<()> {
        let mut state = self.state();
        Self::check_handle(&state, handle)?;
        state.auto_scan_mode = Some(mode);
        Ok(())
    }

    async fn mac_address(&self, handle: RawHandle) -> DeviceResult<String> {
        let state = self.state();
        Self::check_handle(&state, handle)?;
        Ok("02:00:00:00:00:01".to_string())
    }

    async fn interface_name(&self, handle: RawHandle) -> DeviceResult<String> {
        let state = self.state();
        Self::check_handle(&state, handle)?;
        Ok("wlan0".to_string())
    }
}
