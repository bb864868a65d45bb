//! Device subsystem trait definition

use std::sync::Arc;

use trait_variant::make;

use crate::core::{
    error::DeviceResult,
    events::Category,
    store::StateSnapshot,
    types::{AccessPoint, AutoScanMode, ConnectTarget, RequestToken, WiFiConfiguration},
};

/// Opaque native handle value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(pub u64);

/// Raw notification payload as delivered by the device subsystem
///
/// State codes are undecoded; the event bridge validates them before they
/// reach the state store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeNotification {
    DeviceState { code: i32 },
    ConnectionState { code: i32, essid: Option<String> },
    RssiLevel { code: i32 },
    ScanState { code: i32 },
    BackgroundScanFinished { code: i32 },
    /// Terminal result of the request identified by `token`, `0` on success
    RequestResult { token: RequestToken, code: i32 },
}

impl NativeNotification {
    pub fn category(&self) -> Category {
        match self {
            NativeNotification::DeviceState { .. } => Category::DeviceState,
            NativeNotification::ConnectionState { .. } => Category::ConnectionState,
            NativeNotification::RssiLevel { .. } => Category::RssiLevel,
            NativeNotification::ScanState { .. } => Category::ScanState,
            NativeNotification::BackgroundScanFinished { .. } => Category::BackgroundScanFinished,
            NativeNotification::RequestResult { .. } => Category::RequestResult,
        }
    }
}

/// Callback registered per notification category
pub type NotificationCallback = Arc<dyn Fn(NativeNotification) + Send + Sync>;

/// Abstraction over the platform device subsystem
///
/// Request methods only report whether the subsystem accepted the request.
/// Completion is always reported later through the registered callbacks,
/// either as a state notification or as a `RequestResult` echoing the token.
#[make(Send)]
pub trait DeviceBackend: Sync + 'static {
    /// Open the native session
    fn create_handle(&self) -> DeviceResult<RawHandle>;

    /// Close the native session
    fn release_handle(&self, handle: RawHandle);

    fn register_callback(
        &self,
        handle: RawHandle,
        category: Category,
        callback: NotificationCallback,
    ) -> DeviceResult<()>;

    fn unregister_callback(&self, handle: RawHandle, category: Category);

    /// Read the current device state right after the handle is opened
    async fn query_state(&self, handle: RawHandle) -> DeviceResult<StateSnapshot>;

    async fn request_activate(
        &self,
        handle: RawHandle,
        token: RequestToken,
        with_picker: bool,
    ) -> DeviceResult<()>;

    async fn request_deactivate(&self, handle: RawHandle, token: RequestToken) -> DeviceResult<()>;

    async fn request_scan(&self, handle: RawHandle, token: RequestToken) -> DeviceResult<()>;

    async fn request_scan_specific(
        &self,
        handle: RawHandle,
        token: RequestToken,
        essid: &str,
    ) -> DeviceResult<()>;

    async fn request_bssid_scan(&self, handle: RawHandle, token: RequestToken) -> DeviceResult<()>;

    async fn request_multi_scan(
        &self,
        handle: RawHandle,
        token: RequestToken,
        frequencies: &[u32],
    ) -> DeviceResult<()>;

    async fn request_connect(
        &self,
        handle: RawHandle,
        token: RequestToken,
        target: &ConnectTarget,
    ) -> DeviceResult<()>;

    async fn request_disconnect(&self, handle: RawHandle, token: RequestToken) -> DeviceResult<()>;

    /// Results of the last full scan
    async fn found_aps(&self, handle: RawHandle) -> DeviceResult<Vec<AccessPoint>>;

    /// Results of the last specific AP scan
    async fn found_specific_aps(&self, handle: RawHandle) -> DeviceResult<Vec<AccessPoint>>;

    /// Results of the last BSSID scan
    async fn found_bssids(&self, handle: RawHandle) -> DeviceResult<Vec<AccessPoint>>;

    async fn connected_ap(&self, handle: RawHandle) -> DeviceResult<Option<AccessPoint>>;

    async fn list_configurations(&self, handle: RawHandle) -> DeviceResult<Vec<WiFiConfiguration>>;

    async fn save_configuration(
        &self,
        handle: RawHandle,
        configuration: &WiFiConfiguration,
    ) -> DeviceResult<()>;

    async fn remove_configuration(&self, handle: RawHandle, essid: &str) -> DeviceResult<()>;

    async fn set_auto_scan_mode(&self, handle: RawHandle, mode: AutoScanMode) -> DeviceResult<()>;

    async fn mac_address(&self, handle: RawHandle) -> DeviceResult<String>;

    async fn interface_name(&self, handle: RawHandle) -> DeviceResult<String>;
}
