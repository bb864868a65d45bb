//! wpa_supplicant backend built on wifi-ctrl

use std::{
    collections::HashMap,
    fmt::Display,
    io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{process::Command, sync::broadcast};
use tracing::{debug, error, info, warn};
use wifi_ctrl::sta::{
    Broadcast, BroadcastReceiver, KeyMgmt, RequestClient, ScanResult, SelectResult, WifiSetup,
};

use crate::{
    backend::{DeviceBackend, NativeNotification, NotificationCallback, RawHandle},
    core::{
        error::{DeviceError, DeviceResult},
        events::Category,
        store::StateSnapshot,
        types::{
            AccessPoint, AutoScanMode, ConnectTarget, ConnectionState, DeviceState, RequestToken,
            RssiLevel, ScanState, SecurityType, WiFiConfiguration,
        },
    },
};

#[derive(Debug, Default)]
struct ScanCache {
    found: Vec<AccessPoint>,
    specific: Vec<AccessPoint>,
    bssids: Vec<AccessPoint>,
}

#[derive(Debug, Clone, Copy)]
enum ScanTarget {
    Found,
    Specific,
    Bssids,
}

struct Shared {
    interface: String,
    ctrl_socket: PathBuf,
    client: RequestClient,
    callbacks: Mutex<HashMap<Category, NotificationCallback>>,
    live: Mutex<Option<RawHandle>>,
    next_handle: AtomicU64,
    scans: Mutex<ScanCache>,
    /// ESSID of the connect request waiting for association
    connecting: Mutex<Option<String>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn subsystem_error(context: &str, e: impl Display) -> DeviceError {
    DeviceError::Unknown(format!("{context}: {e}"))
}

impl Shared {
    fn emit(&self, notification: NativeNotification) {
        let callback = locked(&self.callbacks).get(&notification.category()).cloned();
        match callback {
            Some(callback) => callback(notification),
            None => debug!(?notification, "No callback registered, dropping notification"),
        }
    }

    fn emit_failure(&self, token: RequestToken, error: &DeviceError) {
        warn!(%token, "Request failed: {}", error);
        self.emit(NativeNotification::RequestResult {
            token,
            code: error.kind().native_code(),
        });
    }

    fn check_handle(&self, handle: RawHandle) -> DeviceResult<()> {
        if *locked(&self.live) == Some(handle) {
            Ok(())
        } else {
            Err(DeviceError::InvalidState(format!(
                "unknown device handle {}",
                handle.0
            )))
        }
    }

    /// Send a raw control command, mapping `FAIL` replies to errors
    async fn command(&self, command: String) -> DeviceResult<String> {
        debug!(%command, "wpa_supplicant request");
        let reply = self
            .client
            .send_custom(command.clone())
            .await
            .map_err(|e| subsystem_error(&command, e))?;

        if reply.trim_start().starts_with("FAIL") {
            return Err(DeviceError::Unknown(format!("{command}: {}", reply.trim())));
        }
        Ok(reply)
    }

    async fn set_interface_up(&self, up: bool) -> DeviceResult<()> {
        let state = if up { "up" } else { "down" };
        let output = Command::new("ip")
            .args(["link", "set", &self.interface, state])
            .output()
            .await
            .map_err(|e| subsystem_error("ip link", e))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("Operation not permitted") {
                Err(DeviceError::PermissionDenied(stderr.trim().to_string()))
            } else {
                Err(DeviceError::Unknown(stderr.trim().to_string()))
            }
        }
    }

    async fn interface_up(&self) -> DeviceResult<bool> {
        let output = Command::new("ip")
            .args(["link", "show", &self.interface])
            .output()
            .await
            .map_err(|e| subsystem_error("ip link", e))?;

        Ok(parse_link_up(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn status(&self) -> DeviceResult<HashMap<String, String>> {
        let status = self
            .client
            .get_status()
            .await
            .map_err(|e| subsystem_error("Failed to get status", e))?;

        Ok(status
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect())
    }

    async fn signal_dbm(&self) -> Option<i16> {
        let reply = self.command("SIGNAL_POLL".to_string()).await.ok()?;
        parse_signal_poll(&reply)
    }

    async fn scan(&self, target: ScanTarget, keep: impl Fn(&AccessPoint) -> bool) -> DeviceResult<()> {
        // get_scan triggers a scan and waits for fresh results
        let results = self
            .client
            .get_scan()
            .await
            .map_err(|e| subsystem_error("Scan failed", e))?;
        let aps: Vec<AccessPoint> = results
            .iter()
            .map(access_point_from_scan)
            .filter(keep)
            .collect();
        debug!(?target, "Scan complete, found {} access points", aps.len());

        let mut scans = locked(&self.scans);
        match target {
            ScanTarget::Found => scans.found = aps,
            ScanTarget::Specific => scans.specific = aps,
            ScanTarget::Bssids => scans.bssids = aps,
        }
        Ok(())
    }

    /// Create a network block for `essid` and return its id
    ///
    /// A block that cannot be fully configured is removed again.
    async fn add_network(
        &self,
        essid: &str,
        security: SecurityType,
        passphrase: Option<&str>,
        hidden: bool,
    ) -> DeviceResult<usize> {
        let id = self
            .client
            .add_network()
            .await
            .map_err(|e| subsystem_error("Failed to add network", e))?;

        if let Err(e) = self
            .configure_network(id, essid, security, passphrase, hidden)
            .await
        {
            self.discard_network(id).await;
            return Err(e);
        }
        Ok(id)
    }

    async fn configure_network(
        &self,
        id: usize,
        essid: &str,
        security: SecurityType,
        passphrase: Option<&str>,
        hidden: bool,
    ) -> DeviceResult<()> {
        // hex form avoids quoting issues with arbitrary SSID bytes
        self.command(format!("SET_NETWORK {id} ssid {}", hex::encode(essid)))
            .await?;

        match (security, passphrase) {
            (SecurityType::Wep, Some(key)) => {
                self.set_key_mgmt(id, KeyMgmt::None).await?;
                self.command(format!("SET_NETWORK {id} wep_key0 {}", wep_key_value(key)))
                    .await?;
            }
            (SecurityType::Sae, Some(passphrase)) => {
                self.command(format!("SET_NETWORK {id} key_mgmt SAE")).await?;
                self.set_psk(id, passphrase).await?;
            }
            (SecurityType::WpaPsk | SecurityType::Wpa2Psk, Some(passphrase)) => {
                self.set_key_mgmt(id, KeyMgmt::WpaPsk).await?;
                self.set_psk(id, passphrase).await?;
            }
            _ => self.set_key_mgmt(id, KeyMgmt::None).await?,
        }

        if hidden {
            self.command(format!("SET_NETWORK {id} scan_ssid 1")).await?;
        }
        Ok(())
    }

    async fn set_key_mgmt(&self, id: usize, key_mgmt: KeyMgmt) -> DeviceResult<()> {
        self.client
            .set_network_keymgmt(id, key_mgmt)
            .await
            .map_err(|e| subsystem_error("Failed to set key management", e))
    }

    async fn set_psk(&self, id: usize, passphrase: &str) -> DeviceResult<()> {
        if is_hex_key(passphrase, &[64]) {
            // wifi-ctrl quotes every PSK, a raw key must go unquoted
            self.command(format!("SET_NETWORK {id} psk {passphrase}"))
                .await?;
            return Ok(());
        }
        self.client
            .set_network_psk(id, passphrase.to_string())
            .await
            .map_err(|e| subsystem_error("Failed to set PSK", e))
    }

    async fn discard_network(&self, id: usize) {
        if let Err(e) = self.client.remove_network(id).await {
            warn!("Failed to remove network {}: {}", id, e);
        }
    }

    /// Drop a connect attempt that will never see a broadcast
    async fn abandon_connect(&self, token: RequestToken, id: usize, error: &DeviceError) {
        locked(&self.connecting).take();
        self.discard_network(id).await;
        self.emit_failure(token, error);
    }

    async fn find_network(&self, essid: &str) -> DeviceResult<Option<usize>> {
        let reply = self.command("LIST_NETWORKS".to_string()).await?;
        Ok(parse_network_list(&reply)
            .into_iter()
            .find(|(_, ssid)| ssid == essid)
            .map(|(id, _)| id))
    }

    async fn save(&self) -> DeviceResult<()> {
        self.client
            .save_config()
            .await
            .map_err(|e| subsystem_error("Failed to save configuration", e))
    }

    async fn pump(self: Arc<Self>, mut receiver: BroadcastReceiver) {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    debug!("Received broadcast event: {:?}", event);
                    let connected = matches!(event, Broadcast::Connected);
                    self.handle_broadcast(event);
                    if connected {
                        if let Some(dbm) = self.signal_dbm().await {
                            self.emit(NativeNotification::RssiLevel {
                                code: RssiLevel::from_dbm(dbm).into(),
                            });
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Broadcast receiver lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Broadcast channel closed, stopping event pump");
                    return;
                }
            }
        }
    }

    fn handle_broadcast(&self, event: Broadcast) {
        let (state, essid) = match event {
            Broadcast::Connected => (ConnectionState::Connected, locked(&self.connecting).take()),
            Broadcast::Disconnected => (ConnectionState::Disconnected, None),
            Broadcast::WrongPsk | Broadcast::NetworkNotFound => {
                (ConnectionState::Failure, locked(&self.connecting).take())
            }
            _ => return,
        };
        self.emit(NativeNotification::ConnectionState {
            code: state.into(),
            essid,
        });
    }
}

/// Check the wpa_supplicant control socket for `interface` is reachable
fn check_ctrl_socket(path: &Path) -> DeviceResult<()> {
    match std::fs::metadata(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(DeviceError::NotSupported(format!(
            "no wpa_supplicant control socket at {}",
            path.display()
        ))),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Err(
            DeviceError::PermissionDenied(format!("cannot access {}", path.display())),
        ),
        Err(e) => Err(subsystem_error("control socket", e)),
    }
}

/// Whether `key` is a raw hex key of one of the given lengths
fn is_hex_key(key: &str, lengths: &[usize]) -> bool {
    lengths.contains(&key.len()) && key.bytes().all(|b| b.is_ascii_hexdigit())
}

/// WEP key as written to a network block: bare hex or a quoted ASCII key
fn wep_key_value(key: &str) -> String {
    if is_hex_key(key, &[10, 26]) {
        key.to_string()
    } else {
        format!("\"{key}\"")
    }
}

fn parse_link_up(output: &str) -> bool {
    output
        .lines()
        .next()
        .and_then(|line| line.split_once('<'))
        .and_then(|(_, rest)| rest.split_once('>'))
        .is_some_and(|(flags, _)| flags.split(',').any(|flag| flag == "UP"))
}

fn access_point_from_scan(result: &ScanResult) -> AccessPoint {
    AccessPoint {
        essid: result.name.clone(),
        bssid: result.mac.clone(),
        frequency: result.frequency.parse().unwrap_or(0),
        rssi: i16::try_from(result.signal).unwrap_or(i16::MIN),
        security: SecurityType::from_flags(&result.flags),
    }
}

/// Parse `LIST_NETWORKS` output into `(id, ssid)` pairs
fn parse_network_list(output: &str) -> Vec<(usize, String)> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let id = parts.next()?.parse().ok()?;
            let ssid = parts.next()?.to_string();
            Some((id, ssid))
        })
        .collect()
}

fn parse_signal_poll(output: &str) -> Option<i16> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("RSSI="))
        .and_then(|rssi| rssi.trim().parse().ok())
}

/// Map a STATUS or network block `key_mgmt` value to a security type
///
/// Network blocks may list several suites (`WPA-PSK WPA-EAP` is the
/// default); PSK suites take precedence over EAP ones.
fn security_from_key_mgmt(key_mgmt: &str) -> SecurityType {
    let suites: Vec<&str> = key_mgmt.split_whitespace().collect();
    let has = |name: &str| suites.iter().any(|suite| *suite == name);

    if has("SAE") {
        SecurityType::Sae
    } else if has("WPA2-PSK") || has("WPA-PSK") || has("WPA-PSK-SHA256") || has("FT-PSK") {
        SecurityType::Wpa2Psk
    } else if suites.iter().any(|suite| suite.contains("EAP") || *suite == "IEEE8021X") {
        SecurityType::Eap
    } else {
        SecurityType::None
    }
}

fn connection_state_from_wpa(wpa_state: &str) -> ConnectionState {
    match wpa_state {
        "COMPLETED" => ConnectionState::Connected,
        "ASSOCIATING" | "ASSOCIATED" | "AUTHENTICATING" => ConnectionState::Association,
        "4WAY_HANDSHAKE" | "GROUP_HANDSHAKE" => ConnectionState::Configuration,
        _ => ConnectionState::Disconnected,
    }
}

/// Device backend talking to wpa_supplicant over its control socket
pub struct WpaBackend {
    shared: Arc<Shared>,
}

impl WpaBackend {
    pub async fn new(interface: String, ctrl_dir: &Path) -> DeviceResult<Self> {
        let ctrl_socket = ctrl_dir.join(&interface);
        let mut setup = WifiSetup::new().map_err(|e| subsystem_error("wifi-ctrl setup", e))?;
        setup.set_socket_path(ctrl_socket.to_string_lossy().into_owned());

        let client = setup.get_request_client();
        let receiver = setup.get_broadcast_receiver();
        let station = setup.complete();

        tokio::spawn(async move {
            if let Err(e) = station.run().await {
                error!("WifiStation runtime error: {}", e);
            }
        });

        let shared = Arc::new(Shared {
            interface,
            ctrl_socket,
            client,
            callbacks: Mutex::new(HashMap::new()),
            live: Mutex::new(None),
            next_handle: AtomicU64::new(1),
            scans: Mutex::new(ScanCache::default()),
            connecting: Mutex::new(None),
        });
        tokio::spawn(shared.clone().pump(receiver));

        Ok(Self { shared })
    }

    /// Run a scan in the background and report its state transitions
    fn spawn_scan(
        &self,
        token: RequestToken,
        target: ScanTarget,
        keep: impl Fn(&AccessPoint) -> bool + Send + 'static,
    ) {
        let shared = self.shared.clone();
        shared.emit(NativeNotification::ScanState {
            code: ScanState::Scanning.into(),
        });
        tokio::spawn(async move {
            if let Err(e) = shared.scan(target, keep).await {
                shared.emit_failure(token, &e);
            }
            shared.emit(NativeNotification::ScanState {
                code: ScanState::NotScanning.into(),
            });
        });
    }

    /// Select network `id` in the background; wifi-ctrl answers only once
    /// the association attempt has an outcome
    fn spawn_select(&self, token: RequestToken, id: usize) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let result = shared
                .client
                .select_network(id)
                .await
                .map_err(|e| subsystem_error("Failed to select network", e));

            match result {
                Ok(SelectResult::Success) | Ok(SelectResult::Timeout) => {
                    debug!(id, "Network selection finished");
                }
                Ok(SelectResult::AlreadyConnected) => {
                    // no broadcast follows for a link that is already up
                    let essid = locked(&shared.connecting).take();
                    shared.emit(NativeNotification::ConnectionState {
                        code: ConnectionState::Connected.into(),
                        essid,
                    });
                }
                Ok(SelectResult::WrongPsk) | Ok(SelectResult::NotFound) => {
                    // the broadcast already reported the failure
                    shared.discard_network(id).await;
                }
                Ok(other) => {
                    let error = DeviceError::Unknown(format!("select network {id}: {other:?}"));
                    shared.abandon_connect(token, id, &error).await;
                }
                Err(e) => shared.abandon_connect(token, id, &e).await,
            }
        });
    }

    fn spawn_power(&self, token: RequestToken, up: bool) {
        let (transient, done, fallback) = if up {
            (
                DeviceState::Activating,
                DeviceState::Activated,
                DeviceState::Deactivated,
            )
        } else {
            (
                DeviceState::Deactivating,
                DeviceState::Deactivated,
                DeviceState::Activated,
            )
        };

        let shared = self.shared.clone();
        shared.emit(NativeNotification::DeviceState {
            code: transient.into(),
        });
        tokio::spawn(async move {
            let state = match shared.set_interface_up(up).await {
                Ok(()) => done,
                Err(e) => {
                    shared.emit_failure(token, &e);
                    fallback
                }
            };
            shared.emit(NativeNotification::DeviceState { code: state.into() });
        });
    }
}

impl DeviceBackend for WpaBackend {
    fn create_handle(&self) -> DeviceResult<RawHandle> {
        check_ctrl_socket(&self.shared.ctrl_socket)?;

        let mut live = locked(&self.shared.live);
        if live.is_some() {
            return Err(DeviceError::OutOfResources(
                "device handle already open".into(),
            ));
        }
        let handle = RawHandle(self.shared.next_handle.fetch_add(1, Ordering::Relaxed));
        *live = Some(handle);
        Ok(handle)
    }

    fn release_handle(&self, handle: RawHandle) {
        let mut live = locked(&self.shared.live);
        if *live == Some(handle) {
            *live = None;
        }
    }

    fn register_callback(
        &self,
        handle: RawHandle,
        category: Category,
        callback: NotificationCallback,
    ) -> DeviceResult<()> {
        self.shared.check_handle(handle)?;
        locked(&self.shared.callbacks).insert(category, callback);
        Ok(())
    }

    fn unregister_callback(&self, _handle: RawHandle, category: Category) {
        locked(&self.shared.callbacks).remove(&category);
    }

    async fn query_state(&self, handle: RawHandle) -> DeviceResult<StateSnapshot> {
        self.shared.check_handle(handle)?;
        let device_state = if self.shared.interface_up().await? {
            DeviceState::Activated
        } else {
            DeviceState::Deactivated
        };

        let status = self.shared.status().await?;
        let connection_state = status
            .get("wpa_state")
            .map(|s| connection_state_from_wpa(s))
            .unwrap_or(ConnectionState::Disconnected);
        let rssi = if connection_state == ConnectionState::Connected {
            self.shared.signal_dbm().await.map(RssiLevel::from_dbm)
        } else {
            None
        };

        Ok(StateSnapshot {
            device_state,
            connection_state,
            scan_state: ScanState::NotScanning,
            rssi,
        })
    }

    async fn request_activate(
        &self,
        handle: RawHandle,
        token: RequestToken,
        with_picker: bool,
    ) -> DeviceResult<()> {
        self.shared.check_handle(handle)?;
        if with_picker {
            return Err(DeviceError::NotSupported(
                "activation picker is not available on wpa_supplicant".into(),
            ));
        }
        self.spawn_power(token, true);
        Ok(())
    }

    async fn request_deactivate(&self, handle: RawHandle, token: RequestToken) -> DeviceResult<()> {
        self.shared.check_handle(handle)?;
        self.spawn_power(token, false);
        Ok(())
    }

    async fn request_scan(&self, handle: RawHandle, token: RequestToken) -> DeviceResult<()> {
        self.shared.check_handle(handle)?;
        self.spawn_scan(token, ScanTarget::Found, |_| true);
        Ok(())
    }

    async fn request_scan_specific(
        &self,
        handle: RawHandle,
        token: RequestToken,
        essid: &str,
    ) -> DeviceResult<()> {
        self.shared.check_handle(handle)?;
        let essid = essid.to_string();
        self.spawn_scan(token, ScanTarget::Specific, move |ap| ap.essid == essid);
        Ok(())
    }

    async fn request_bssid_scan(&self, handle: RawHandle, token: RequestToken) -> DeviceResult<()> {
        self.shared.check_handle(handle)?;
        self.spawn_scan(token, ScanTarget::Bssids, |_| true);
        Ok(())
    }

    async fn request_multi_scan(
        &self,
        handle: RawHandle,
        token: RequestToken,
        frequencies: &[u32],
    ) -> DeviceResult<()> {
        self.shared.check_handle(handle)?;
        let frequencies = frequencies.to_vec();
        self.spawn_scan(token, ScanTarget::Found, move |ap| {
            frequencies.contains(&ap.frequency)
        });
        Ok(())
    }

    async fn request_connect(
        &self,
        handle: RawHandle,
        token: RequestToken,
        target: &ConnectTarget,
    ) -> DeviceResult<()> {
        self.shared.check_handle(handle)?;
        let id = self
            .shared
            .add_network(
                &target.essid,
                target.security,
                target.passphrase.as_deref(),
                target.hidden,
            )
            .await?;
        if let Some(bssid) = &target.bssid {
            if let Err(e) = self
                .shared
                .command(format!("SET_NETWORK {id} bssid {bssid}"))
                .await
            {
                self.shared.discard_network(id).await;
                return Err(e);
            }
        }

        *locked(&self.shared.connecting) = Some(target.essid.clone());
        self.shared.emit(NativeNotification::ConnectionState {
            code: ConnectionState::Association.into(),
            essid: Some(target.essid.clone()),
        });
        self.spawn_select(token, id);
        debug!(essid = %target.essid, "Connection initiated");
        Ok(())
    }

    async fn request_disconnect(&self, handle: RawHandle, _token: RequestToken) -> DeviceResult<()> {
        self.shared.check_handle(handle)?;
        self.shared.command("DISCONNECT".to_string()).await?;
        self.shared.emit(NativeNotification::ConnectionState {
            code: ConnectionState::Disconnecting.into(),
            essid: None,
        });
        Ok(())
    }

    async fn found_aps(&self, handle: RawHandle) -> DeviceResult<Vec<AccessPoint>> {
        self.shared.check_handle(handle)?;
        Ok(locked(&self.shared.scans).found.clone())
    }

    async fn found_specific_aps(&self, handle: RawHandle) -> DeviceResult<Vec<AccessPoint>> {
        self.shared.check_handle(handle)?;
        Ok(locked(&self.shared.scans).specific.clone())
    }

    async fn found_bssids(&self, handle: RawHandle) -> DeviceResult<Vec<AccessPoint>> {
        self.shared.check_handle(handle)?;
        Ok(locked(&self.shared.scans).bssids.clone())
    }

    async fn connected_ap(&self, handle: RawHandle) -> DeviceResult<Option<AccessPoint>> {
        self.shared.check_handle(handle)?;
        let status = self.shared.status().await?;
        if status.get("wpa_state").map(String::as_str) != Some("COMPLETED") {
            return Ok(None);
        }

        let field = |key: &str| status.get(key).cloned().unwrap_or_default();
        Ok(Some(AccessPoint {
            essid: field("ssid"),
            bssid: field("bssid"),
            security: security_from_key_mgmt(&field("key_mgmt")),
            rssi: self.shared.signal_dbm().await.unwrap_or(0),
            frequency: field("freq").parse().unwrap_or(0),
        }))
    }

    async fn list_configurations(&self, handle: RawHandle) -> DeviceResult<Vec<WiFiConfiguration>> {
        self.shared.check_handle(handle)?;
        let reply = self.shared.command("LIST_NETWORKS".to_string()).await?;

        let mut configurations = Vec::new();
        for (id, essid) in parse_network_list(&reply) {
            let key_mgmt = self
                .shared
                .command(format!("GET_NETWORK {id} key_mgmt"))
                .await
                .unwrap_or_default();
            let hidden = self
                .shared
                .command(format!("GET_NETWORK {id} scan_ssid"))
                .await
                .is_ok_and(|reply| reply.trim() == "1");

            let mut configuration = WiFiConfiguration::new(essid, security_from_key_mgmt(&key_mgmt));
            configuration.hidden = hidden;
            configurations.push(configuration);
        }
        Ok(configurations)
    }

    async fn save_configuration(
        &self,
        handle: RawHandle,
        configuration: &WiFiConfiguration,
    ) -> DeviceResult<()> {
        self.shared.check_handle(handle)?;
        if let Some(id) = self.shared.find_network(&configuration.essid).await? {
            self.shared.command(format!("REMOVE_NETWORK {id}")).await?;
        }

        let id = self
            .shared
            .add_network(
                &configuration.essid,
                configuration.security,
                configuration.passphrase.as_deref(),
                configuration.hidden,
            )
            .await?;
        self.shared.command(format!("ENABLE_NETWORK {id}")).await?;
        self.shared.save().await
    }

    async fn remove_configuration(&self, handle: RawHandle, essid: &str) -> DeviceResult<()> {
        self.shared.check_handle(handle)?;
        let Some(id) = self.shared.find_network(essid).await? else {
            return Err(DeviceError::InvalidArgument(format!(
                "no stored configuration for {essid}"
            )));
        };
        self.shared.command(format!("REMOVE_NETWORK {id}")).await?;
        self.shared.save().await
    }

    async fn set_auto_scan_mode(&self, handle: RawHandle, mode: AutoScanMode) -> DeviceResult<()> {
        self.shared.check_handle(handle)?;
        let schedule = match mode {
            AutoScanMode::Periodic => "periodic:30",
            AutoScanMode::Exponential => "exponential:3:300",
        };
        self.shared.command(format!("AUTOSCAN {schedule}")).await?;
        Ok(())
    }

    async fn mac_address(&self, handle: RawHandle) -> DeviceResult<String> {
        self.shared.check_handle(handle)?;
        self.shared
            .status()
            .await?
            .remove("address")
            .ok_or_else(|| DeviceError::Unknown("wpa_supplicant reported no MAC address".into()))
    }

    async fn interface_name(&self, handle: RawHandle) -> DeviceResult<String> {
        self.shared.check_handle(handle)?;
        Ok(self.shared.interface.clone())
    }
}
