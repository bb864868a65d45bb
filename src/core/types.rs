//! Domain types for WiFi device management

use std::fmt;

use serde::{Deserialize, Serialize};

/// Power state of the wireless device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DeviceState {
    Deactivated = 0,
    Activating = 1,
    Activated = 2,
    Deactivating = 3,
}

impl TryFrom<i32> for DeviceState {
    type Error = ();

    fn try_from(value: i32) -> Result<Self, <Self as TryFrom<i32>>::Error> {
        match value {
            0 => Ok(DeviceState::Deactivated),
            1 => Ok(DeviceState::Activating),
            2 => Ok(DeviceState::Activated),
            3 => Ok(DeviceState::Deactivating),
            _ => Err(()),
        }
    }
}

impl From<DeviceState> for i32 {
    fn from(state: DeviceState) -> Self {
        state as i32
    }
}

/// Link state of the wireless connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Association = 1,
    Configuration = 2,
    Connected = 3,
    Disconnecting = 4,
    Failure = 5,
}

impl TryFrom<i32> for ConnectionState {
    type Error = ();

    fn try_from(value: i32) -> Result<Self, <Self as TryFrom<i32>>::Error> {
        match value {
            0 => Ok(ConnectionState::Disconnected),
            1 => Ok(ConnectionState::Association),
            2 => Ok(ConnectionState::Configuration),
            3 => Ok(ConnectionState::Connected),
            4 => Ok(ConnectionState::Disconnecting),
            5 => Ok(ConnectionState::Failure),
            _ => Err(()),
        }
    }
}

impl From<ConnectionState> for i32 {
    fn from(state: ConnectionState) -> Self {
        state as i32
    }
}

/// Scan activity of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ScanState {
    NotScanning = 0,
    Scanning = 1,
}

impl TryFrom<i32> for ScanState {
    type Error = ();

    fn try_from(value: i32) -> Result<Self, <Self as TryFrom<i32>>::Error> {
        match value {
            0 => Ok(ScanState::NotScanning),
            1 => Ok(ScanState::Scanning),
            _ => Err(()),
        }
    }
}

impl From<ScanState> for i32 {
    fn from(state: ScanState) -> Self {
        state as i32
    }
}

/// Signal strength of the connected AP on the platform's five level scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RssiLevel {
    Level0 = 0,
    Level1 = 1,
    Level2 = 2,
    Level3 = 3,
    Level4 = 4,
}

impl RssiLevel {
    /// Bucket a dBm reading into a level
    pub fn from_dbm(dbm: i16) -> Self {
        match dbm {
            i16::MIN..=-90 => RssiLevel::Level0,
            -89..=-80 => RssiLevel::Level1,
            -79..=-70 => RssiLevel::Level2,
            -69..=-60 => RssiLevel::Level3,
            _ => RssiLevel::Level4,
        }
    }
}

impl TryFrom<i32> for RssiLevel {
    type Error = ();

    fn try_from(value: i32) -> Result<Self, <Self as TryFrom<i32>>::Error> {
        match value {
            0 => Ok(RssiLevel::Level0),
            1 => Ok(RssiLevel::Level1),
            2 => Ok(RssiLevel::Level2),
            3 => Ok(RssiLevel::Level3),
            4 => Ok(RssiLevel::Level4),
            _ => Err(()),
        }
    }
}

impl From<RssiLevel> for i32 {
    fn from(level: RssiLevel) -> Self {
        level as i32
    }
}

/// Security scheme of an access point or stored profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityType {
    #[default]
    None,
    Wep,
    WpaPsk,
    Wpa2Psk,
    Sae,
    Eap,
}

impl SecurityType {
    /// Whether connecting requires a passphrase
    pub fn needs_passphrase(&self) -> bool {
        matches!(
            self,
            SecurityType::Wep | SecurityType::WpaPsk | SecurityType::Wpa2Psk | SecurityType::Sae
        )
    }

    /// Derive the security type from a wpa_supplicant flags column
    pub fn from_flags(flags: &str) -> Self {
        if flags.contains("EAP") {
            SecurityType::Eap
        } else if flags.contains("SAE") {
            SecurityType::Sae
        } else if flags.contains("WPA2") {
            SecurityType::Wpa2Psk
        } else if flags.contains("WPA") {
            SecurityType::WpaPsk
        } else if flags.contains("WEP") {
            SecurityType::Wep
        } else {
            SecurityType::None
        }
    }
}

/// Auto scan schedule used by the device while idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoScanMode {
    /// Scan at a fixed interval
    Periodic,
    /// Back off exponentially between scans
    Exponential,
}

/// Snapshot of a discovered access point
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessPoint {
    /// Network ESSID (empty for hidden networks)
    pub essid: String,
    /// MAC address of the AP
    pub bssid: String,
    pub security: SecurityType,
    /// Signal strength in dBm
    pub rssi: i16,
    /// Frequency in MHz
    pub frequency: u32,
}

impl AccessPoint {
    /// Channel number for the AP frequency, `0` when unmapped
    pub fn channel(&self) -> u16 {
        frequency_to_channel(self.frequency)
    }

    pub fn rssi_level(&self) -> RssiLevel {
        RssiLevel::from_dbm(self.rssi)
    }
}

/// Convert frequency (MHz) to channel number
pub fn frequency_to_channel(freq: u32) -> u16 {
    match freq {
        2484 => 14,
        2412..=2472 if (freq - 2412) % 5 == 0 => ((freq - 2412) / 5 + 1) as u16,
        5160..=5885 if (freq - 5000) % 5 == 0 => ((freq - 5000) / 5) as u16,
        5955..=7115 if (freq - 5950) % 5 == 0 => ((freq - 5950) / 5) as u16,
        _ => 0,
    }
}

/// Stored connection profile, passed through to the device subsystem
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WiFiConfiguration {
    /// Profile name, equal to the network ESSID
    pub essid: String,
    pub security: SecurityType,
    #[serde(skip_serializing, default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub hidden: bool,
}

impl WiFiConfiguration {
    pub fn new(essid: impl Into<String>, security: SecurityType) -> Self {
        Self {
            essid: essid.into(),
            security,
            passphrase: None,
            hidden: false,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }
}

/// Target of a connect request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub essid: String,
    pub bssid: Option<String>,
    pub security: SecurityType,
    pub passphrase: Option<String>,
    /// Probe for the ESSID explicitly (hidden network)
    pub hidden: bool,
}

impl ConnectTarget {
    /// Open network target
    pub fn open(essid: impl Into<String>) -> Self {
        Self {
            essid: essid.into(),
            bssid: None,
            security: SecurityType::None,
            passphrase: None,
            hidden: false,
        }
    }

    /// Passphrase protected target
    pub fn secured(
        essid: impl Into<String>,
        security: SecurityType,
        passphrase: impl Into<String>,
    ) -> Self {
        Self {
            essid: essid.into(),
            bssid: None,
            security,
            passphrase: Some(passphrase.into()),
            hidden: false,
        }
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }
}

impl From<&AccessPoint> for ConnectTarget {
    fn from(ap: &AccessPoint) -> Self {
        Self {
            essid: ap.essid.clone(),
            bssid: Some(ap.bssid.clone()),
            security: ap.security,
            passphrase: None,
            hidden: false,
        }
    }
}

/// Kinds of asynchronous device operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Activate,
    Deactivate,
    Scan,
    ScanSpecific,
    BssidScan,
    MultiScan,
    Connect,
    Disconnect,
}

impl OperationKind {
    pub fn class(&self) -> ExclusivityClass {
        match self {
            OperationKind::Activate | OperationKind::Deactivate => ExclusivityClass::Power,
            OperationKind::Scan
            | OperationKind::ScanSpecific
            | OperationKind::BssidScan
            | OperationKind::MultiScan => ExclusivityClass::Scan,
            OperationKind::Connect | OperationKind::Disconnect => ExclusivityClass::Link,
        }
    }

    pub fn is_scan(&self) -> bool {
        self.class() == ExclusivityClass::Scan
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Activate => "activate",
            OperationKind::Deactivate => "deactivate",
            OperationKind::Scan => "scan",
            OperationKind::ScanSpecific => "specific AP scan",
            OperationKind::BssidScan => "BSSID scan",
            OperationKind::MultiScan => "multi-frequency scan",
            OperationKind::Connect => "connect",
            OperationKind::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

/// Group of operation kinds of which at most one may be outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExclusivityClass {
    Power,
    Scan,
    Link,
}

/// Identifies one issued request; echoed back by the subsystem on completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken {
    pub kind: OperationKind,
    pub generation: u64,
}

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.generation)
    }
}
