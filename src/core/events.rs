//! Typed events published to subscribers

use serde::{Deserialize, Serialize};

use crate::core::types::{ConnectionState, DeviceState, RssiLevel, ScanState};

/// Notification categories, one native callback each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    DeviceState,
    ConnectionState,
    RssiLevel,
    ScanState,
    BackgroundScanFinished,
    /// Per-request completion reports
    RequestResult,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::DeviceState,
        Category::ConnectionState,
        Category::RssiLevel,
        Category::ScanState,
        Category::BackgroundScanFinished,
        Category::RequestResult,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStateChanged {
    pub state: DeviceState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStateChanged {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub essid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RssiLevelChanged {
    pub level: RssiLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStateChanged {
    pub state: ScanState,
}

/// Background scan completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundScanFinished {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::core::error::ErrorKind>,
}

/// Any event raised by the manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "params")]
#[serde(rename_all = "snake_case")]
pub enum WifiEvent {
    DeviceStateChanged(DeviceStateChanged),
    ConnectionStateChanged(ConnectionStateChanged),
    RssiLevelChanged(RssiLevelChanged),
    ScanStateChanged(ScanStateChanged),
    BackgroundScanFinished(BackgroundScanFinished),
}

impl WifiEvent {
    pub fn category(&self) -> Category {
        match self {
            WifiEvent::DeviceStateChanged(_) => Category::DeviceState,
            WifiEvent::ConnectionStateChanged(_) => Category::ConnectionState,
            WifiEvent::RssiLevelChanged(_) => Category::RssiLevel,
            WifiEvent::ScanStateChanged(_) => Category::ScanState,
            WifiEvent::BackgroundScanFinished(_) => Category::BackgroundScanFinished,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_state_event_json() {
        let event = WifiEvent::DeviceStateChanged(DeviceStateChanged {
            state: DeviceState::Activated,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"device_state_changed""#));
        assert!(json.contains(r#""state":"activated""#));

        let decoded: WifiEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.category(), Category::DeviceState);
    }

    #[test]
    fn test_connection_event_omits_missing_essid() {
        let event = WifiEvent::ConnectionStateChanged(ConnectionStateChanged {
            state: ConnectionState::Association,
            essid: None,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""state":"association""#));
        assert!(!json.contains("essid"));
    }
}
