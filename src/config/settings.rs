//! Runtime settings

use std::{path::PathBuf, time::Duration};

use crate::{config::CliArgs, core::types::OperationKind};

/// Deadline per operation kind; `None` waits indefinitely
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationTimeouts {
    pub activate: Option<Duration>,
    pub deactivate: Option<Duration>,
    pub scan: Option<Duration>,
    pub connect: Option<Duration>,
    pub disconnect: Option<Duration>,
}

impl OperationTimeouts {
    /// No deadlines at all
    pub const NONE: Self = Self {
        activate: None,
        deactivate: None,
        scan: None,
        connect: None,
        disconnect: None,
    };

    pub fn for_kind(&self, kind: OperationKind) -> Option<Duration> {
        match kind {
            OperationKind::Activate => self.activate,
            OperationKind::Deactivate => self.deactivate,
            OperationKind::Scan
            | OperationKind::ScanSpecific
            | OperationKind::BssidScan
            | OperationKind::MultiScan => self.scan,
            OperationKind::Connect => self.connect,
            OperationKind::Disconnect => self.disconnect,
        }
    }
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        Self {
            activate: Some(Duration::from_secs(30)),
            deactivate: Some(Duration::from_secs(30)),
            scan: Some(Duration::from_secs(15)),
            connect: Some(Duration::from_secs(30)),
            disconnect: Some(Duration::from_secs(10)),
        }
    }
}

fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Runtime configuration settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub interface: String,
    pub ctrl_dir: PathBuf,
    pub simulate: bool,
    pub timeouts: OperationTimeouts,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interface: "wlan0".to_string(),
            ctrl_dir: PathBuf::from("/var/run/wpa_supplicant"),
            simulate: false,
            timeouts: OperationTimeouts::default(),
        }
    }
}

impl From<CliArgs> for Settings {
    fn from(args: CliArgs) -> Self {
        Settings {
            interface: args.interface,
            ctrl_dir: args.ctrl_dir,
            simulate: args.simulate,
            timeouts: OperationTimeouts {
                activate: seconds(args.activate_timeout),
                deactivate: seconds(args.deactivate_timeout),
                scan: seconds(args.scan_timeout),
                connect: seconds(args.connect_timeout),
                disconnect: seconds(args.disconnect_timeout),
            },
        }
    }
}
