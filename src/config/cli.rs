//! Command-line argument parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[clap(name = "wifi-device-manager", version, author)]
#[clap(about = "WiFi device manager: activation, scanning and connection control")]
pub struct CliArgs {
    /// Wireless network interface name
    #[clap(short, long, default_value = "wlan0")]
    pub interface: String,

    /// Directory holding the wpa_supplicant control sockets
    #[clap(long, default_value = "/var/run/wpa_supplicant")]
    pub ctrl_dir: PathBuf,

    /// Use the simulated device instead of wpa_supplicant
    #[clap(long)]
    pub simulate: bool,

    /// Activation timeout in seconds (0 waits forever)
    #[clap(long, default_value_t = 30)]
    pub activate_timeout: u64,

    /// Deactivation timeout in seconds (0 waits forever)
    #[clap(long, default_value_t = 30)]
    pub deactivate_timeout: u64,

    /// Scan timeout in seconds (0 waits forever)
    #[clap(long, default_value_t = 15)]
    pub scan_timeout: u64,

    /// Connect timeout in seconds (0 waits forever)
    #[clap(long, default_value_t = 30)]
    pub connect_timeout: u64,

    /// Disconnect timeout in seconds (0 waits forever)
    #[clap(long, default_value_t = 10)]
    pub disconnect_timeout: u64,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the current device state
    Status,
    /// Power the WiFi device on
    Activate,
    /// Power the WiFi device off
    Deactivate,
    /// Scan all channels and list access points
    Scan,
    /// Scan for a specific ESSID
    ScanAp { essid: String },
    /// Scan and list BSSIDs
    BssidScan,
    /// Scan the given frequencies (MHz)
    MultiScan {
        #[clap(required = true)]
        frequencies: Vec<u32>,
    },
    /// Connect to an access point
    Connect {
        essid: String,
        #[clap(short, long)]
        passphrase: Option<String>,
        /// The network does not broadcast its ESSID
        #[clap(long)]
        hidden: bool,
    },
    /// Disconnect from the current access point
    Disconnect,
    /// List stored configurations
    Configs,
    /// Print device events as JSON lines until interrupted
    Monitor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = CliArgs::try_parse_from(["wifi-device-manager", "status"]).unwrap();
        assert_eq!(args.interface, "wlan0");
        assert_eq!(args.connect_timeout, 30);
        assert_eq!(args.scan_timeout, 15);
        assert!(!args.simulate);
        assert_eq!(args.command, Command::Status);
    }

    #[test]
    fn test_connect_arguments() {
        let args = CliArgs::try_parse_from([
            "wifi-device-manager",
            "--interface",
            "wlp2s0",
            "connect",
            "Office",
            "--passphrase",
            "hunter22",
            "--hidden",
        ])
        .unwrap();

        assert_eq!(args.interface, "wlp2s0");
        assert_eq!(
            args.command,
            Command::Connect {
                essid: "Office".to_string(),
                passphrase: Some("hunter22".to_string()),
                hidden: true,
            }
        );
    }

    #[test]
    fn test_multi_scan_requires_frequencies() {
        assert!(CliArgs::try_parse_from(["wifi-device-manager", "multi-scan"]).is_err());
        let args =
            CliArgs::try_parse_from(["wifi-device-manager", "multi-scan", "2412", "5180"]).unwrap();
        assert_eq!(
            args.command,
            Command::MultiScan {
                frequencies: vec![2412, 5180]
            }
        );
    }
}
