//! WiFi Device Manager
//!
//! Activation, scanning and connection management for a wireless adapter
//! driven by an asynchronous, callback based device subsystem:
//! - a single device handle bound to the context that opened it
//! - at most one outstanding operation per exclusivity class
//! - state snapshots and typed events fed only by device notifications

pub mod backend;
pub mod config;
pub mod core;

pub use core::{
    bridge::SubscriptionId,
    error::{DeviceError, DeviceResult, ErrorKind},
    events::WifiEvent,
    manager::WifiManager,
    store::StateSnapshot,
    types::{
        AccessPoint, AutoScanMode, ConnectTarget, ConnectionState, DeviceState, RssiLevel,
        ScanState, SecurityType, WiFiConfiguration,
    },
};
