//! Error types for the WiFi device manager

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::OperationKind;

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Error taxonomy shared by the manager and the device backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum ErrorKind {
    NotSupported = 1,
    PermissionDenied = 2,
    InvalidArgument = 3,
    OperationInProgress = 4,
    InvalidContext = 5,
    TimedOut = 6,
    OutOfResources = 7,
    InvalidState = 8,
    Unknown = 9,
}

impl ErrorKind {
    /// Map a native result code to an error kind
    ///
    /// `0` means success. Codes outside the known range collapse to
    /// [`ErrorKind::Unknown`].
    pub fn from_native_code(code: i32) -> Option<Self> {
        match code {
            0 => None,
            1 => Some(ErrorKind::NotSupported),
            2 => Some(ErrorKind::PermissionDenied),
            3 => Some(ErrorKind::InvalidArgument),
            4 => Some(ErrorKind::OperationInProgress),
            5 => Some(ErrorKind::InvalidContext),
            6 => Some(ErrorKind::TimedOut),
            7 => Some(ErrorKind::OutOfResources),
            8 => Some(ErrorKind::InvalidState),
            _ => Some(ErrorKind::Unknown),
        }
    }

    pub fn native_code(self) -> i32 {
        self as i32
    }
}

/// Errors surfaced by device operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("WiFi feature not supported: {0}")]
    NotSupported(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} operation already in progress")]
    OperationInProgress(OperationKind),

    #[error("Device handle used from a foreign execution context")]
    InvalidContext,

    #[error("{0} operation timed out")]
    TimedOut(OperationKind),

    #[error("Out of resources: {0}")]
    OutOfResources(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Device subsystem error: {0}")]
    Unknown(String),
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::NotSupported(_) => ErrorKind::NotSupported,
            DeviceError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            DeviceError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            DeviceError::OperationInProgress(_) => ErrorKind::OperationInProgress,
            DeviceError::InvalidContext => ErrorKind::InvalidContext,
            DeviceError::TimedOut(_) => ErrorKind::TimedOut,
            DeviceError::OutOfResources(_) => ErrorKind::OutOfResources,
            DeviceError::InvalidState(_) => ErrorKind::InvalidState,
            DeviceError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Build the error reported by a failed native request of `kind`
    pub fn from_native(kind: ErrorKind, operation: OperationKind) -> Self {
        let detail = format!("{operation} rejected by device subsystem");
        match kind {
            ErrorKind::NotSupported => DeviceError::NotSupported(detail),
            ErrorKind::PermissionDenied => DeviceError::PermissionDenied(detail),
            ErrorKind::InvalidArgument => DeviceError::InvalidArgument(detail),
            ErrorKind::OperationInProgress => DeviceError::OperationInProgress(operation),
            ErrorKind::InvalidContext => DeviceError::InvalidContext,
            ErrorKind::TimedOut => DeviceError::TimedOut(operation),
            ErrorKind::OutOfResources => DeviceError::OutOfResources(detail),
            ErrorKind::InvalidState => DeviceError::InvalidState(detail),
            ErrorKind::Unknown => DeviceError::Unknown(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_code_mapping() {
        assert_eq!(ErrorKind::from_native_code(0), None);
        assert_eq!(
            ErrorKind::from_native_code(2),
            Some(ErrorKind::PermissionDenied)
        );
        assert_eq!(ErrorKind::from_native_code(-17), Some(ErrorKind::Unknown));
        assert_eq!(ErrorKind::from_native_code(42), Some(ErrorKind::Unknown));

        for kind in [ErrorKind::NotSupported, ErrorKind::TimedOut, ErrorKind::Unknown] {
            assert_eq!(ErrorKind::from_native_code(kind.native_code()), Some(kind));
        }
    }

    #[test]
    fn test_from_native_keeps_kind() {
        let err = DeviceError::from_native(ErrorKind::OutOfResources, OperationKind::Scan);
        assert_eq!(err.kind(), ErrorKind::OutOfResources);

        let err = DeviceError::from_native(ErrorKind::TimedOut, OperationKind::Connect);
        assert_eq!(err, DeviceError::TimedOut(OperationKind::Connect));
    }
}
