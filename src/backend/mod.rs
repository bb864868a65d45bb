//! Device subsystem abstraction layer

pub mod device_backend;
pub mod mock_backend;
pub mod wpa_backend;

pub use device_backend::{DeviceBackend, NativeNotification, NotificationCallback, RawHandle};
pub use mock_backend::{MockDeviceBackend, MockRequest};
pub use wpa_backend::WpaBackend;
