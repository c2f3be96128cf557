//! USB Transport layer abstraction.
//!
//! Defines the `UsbTransport` trait for DFU class control transfers,
//! allowing different implementations (nusb, mock, etc.).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::FunctionalDescriptor;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Request stalled")]
    Stall,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bus identity of an opened device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UsbIdentity {
    pub vid: u16,
    pub pid: u16,
    /// bcdDevice.
    pub release: u16,
    /// Platform location, stable across re-enumeration on the same port.
    pub location: String,
}

impl fmt::Display for UsbIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x} @ {}", self.vid, self.pid, self.location)
    }
}

/// One interface alternate setting as reported by the active configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AltSetting {
    pub interface_number: u8,
    pub alt_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub name: Option<String>,
    pub functional: Option<FunctionalDescriptor>,
}

/// Class/interface control transfers plus the handful of device-level
/// operations the DFU engine needs.
pub trait UsbTransport: Send + Sync {
    fn identity(&self) -> UsbIdentity;

    /// Alternate settings of the active configuration.
    fn alt_settings(&self) -> Result<Vec<AltSetting>, TransportError>;

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError>;

    fn set_alt_setting(&mut self, interface: u8, alt_setting: u8) -> Result<(), TransportError>;

    /// Host-to-device class request addressed to the claimed interface.
    fn control_out(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Device-to-host class request addressed to the claimed interface.
    fn control_in(
        &self,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// USB port reset. The device may disconnect as a result.
    fn reset(&mut self) -> Result<(), TransportError>;

    /// Look for a device satisfying `matches` and rebind to it.
    ///
    /// Returns `Ok(false)` when no such device is present yet.
    fn reopen(&mut self, matches: &dyn Fn(&UsbIdentity) -> bool) -> Result<bool, TransportError>;

    fn is_connected(&self) -> bool;
}
