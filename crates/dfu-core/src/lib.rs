//! DFU-Core: USB Device Firmware Upgrade in Rust.
//!
//! This crate implements the USB DFU 1.0/1.1 class protocol, the ST DfuSe
//! extensions, and the firmware container formats used to carry images to
//! and from such devices.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Request codes, states, status and functional descriptor
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **Quirks**: Per-device workaround table
//! - **Sector**: DfuSe memory layout parsed from interface strings
//! - **Device / Target**: Protocol engine bound to one device and its alt settings
//! - **Firmware**: Raw, DFU suffix, DfuSe and Intel HEX codecs
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use dfu_core::{Cancellable, Device, DfuConfig, Firmware, ParseFlags, TransferFlags};
//! use dfu_core::transport::NusbTransport;
//!
//! let firmware = Firmware::parse_file("firmware.dfu", ParseFlags::empty())?;
//! let transport = NusbTransport::open_with_ids(0x0483, 0xDF11)?;
//! let mut device = Device::new(transport, DfuConfig::default())?;
//! device.open()?;
//! device.download(&firmware, TransferFlags::VERIFY, &Cancellable::new())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod cancel;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod firmware;
pub mod protocol;
pub mod quirks;
pub mod sector;
pub mod target;
pub mod transport;

// Re-exports for convenience
pub use cancel::{Cancellable, RecordingSleeper, Sleeper, ThreadSleeper};
pub use config::DfuConfig;
pub use device::{Device, DeviceMode, TargetInfo, TransferFlags};
pub use error::{DfuError, ErrorKind};
pub use events::{Action, DfuEvent, DfuObserver, NullObserver, RecordingObserver, TracingObserver};
pub use firmware::{
    CipherKind, Element, Firmware, FirmwareError, FirmwareFormat, Image, ParseFlags,
};
pub use protocol::{DfuAttributes, DfuState, DfuStatus, FunctionalDescriptor, StatusResponse};
pub use quirks::{QUIRK_TABLE, QuirkEntry, QuirkRule, Quirks};
pub use sector::{Sector, SectorCaps};
pub use target::Target;
pub use transport::{MockTransport, NusbTransport, TransportError, UsbIdentity, UsbTransport};
