//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockRequest, MockTransport};
pub use nusb::NusbTransport;
pub use traits::{AltSetting, TransportError, UsbIdentity, UsbTransport};
