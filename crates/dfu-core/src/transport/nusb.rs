//! nusb-based USB transport implementation.

use std::time::Duration;

use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient, TransferError};
use nusb::{Device, DeviceInfo, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::traits::{AltSetting, TransportError, UsbIdentity, UsbTransport};
use crate::protocol::{FunctionalDescriptor, USB_CLASS_APPLICATION_SPECIFIC, USB_SUBCLASS_DFU};

const LANGUAGE_ID_EN_US: u16 = 0x0409;
const STRING_DESCRIPTOR_TIMEOUT: Duration = Duration::from_millis(1000);

fn location_of(info: &DeviceInfo) -> String {
    let ports: Vec<String> = info.port_chain().iter().map(|p| p.to_string()).collect();
    format!("{}-{}", info.bus_id(), ports.join("."))
}

fn identity_of(info: &DeviceInfo) -> UsbIdentity {
    UsbIdentity {
        vid: info.vendor_id(),
        pid: info.product_id(),
        release: info.device_version(),
        location: location_of(info),
    }
}

fn map_transfer_error(e: TransferError, timeout: Duration) -> TransportError {
    match e {
        TransferError::Stall => TransportError::Stall,
        TransferError::Disconnected => TransportError::Disconnected,
        TransferError::Cancelled => TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        },
        other => TransportError::TransferFailed(other.to_string()),
    }
}

/// True when any interface of the device advertises the DFU class.
fn has_dfu_interface(info: &DeviceInfo) -> bool {
    info.interfaces().any(|i| {
        i.class() == USB_CLASS_APPLICATION_SPECIFIC && i.subclass() == USB_SUBCLASS_DFU
    })
}

/// nusb-based USB transport.
pub struct NusbTransport {
    device: Device,
    interface: Option<Interface>,
    interface_number: u8,
    identity: UsbIdentity,
    connected: bool,
}

impl NusbTransport {
    /// Every attached device that exposes a DFU interface.
    pub fn list() -> Result<Vec<DeviceInfo>, TransportError> {
        Ok(list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .filter(has_dfu_interface)
            .collect())
    }

    /// Open the first DFU-capable device.
    #[instrument(level = "info")]
    pub fn open() -> Result<Self, TransportError> {
        let device_info = Self::list()?
            .into_iter()
            .next()
            .ok_or(TransportError::DeviceNotFound {
                vid: crate::protocol::WILDCARD_ID,
                pid: crate::protocol::WILDCARD_ID,
            })?;
        Self::open_device_info(device_info)
    }

    /// Open a device with specific VID/PID.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_ids(vid: u16, pid: u16) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        Self::open_device_info(device_info)
    }

    pub fn open_device_info(device_info: DeviceInfo) -> Result<Self, TransportError> {
        let identity = identity_of(&device_info);

        info!(
            vendor_id = %format!("{:04X}", identity.vid),
            product_id = %format!("{:04X}", identity.pid),
            location = %identity.location,
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        Ok(Self {
            device,
            interface: None,
            interface_number: 0,
            identity,
            connected: true,
        })
    }

    fn interface(&self) -> Result<&Interface, TransportError> {
        self.interface
            .as_ref()
            .ok_or_else(|| TransportError::TransferFailed("no interface claimed".into()))
    }

    fn string_descriptor(&self, index: std::num::NonZeroU8) -> Option<String> {
        match self
            .device
            .get_string_descriptor(index, LANGUAGE_ID_EN_US, STRING_DESCRIPTOR_TIMEOUT)
            .wait()
        {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(index = index.get(), error = %e, "Failed to read string descriptor");
                None
            }
        }
    }
}

impl UsbTransport for NusbTransport {
    fn identity(&self) -> UsbIdentity {
        self.identity.clone()
    }

    fn alt_settings(&self) -> Result<Vec<AltSetting>, TransportError> {
        let config = self
            .device
            .active_configuration()
            .map_err(|e| TransportError::TransferFailed(e.to_string()))?;

        let mut alts = Vec::new();
        for iface in config.interfaces() {
            for alt in iface.alt_settings() {
                let mut extra = Vec::new();
                for descriptor in alt.descriptors() {
                    extra.extend_from_slice(&descriptor);
                }
                alts.push(AltSetting {
                    interface_number: alt.interface_number(),
                    alt_setting: alt.alternate_setting(),
                    class: alt.class(),
                    subclass: alt.subclass(),
                    protocol: alt.protocol(),
                    name: alt.string_index().and_then(|i| self.string_descriptor(i)),
                    functional: FunctionalDescriptor::find(&extra),
                });
            }
        }
        Ok(alts)
    }

    #[instrument(skip(self))]
    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        let claimed = self
            .device
            .detach_and_claim_interface(interface)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface,
                message: e.to_string(),
            })?;
        self.interface = Some(claimed);
        self.interface_number = interface;
        debug!(interface, "Interface claimed");
        Ok(())
    }

    #[instrument(skip(self))]
    fn set_alt_setting(&mut self, interface: u8, alt_setting: u8) -> Result<(), TransportError> {
        if self.interface.is_none() || self.interface_number != interface {
            self.claim_interface(interface)?;
        }
        self.interface()?
            .set_alt_setting(alt_setting)
            .wait()
            .map_err(|e| TransportError::TransferFailed(e.to_string()))
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    fn control_out(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.interface()?
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    data,
                },
                timeout,
            )
            .wait()
            .map_err(|e| map_transfer_error(e, timeout))?;
        Ok(data.len())
    }

    #[instrument(skip(self))]
    fn control_in(
        &self,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let data = self
            .interface()?
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    length,
                },
                timeout,
            )
            .wait()
            .map_err(|e| map_transfer_error(e, timeout))?;
        debug!(bytes_read = data.len(), "Read complete");
        Ok(data)
    }

    #[instrument(skip(self))]
    fn reset(&mut self) -> Result<(), TransportError> {
        self.interface = None;
        match self.device.reset().wait() {
            Ok(()) => Ok(()),
            // a device that re-enumerates on reset reports it as gone
            Err(e) => {
                debug!(error = %e, "Reset reported an error, treating device as gone");
                self.connected = false;
                Ok(())
            }
        }
    }

    fn reopen(&mut self, matches: &dyn Fn(&UsbIdentity) -> bool) -> Result<bool, TransportError> {
        let found = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| matches(&identity_of(d)));
        let Some(device_info) = found else {
            self.connected = false;
            return Ok(false);
        };
        let reopened = Self::open_device_info(device_info)?;
        *self = reopened;
        Ok(true)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
