//! DFU device: binds a USB transport, tracks the device-reported state and
//! drives the device-level operations (status, detach, attach, replug).
//!
//! Per-alt-setting transfers live in [`crate::target`].

use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, info, instrument, warn};

use crate::cancel::{Cancellable, Sleeper, ThreadSleeper};
use crate::config::DfuConfig;
use crate::error::DfuError;
use crate::events::{Action, DfuEvent, DfuObserver, NullObserver};
use crate::firmware::{CipherKind, Firmware, FirmwareFormat};
use crate::protocol::*;
use crate::quirks::{QUIRK_TABLE, QuirkEntry, Quirks, lookup_in};
use crate::sector::{Sector, parse_alt_name};
use crate::target::Target;
use crate::transport::{TransportError, UsbIdentity, UsbTransport};

bitflags! {
    /// Options for upload and download.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TransferFlags: u16 {
        /// Read back and compare after a download.
        const VERIFY = 1 << 0;
        /// Detach a runtime-mode device into DFU mode first.
        const DETACH = 1 << 1;
        /// Return the device to runtime mode afterwards.
        const ATTACH = 1 << 2;
        /// Wait for the device to re-enumerate after attaching.
        const WAIT_RUNTIME = 1 << 3;
        /// Accept firmware whose vendor ID does not match the device.
        const WILDCARD_VID = 1 << 4;
        /// Accept firmware whose product ID does not match the device.
        const WILDCARD_PID = 1 << 5;
        /// Accept an image bound to a different alternate setting.
        const WILDCARD_ALT = 1 << 6;
        /// Accept firmware whose cipher differs from the target's.
        const ANY_CIPHER = 1 << 7;
    }
}

/// Which personality the device currently enumerates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    /// Application firmware with a DFU runtime interface.
    Runtime,
    /// DFU bootloader.
    Dfu,
}

/// One DFU alternate setting as discovered at bind time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    pub(crate) interface: u8,
    pub(crate) alt_setting: u8,
    pub(crate) alt_name: Option<String>,
    pub(crate) sectors: Vec<Sector>,
    pub(crate) cipher: CipherKind,
}

impl TargetInfo {
    pub fn alt_setting(&self) -> u8 {
        self.alt_setting
    }

    pub fn alt_name(&self) -> Option<&str> {
        self.alt_name.as_deref()
    }

    pub fn sectors(&self) -> &[Sector] {
        &self.sectors
    }

    pub fn cipher_kind(&self) -> CipherKind {
        self.cipher
    }
}

fn cipher_from_alt_name(name: &str) -> CipherKind {
    if name.contains("|XTEA") {
        CipherKind::Xtea
    } else {
        CipherKind::None
    }
}

/// A bound DFU-capable USB device.
pub struct Device<T: UsbTransport> {
    pub(crate) transport: T,
    pub(crate) config: DfuConfig,
    pub(crate) observer: Arc<dyn DfuObserver>,
    pub(crate) sleeper: Arc<dyn Sleeper>,
    quirk_table: Vec<QuirkEntry>,
    pub(crate) quirks: Quirks,
    pub(crate) attributes: DfuAttributes,
    pub(crate) version: u16,
    pub(crate) transfer_size: u16,
    detach_timeout_ms: u16,
    pub(crate) mode: DeviceMode,
    interface: u8,
    location: String,
    pub(crate) state: DfuState,
    pub(crate) status: DfuStatus,
    runtime_vid: u16,
    runtime_pid: u16,
    runtime_release: u16,
    pub(crate) targets: Vec<TargetInfo>,
    pub(crate) done_transfer: bool,
    /// Mode the device must come back in after the last detach.
    replug_mode: Option<DeviceMode>,
}

impl<T: UsbTransport> Device<T> {
    /// Bind to a transport and read its DFU descriptors.
    ///
    /// No DFU request is sent until [`Device::open`].
    pub fn new(transport: T, config: DfuConfig) -> Result<Self, DfuError> {
        config.validate()?;
        let mut quirk_table = config.quirk_entries()?;
        quirk_table.extend(QUIRK_TABLE.iter().cloned());

        let identity = transport.identity();
        let mut device = Self {
            transport,
            config,
            observer: Arc::new(NullObserver),
            sleeper: Arc::new(ThreadSleeper),
            quirk_table,
            quirks: Quirks::empty(),
            attributes: DfuAttributes::empty(),
            version: DFU_VERSION_1_0,
            transfer_size: DEFAULT_TRANSFER_SIZE,
            detach_timeout_ms: 0,
            mode: DeviceMode::Runtime,
            interface: 0,
            location: identity.location.clone(),
            state: DfuState::AppIdle,
            status: DfuStatus::Ok,
            runtime_vid: WILDCARD_ID,
            runtime_pid: WILDCARD_ID,
            runtime_release: WILDCARD_ID,
            targets: Vec::new(),
            done_transfer: false,
            replug_mode: None,
        };
        device.probe()?;
        Ok(device)
    }

    pub fn with_observer(mut self, observer: Arc<dyn DfuObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Resolve quirks, mode, attributes and targets from the descriptors.
    ///
    /// Quirks found on an earlier bind are kept.
    fn probe(&mut self) -> Result<(), DfuError> {
        let identity = self.transport.identity();
        self.quirks |= lookup_in(&self.quirk_table, identity.vid, identity.pid, identity.release);

        let alts: Vec<_> = self
            .transport
            .alt_settings()
            .map_err(|e| self.transport_error("reading descriptors", e))?
            .into_iter()
            .filter(|a| a.class == USB_CLASS_APPLICATION_SPECIFIC && a.subclass == USB_SUBCLASS_DFU)
            .collect();
        let first = alts
            .first()
            .ok_or_else(|| DfuError::NotFound(format!("no DFU interface on {}", identity)))?;

        self.interface = first.interface_number;
        self.mode = match first.protocol {
            DFU_PROTOCOL_RUNTIME => DeviceMode::Runtime,
            DFU_PROTOCOL_DFU => DeviceMode::Dfu,
            0 if self.quirks.contains(Quirks::USE_PROTOCOL_ZERO) => DeviceMode::Dfu,
            other => {
                warn!(protocol = other, "Unexpected DFU interface protocol, assuming runtime");
                DeviceMode::Runtime
            }
        };
        if self.quirks.contains(Quirks::FORCE_DFU_MODE) {
            self.mode = DeviceMode::Dfu;
        }

        match alts.iter().find_map(|a| a.functional) {
            Some(desc) => {
                self.attributes = desc.attributes;
                self.detach_timeout_ms = desc.detach_timeout_ms;
                self.version = desc.dfu_version;
                self.transfer_size = if desc.transfer_size == 0 {
                    DEFAULT_TRANSFER_SIZE
                } else {
                    desc.transfer_size
                };
            }
            None => {
                warn!("No DFU functional descriptor, assuming DFU 1.0 defaults");
                self.attributes = DfuAttributes::CAN_DOWNLOAD | DfuAttributes::CAN_UPLOAD;
                self.version = DFU_VERSION_1_0;
                self.transfer_size = DEFAULT_TRANSFER_SIZE;
            }
        }
        if !KNOWN_DFU_VERSIONS.contains(&self.version)
            && !self.quirks.contains(Quirks::IGNORE_INVALID_VERSION)
        {
            warn!(version = %format!("{:04x}", self.version), "DFU version is invalid");
        }
        if self.is_dfuse() && self.attributes.contains(DfuAttributes::CAN_ACCELERATE) {
            self.transfer_size = DFUSE_ACCELERATED_TRANSFER_SIZE;
        }
        if let Some(size) = self.config.transfer_size {
            self.transfer_size = size;
        }

        if self.mode == DeviceMode::Runtime || self.quirks.contains(Quirks::NO_PID_CHANGE) {
            self.runtime_vid = identity.vid;
            self.runtime_pid = identity.pid;
            self.runtime_release = identity.release;
        }

        let dfuse = self.is_dfuse();
        self.targets = alts
            .iter()
            .map(|a| -> Result<TargetInfo, DfuError> {
                let alt_name = a.name.clone();
                let sectors = match (&alt_name, dfuse) {
                    (Some(name), true) => parse_alt_name(name)?.sectors,
                    _ => Vec::new(),
                };
                let cipher = alt_name
                    .as_deref()
                    .map(cipher_from_alt_name)
                    .unwrap_or_default();
                Ok(TargetInfo {
                    interface: a.interface_number,
                    alt_setting: a.alt_setting,
                    alt_name,
                    sectors,
                    cipher,
                })
            })
            .collect::<Result<_, _>>()?;

        info!(
            vid = %format!("{:04X}", identity.vid),
            pid = %format!("{:04X}", identity.pid),
            mode = ?self.mode,
            version = %format!("{:04x}", self.version),
            transfer_size = self.transfer_size,
            quirks = %self.quirks,
            targets = self.targets.len(),
            "Probed DFU device"
        );
        Ok(())
    }

    /// Claim the DFU interface and bring the device to a known state.
    #[instrument(skip(self))]
    pub fn open(&mut self) -> Result<(), DfuError> {
        let interface = self.interface;
        self.transport
            .claim_interface(interface)
            .map_err(|e| self.transport_error("claiming interface", e))?;
        let identity = self.transport.identity();
        self.observer.on_event(&DfuEvent::DeviceConnected {
            vid: identity.vid,
            pid: identity.pid,
        });

        if self.mode == DeviceMode::Runtime && self.quirks.contains(Quirks::NO_DFU_RUNTIME) {
            debug!("No DFU runtime, skipping status refresh");
            return Ok(());
        }
        let status = self.refresh()?;
        if status.state.is_transfer_pending() {
            debug!(state = %status.state, "Aborting pending transfer");
            self.abort()?;
        } else if status.state == DfuState::DfuError {
            debug!(status = %status.status, "Clearing error status");
            self.clear_status()?;
        }
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &DfuConfig {
        &self.config
    }

    pub fn identity(&self) -> UsbIdentity {
        self.transport.identity()
    }

    pub fn quirks(&self) -> Quirks {
        self.quirks
    }

    /// Quirks in the `ignore-polltimeout|no-pid-change` form.
    pub fn quirks_string(&self) -> String {
        self.quirks.to_string()
    }

    pub fn attributes(&self) -> DfuAttributes {
        self.attributes
    }

    /// bcdDFUVersion.
    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn is_dfuse(&self) -> bool {
        self.version == DFU_VERSION_DFUSE
    }

    pub fn transfer_size(&self) -> u16 {
        self.transfer_size
    }

    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    pub fn is_runtime(&self) -> bool {
        self.mode == DeviceMode::Runtime
    }

    /// Last state reported by the device.
    pub fn state(&self) -> DfuState {
        self.state
    }

    pub fn status(&self) -> DfuStatus {
        self.status
    }

    pub fn runtime_vid(&self) -> u16 {
        self.runtime_vid
    }

    pub fn runtime_pid(&self) -> u16 {
        self.runtime_pid
    }

    pub fn runtime_release(&self) -> u16 {
        self.runtime_release
    }

    pub fn targets(&self) -> &[TargetInfo] {
        &self.targets
    }

    pub fn target(&mut self, index: usize) -> Result<Target<'_, T>, DfuError> {
        let alt_setting = self
            .targets
            .get(index)
            .map(|t| t.alt_setting)
            .ok_or_else(|| DfuError::NotFound(format!("no target with index {}", index)))?;
        Ok(Target::new(self, alt_setting))
    }

    pub fn target_by_alt_setting(&mut self, alt_setting: u8) -> Result<Target<'_, T>, DfuError> {
        if !self.targets.iter().any(|t| t.alt_setting == alt_setting) {
            return Err(DfuError::NotFound(format!(
                "no target with alt-setting {}",
                alt_setting
            )));
        }
        Ok(Target::new(self, alt_setting))
    }

    pub fn target_by_alt_name(&mut self, name: &str) -> Result<Target<'_, T>, DfuError> {
        let alt_setting = self
            .targets
            .iter()
            .find(|t| t.alt_name.as_deref() == Some(name))
            .map(|t| t.alt_setting)
            .ok_or_else(|| DfuError::NotFound(format!("no target with alt-name '{}'", name)))?;
        Ok(Target::new(self, alt_setting))
    }

    pub(crate) fn target_info(&self, alt_setting: u8) -> Result<&TargetInfo, DfuError> {
        self.targets
            .iter()
            .find(|t| t.alt_setting == alt_setting)
            .ok_or_else(|| {
                DfuError::NotFound(format!("no target with alt-setting {}", alt_setting))
            })
    }

    // ========================================================================
    // Control transfers and error fixup
    // ========================================================================

    fn transport_error(&self, context: &str, source: TransportError) -> DfuError {
        DfuError::Transport {
            context: context.to_string(),
            device: self.transport.identity().to_string(),
            state: self.state,
            source,
        }
    }

    /// Classify a failed control transfer using quirks and device status.
    fn fixup_error(&mut self, context: &str, source: TransportError) -> DfuError {
        if self.mode == DeviceMode::Runtime && self.quirks.contains(Quirks::NO_DFU_RUNTIME) {
            return DfuError::Unsupported(format!("{}: device has no DFU runtime interface", context));
        }
        if matches!(source, TransportError::Stall) && self.mode == DeviceMode::Dfu {
            let status = self
                .transport
                .control_in(
                    DFU_REQUEST_GETSTATUS,
                    0,
                    self.interface as u16,
                    StatusResponse::SIZE as u16,
                    self.config.transfer_timeout(),
                )
                .ok()
                .and_then(|bytes| StatusResponse::from_bytes(&bytes).ok());
            if let Some(status) = status {
                self.update_status(&status);
                if status.state == DfuState::DfuError {
                    return self.protocol_error(context, &status);
                }
            }
        }
        self.transport_error(context, source)
    }

    /// Build a protocol error from a dfuERROR status, clearing it first.
    pub(crate) fn protocol_error(&mut self, context: &str, status: &StatusResponse) -> DfuError {
        let detail = match status.status {
            DfuStatus::ErrVendor if self.is_dfuse() => "read protection is active",
            DfuStatus::ErrTarget if self.is_dfuse() => "address is wrong or unsupported",
            other => other.description(),
        };
        if let Err(e) = self.clear_status() {
            warn!(error = %e, "Failed to clear error status");
        }
        DfuError::Protocol {
            state: status.state,
            status: status.status,
            message: format!("{}: {}", context, detail),
        }
    }

    pub(crate) fn control_out(
        &mut self,
        context: &str,
        request: u8,
        value: u16,
        data: &[u8],
    ) -> Result<usize, DfuError> {
        let timeout = self.config.transfer_timeout();
        match self
            .transport
            .control_out(request, value, self.interface as u16, data, timeout)
        {
            Ok(n) => Ok(n),
            Err(e) => Err(self.fixup_error(context, e)),
        }
    }

    pub(crate) fn control_in(
        &mut self,
        context: &str,
        request: u8,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, DfuError> {
        let timeout = self.config.transfer_timeout();
        match self
            .transport
            .control_in(request, value, self.interface as u16, length, timeout)
        {
            Ok(data) => Ok(data),
            Err(e) => Err(self.fixup_error(context, e)),
        }
    }

    pub(crate) fn select_alt_setting(&mut self, alt_setting: u8) -> Result<(), DfuError> {
        let interface = self.target_info(alt_setting)?.interface;
        self.transport
            .set_alt_setting(interface, alt_setting)
            .map_err(|e| self.transport_error("selecting alt-setting", e))
    }

    fn update_status(&mut self, status: &StatusResponse) {
        if status.state != self.state || status.status != self.status {
            self.state = status.state;
            self.status = status.status;
            self.observer.on_event(&DfuEvent::StateChanged {
                state: status.state,
                status: status.status,
            });
        }
    }

    pub(crate) fn set_action(&self, action: Action) {
        self.observer.on_event(&DfuEvent::ActionChanged { action });
    }

    /// Sleep for the poll timeout the device asked for, unless quirked.
    pub(crate) fn sleep_poll_timeout(&self, status: &StatusResponse) {
        if status.poll_timeout_ms > 0 && !self.quirks.contains(Quirks::IGNORE_POLLTIMEOUT) {
            self.sleeper.sleep(status.poll_timeout());
        }
    }

    /// Poll GETSTATUS while the device is busy with the last request.
    pub(crate) fn wait_while_busy(
        &mut self,
        context: &str,
        cancel: &Cancellable,
    ) -> Result<StatusResponse, DfuError> {
        let mut polls: u32 = 0;
        loop {
            cancel.check()?;
            let status = self.refresh()?;
            match status.state {
                DfuState::DfuDnbusy | DfuState::DfuDnloadSync => {
                    polls += 1;
                    if polls > self.config.max_busy_polls {
                        return Err(DfuError::Timeout(format!(
                            "{}: device still busy after {} status polls",
                            context, polls
                        )));
                    }
                    self.sleep_poll_timeout(&status);
                }
                DfuState::DfuError => return Err(self.protocol_error(context, &status)),
                _ => return Ok(status),
            }
        }
    }

    // ========================================================================
    // Device operations
    // ========================================================================

    /// GETSTATUS.
    pub fn refresh(&mut self) -> Result<StatusResponse, DfuError> {
        let bytes = self.control_in(
            "getting status",
            DFU_REQUEST_GETSTATUS,
            0,
            StatusResponse::SIZE as u16,
        )?;
        let status = StatusResponse::from_bytes(&bytes).map_err(|e| DfuError::Protocol {
            state: self.state,
            status: self.status,
            message: format!("invalid status response: {}", e),
        })?;
        self.update_status(&status);
        Ok(status)
    }

    /// GETSTATE.
    pub fn get_state(&mut self) -> Result<DfuState, DfuError> {
        let bytes = self.control_in("getting state", DFU_REQUEST_GETSTATE, 0, 1)?;
        let state = bytes
            .first()
            .map(|b| DfuState::from(*b))
            .ok_or_else(|| DfuError::Protocol {
                state: self.state,
                status: self.status,
                message: "empty state response".into(),
            })?;
        self.state = state;
        Ok(state)
    }

    /// ABORT: back to dfuIDLE from any idle transfer state.
    pub fn abort(&mut self) -> Result<(), DfuError> {
        self.control_out("aborting", DFU_REQUEST_ABORT, 0, &[])?;
        self.state = DfuState::DfuIdle;
        Ok(())
    }

    /// CLRSTATUS: leave dfuERROR.
    pub fn clear_status(&mut self) -> Result<(), DfuError> {
        let timeout = self.config.transfer_timeout();
        // no fixup: a stall here must not recurse into another clear
        self.transport
            .control_out(DFU_REQUEST_CLRSTATUS, 0, self.interface as u16, &[], timeout)
            .map_err(|e| self.transport_error("clearing status", e))?;
        self.state = DfuState::DfuIdle;
        self.status = DfuStatus::Ok;
        Ok(())
    }

    /// USB port reset.
    #[instrument(skip(self))]
    pub fn reset(&mut self) -> Result<(), DfuError> {
        self.transport
            .reset()
            .map_err(|e| self.transport_error("resetting", e))
    }

    /// Ask a runtime-mode device to switch to DFU mode.
    ///
    /// Devices without `WILL_DETACH` are reset afterwards. Use
    /// [`Device::wait_for_replug`] to rebind to the DFU-mode device.
    #[instrument(skip(self, cancel))]
    pub fn detach(&mut self, cancel: &Cancellable) -> Result<(), DfuError> {
        cancel.check()?;
        if self.mode == DeviceMode::Dfu {
            return Err(DfuError::Unsupported("device is already in DFU mode".into()));
        }
        if self.quirks.contains(Quirks::NO_DFU_RUNTIME) {
            return Err(DfuError::Unsupported("device has no DFU runtime interface".into()));
        }
        self.set_action(Action::Detach);
        let timeout = self.config.transfer_timeout();
        match self.transport.control_out(
            DFU_REQUEST_DETACH,
            self.detach_timeout_ms,
            self.interface as u16,
            &[],
            timeout,
        ) {
            // some devices drop off the bus before acknowledging
            Ok(_) | Err(TransportError::Disconnected) => {}
            Err(e) => return Err(self.fixup_error("detaching", e)),
        }
        self.state = DfuState::AppDetach;
        self.replug_mode = Some(DeviceMode::Dfu);
        if !self.attributes.contains(DfuAttributes::WILL_DETACH) && self.transport.is_connected() {
            self.reset()?;
        }
        self.observer.on_event(&DfuEvent::DeviceDisconnected);
        self.set_action(Action::Idle);
        Ok(())
    }

    /// Return a DFU-mode device to its application firmware.
    #[instrument(skip(self, cancel))]
    pub fn attach(&mut self, cancel: &Cancellable) -> Result<(), DfuError> {
        cancel.check()?;
        if self.mode == DeviceMode::Runtime {
            debug!("Already in runtime mode");
            return Ok(());
        }
        self.set_action(Action::Attach);

        if self.quirks.contains(Quirks::ATTACH_UPLOAD_DOWNLOAD) && !self.done_transfer {
            debug!("Performing dummy upload before attach");
            let size = self.transfer_size;
            self.control_in("dummy upload", DFU_REQUEST_UPLOAD, 0, size)?;
            self.abort()?;
        }

        if self.is_dfuse() {
            // leave DFU mode: point at the start of memory, then zero-length download
            let start = self
                .targets
                .first()
                .and_then(|t| t.sectors.first())
                .map(|s| s.address());
            if let Some(address) = start {
                self.dfuse_command(DFUSE_CMD_SET_ADDRESS_POINTER, Some(address), cancel)?;
            }
            self.control_out("leaving DFU mode", DFU_REQUEST_DNLOAD, DFUSE_DATA_BLOCK_OFFSET, &[])?;
            match self.refresh() {
                Ok(_) => {}
                Err(DfuError::Transport { .. }) => debug!("Device left during leave request"),
                Err(e) => return Err(e),
            }
        } else if self.transport.is_connected() {
            self.reset()?;
        }
        self.observer.on_event(&DfuEvent::DeviceDisconnected);
        self.set_action(Action::Idle);
        Ok(())
    }

    /// DfuSe special command via DNLOAD block 0, followed by a status check.
    pub(crate) fn dfuse_command(
        &mut self,
        command: u8,
        address: Option<u32>,
        cancel: &Cancellable,
    ) -> Result<(), DfuError> {
        cancel.check()?;
        let mut data = vec![command];
        if let Some(address) = address {
            data.extend_from_slice(&address.to_le_bytes());
        }
        let context = match command {
            DFUSE_CMD_SET_ADDRESS_POINTER => "setting address pointer",
            DFUSE_CMD_ERASE => "erasing",
            _ => "DfuSe command",
        };
        debug!(command = %format!("0x{:02x}", command), address = ?address, "DfuSe command");
        self.control_out(context, DFU_REQUEST_DNLOAD, 0, &data)?;
        self.wait_while_busy(context, cancel)?;
        Ok(())
    }

    /// Wait for the device to come back after a detach, attach or reset
    /// and rebind to it.
    ///
    /// The device must re-appear at the same bus location. Its vendor ID
    /// must match the runtime vendor ID unless `WILDCARD_VID` is given; the
    /// product ID is only compared under the `no-pid-change` quirk.
    ///
    /// A device still listed from before the reset is skipped: after a
    /// detach it must come back in DFU mode, and it must not still be in
    /// dfuMANIFEST-WAIT-RESET.
    #[instrument(skip(self, cancel))]
    pub fn wait_for_replug(
        &mut self,
        flags: TransferFlags,
        cancel: &Cancellable,
    ) -> Result<(), DfuError> {
        let location = self.location.clone();
        let vid = (!flags.contains(TransferFlags::WILDCARD_VID) && self.runtime_vid != WILDCARD_ID)
            .then_some(self.runtime_vid);
        let pid = (self.quirks.contains(Quirks::NO_PID_CHANGE) && self.runtime_pid != WILDCARD_ID)
            .then_some(self.runtime_pid);
        let matches = move |id: &UsbIdentity| {
            id.location == location && vid.is_none_or(|v| v == id.vid) && pid.is_none_or(|p| p == id.pid)
        };

        let interval = REPLUG_POLL_INTERVAL;
        let attempts = (self.config.replug_timeout().as_millis() / interval.as_millis()).max(1) as u32;
        for attempt in 0..attempts {
            cancel.check()?;
            let found = self
                .transport
                .reopen(&matches)
                .map_err(|e| self.transport_error("waiting for replug", e))?;
            if found {
                self.probe()?;
                if self.replug_mode.is_some_and(|mode| mode != self.mode) {
                    debug!(attempt, mode = ?self.mode, "Old device still enumerated");
                } else {
                    self.open()?;
                    if self.state != DfuState::DfuManifestWaitReset {
                        debug!(attempt, "Device re-enumerated");
                        self.replug_mode = None;
                        return Ok(());
                    }
                    debug!(attempt, "Device has not reset yet");
                }
            }
            self.sleeper.sleep(interval);
        }
        Err(DfuError::Timeout(format!(
            "device did not re-appear within {}ms",
            self.config.replug_timeout_ms
        )))
    }

    /// Leave runtime mode if needed before a transfer.
    pub(crate) fn ensure_dfu_mode(
        &mut self,
        flags: TransferFlags,
        cancel: &Cancellable,
    ) -> Result<(), DfuError> {
        if self.mode == DeviceMode::Dfu {
            return Ok(());
        }
        if !flags.contains(TransferFlags::DETACH) {
            return Err(DfuError::Unsupported(
                "device is in runtime mode and DETACH was not requested".into(),
            ));
        }
        self.detach(cancel)?;
        self.wait_for_replug(flags, cancel)
    }

    // ========================================================================
    // Whole-device transfers
    // ========================================================================

    /// Download every image of `firmware` to the target with the matching
    /// alternate setting.
    #[instrument(skip_all, fields(images = firmware.images().len()))]
    pub fn download(
        &mut self,
        firmware: &Firmware,
        flags: TransferFlags,
        cancel: &Cancellable,
    ) -> Result<(), DfuError> {
        self.check_firmware_ids(firmware, flags)?;
        if firmware.images().is_empty() {
            return Err(DfuError::InvalidImage("firmware has no images".into()));
        }
        self.ensure_dfu_mode(flags, cancel)?;
        if firmware.images().len() > 1
            && !self.attributes.contains(DfuAttributes::MANIFEST_TOLERANT)
        {
            return Err(DfuError::Unsupported(
                "multiple images need a manifestation-tolerant device".into(),
            ));
        }

        let per_image = flags - TransferFlags::ATTACH - TransferFlags::WAIT_RUNTIME;
        for image in firmware.images() {
            let alt_setting = match image.alt_setting() {
                Some(alt) => alt,
                None => {
                    self.targets
                        .first()
                        .ok_or_else(|| DfuError::NotFound("device has no targets".into()))?
                        .alt_setting
                }
            };
            let cipher = self.target_info(alt_setting)?.cipher;
            if !flags.contains(TransferFlags::ANY_CIPHER) && firmware.cipher_kind() != cipher {
                return Err(DfuError::InvalidImage(format!(
                    "firmware cipher {} does not match target cipher {}",
                    firmware.cipher_kind(),
                    cipher
                )));
            }
            self.target_by_alt_setting(alt_setting)?
                .download(image, per_image, cancel)?;
        }

        self.finish(flags, cancel)
    }

    /// Upload every target into a new firmware container.
    #[instrument(skip_all)]
    pub fn upload(
        &mut self,
        flags: TransferFlags,
        cancel: &Cancellable,
    ) -> Result<Firmware, DfuError> {
        self.ensure_dfu_mode(flags, cancel)?;

        let mut firmware = Firmware::new();
        let identity = self.transport.identity();
        firmware.set_vid(if self.runtime_vid != WILDCARD_ID {
            self.runtime_vid
        } else {
            identity.vid
        });
        firmware.set_pid(if self.runtime_pid != WILDCARD_ID {
            self.runtime_pid
        } else {
            identity.pid
        });
        firmware.set_release(WILDCARD_ID);

        let per_target = flags - TransferFlags::ATTACH - TransferFlags::WAIT_RUNTIME;
        let alts: Vec<u8> = self.targets.iter().map(|t| t.alt_setting).collect();
        for alt_setting in &alts {
            let image = self
                .target_by_alt_setting(*alt_setting)?
                .upload(per_target, cancel)?;
            firmware.add_image(image);
        }
        firmware.set_format(if alts.len() > 1 || self.is_dfuse() {
            FirmwareFormat::DfuSe
        } else {
            FirmwareFormat::Dfu
        });

        self.finish(flags, cancel)?;
        Ok(firmware)
    }

    fn check_firmware_ids(&self, firmware: &Firmware, flags: TransferFlags) -> Result<(), DfuError> {
        if firmware.vid() != WILDCARD_ID
            && self.runtime_vid != WILDCARD_ID
            && !flags.contains(TransferFlags::WILDCARD_VID)
            && firmware.vid() != self.runtime_vid
        {
            return Err(DfuError::InvalidImage(format!(
                "vendor ID incorrect, expected 0x{:04x} got 0x{:04x}",
                self.runtime_vid,
                firmware.vid()
            )));
        }
        if firmware.pid() != WILDCARD_ID
            && self.runtime_pid != WILDCARD_ID
            && !flags.contains(TransferFlags::WILDCARD_PID)
            && firmware.pid() != self.runtime_pid
        {
            return Err(DfuError::InvalidImage(format!(
                "product ID incorrect, expected 0x{:04x} got 0x{:04x}",
                self.runtime_pid,
                firmware.pid()
            )));
        }
        Ok(())
    }

    /// ATTACH and WAIT_RUNTIME handling at the end of a transfer.
    pub(crate) fn finish(&mut self, flags: TransferFlags, cancel: &Cancellable) -> Result<(), DfuError> {
        if flags.contains(TransferFlags::ATTACH)
            && self.mode == DeviceMode::Dfu
            && self.transport.is_connected()
        {
            self.attach(cancel)?;
            if flags.contains(TransferFlags::WAIT_RUNTIME) {
                self.wait_for_replug(flags, cancel)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::RecordingSleeper;
    use crate::events::RecordingObserver;
    use crate::transport::MockTransport;

    fn open(mock: &MockTransport, config: DfuConfig) -> (Device<MockTransport>, RecordingSleeper) {
        let sleeper = RecordingSleeper::new();
        let mut device = Device::new(mock.clone(), config)
            .unwrap()
            .with_sleeper(Arc::new(sleeper.clone()));
        device.open().unwrap();
        (device, sleeper)
    }

    #[test]
    fn test_probe_dfu_mode() {
        let mock = MockTransport::new().with_transfer_size(0);
        let (device, _) = open(&mock, DfuConfig::default());
        assert_eq!(device.mode(), DeviceMode::Dfu);
        assert_eq!(device.transfer_size(), DEFAULT_TRANSFER_SIZE);
        assert_eq!(device.state(), DfuState::DfuIdle);
        assert_eq!(device.targets().len(), 1);
        assert_eq!(device.targets()[0].alt_name(), Some("Flash"));
        // DFU mode without no-pid-change does not know the runtime ids
        assert_eq!(device.runtime_pid(), WILDCARD_ID);
    }

    #[test]
    fn test_probe_dfuse_sectors_and_acceleration() {
        let mock = MockTransport::dfuse(&["@Internal Flash  /0x08000000/04*016Kg"])
            .with_attributes(DfuAttributes::CAN_DOWNLOAD | DfuAttributes::CAN_ACCELERATE);
        let (device, _) = open(&mock, DfuConfig::default());
        assert!(device.is_dfuse());
        assert_eq!(device.transfer_size(), DFUSE_ACCELERATED_TRANSFER_SIZE);
        assert_eq!(device.targets()[0].sectors().len(), 4);

        let config = DfuConfig {
            transfer_size: Some(256),
            ..DfuConfig::default()
        };
        let (device, _) = open(&mock, config);
        assert_eq!(device.transfer_size(), 256);
    }

    #[test]
    fn test_protocol_zero_and_force_dfu_quirks() {
        let mock = MockTransport::new()
            .with_ids(0x1234, 0x1111, 0x1111)
            .with_protocol(0);
        let config = DfuConfig {
            extra_quirks: vec![crate::quirks::QuirkRule {
                vid: 0x1234,
                pid: 0x1111,
                release: None,
                quirks: "use-protocol-zero|no-pid-change".into(),
            }],
            ..DfuConfig::default()
        };
        let (device, _) = open(&mock, config);
        assert_eq!(device.mode(), DeviceMode::Dfu);
        assert_eq!(device.quirks_string(), "use-protocol-zero|no-pid-change");
        assert_eq!(device.runtime_pid(), 0x1111);

        let (device, _) = open(&mock, DfuConfig::default());
        assert_eq!(device.mode(), DeviceMode::Runtime);
    }

    #[test]
    fn test_open_clears_error_and_aborts_pending() {
        let mock = MockTransport::new().with_state(DfuState::DfuError, DfuStatus::ErrWrite);
        let (device, _) = open(&mock, DfuConfig::default());
        assert_eq!(device.state(), DfuState::DfuIdle);
        assert_eq!(mock.count_requests(DFU_REQUEST_CLRSTATUS), 1);

        let mock = MockTransport::new().with_state(DfuState::DfuDnloadIdle, DfuStatus::Ok);
        open(&mock, DfuConfig::default());
        assert_eq!(mock.count_requests(DFU_REQUEST_ABORT), 1);
        assert_eq!(mock.dfu_state(), DfuState::DfuIdle);
    }

    #[test]
    fn test_stall_is_annotated_with_device_status() {
        let mock = MockTransport::new().stall_request(DFU_REQUEST_ABORT);
        let (mut device, _) = open(&mock, DfuConfig::default());
        let err = device.abort().unwrap_err();
        match err {
            DfuError::Protocol { state, status, .. } => {
                assert_eq!(state, DfuState::DfuError);
                assert_eq!(status, DfuStatus::ErrStalledPacket);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(mock.count_requests(DFU_REQUEST_CLRSTATUS), 1);
        assert_eq!(device.state(), DfuState::DfuIdle);
        assert_eq!(device.status(), DfuStatus::Ok);
    }

    #[test]
    fn test_detach_and_replug_into_dfu_mode() {
        let mock = MockTransport::new()
            .with_runtime_mode()
            .with_replug_delay(2);
        let observer = Arc::new(RecordingObserver::new());
        let sleeper = RecordingSleeper::new();
        let mut device = Device::new(mock.clone(), DfuConfig::default())
            .unwrap()
            .with_observer(observer.clone())
            .with_sleeper(Arc::new(sleeper.clone()));
        device.open().unwrap();
        assert!(device.is_runtime());
        assert_eq!(device.runtime_pid(), 0x5678);

        let cancel = Cancellable::new();
        device.detach(&cancel).unwrap();
        assert_eq!(mock.reset_count(), 1);
        device
            .wait_for_replug(TransferFlags::empty(), &cancel)
            .unwrap();

        assert_eq!(device.mode(), DeviceMode::Dfu);
        assert_eq!(device.identity().pid, 0x5679);
        assert_eq!(device.runtime_pid(), 0x5678);
        assert_eq!(sleeper.sleeps(), vec![REPLUG_POLL_INTERVAL; 2]);
        assert!(observer.events().contains(&DfuEvent::DeviceConnected {
            vid: 0x1234,
            pid: 0x5679
        }));
    }

    #[test]
    fn test_replug_timeout() {
        let mock = MockTransport::new().with_runtime_mode().with_replug_delay(100);
        let config = DfuConfig {
            replug_timeout_ms: 300,
            ..DfuConfig::default()
        };
        let (mut device, sleeper) = open(&mock, config);
        let cancel = Cancellable::new();
        device.detach(&cancel).unwrap();
        let err = device
            .wait_for_replug(TransferFlags::empty(), &cancel)
            .unwrap_err();
        assert!(matches!(err, DfuError::Timeout(_)));
        assert_eq!(sleeper.sleeps().len(), 3);
    }

    #[test]
    fn test_no_pid_change_requires_same_pid() {
        let mock = MockTransport::new().with_runtime_mode();
        let config = DfuConfig {
            replug_timeout_ms: 200,
            extra_quirks: vec![crate::quirks::QuirkRule {
                vid: 0x1234,
                pid: 0x5678,
                release: None,
                quirks: "no-pid-change".into(),
            }],
            ..DfuConfig::default()
        };
        let (mut device, _) = open(&mock, config);
        let cancel = Cancellable::new();
        device.detach(&cancel).unwrap();
        // the mock comes back with a different PID
        assert!(matches!(
            device.wait_for_replug(TransferFlags::empty(), &cancel),
            Err(DfuError::Timeout(_))
        ));
    }

    #[test]
    fn test_detach_rejected_in_dfu_mode_and_without_runtime() {
        let mock = MockTransport::new();
        let (mut device, _) = open(&mock, DfuConfig::default());
        assert!(matches!(
            device.detach(&Cancellable::new()),
            Err(DfuError::Unsupported(_))
        ));
    }

    #[test]
    fn test_no_dfu_runtime_skips_refresh_and_detach() {
        let mock = MockTransport::new().with_runtime_mode();
        let config = DfuConfig {
            extra_quirks: vec![crate::quirks::QuirkRule {
                vid: 0x1234,
                pid: 0x5678,
                release: None,
                quirks: "no-dfu-runtime".into(),
            }],
            ..DfuConfig::default()
        };
        let (mut device, _) = open(&mock, config);
        assert_eq!(mock.count_requests(DFU_REQUEST_GETSTATUS), 0);
        assert!(matches!(
            device.detach(&Cancellable::new()),
            Err(DfuError::Unsupported(_))
        ));
    }

    #[test]
    fn test_no_dfu_runtime_reclassifies_transfer_errors() {
        let mock = MockTransport::new().with_runtime_mode();
        let (mut device, _) = open(&mock, DfuConfig::default());
        assert!(matches!(
            device.abort(),
            Err(DfuError::Transport {
                source: TransportError::Stall,
                ..
            })
        ));

        let config = DfuConfig {
            extra_quirks: vec![crate::quirks::QuirkRule {
                vid: 0x1234,
                pid: 0x5678,
                release: None,
                quirks: "no-dfu-runtime".into(),
            }],
            ..DfuConfig::default()
        };
        let (mut device, _) = open(&mock, config);
        assert!(matches!(device.abort(), Err(DfuError::Unsupported(_))));
        assert_eq!(mock.count_requests(DFU_REQUEST_ABORT), 2);
    }

    #[test]
    fn test_attach_with_dummy_upload() {
        let mock = MockTransport::new()
            .with_runtime_mode()
            .with_flash(&[0u8; 8]);
        let config = DfuConfig {
            extra_quirks: vec![crate::quirks::QuirkRule {
                vid: 0x1234,
                pid: 0x5678,
                release: None,
                quirks: "attach-upload-download".into(),
            }],
            ..DfuConfig::default()
        };
        let (mut device, _) = open(&mock, config);
        let cancel = Cancellable::new();
        device.detach(&cancel).unwrap();
        device
            .wait_for_replug(TransferFlags::empty(), &cancel)
            .unwrap();

        device.attach(&cancel).unwrap();
        assert_eq!(mock.count_requests(DFU_REQUEST_UPLOAD), 1);
        assert_eq!(mock.reset_count(), 2);
        assert!(!mock.is_connected());
    }
}
