//! Mock USB transport for testing.
//!
//! `MockTransport` simulates a DFU device in memory: runtime and DFU modes
//! with different PIDs, the DFU state machine, DfuSe address-pointer and
//! erase commands, manifestation, re-enumeration and error injection. Clones
//! share one device so a test can keep a handle for inspection after handing
//! the transport to a `Device`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::traits::{AltSetting, TransportError, UsbIdentity, UsbTransport};
use crate::protocol::*;

/// One captured control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRequest {
    pub request: u8,
    pub value: u16,
    /// Payload of an OUT request, empty for IN requests.
    pub data: Vec<u8>,
    /// Requested length of an IN request, zero for OUT requests.
    pub length: u16,
}

#[derive(Debug)]
struct MockState {
    vid: u16,
    runtime_pid: u16,
    dfu_pid: u16,
    release: u16,
    location: String,
    in_dfu_mode: bool,
    has_runtime: bool,
    connected: bool,
    protocol_override: Option<u8>,
    descriptor: FunctionalDescriptor,
    alt_names: Vec<String>,

    state: DfuState,
    status: DfuStatus,
    poll_timeout_ms: u32,
    busy_polls: u32,
    busy_remaining: u32,
    pending_error: Option<DfuStatus>,

    dfuse: bool,
    address_pointer: u32,
    memory: BTreeMap<u32, u8>,
    erased: Vec<u32>,
    flash: Vec<u8>,
    staged: Vec<u8>,
    upload_offset: usize,
    upload_ends_idle: bool,

    fail_block: Option<(u16, DfuStatus)>,
    stall_request: Option<u8>,
    reenumerate_to: Option<bool>,
    replug_delay: u32,
    reset_lag: u32,
    resets: u32,
    log: Vec<MockRequest>,
}

impl MockState {
    fn identity(&self) -> UsbIdentity {
        UsbIdentity {
            vid: self.vid,
            pid: if self.in_dfu_mode {
                self.dfu_pid
            } else {
                self.runtime_pid
            },
            release: self.release,
            location: self.location.clone(),
        }
    }

    fn status_bytes(&self) -> Vec<u8> {
        StatusResponse::new(self.status, self.state, self.poll_timeout_ms).to_bytes()
    }

    fn stall(&mut self) -> TransportError {
        if self.in_dfu_mode {
            self.state = DfuState::DfuError;
            self.status = DfuStatus::ErrStalledPacket;
        }
        TransportError::Stall
    }

    /// Disconnect now and come back in the given mode on the next `reopen`.
    fn schedule_reenumeration(&mut self, dfu_mode: bool) {
        self.connected = false;
        self.reenumerate_to = Some(dfu_mode);
    }

    fn commit_flash(&mut self) {
        if !self.staged.is_empty() {
            self.flash = std::mem::take(&mut self.staged);
        }
    }

    fn dfuse_block_address(&self, block: u16) -> u32 {
        let offset = (block.saturating_sub(DFUSE_DATA_BLOCK_OFFSET) as u32)
            .wrapping_mul(self.descriptor.transfer_size as u32);
        self.address_pointer.wrapping_add(offset)
    }

    fn dnload(&mut self, block: u16, data: &[u8]) -> Result<(), TransportError> {
        if !matches!(self.state, DfuState::DfuIdle | DfuState::DfuDnloadIdle) {
            return Err(self.stall());
        }
        if data.is_empty() {
            self.state = DfuState::DfuManifestSync;
            return Ok(());
        }
        if self.dfuse && block == 0 {
            self.dfuse_command(data);
        } else if self.dfuse {
            let address = self.dfuse_block_address(block);
            for (i, b) in data.iter().enumerate() {
                self.memory.insert(address.wrapping_add(i as u32), *b);
            }
        } else {
            self.staged.extend_from_slice(data);
        }
        if let Some((fail, status)) = self.fail_block {
            if fail == block && !(self.dfuse && block == 0) {
                self.pending_error = Some(status);
            }
        }
        self.state = DfuState::DfuDnloadSync;
        self.busy_remaining = self.busy_polls;
        Ok(())
    }

    fn dfuse_command(&mut self, data: &[u8]) {
        let address = |d: &[u8]| -> Option<u32> {
            d.get(1..5).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        };
        match (data[0], address(data)) {
            (DFUSE_CMD_SET_ADDRESS_POINTER, Some(addr)) => self.address_pointer = addr,
            (DFUSE_CMD_ERASE, Some(addr)) => self.erased.push(addr),
            (DFUSE_CMD_ERASE, None) => self.memory.clear(),
            (DFUSE_CMD_READ_UNPROTECT, _) => {}
            _ => self.pending_error = Some(DfuStatus::ErrTarget),
        }
    }

    fn get_status(&mut self) -> Vec<u8> {
        match self.state {
            DfuState::DfuDnloadSync | DfuState::DfuDnbusy => {
                if let Some(status) = self.pending_error.take() {
                    self.state = DfuState::DfuError;
                    self.status = status;
                } else if self.busy_remaining > 0 {
                    self.busy_remaining -= 1;
                    self.state = DfuState::DfuDnbusy;
                } else {
                    self.state = DfuState::DfuDnloadIdle;
                }
            }
            DfuState::DfuManifestSync => {
                self.commit_flash();
                if self
                    .descriptor
                    .attributes
                    .contains(DfuAttributes::MANIFEST_TOLERANT)
                {
                    self.state = DfuState::DfuIdle;
                } else {
                    self.state = DfuState::DfuManifestWaitReset;
                    let bytes = self.status_bytes();
                    if self
                        .descriptor
                        .attributes
                        .contains(DfuAttributes::WILL_DETACH)
                    {
                        let back_to_dfu = !self.has_runtime;
                        self.schedule_reenumeration(back_to_dfu);
                    }
                    return bytes;
                }
            }
            _ => {}
        }
        self.status_bytes()
    }

    fn upload(&mut self, block: u16, length: u16) -> Result<Vec<u8>, TransportError> {
        if !matches!(self.state, DfuState::DfuIdle | DfuState::DfuUploadIdle) {
            return Err(self.stall());
        }
        if self.dfuse {
            if block == 0 {
                self.state = DfuState::DfuUploadIdle;
                return Ok(vec![
                    DFUSE_CMD_GET_COMMAND,
                    DFUSE_CMD_SET_ADDRESS_POINTER,
                    DFUSE_CMD_ERASE,
                    DFUSE_CMD_READ_UNPROTECT,
                ]);
            }
            let address = self.dfuse_block_address(block);
            let data = (0..length as u32)
                .map(|i| {
                    self.memory
                        .get(&address.wrapping_add(i))
                        .copied()
                        .unwrap_or(0xFF)
                })
                .collect();
            self.state = DfuState::DfuUploadIdle;
            return Ok(data);
        }
        let start = self.upload_offset.min(self.flash.len());
        let end = (start + length as usize).min(self.flash.len());
        let chunk = self.flash[start..end].to_vec();
        if chunk.len() < length as usize || (self.upload_ends_idle && end == self.flash.len()) {
            self.state = DfuState::DfuIdle;
            self.upload_offset = 0;
        } else {
            self.state = DfuState::DfuUploadIdle;
            self.upload_offset = end;
        }
        Ok(chunk)
    }
}

/// Mock transport simulating a DFU device.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Plain DFU 1.1 device in DFU mode: can download and upload,
    /// manifestation tolerant, 64-byte transfers, one alt setting.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                vid: 0x1234,
                runtime_pid: 0x5678,
                dfu_pid: 0x5679,
                release: 0x0100,
                location: "1-2".into(),
                in_dfu_mode: true,
                has_runtime: false,
                connected: true,
                protocol_override: None,
                descriptor: FunctionalDescriptor {
                    attributes: DfuAttributes::CAN_DOWNLOAD
                        | DfuAttributes::CAN_UPLOAD
                        | DfuAttributes::MANIFEST_TOLERANT,
                    detach_timeout_ms: 1000,
                    transfer_size: DEFAULT_TRANSFER_SIZE,
                    dfu_version: DFU_VERSION_1_1,
                },
                alt_names: vec!["Flash".into()],
                state: DfuState::DfuIdle,
                status: DfuStatus::Ok,
                poll_timeout_ms: 0,
                busy_polls: 0,
                busy_remaining: 0,
                pending_error: None,
                dfuse: false,
                address_pointer: 0,
                memory: BTreeMap::new(),
                erased: Vec::new(),
                flash: Vec::new(),
                staged: Vec::new(),
                upload_offset: 0,
                upload_ends_idle: false,
                fail_block: None,
                stall_request: None,
                reenumerate_to: None,
                replug_delay: 0,
                reset_lag: 0,
                resets: 0,
                log: Vec::new(),
            })),
        }
    }

    /// DfuSe device (bcdDFU 0x011A) with one alt setting per sector descriptor.
    pub fn dfuse(alt_names: &[&str]) -> Self {
        let mock = Self::new()
            .with_dfu_version(DFU_VERSION_DFUSE)
            .with_alt_names(alt_names)
            .with_transfer_size(2048);
        mock.lock().dfuse = true;
        mock
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ========================================================================
    // Builder
    // ========================================================================

    pub fn with_ids(self, vid: u16, runtime_pid: u16, dfu_pid: u16) -> Self {
        {
            let mut s = self.lock();
            s.vid = vid;
            s.runtime_pid = runtime_pid;
            s.dfu_pid = dfu_pid;
        }
        self
    }

    pub fn with_release(self, release: u16) -> Self {
        self.lock().release = release;
        self
    }

    /// Start in application mode with a DFU runtime interface.
    pub fn with_runtime_mode(self) -> Self {
        {
            let mut s = self.lock();
            s.in_dfu_mode = false;
            s.has_runtime = true;
            s.state = DfuState::AppIdle;
        }
        self
    }

    pub fn with_attributes(self, attributes: DfuAttributes) -> Self {
        self.lock().descriptor.attributes = attributes;
        self
    }

    pub fn with_transfer_size(self, transfer_size: u16) -> Self {
        self.lock().descriptor.transfer_size = transfer_size;
        self
    }

    pub fn with_dfu_version(self, version: u16) -> Self {
        self.lock().descriptor.dfu_version = version;
        self
    }

    pub fn with_alt_names(self, names: &[&str]) -> Self {
        self.lock().alt_names = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Report this bInterfaceProtocol instead of 1 (runtime) / 2 (DFU).
    pub fn with_protocol(self, protocol: u8) -> Self {
        self.lock().protocol_override = Some(protocol);
        self
    }

    /// Each download block keeps the device in dfuDNBUSY for `polls`
    /// GETSTATUS requests, each reporting `poll_timeout_ms`.
    pub fn with_busy(self, polls: u32, poll_timeout_ms: u32) -> Self {
        {
            let mut s = self.lock();
            s.busy_polls = polls;
            s.poll_timeout_ms = poll_timeout_ms;
        }
        self
    }

    pub fn with_flash(self, data: &[u8]) -> Self {
        self.lock().flash = data.to_vec();
        self
    }

    pub fn with_memory(self, address: u32, data: &[u8]) -> Self {
        {
            let mut s = self.lock();
            for (i, b) in data.iter().enumerate() {
                s.memory.insert(address + i as u32, *b);
            }
        }
        self
    }

    /// Number of `reopen` calls that find nothing after a re-enumeration.
    pub fn with_replug_delay(self, attempts: u32) -> Self {
        self.lock().replug_delay = attempts;
        self
    }

    /// Number of `reopen` calls after a port reset that still find the
    /// device as it was before the reset.
    pub fn with_reset_lag(self, reopens: u32) -> Self {
        self.lock().reset_lag = reopens;
        self
    }

    pub fn with_state(self, state: DfuState, status: DfuStatus) -> Self {
        {
            let mut s = self.lock();
            s.state = state;
            s.status = status;
        }
        self
    }

    /// Report `status` in dfuERROR after download block `block`.
    pub fn fail_block(self, block: u16, status: DfuStatus) -> Self {
        self.lock().fail_block = Some((block, status));
        self
    }

    /// Drop back to dfuIDLE after the last upload block even when it is
    /// full-size.
    pub fn upload_ends_idle(self) -> Self {
        self.lock().upload_ends_idle = true;
        self
    }

    /// Stall every request with this bRequest.
    pub fn stall_request(self, request: u8) -> Self {
        self.lock().stall_request = Some(request);
        self
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn requests(&self) -> Vec<MockRequest> {
        self.lock().log.clone()
    }

    pub fn clear_requests(&self) {
        self.lock().log.clear();
    }

    pub fn count_requests(&self, request: u8) -> usize {
        self.lock().log.iter().filter(|r| r.request == request).count()
    }

    /// DNLOAD requests carrying data, excluding DfuSe commands.
    pub fn download_blocks(&self) -> Vec<(u16, Vec<u8>)> {
        let s = self.lock();
        s.log
            .iter()
            .filter(|r| r.request == DFU_REQUEST_DNLOAD && !(s.dfuse && r.value == 0))
            .map(|r| (r.value, r.data.clone()))
            .collect()
    }

    /// DfuSe command payloads in the order they were sent.
    pub fn dfuse_commands(&self) -> Vec<Vec<u8>> {
        self.lock()
            .log
            .iter()
            .filter(|r| r.request == DFU_REQUEST_DNLOAD && r.value == 0 && !r.data.is_empty())
            .map(|r| r.data.clone())
            .collect()
    }

    pub fn flash(&self) -> Vec<u8> {
        self.lock().flash.clone()
    }

    pub fn memory(&self, address: u32, len: usize) -> Vec<u8> {
        let s = self.lock();
        (0..len as u32)
            .map(|i| s.memory.get(&(address + i)).copied().unwrap_or(0xFF))
            .collect()
    }

    pub fn erased_pages(&self) -> Vec<u32> {
        self.lock().erased.clone()
    }

    pub fn dfu_state(&self) -> DfuState {
        self.lock().state
    }

    pub fn in_dfu_mode(&self) -> bool {
        self.lock().in_dfu_mode
    }

    pub fn reset_count(&self) -> u32 {
        self.lock().resets
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.lock().connected = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        self.lock().connected = true;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn identity(&self) -> UsbIdentity {
        self.lock().identity()
    }

    fn alt_settings(&self) -> Result<Vec<AltSetting>, TransportError> {
        let s = self.lock();
        if !s.connected {
            return Err(TransportError::Disconnected);
        }
        let functional = Some(s.descriptor);
        if !s.in_dfu_mode {
            return Ok(vec![AltSetting {
                interface_number: 0,
                alt_setting: 0,
                class: USB_CLASS_APPLICATION_SPECIFIC,
                subclass: USB_SUBCLASS_DFU,
                protocol: s.protocol_override.unwrap_or(DFU_PROTOCOL_RUNTIME),
                name: None,
                functional,
            }]);
        }
        Ok(s.alt_names
            .iter()
            .enumerate()
            .map(|(i, name)| AltSetting {
                interface_number: 0,
                alt_setting: i as u8,
                class: USB_CLASS_APPLICATION_SPECIFIC,
                subclass: USB_SUBCLASS_DFU,
                protocol: s.protocol_override.unwrap_or(DFU_PROTOCOL_DFU),
                name: Some(name.clone()),
                functional,
            })
            .collect())
    }

    fn claim_interface(&mut self, _interface: u8) -> Result<(), TransportError> {
        if !self.lock().connected {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }

    fn set_alt_setting(&mut self, _interface: u8, alt_setting: u8) -> Result<(), TransportError> {
        let s = self.lock();
        if !s.connected {
            return Err(TransportError::Disconnected);
        }
        if s.in_dfu_mode && alt_setting as usize >= s.alt_names.len() {
            return Err(TransportError::TransferFailed(format!(
                "no alt setting {}",
                alt_setting
            )));
        }
        Ok(())
    }

    fn control_out(
        &self,
        request: u8,
        value: u16,
        _index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut s = self.lock();
        if !s.connected {
            return Err(TransportError::Disconnected);
        }
        s.log.push(MockRequest {
            request,
            value,
            data: data.to_vec(),
            length: 0,
        });
        if s.stall_request == Some(request) {
            return Err(s.stall());
        }
        if !s.in_dfu_mode {
            if request != DFU_REQUEST_DETACH {
                return Err(TransportError::Stall);
            }
            s.state = DfuState::AppDetach;
            if s
                .descriptor
                .attributes
                .contains(DfuAttributes::WILL_DETACH)
            {
                s.schedule_reenumeration(true);
            }
            return Ok(data.len());
        }
        match request {
            DFU_REQUEST_DNLOAD => s.dnload(value, data)?,
            DFU_REQUEST_CLRSTATUS => {
                s.state = DfuState::DfuIdle;
                s.status = DfuStatus::Ok;
            }
            DFU_REQUEST_ABORT => {
                s.state = DfuState::DfuIdle;
                s.upload_offset = 0;
            }
            _ => return Err(s.stall()),
        }
        Ok(data.len())
    }

    fn control_in(
        &self,
        request: u8,
        value: u16,
        _index: u16,
        length: u16,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut s = self.lock();
        if !s.connected {
            return Err(TransportError::Disconnected);
        }
        s.log.push(MockRequest {
            request,
            value,
            data: Vec::new(),
            length,
        });
        if s.stall_request == Some(request) {
            return Err(s.stall());
        }
        match request {
            DFU_REQUEST_GETSTATUS => Ok(s.get_status()),
            DFU_REQUEST_GETSTATE => Ok(vec![u8::from(s.state)]),
            DFU_REQUEST_UPLOAD if s.in_dfu_mode => s.upload(value, length),
            _ => Err(s.stall()),
        }
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        let mut s = self.lock();
        s.resets += 1;
        let to_dfu = if s.in_dfu_mode {
            !s.has_runtime
        } else {
            s.state == DfuState::AppDetach
        };
        s.schedule_reenumeration(to_dfu);
        if s.reset_lag > 0 {
            s.connected = true;
        }
        Ok(())
    }

    fn reopen(&mut self, matches: &dyn Fn(&UsbIdentity) -> bool) -> Result<bool, TransportError> {
        let mut s = self.lock();
        if s.reenumerate_to.is_some() && s.reset_lag > 0 {
            s.reset_lag -= 1;
            return Ok(s.connected && matches(&s.identity()));
        }
        if let Some(dfu_mode) = s.reenumerate_to {
            if s.replug_delay > 0 {
                s.replug_delay -= 1;
                return Ok(false);
            }
            s.reenumerate_to = None;
            s.in_dfu_mode = dfu_mode;
            s.connected = true;
            s.state = if dfu_mode {
                DfuState::DfuIdle
            } else {
                DfuState::AppIdle
            };
            s.status = DfuStatus::Ok;
            s.upload_offset = 0;
        }
        Ok(s.connected && matches(&s.identity()))
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }
}
