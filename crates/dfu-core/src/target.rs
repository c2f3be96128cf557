//! One DFU alternate setting on a bound [`Device`]: block download with
//! status polling, block upload, DfuSe erase and address-pointer handling,
//! manifestation and verify.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::cancel::Cancellable;
use crate::device::{Device, TransferFlags};
use crate::error::DfuError;
use crate::events::{Action, DfuEvent, ProgressTracker};
use crate::firmware::{CipherKind, Element, Image};
use crate::protocol::*;
use crate::quirks::Quirks;
use crate::sector::{Sector, SectorCaps, find_sector};
use crate::transport::{TransportError, UsbTransport};

/// Borrowed view of one alternate setting.
pub struct Target<'a, T: UsbTransport> {
    device: &'a mut Device<T>,
    alt_setting: u8,
}

impl<'a, T: UsbTransport> Target<'a, T> {
    pub(crate) fn new(device: &'a mut Device<T>, alt_setting: u8) -> Self {
        Self {
            device,
            alt_setting,
        }
    }

    pub fn alt_setting(&self) -> u8 {
        self.alt_setting
    }

    pub fn alt_name(&self) -> Option<&str> {
        self.device
            .target_info(self.alt_setting)
            .ok()
            .and_then(|t| t.alt_name())
    }

    /// DfuSe memory layout; empty for plain DFU targets.
    pub fn sectors(&self) -> &[Sector] {
        self.device
            .target_info(self.alt_setting)
            .map(|t| t.sectors())
            .unwrap_or(&[])
    }

    pub fn cipher_kind(&self) -> CipherKind {
        self.device
            .target_info(self.alt_setting)
            .map(|t| t.cipher_kind())
            .unwrap_or_default()
    }

    // ========================================================================
    // Download
    // ========================================================================

    /// Write `image` to this alternate setting.
    #[instrument(skip_all, fields(alt = self.alt_setting, size = image.size()))]
    pub fn download(
        &mut self,
        image: &Image,
        flags: TransferFlags,
        cancel: &Cancellable,
    ) -> Result<(), DfuError> {
        cancel.check()?;
        self.device.ensure_dfu_mode(flags, cancel)?;
        let attributes = self.device.attributes;
        if !attributes.contains(DfuAttributes::CAN_DOWNLOAD) {
            return Err(DfuError::Unsupported("device cannot download".into()));
        }
        if let Some(alt) = image.alt_setting() {
            if alt != self.alt_setting && !flags.contains(TransferFlags::WILDCARD_ALT) {
                return Err(DfuError::InvalidImage(format!(
                    "image is for alt-setting {} but target is {}",
                    alt, self.alt_setting
                )));
            }
        }
        if image.elements().is_empty() {
            return Err(DfuError::InvalidImage("image has no elements".into()));
        }
        if flags.contains(TransferFlags::VERIFY) {
            if !attributes.contains(DfuAttributes::CAN_UPLOAD) {
                return Err(DfuError::Unsupported("verify needs a device that can upload".into()));
            }
            if !attributes.contains(DfuAttributes::MANIFEST_TOLERANT) {
                return Err(DfuError::Unsupported(
                    "verify needs a manifestation-tolerant device".into(),
                ));
            }
        }
        let dfuse = self.device.is_dfuse();
        if !dfuse && image.elements().len() > 1 {
            return Err(DfuError::Unsupported(
                "images with more than one element need a DfuSe device".into(),
            ));
        }

        self.device.select_alt_setting(self.alt_setting)?;
        info!(
            alt = self.alt_setting,
            elements = image.elements().len(),
            size = image.size(),
            "Downloading image"
        );

        let manifest_block = if dfuse {
            let sectors = self.sectors().to_vec();
            if sectors.is_empty() {
                return Err(DfuError::Unsupported(format!(
                    "alt-setting {} has no sector layout",
                    self.alt_setting
                )));
            }
            self.erase_for(image, &sectors, cancel)?;
            for element in image.elements() {
                self.download_dfuse_element(element, cancel)?;
            }
            DFUSE_DATA_BLOCK_OFFSET
        } else {
            self.download_element(&image.elements()[0], cancel)?
        };

        self.manifest(manifest_block, flags, cancel)?;
        self.device.done_transfer = true;

        if flags.contains(TransferFlags::VERIFY) {
            self.verify(image, cancel)?;
        }
        self.device.set_action(Action::Idle);
        self.device.finish(flags, cancel)
    }

    fn download_block(
        &mut self,
        block: u16,
        data: &[u8],
        cancel: &Cancellable,
    ) -> Result<(), DfuError> {
        cancel.check()?;
        debug!(block, len = data.len(), "DNLOAD");
        self.device
            .control_out("downloading", DFU_REQUEST_DNLOAD, block, data)?;
        self.device.wait_while_busy("downloading", cancel)?;
        Ok(())
    }

    /// Plain DFU: blocks numbered from 0. Returns the next block number.
    fn download_element(&mut self, element: &Element, cancel: &Cancellable) -> Result<u16, DfuError> {
        let observer = Arc::clone(&self.device.observer);
        let size = self.device.transfer_size as usize;
        let mut progress = ProgressTracker::new(Action::Write, element.len() as u64);
        self.device.set_action(Action::Write);

        let mut block: u16 = 0;
        for chunk in element.data().chunks(size) {
            self.download_block(block, chunk, cancel)?;
            block = block.wrapping_add(1);
            progress.advance(chunk.len() as u64, observer.as_ref());
        }
        Ok(block)
    }

    /// Erase every erasable sector an element touches, each one once.
    fn erase_for(
        &mut self,
        image: &Image,
        sectors: &[Sector],
        cancel: &Cancellable,
    ) -> Result<(), DfuError> {
        let mut to_erase: Vec<u32> = Vec::new();
        for element in image.elements() {
            let mut address = element.address() as u64;
            while address < element.end() {
                let sector = find_sector(sectors, address as u32).ok_or_else(|| {
                    DfuError::NotFound(format!("no memory sector at 0x{:08x}", address))
                })?;
                if !sector.has_cap(SectorCaps::WRITABLE) {
                    return Err(DfuError::Unsupported(format!(
                        "memory sector at 0x{:08x} is not writable",
                        sector.address()
                    )));
                }
                if sector.has_cap(SectorCaps::ERASABLE) && !to_erase.contains(&sector.address()) {
                    to_erase.push(sector.address());
                }
                address = sector.end();
            }
        }
        if to_erase.is_empty() {
            return Ok(());
        }

        let observer = Arc::clone(&self.device.observer);
        let mut progress = ProgressTracker::new(Action::Erase, to_erase.len() as u64);
        self.device.set_action(Action::Erase);
        for address in to_erase {
            debug!(address = %format!("0x{:08x}", address), "Erasing sector");
            self.device
                .dfuse_command(DFUSE_CMD_ERASE, Some(address), cancel)?;
            progress.advance(1, observer.as_ref());
        }
        Ok(())
    }

    /// DfuSe: point at the element, then blocks from 2. The pointer is moved
    /// again whenever the 16-bit block counter wraps.
    fn download_dfuse_element(&mut self, element: &Element, cancel: &Cancellable) -> Result<(), DfuError> {
        let observer = Arc::clone(&self.device.observer);
        let size = self.device.transfer_size as usize;
        let mut progress = ProgressTracker::new(Action::Write, element.len() as u64);
        self.device.set_action(Action::Write);

        self.device
            .dfuse_command(DFUSE_CMD_SET_ADDRESS_POINTER, Some(element.address()), cancel)?;
        let mut block = DFUSE_DATA_BLOCK_OFFSET;
        let mut offset: usize = 0;
        for chunk in element.data().chunks(size) {
            if block == 0 {
                let address = element.address().wrapping_add(offset as u32);
                self.device
                    .dfuse_command(DFUSE_CMD_SET_ADDRESS_POINTER, Some(address), cancel)?;
                block = DFUSE_DATA_BLOCK_OFFSET;
            }
            self.download_block(block, chunk, cancel)?;
            block = block.wrapping_add(1);
            offset += chunk.len();
            progress.advance(chunk.len() as u64, observer.as_ref());
        }
        Ok(())
    }

    /// Zero-length download, then wait for the device to finish.
    fn manifest(&mut self, block: u16, flags: TransferFlags, cancel: &Cancellable) -> Result<(), DfuError> {
        cancel.check()?;
        self.device.set_action(Action::Manifest);
        let attributes = self.device.attributes;
        let tolerant = attributes.contains(DfuAttributes::MANIFEST_TOLERANT);
        debug!(block, tolerant, "Starting manifestation");

        match self
            .device
            .control_out("manifesting", DFU_REQUEST_DNLOAD, block, &[])
        {
            Ok(_) => {}
            Err(e) if !tolerant && is_disconnect(&e) => {}
            Err(e) => return Err(e),
        }

        let mut polls: u32 = 0;
        loop {
            cancel.check()?;
            let status = match self.device.refresh() {
                Ok(status) => status,
                Err(e) if !tolerant && is_disconnect(&e) => break,
                Err(e) => return Err(e),
            };
            match status.state {
                DfuState::DfuIdle if tolerant => return Ok(()),
                DfuState::DfuManifestWaitReset if !tolerant => break,
                DfuState::DfuError => return Err(self.device.protocol_error("manifesting", &status)),
                _ => {
                    polls += 1;
                    if polls > self.device.config.max_busy_polls {
                        return Err(DfuError::Timeout(format!(
                            "manifestation did not finish after {} status polls",
                            polls
                        )));
                    }
                    self.device.sleep_poll_timeout(&status);
                }
            }
        }

        // not manifestation tolerant: the device resets into its new firmware
        if !attributes.contains(DfuAttributes::WILL_DETACH) && self.device.transport.is_connected() {
            self.device.reset()?;
        }
        self.device.observer.on_event(&DfuEvent::DeviceDisconnected);
        self.device.wait_for_replug(flags, cancel)
    }

    fn verify(&mut self, image: &Image, cancel: &Cancellable) -> Result<(), DfuError> {
        self.device.set_action(Action::Verify);
        let observer = Arc::clone(&self.device.observer);
        let mut progress = ProgressTracker::new(Action::Verify, image.size() as u64);

        if self.device.is_dfuse() {
            for element in image.elements() {
                let data = self.upload_dfuse_range(element.address(), element.len(), None, cancel)?;
                compare(element, &data)?;
                progress.advance(element.len() as u64, observer.as_ref());
            }
        } else {
            let data = self.upload_plain(cancel)?;
            compare(&image.elements()[0], &data)?;
            progress.advance(image.size() as u64, observer.as_ref());
        }
        info!(alt = self.alt_setting, "Verified");
        Ok(())
    }

    // ========================================================================
    // Upload
    // ========================================================================

    /// Read this alternate setting back from the device.
    #[instrument(skip_all, fields(alt = self.alt_setting))]
    pub fn upload(&mut self, flags: TransferFlags, cancel: &Cancellable) -> Result<Image, DfuError> {
        cancel.check()?;
        self.device.ensure_dfu_mode(flags, cancel)?;
        if !self.device.attributes.contains(DfuAttributes::CAN_UPLOAD) {
            return Err(DfuError::Unsupported("device cannot upload".into()));
        }
        self.device.select_alt_setting(self.alt_setting)?;
        self.device.set_action(Action::Read);

        let mut image = Image::with_alt_setting(self.alt_setting);
        image.set_name(self.alt_name().map(str::to_string));

        if self.device.is_dfuse() {
            let runs = readable_runs(self.sectors());
            if runs.is_empty() {
                return Err(DfuError::Unsupported(format!(
                    "alt-setting {} has no readable sectors",
                    self.alt_setting
                )));
            }
            let total: u64 = runs.iter().map(|(_, len)| *len as u64).sum();
            let mut progress = ProgressTracker::new(Action::Read, total);
            for (address, len) in runs {
                let data = self.upload_dfuse_range(address, len, Some(&mut progress), cancel)?;
                image.add_element(Element::new(address, data)?)?;
            }
        } else {
            let data = self.upload_plain(cancel)?;
            if data.is_empty() {
                return Err(DfuError::NotFound("device returned no data".into()));
            }
            image.add_element(Element::new(0, data)?)?;
        }

        self.device.done_transfer = true;
        info!(alt = self.alt_setting, size = image.size(), "Uploaded image");
        self.device.set_action(Action::Idle);
        self.device.finish(flags, cancel)?;
        Ok(image)
    }

    /// Plain DFU upload: blocks from 0 until a short block.
    fn upload_plain(&mut self, cancel: &Cancellable) -> Result<Vec<u8>, DfuError> {
        let size = self.device.transfer_size;
        let check_status = !self.device.quirks.contains(Quirks::NO_GET_STATUS_UPLOAD);
        let mut data = Vec::new();
        let mut block: u16 = 0;
        loop {
            cancel.check()?;
            let chunk = self
                .device
                .control_in("uploading", DFU_REQUEST_UPLOAD, block, size)?;
            debug!(block, len = chunk.len(), "UPLOAD");
            let short = chunk.len() < size as usize;
            data.extend_from_slice(&chunk);
            if check_status {
                let status = self.device.refresh()?;
                if status.state == DfuState::DfuError {
                    return Err(self.device.protocol_error("uploading", &status));
                }
                if !short && status.state != DfuState::DfuUploadIdle {
                    return Err(DfuError::Protocol {
                        state: status.state,
                        status: status.status,
                        message: format!(
                            "uploading: device left dfuUPLOAD-IDLE after block {}",
                            block
                        ),
                    });
                }
            }
            block = block.wrapping_add(1);
            if short {
                break;
            }
        }
        Ok(data)
    }

    /// DfuSe upload of `len` bytes at `address`.
    fn upload_dfuse_range(
        &mut self,
        address: u32,
        len: usize,
        mut progress: Option<&mut ProgressTracker>,
        cancel: &Cancellable,
    ) -> Result<Vec<u8>, DfuError> {
        let observer = Arc::clone(&self.device.observer);
        let size = self.device.transfer_size as usize;

        self.device
            .dfuse_command(DFUSE_CMD_SET_ADDRESS_POINTER, Some(address), cancel)?;
        self.device.abort()?;

        let mut data = Vec::with_capacity(len);
        let mut block = DFUSE_DATA_BLOCK_OFFSET;
        while data.len() < len {
            cancel.check()?;
            if block == 0 {
                let next = address.wrapping_add(data.len() as u32);
                self.device
                    .dfuse_command(DFUSE_CMD_SET_ADDRESS_POINTER, Some(next), cancel)?;
                self.device.abort()?;
                block = DFUSE_DATA_BLOCK_OFFSET;
            }
            let want = size.min(len - data.len());
            let chunk = self
                .device
                .control_in("uploading", DFU_REQUEST_UPLOAD, block, want as u16)?;
            if chunk.is_empty() {
                return Err(DfuError::Protocol {
                    state: self.device.state,
                    status: self.device.status,
                    message: format!(
                        "device returned no data at 0x{:08x}",
                        address.wrapping_add(data.len() as u32)
                    ),
                });
            }
            debug!(block, len = chunk.len(), "UPLOAD");
            if let Some(progress) = progress.as_deref_mut() {
                progress.advance(chunk.len() as u64, observer.as_ref());
            }
            data.extend_from_slice(&chunk);
            block = block.wrapping_add(1);
        }
        data.truncate(len);
        self.device.abort()?;
        Ok(data)
    }
}

fn is_disconnect(err: &DfuError) -> bool {
    matches!(
        err,
        DfuError::Transport {
            source: TransportError::Disconnected,
            ..
        }
    )
}

/// Contiguous readable address ranges, one per run of adjacent sectors.
fn readable_runs(sectors: &[Sector]) -> Vec<(u32, usize)> {
    let mut runs: Vec<(u32, usize)> = Vec::new();
    for sector in sectors.iter().filter(|s| s.has_cap(SectorCaps::READABLE)) {
        match runs.last_mut() {
            Some((start, len)) if *start as u64 + *len as u64 == sector.address() as u64 => {
                *len += sector.size() as usize;
            }
            _ => runs.push((sector.address(), sector.size() as usize)),
        }
    }
    runs
}

fn compare(element: &Element, actual: &[u8]) -> Result<(), DfuError> {
    let expected = element.data();
    if let Some(i) = expected.iter().zip(actual).position(|(a, b)| a != b) {
        return Err(DfuError::Integrity {
            address: element.address().wrapping_add(i as u32),
            detail: format!("expected 0x{:02x}, got 0x{:02x}", expected[i], actual[i]),
        });
    }
    if actual.len() < expected.len() {
        return Err(DfuError::Integrity {
            address: element.address().wrapping_add(actual.len() as u32),
            detail: format!(
                "read back {} bytes, expected {}",
                actual.len(),
                expected.len()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::RecordingSleeper;
    use crate::config::DfuConfig;
    use crate::device::DeviceMode;
    use crate::events::RecordingObserver;
    use crate::transport::MockTransport;

    const STM32_FLASH: &str = "@Internal Flash  /0x08000000/04*016Kg,01*064Kg";

    fn device(mock: &MockTransport) -> Device<MockTransport> {
        let mut device = Device::new(mock.clone(), DfuConfig::default())
            .unwrap()
            .with_sleeper(Arc::new(RecordingSleeper::new()));
        device.open().unwrap();
        device
    }

    fn raw_image(data: Vec<u8>) -> Image {
        let mut image = Image::new();
        image.add_element(Element::new(0, data).unwrap()).unwrap();
        image
    }

    #[test]
    fn test_readable_runs_merge_adjacent() {
        let sectors = [
            Sector::new(0x0, 0x100, SectorCaps::all()),
            Sector::new(0x100, 0x100, SectorCaps::READABLE),
            Sector::new(0x200, 0x100, SectorCaps::WRITABLE),
            Sector::new(0x400, 0x10, SectorCaps::READABLE),
        ];
        assert_eq!(readable_runs(&sectors), vec![(0x0, 0x200), (0x400, 0x10)]);
    }

    #[test]
    fn test_block_numbers_wrap_without_gaps() {
        let mock = MockTransport::new().with_transfer_size(1);
        let mut device = device(&mock);
        let data: Vec<u8> = (0..65_540u32).map(|i| i as u8).collect();
        device
            .target(0)
            .unwrap()
            .download(&raw_image(data), TransferFlags::empty(), &Cancellable::new())
            .unwrap();

        let blocks: Vec<u16> = mock.download_blocks().iter().map(|(b, _)| *b).collect();
        assert_eq!(blocks.len(), 65_541);
        assert_eq!(blocks[65_535], 0xFFFF);
        assert_eq!(blocks[65_536], 0);
        assert_eq!(blocks[65_539], 3);
        // zero-length manifestation block follows the last data block
        assert_eq!(blocks[65_540], 4);
    }

    #[test]
    fn test_alt_mismatch_needs_wildcard() {
        let mock = MockTransport::new();
        let mut device = device(&mock);
        let mut image = raw_image(vec![1; 4]);
        image.set_alt_setting(Some(3));
        let cancel = Cancellable::new();

        let mut target = device.target(0).unwrap();
        assert!(matches!(
            target.download(&image, TransferFlags::empty(), &cancel),
            Err(DfuError::InvalidImage(_))
        ));
        target
            .download(&image, TransferFlags::WILDCARD_ALT, &cancel)
            .unwrap();
    }

    #[test]
    fn test_multiple_elements_need_dfuse() {
        let mock = MockTransport::new();
        let mut device = device(&mock);
        let mut image = raw_image(vec![1; 4]);
        image.add_element(Element::new(0x100, vec![2; 4]).unwrap()).unwrap();
        assert!(matches!(
            device
                .target(0)
                .unwrap()
                .download(&image, TransferFlags::empty(), &Cancellable::new()),
            Err(DfuError::Unsupported(_))
        ));
    }

    #[test]
    fn test_verify_requires_manifest_tolerance() {
        let mock = MockTransport::new()
            .with_attributes(DfuAttributes::CAN_DOWNLOAD | DfuAttributes::CAN_UPLOAD);
        let mut device = device(&mock);
        let result = device.target(0).unwrap().download(
            &raw_image(vec![1; 4]),
            TransferFlags::VERIFY,
            &Cancellable::new(),
        );
        assert!(matches!(result, Err(DfuError::Unsupported(_))));
        assert!(mock.download_blocks().is_empty());
    }

    #[test]
    fn test_non_tolerant_manifest_resets_and_rebinds() {
        let mock = MockTransport::new().with_attributes(DfuAttributes::CAN_DOWNLOAD);
        let mut device = device(&mock);
        device
            .target(0)
            .unwrap()
            .download(&raw_image(vec![7; 100]), TransferFlags::empty(), &Cancellable::new())
            .unwrap();
        assert_eq!(mock.reset_count(), 1);
        assert_eq!(mock.flash(), vec![7; 100]);
        assert_eq!(device.state(), DfuState::DfuIdle);
    }

    #[test]
    fn test_non_tolerant_manifest_waits_for_reset_to_take_effect() {
        let mock = MockTransport::new()
            .with_attributes(DfuAttributes::CAN_DOWNLOAD)
            .with_reset_lag(1);
        let sleeper = RecordingSleeper::new();
        let mut device = Device::new(mock.clone(), DfuConfig::default())
            .unwrap()
            .with_sleeper(Arc::new(sleeper.clone()));
        device.open().unwrap();
        device
            .target(0)
            .unwrap()
            .download(&raw_image(vec![7; 100]), TransferFlags::empty(), &Cancellable::new())
            .unwrap();
        // first rebind found the device still in dfuMANIFEST-WAIT-RESET
        assert_eq!(sleeper.sleeps(), vec![REPLUG_POLL_INTERVAL]);
        assert_eq!(device.state(), DfuState::DfuIdle);
        assert_eq!(mock.flash(), vec![7; 100]);
    }

    #[test]
    fn test_detach_skips_runtime_device_still_listed() {
        let mock = MockTransport::new().with_runtime_mode().with_reset_lag(1);
        let sleeper = RecordingSleeper::new();
        let mut device = Device::new(mock.clone(), DfuConfig::default())
            .unwrap()
            .with_sleeper(Arc::new(sleeper.clone()));
        device.open().unwrap();

        device
            .target(0)
            .unwrap()
            .download(&raw_image(vec![3; 100]), TransferFlags::DETACH, &Cancellable::new())
            .unwrap();
        assert_eq!(device.mode(), DeviceMode::Dfu);
        assert_eq!(mock.count_requests(DFU_REQUEST_DETACH), 1);
        assert_eq!(sleeper.sleeps(), vec![REPLUG_POLL_INTERVAL]);
        assert_eq!(mock.flash(), vec![3; 100]);
    }

    #[test]
    fn test_detach_times_out_when_device_never_resets() {
        let mock = MockTransport::new().with_runtime_mode().with_reset_lag(100);
        let config = DfuConfig {
            replug_timeout_ms: 300,
            ..DfuConfig::default()
        };
        let mut device = Device::new(mock.clone(), config)
            .unwrap()
            .with_sleeper(Arc::new(RecordingSleeper::new()));
        device.open().unwrap();

        let result = device.target(0).unwrap().download(
            &raw_image(vec![3; 100]),
            TransferFlags::DETACH,
            &Cancellable::new(),
        );
        assert!(matches!(result, Err(DfuError::Timeout(_))));
        assert_eq!(device.mode(), DeviceMode::Runtime);
        assert_eq!(mock.count_requests(DFU_REQUEST_DNLOAD), 0);
    }

    #[test]
    fn test_busy_poll_limit() {
        let mock = MockTransport::new().with_busy(5, 0);
        let config = DfuConfig {
            max_busy_polls: 3,
            ..DfuConfig::default()
        };
        let mut device = Device::new(mock.clone(), config).unwrap();
        device.open().unwrap();
        let result = device.target(0).unwrap().download(
            &raw_image(vec![1; 4]),
            TransferFlags::empty(),
            &Cancellable::new(),
        );
        assert!(matches!(result, Err(DfuError::Timeout(_))));
    }

    #[test]
    fn test_dfuse_download_erases_and_points() {
        let mock = MockTransport::dfuse(&[STM32_FLASH]);
        let mut device = device(&mock);
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let mut image = Image::with_alt_setting(0);
        image
            .add_element(Element::new(0x0800_0000, data.clone()).unwrap())
            .unwrap();

        device
            .target(0)
            .unwrap()
            .download(&image, TransferFlags::VERIFY, &Cancellable::new())
            .unwrap();

        let mut erase0 = vec![DFUSE_CMD_ERASE];
        erase0.extend_from_slice(&0x0800_0000u32.to_le_bytes());
        let mut erase1 = vec![DFUSE_CMD_ERASE];
        erase1.extend_from_slice(&0x0800_4000u32.to_le_bytes());
        let mut set = vec![DFUSE_CMD_SET_ADDRESS_POINTER];
        set.extend_from_slice(&0x0800_0000u32.to_le_bytes());
        let commands = mock.dfuse_commands();
        assert_eq!(&commands[..3], &[erase0, erase1, set]);
        assert_eq!(mock.erased_pages(), vec![0x0800_0000, 0x0800_4000]);

        let blocks = mock.download_blocks();
        // 2048-byte transfers: ten data blocks from 2, then the manifest block
        assert_eq!(blocks.len(), 11);
        assert_eq!(blocks[0].0, 2);
        assert_eq!(blocks[9].0, 11);
        assert_eq!(blocks[9].1.len(), 20_000 - 9 * 2048);
        assert!(blocks[10].1.is_empty());
        assert_eq!(mock.memory(0x0800_0000, 20_000), data);
    }

    #[test]
    fn test_dfuse_rejects_unknown_and_read_only_sectors() {
        let mock = MockTransport::dfuse(&["@Flash /0x08000000/02*001Ka"]);
        let mut device = device(&mock);
        let cancel = Cancellable::new();

        let mut outside = Image::with_alt_setting(0);
        outside
            .add_element(Element::new(0x0900_0000, vec![1; 4]).unwrap())
            .unwrap();
        assert!(matches!(
            device.target(0).unwrap().download(&outside, TransferFlags::empty(), &cancel),
            Err(DfuError::NotFound(_))
        ));

        let mut read_only = Image::with_alt_setting(0);
        read_only
            .add_element(Element::new(0x0800_0000, vec![1; 4]).unwrap())
            .unwrap();
        assert!(matches!(
            device.target(0).unwrap().download(&read_only, TransferFlags::empty(), &cancel),
            Err(DfuError::Unsupported(_))
        ));
    }

    #[test]
    fn test_dfuse_upload_readable_runs() {
        let mock = MockTransport::dfuse(&["@Option Bytes  /0x1FFFC000/01*016 e"])
            .with_memory(0x1FFF_C000, &[0xAA, 0x55, 0x01]);
        let mut device = device(&mock);
        let image = device
            .target(0)
            .unwrap()
            .upload(TransferFlags::empty(), &Cancellable::new())
            .unwrap();
        let element = &image.elements()[0];
        assert_eq!(element.address(), 0x1FFF_C000);
        assert_eq!(element.len(), 16);
        assert_eq!(&element.data()[..4], &[0xAA, 0x55, 0x01, 0xFF]);
        assert_eq!(image.name(), Some("@Option Bytes  /0x1FFFC000/01*016 e"));
        // pointer set, abort before reading and after
        assert_eq!(mock.count_requests(DFU_REQUEST_ABORT), 2);
    }

    #[test]
    fn test_plain_upload_without_status_polls() {
        let flash: Vec<u8> = (0..150u8).collect();
        let mock = MockTransport::new().with_flash(&flash);
        let mut device = device(&mock);
        device.quirks |= Quirks::NO_GET_STATUS_UPLOAD;
        mock.clear_requests();

        let image = device
            .target(0)
            .unwrap()
            .upload(TransferFlags::empty(), &Cancellable::new())
            .unwrap();
        assert_eq!(image.elements()[0].data(), flash.as_slice());
        assert_eq!(image.alt_setting(), Some(0));
        assert_eq!(mock.count_requests(DFU_REQUEST_UPLOAD), 3);
        assert_eq!(mock.count_requests(DFU_REQUEST_GETSTATUS), 0);
    }

    #[test]
    fn test_plain_upload_requires_upload_idle_after_full_block() {
        let mock = MockTransport::new()
            .with_flash(&[0x42; 128])
            .upload_ends_idle();
        let mut device = device(&mock);
        let result = device
            .target(0)
            .unwrap()
            .upload(TransferFlags::empty(), &Cancellable::new());
        match result {
            Err(DfuError::Protocol { state, .. }) => assert_eq!(state, DfuState::DfuIdle),
            other => panic!("unexpected result: {:?}", other.map(|i| i.size())),
        }
        // stopped after the second block instead of asking for a third
        assert_eq!(mock.count_requests(DFU_REQUEST_UPLOAD), 2);
    }

    #[test]
    fn test_cancel_before_busy_status_poll() {
        let mock = MockTransport::new();
        let mut device = device(&mock);
        mock.clear_requests();
        let cancel = Cancellable::new();
        cancel.cancel();
        let result = device.wait_while_busy("downloading", &cancel);
        assert!(matches!(result, Err(DfuError::Cancelled)));
        assert_eq!(mock.count_requests(DFU_REQUEST_GETSTATUS), 0);
    }

    #[test]
    fn test_progress_events_are_monotonic() {
        let mock = MockTransport::new();
        let observer = Arc::new(RecordingObserver::new());
        let mut device = Device::new(mock.clone(), DfuConfig::default())
            .unwrap()
            .with_observer(observer.clone());
        device.open().unwrap();
        device
            .target(0)
            .unwrap()
            .download(&raw_image(vec![0; 1000]), TransferFlags::empty(), &Cancellable::new())
            .unwrap();
        let progress = observer.progress(Action::Write);
        assert_eq!(progress.last(), Some(&100));
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
    }
}
