//! End-to-end transfers against the in-memory DFU device.

use std::sync::Arc;
use std::time::Duration;

use dfu_core::protocol::{DFU_REQUEST_CLRSTATUS, DFU_REQUEST_DETACH};
use dfu_core::{
    Action, Cancellable, DeviceMode, Device, DfuAttributes, DfuConfig, DfuError, DfuEvent,
    DfuObserver, DfuState, DfuStatus, Element, ErrorKind, Firmware, FirmwareError,
    FirmwareFormat, Image, MockTransport, ParseFlags, QuirkRule, RecordingObserver,
    RecordingSleeper, TransferFlags,
};

const STM32_FLASH: &str = "@Internal Flash  /0x08000000/04*016Kg,01*064Kg";
const STM32_OPTION_BYTES: &str = "@Option Bytes  /0x1FFFC000/01*016 e";

fn open(
    mock: &MockTransport,
    config: DfuConfig,
) -> (Device<MockTransport>, RecordingSleeper, Arc<RecordingObserver>) {
    let sleeper = RecordingSleeper::new();
    let observer = Arc::new(RecordingObserver::new());
    let mut device = Device::new(mock.clone(), config)
        .unwrap()
        .with_sleeper(Arc::new(sleeper.clone()))
        .with_observer(observer.clone());
    device.open().unwrap();
    (device, sleeper, observer)
}

fn counting(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

#[test]
fn raw_download_with_verify() {
    let data = counting(300);
    let firmware = Firmware::parse(&data, ParseFlags::empty()).unwrap();
    assert_eq!(firmware.format(), FirmwareFormat::Raw);

    let mock = MockTransport::new();
    let (mut device, _, observer) = open(&mock, DfuConfig::default());
    device
        .download(&firmware, TransferFlags::VERIFY, &Cancellable::new())
        .unwrap();

    let lengths: Vec<usize> = mock.download_blocks().iter().map(|(_, d)| d.len()).collect();
    assert_eq!(lengths, vec![64, 64, 64, 64, 44, 0]);
    let blocks: Vec<u16> = mock.download_blocks().iter().map(|(b, _)| *b).collect();
    assert_eq!(blocks, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(mock.flash(), data);
    assert_eq!(observer.progress(Action::Write), vec![21, 42, 64, 85, 100]);
    assert_eq!(observer.progress(Action::Verify), vec![100]);
    assert_eq!(device.state(), DfuState::DfuIdle);
}

#[test]
fn upload_then_download_roundtrip_through_dfu_file() {
    let data = counting(1000);
    let mock = MockTransport::new().with_flash(&data);
    let (mut device, _, _) = open(&mock, DfuConfig::default());

    let firmware = device
        .upload(TransferFlags::empty(), &Cancellable::new())
        .unwrap();
    assert_eq!(firmware.format(), FirmwareFormat::Dfu);
    assert_eq!(firmware.vid(), 0x1234);
    assert_eq!(firmware.pid(), 0x5679);
    assert_eq!(firmware.release(), 0xFFFF);

    let bytes = firmware.write().unwrap();
    assert_eq!(bytes.len(), 1000 + 16);
    let parsed = Firmware::parse(&bytes, ParseFlags::empty()).unwrap();
    assert_eq!(parsed.images()[0].elements()[0].data(), data.as_slice());

    let other = MockTransport::new();
    let (mut device, _, _) = open(&other, DfuConfig::default());
    device
        .download(&parsed, TransferFlags::empty(), &Cancellable::new())
        .unwrap();
    assert_eq!(other.flash(), data);
}

#[test]
fn crc_flip_rejected_unless_skipped() {
    let mut firmware = Firmware::parse(&counting(64), ParseFlags::empty()).unwrap();
    firmware.set_format(FirmwareFormat::Dfu);
    let mut bytes = firmware.write().unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;

    let err = Firmware::parse(&bytes, ParseFlags::empty()).unwrap_err();
    assert!(matches!(err, FirmwareError::CrcMismatch { .. }));
    assert_eq!(err.kind(), ErrorKind::Malformed);

    let parsed = Firmware::parse(&bytes, ParseFlags::NO_CRC_TEST).unwrap();
    assert_eq!(parsed.size(), 64);
}

#[test]
fn vendor_id_must_match_unless_wildcard() {
    let mock = MockTransport::new()
        .with_runtime_mode()
        .with_attributes(
            DfuAttributes::CAN_DOWNLOAD
                | DfuAttributes::MANIFEST_TOLERANT
                | DfuAttributes::WILL_DETACH,
        );
    let (mut device, _, _) = open(&mock, DfuConfig::default());
    let mut firmware = Firmware::parse(&counting(16), ParseFlags::empty()).unwrap();
    firmware.set_vid(0xAAAA);

    let err = device
        .download(&firmware, TransferFlags::DETACH, &Cancellable::new())
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid image: vendor ID incorrect, expected 0x1234 got 0xaaaa"
    );
    // rejected before the device was detached
    assert_eq!(mock.count_requests(DFU_REQUEST_DETACH), 0);

    device
        .download(
            &firmware,
            TransferFlags::DETACH | TransferFlags::WILDCARD_VID,
            &Cancellable::new(),
        )
        .unwrap();
    assert_eq!(mock.flash(), counting(16));
}

#[test]
fn detach_and_download_from_runtime_mode() {
    let mock = MockTransport::new()
        .with_runtime_mode()
        .with_replug_delay(1);
    let (mut device, sleeper, observer) = open(&mock, DfuConfig::default());
    assert_eq!(device.mode(), DeviceMode::Runtime);
    let firmware = Firmware::parse(&counting(100), ParseFlags::empty()).unwrap();

    let err = device
        .download(&firmware, TransferFlags::empty(), &Cancellable::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    device
        .download(&firmware, TransferFlags::DETACH, &Cancellable::new())
        .unwrap();
    assert_eq!(device.mode(), DeviceMode::Dfu);
    assert!(mock.in_dfu_mode());
    assert_eq!(mock.count_requests(DFU_REQUEST_DETACH), 1);
    assert_eq!(mock.flash(), counting(100));
    // one failed enumeration attempt before the device came back
    assert_eq!(sleeper.sleeps(), vec![Duration::from_millis(100)]);

    let events = observer.events();
    assert!(events.contains(&DfuEvent::DeviceDisconnected));
    assert!(events.contains(&DfuEvent::DeviceConnected {
        vid: 0x1234,
        pid: 0x5679
    }));
}

#[test]
fn config_quirk_suppresses_poll_waits() {
    let mock = MockTransport::new().with_busy(3, 50);
    let firmware = Firmware::parse(&counting(64), ParseFlags::empty()).unwrap();

    let (mut device, sleeper, _) = open(&mock, DfuConfig::default());
    device
        .download(&firmware, TransferFlags::empty(), &Cancellable::new())
        .unwrap();
    assert_eq!(sleeper.sleeps(), vec![Duration::from_millis(50); 3]);

    let config = DfuConfig {
        extra_quirks: vec![QuirkRule {
            vid: 0x1234,
            pid: 0x5679,
            release: None,
            quirks: "ignore-polltimeout".into(),
        }],
        ..DfuConfig::default()
    };
    let (mut device, sleeper, _) = open(&mock, config);
    assert_eq!(device.quirks_string(), "ignore-polltimeout");
    device
        .download(&firmware, TransferFlags::empty(), &Cancellable::new())
        .unwrap();
    assert!(sleeper.sleeps().is_empty());
}

#[test]
fn dfuse_file_with_two_targets() {
    let mut flash = Image::with_alt_setting(0);
    flash.set_name(Some("Internal Flash".into()));
    flash
        .add_element(Element::new(0x0800_0000, counting(5000)).unwrap())
        .unwrap();
    flash
        .add_element(Element::new(0x0801_0000, vec![0x5A; 300]).unwrap())
        .unwrap();
    let mut option_bytes = Image::with_alt_setting(1);
    option_bytes
        .add_element(Element::new(0x1FFF_C000, vec![0xAA, 0x55, 0xAA, 0x55]).unwrap())
        .unwrap();

    let mut firmware = Firmware::new();
    firmware.set_format(FirmwareFormat::DfuSe);
    firmware.add_image(flash);
    firmware.add_image(option_bytes);
    let bytes = firmware.write().unwrap();
    let parsed = Firmware::parse(&bytes, ParseFlags::empty()).unwrap();
    assert_eq!(parsed.format(), FirmwareFormat::DfuSe);
    assert_eq!(parsed.images().len(), 2);
    assert_eq!(parsed.image(0).and_then(|i| i.name()), Some("Internal Flash"));

    let mock = MockTransport::dfuse(&[STM32_FLASH, STM32_OPTION_BYTES]);
    let (mut device, _, _) = open(&mock, DfuConfig::default());
    device
        .download(&parsed, TransferFlags::VERIFY, &Cancellable::new())
        .unwrap();

    assert_eq!(mock.memory(0x0800_0000, 5000), counting(5000));
    assert_eq!(mock.memory(0x0801_0000, 300), vec![0x5A; 300]);
    assert_eq!(mock.memory(0x1FFF_C000, 4), vec![0xAA, 0x55, 0xAA, 0x55]);
    // first 16K sector and the 64K sector; option bytes are not erasable
    assert_eq!(mock.erased_pages(), vec![0x0800_0000, 0x0801_0000]);
}

#[test]
fn intel_hex_download_to_dfuse() {
    let hex = ":020000040800F2\n\
               :10000000000102030405060708090A0B0C0D0E0F78\n\
               :0400100010111213A6\n\
               :00000001FF\n";
    let firmware = Firmware::parse(hex.as_bytes(), ParseFlags::empty()).unwrap();
    assert_eq!(firmware.format(), FirmwareFormat::IntelHex);

    let mock = MockTransport::dfuse(&[STM32_FLASH]);
    let (mut device, _, _) = open(&mock, DfuConfig::default());
    device
        .download(&firmware, TransferFlags::empty(), &Cancellable::new())
        .unwrap();
    let expected: Vec<u8> = (0..20u8).collect();
    assert_eq!(mock.memory(0x0800_0000, 20), expected);
    assert_eq!(mock.erased_pages(), vec![0x0800_0000]);
}

#[test]
fn dfuse_upload_produces_dfuse_container() {
    let mock = MockTransport::dfuse(&[STM32_OPTION_BYTES]).with_memory(0x1FFF_C000, &[1, 2, 3]);
    let (mut device, _, observer) = open(&mock, DfuConfig::default());
    let firmware = device
        .upload(TransferFlags::empty(), &Cancellable::new())
        .unwrap();
    assert_eq!(firmware.format(), FirmwareFormat::DfuSe);
    let element = &firmware.images()[0].elements()[0];
    assert_eq!(element.address(), 0x1FFF_C000);
    assert_eq!(&element.data()[..4], &[1, 2, 3, 0xFF]);
    assert_eq!(observer.progress(Action::Read).last(), Some(&100));

    let bytes = firmware.write().unwrap();
    assert!(bytes.starts_with(b"DfuSe"));
}

#[test]
fn write_error_reports_status_and_clears_it() {
    let mock = MockTransport::new().fail_block(2, DfuStatus::ErrWrite);
    let (mut device, _, _) = open(&mock, DfuConfig::default());
    let firmware = Firmware::parse(&counting(300), ParseFlags::empty()).unwrap();

    let err = device
        .download(&firmware, TransferFlags::empty(), &Cancellable::new())
        .unwrap_err();
    match &err {
        DfuError::Protocol { state, status, .. } => {
            assert_eq!(*state, DfuState::DfuError);
            assert_eq!(*status, DfuStatus::ErrWrite);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(mock.count_requests(DFU_REQUEST_CLRSTATUS), 1);
    assert_eq!(mock.dfu_state(), DfuState::DfuIdle);
    // blocks after the failing one were never sent
    assert_eq!(mock.download_blocks().len(), 3);
}

struct CancelAt {
    cancel: Cancellable,
    percentage: u8,
}

impl DfuObserver for CancelAt {
    fn on_event(&self, event: &DfuEvent) {
        if let DfuEvent::Progress { percentage, .. } = event {
            if *percentage >= self.percentage {
                self.cancel.cancel();
            }
        }
    }
}

#[test]
fn cancellation_stops_between_blocks() {
    let mock = MockTransport::new();
    let cancel = Cancellable::new();
    let mut device = Device::new(mock.clone(), DfuConfig::default())
        .unwrap()
        .with_sleeper(Arc::new(RecordingSleeper::new()))
        .with_observer(Arc::new(CancelAt {
            cancel: cancel.clone(),
            percentage: 50,
        }));
    device.open().unwrap();
    let firmware = Firmware::parse(&counting(640), ParseFlags::empty()).unwrap();

    let err = device
        .download(&firmware, TransferFlags::empty(), &cancel)
        .unwrap_err();
    assert!(matches!(err, DfuError::Cancelled));
    // 50% is reached after the fifth of ten blocks
    assert_eq!(mock.download_blocks().len(), 5);
    assert!(mock.flash().is_empty());
}

#[test]
fn attach_after_download_returns_to_runtime() {
    let mock = MockTransport::new()
        .with_runtime_mode()
        .with_attributes(
            DfuAttributes::CAN_DOWNLOAD
                | DfuAttributes::CAN_UPLOAD
                | DfuAttributes::MANIFEST_TOLERANT,
        );
    let (mut device, _, _) = open(&mock, DfuConfig::default());
    let firmware = Firmware::parse(&counting(64), ParseFlags::empty()).unwrap();
    device
        .download(
            &firmware,
            TransferFlags::DETACH | TransferFlags::ATTACH | TransferFlags::WAIT_RUNTIME,
            &Cancellable::new(),
        )
        .unwrap();
    assert!(!mock.in_dfu_mode());
    assert_eq!(device.mode(), DeviceMode::Runtime);
    assert_eq!(mock.flash(), counting(64));
}
