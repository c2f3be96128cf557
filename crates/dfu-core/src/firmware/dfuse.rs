//! DfuSe multi-target container (UM0391).
//!
//! ```text
//! prefix   "DfuSe" | bVersion=0x01 | DFUImageSize u32 | bTargets u8
//! target   "Target" | bAlternateSetting u8 | bTargetNamed u32 |
//!          szTargetName[255] | dwTargetSize u32 | dwNbElements u32
//! element  dwElementAddress u32 | dwElementSize u32 | data
//! suffix   DFU 1.0 suffix with bcdDFU = 0x011A
//! ```

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;

use super::{Element, Firmware, FirmwareError, FirmwareFormat, Image, ParseFlags, dfu};
use crate::protocol::DFU_VERSION_DFUSE;

pub const PREFIX_SIGNATURE: &[u8; 5] = b"DfuSe";
pub const PREFIX_SIZE: usize = 11;
pub const FORMAT_VERSION: u8 = 0x01;
pub const TARGET_SIGNATURE: &[u8; 6] = b"Target";
pub const TARGET_PREFIX_SIZE: usize = 274;
pub const TARGET_NAME_SIZE: usize = 255;
pub const ELEMENT_HEADER_SIZE: usize = 8;

fn truncated(offset: u64, what: &str) -> FirmwareError {
    FirmwareError::malformed(offset as usize, format!("truncated {}", what))
}

/// Parse a complete DfuSe file including its DFU suffix.
pub fn parse(data: &[u8], flags: ParseFlags) -> Result<Firmware, FirmwareError> {
    let suffix = dfu::parse_suffix(data, flags)?;
    let mut firmware = parse_body(&data[..data.len() - suffix.length])?;
    firmware.set_format(FirmwareFormat::DfuSe);
    dfu::apply_suffix(&mut firmware, suffix);
    Ok(firmware)
}

/// Parse the container without its suffix.
pub(crate) fn parse_body(data: &[u8]) -> Result<Firmware, FirmwareError> {
    if data.len() < PREFIX_SIZE || !data.starts_with(PREFIX_SIGNATURE) {
        return Err(FirmwareError::malformed(0, "no DfuSe prefix"));
    }
    let mut cursor = Cursor::new(data);
    cursor.set_position(PREFIX_SIGNATURE.len() as u64);
    let version = cursor.read_u8()?;
    if version != FORMAT_VERSION {
        return Err(FirmwareError::Unsupported(format!(
            "DfuSe format version 0x{:02x}",
            version
        )));
    }
    let image_size = cursor.read_u32::<LittleEndian>()? as usize;
    if image_size != data.len() {
        return Err(FirmwareError::malformed(
            6,
            format!(
                "DfuSe image size 0x{:x} does not match payload size 0x{:x}",
                image_size,
                data.len()
            ),
        ));
    }
    let targets = cursor.read_u8()?;

    let mut firmware = Firmware::new();
    for _ in 0..targets {
        let image = parse_target(&mut cursor)?;
        if firmware.images().iter().any(|i| i.alt_setting() == image.alt_setting()) {
            return Err(FirmwareError::malformed(
                cursor.position() as usize,
                format!("duplicate target for alt {:?}", image.alt_setting()),
            ));
        }
        firmware.add_image(image);
    }
    if cursor.position() as usize != data.len() {
        return Err(FirmwareError::malformed(
            cursor.position() as usize,
            "trailing data after last target",
        ));
    }
    debug!(targets, size = firmware.size(), "Parsed DfuSe container");
    Ok(firmware)
}

fn parse_target(cursor: &mut Cursor<&[u8]>) -> Result<Image, FirmwareError> {
    let start = cursor.position();
    let remaining = cursor.get_ref().len() as u64 - start;
    if remaining < TARGET_PREFIX_SIZE as u64 {
        return Err(truncated(start, "target prefix"));
    }
    let mut signature = [0u8; 6];
    cursor.read_exact(&mut signature)?;
    if &signature != TARGET_SIGNATURE {
        return Err(FirmwareError::malformed(start as usize, "no target signature"));
    }
    let alt_setting = cursor.read_u8()?;
    let named = cursor.read_u32::<LittleEndian>()? != 0;
    let mut name = [0u8; TARGET_NAME_SIZE];
    cursor.read_exact(&mut name)?;
    let target_size = cursor.read_u32::<LittleEndian>()? as u64;
    let elements = cursor.read_u32::<LittleEndian>()?;

    let mut image = Image::with_alt_setting(alt_setting);
    if named {
        let end = name.iter().position(|b| *b == 0).unwrap_or(name.len());
        image.set_name(Some(String::from_utf8_lossy(&name[..end]).into_owned()));
    }

    let body_start = cursor.position();
    for _ in 0..elements {
        let offset = cursor.position();
        let address = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| truncated(offset, "element header"))?;
        let size = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| truncated(offset, "element header"))? as u64;
        if size > cursor.get_ref().len() as u64 - cursor.position() {
            return Err(truncated(offset, "element data"));
        }
        let mut data = vec![0u8; size as usize];
        cursor
            .read_exact(&mut data)
            .map_err(|_| truncated(offset, "element data"))?;
        image
            .add_element(Element::new(address, data)?)
            .map_err(|e| FirmwareError::malformed(offset as usize, e.to_string()))?;
    }
    let consumed = cursor.position() - body_start;
    if consumed != target_size {
        return Err(FirmwareError::malformed(
            start as usize + 266,
            format!(
                "target size 0x{:x} does not match elements size 0x{:x}",
                target_size, consumed
            ),
        ));
    }
    Ok(image)
}

pub fn write(firmware: &Firmware) -> Result<Vec<u8>, FirmwareError> {
    let targets = u8::try_from(firmware.images().len())
        .map_err(|_| FirmwareError::Unsupported("too many DfuSe targets".into()))?;

    let mut buf = Vec::new();
    buf.extend_from_slice(PREFIX_SIGNATURE);
    buf.push(FORMAT_VERSION);
    // image size, patched below
    buf.write_u32::<LittleEndian>(0)?;
    buf.push(targets);

    for image in firmware.images() {
        let target_size: usize = image
            .elements()
            .iter()
            .map(|e| ELEMENT_HEADER_SIZE + e.len())
            .sum();
        buf.extend_from_slice(TARGET_SIGNATURE);
        buf.push(image.alt_setting().unwrap_or(0));
        buf.write_u32::<LittleEndian>(image.name().is_some() as u32)?;
        let mut name = [0u8; TARGET_NAME_SIZE];
        if let Some(n) = image.name() {
            // keep a terminating NUL
            let len = n.len().min(TARGET_NAME_SIZE - 1);
            name[..len].copy_from_slice(&n.as_bytes()[..len]);
        }
        buf.extend_from_slice(&name);
        buf.write_u32::<LittleEndian>(u32_size(target_size)?)?;
        buf.write_u32::<LittleEndian>(u32_size(image.elements().len())?)?;
        for element in image.elements() {
            buf.write_u32::<LittleEndian>(element.address())?;
            buf.write_u32::<LittleEndian>(u32_size(element.len())?)?;
            buf.extend_from_slice(element.data());
        }
    }

    let image_size = u32_size(buf.len())?;
    buf[6..10].copy_from_slice(&image_size.to_le_bytes());
    dfu::append_suffix(&mut buf, firmware, DFU_VERSION_DFUSE)?;
    Ok(buf)
}

fn u32_size(n: usize) -> Result<u32, FirmwareError> {
    u32::try_from(n).map_err(|_| FirmwareError::Unsupported(format!("size {} exceeds 4 GiB", n)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_targets() -> Firmware {
        let mut fw = Firmware::new();
        fw.set_format(FirmwareFormat::DfuSe);
        fw.set_vid(0x0483);
        fw.set_pid(0xDF11);
        fw.set_release(0x2200);

        let mut flash = Image::with_alt_setting(0);
        flash.set_name(Some("Internal Flash".into()));
        flash
            .add_element(Element::new(0x0800_0000, vec![0xAA; 100]).unwrap())
            .unwrap();
        flash
            .add_element(Element::new(0x0800_4000, vec![0xBB; 20]).unwrap())
            .unwrap();
        fw.add_image(flash);

        let mut option = Image::with_alt_setting(1);
        option
            .add_element(Element::new(0x1FFF_C000, vec![0x55; 16]).unwrap())
            .unwrap();
        fw.add_image(option);
        fw
    }

    #[test]
    fn test_layout() {
        let data = write(&two_targets()).unwrap();
        assert_eq!(&data[..5], b"DfuSe");
        assert_eq!(data[5], 0x01);
        let payload_len = data.len() - dfu::SUFFIX_SIZE;
        assert_eq!(
            u32::from_le_bytes([data[6], data[7], data[8], data[9]]) as usize,
            payload_len
        );
        assert_eq!(data[10], 2);
        assert_eq!(&data[11..17], b"Target");
        let bcd = &data[data.len() - 10..data.len() - 8];
        assert_eq!(bcd, &[0x1A, 0x01]);
        assert_eq!(
            payload_len,
            PREFIX_SIZE + 2 * TARGET_PREFIX_SIZE + 3 * ELEMENT_HEADER_SIZE + 136
        );
    }

    #[test]
    fn test_roundtrip() {
        let fw = two_targets();
        let data = write(&fw).unwrap();
        let parsed = Firmware::parse(&data, ParseFlags::empty()).unwrap();
        assert_eq!(parsed, fw);
        assert_eq!(parsed.images().len(), 2);
        assert_eq!(parsed.image(0).and_then(|i| i.name()), Some("Internal Flash"));
        assert_eq!(parsed.image(1).and_then(|i| i.name()), None);
        assert_eq!(parsed.size(), 136);
        assert_eq!(parsed.write().unwrap(), data);
    }

    #[test]
    fn test_image_size_mismatch() {
        let mut data = write(&two_targets()).unwrap();
        data[6] = data[6].wrapping_add(1);
        assert!(matches!(
            parse(&data, ParseFlags::NO_CRC_TEST),
            Err(FirmwareError::Malformed { offset: 6, .. })
        ));
    }

    #[test]
    fn test_truncated_element() {
        let mut fw = Firmware::new();
        let mut image = Image::with_alt_setting(0);
        image.add_element(Element::new(0, vec![1; 8]).unwrap()).unwrap();
        fw.add_image(image);
        let data = write(&fw).unwrap();

        // claim a bigger element than present and fix up the sizes
        let mut body = data[..data.len() - dfu::SUFFIX_SIZE].to_vec();
        let size_offset = PREFIX_SIZE + TARGET_PREFIX_SIZE + 4;
        body[size_offset..size_offset + 4].copy_from_slice(&64u32.to_le_bytes());
        assert!(matches!(
            parse_body(&body),
            Err(FirmwareError::Malformed { .. })
        ));
    }

    #[test]
    fn test_oversized_element_rejected_before_reading() {
        let mut fw = Firmware::new();
        let mut image = Image::with_alt_setting(0);
        image.add_element(Element::new(0, vec![1; 8]).unwrap()).unwrap();
        fw.add_image(image);
        let data = write(&fw).unwrap();

        let mut body = data[..data.len() - dfu::SUFFIX_SIZE].to_vec();
        let header = PREFIX_SIZE + TARGET_PREFIX_SIZE;
        body[header + 4..header + 8].copy_from_slice(&0xFFFF_FFF0u32.to_le_bytes());
        match parse_body(&body) {
            Err(FirmwareError::Malformed { offset, reason }) => {
                assert_eq!(offset, header);
                assert_eq!(reason, "truncated element data");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_bad_target_signature() {
        let mut data = write(&two_targets()).unwrap();
        data[11] = b't';
        assert!(matches!(
            parse(&data, ParseFlags::NO_CRC_TEST),
            Err(FirmwareError::Malformed { offset: 11, .. })
        ));
    }
}
