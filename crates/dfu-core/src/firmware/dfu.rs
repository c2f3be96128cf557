//! DFU 1.0 file suffix.
//!
//! The payload is followed by a 16-byte footer:
//!
//! | offset | size | field                          |
//! |--------|------|--------------------------------|
//! | 0      | 2    | bcdDevice (release)            |
//! | 2      | 2    | idProduct                      |
//! | 4      | 2    | idVendor                       |
//! | 6      | 2    | bcdDFU                         |
//! | 8      | 3    | ucDfuSignature, bytes `U F D`  |
//! | 11     | 1    | bLength                        |
//! | 12     | 4    | dwCRC                          |
//!
//! All integers are little-endian. An optional metadata table (`MD`, pair
//! count, length-prefixed key/value strings) may sit directly before the
//! footer, in which case bLength covers it as well.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, warn};

use super::{Firmware, FirmwareError, FirmwareFormat, ParseFlags, dfuse, raw};
use crate::protocol::{DFU_VERSION_1_0, DFU_VERSION_DFUSE, KNOWN_DFU_VERSIONS};

pub const SUFFIX_SIZE: usize = 16;
/// On-disk byte order of the "DFU" signature.
pub const SUFFIX_SIGNATURE: &[u8; 3] = b"UFD";
pub const METADATA_SIGNATURE: &[u8; 2] = b"MD";

/// CRC as stored in the suffix: CRC-32 (poly 0xEDB88320, init 0xFFFFFFFF)
/// without the final inversion.
pub fn crc(data: &[u8]) -> u32 {
    !crc32fast::hash(data)
}

/// True if `data` ends with a suffix signature and a plausible length.
pub fn has_suffix(data: &[u8]) -> bool {
    if data.len() < SUFFIX_SIZE {
        return false;
    }
    let footer = &data[data.len() - SUFFIX_SIZE..];
    let length = footer[11] as usize;
    &footer[8..11] == SUFFIX_SIGNATURE && length >= SUFFIX_SIZE && length <= data.len()
}

/// Decoded suffix fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Suffix {
    pub release: u16,
    pub pid: u16,
    pub vid: u16,
    pub bcd_version: u16,
    pub metadata: Vec<(String, String)>,
    /// Bytes taken by footer and metadata table.
    pub length: usize,
}

pub(crate) fn parse_suffix(data: &[u8], flags: ParseFlags) -> Result<Suffix, FirmwareError> {
    if data.len() < SUFFIX_SIZE {
        return Err(FirmwareError::malformed(
            0,
            format!("file too small for DFU suffix ({} bytes)", data.len()),
        ));
    }
    let footer_offset = data.len() - SUFFIX_SIZE;
    let mut cursor = Cursor::new(&data[footer_offset..]);
    let release = cursor.read_u16::<LittleEndian>()?;
    let pid = cursor.read_u16::<LittleEndian>()?;
    let vid = cursor.read_u16::<LittleEndian>()?;
    let bcd_version = cursor.read_u16::<LittleEndian>()?;
    let mut signature = [0u8; 3];
    cursor.read_exact(&mut signature)?;
    let length = cursor.read_u8()? as usize;
    let stored_crc = cursor.read_u32::<LittleEndian>()?;

    if &signature != SUFFIX_SIGNATURE {
        return Err(FirmwareError::malformed(
            footer_offset + 8,
            "no DFU suffix signature",
        ));
    }
    if length < SUFFIX_SIZE || length > data.len() {
        return Err(FirmwareError::malformed(
            footer_offset + 11,
            format!("invalid suffix length {}", length),
        ));
    }

    if !flags.contains(ParseFlags::NO_CRC_TEST) {
        let computed = crc(&data[..data.len() - 4]);
        if computed != stored_crc {
            return Err(FirmwareError::CrcMismatch {
                expected: stored_crc,
                actual: computed,
            });
        }
    }

    if !flags.contains(ParseFlags::NO_VERSION_TEST) && !KNOWN_DFU_VERSIONS.contains(&bcd_version)
    {
        return Err(FirmwareError::Unsupported(format!(
            "DFU version 0x{:04x} is not supported",
            bcd_version
        )));
    }

    let metadata = if length > SUFFIX_SIZE && !flags.contains(ParseFlags::NO_METADATA) {
        let table_offset = data.len() - length;
        parse_metadata(&data[table_offset..footer_offset], table_offset)?
    } else {
        Vec::new()
    };

    debug!(
        vid = %format!("{:04X}", vid),
        pid = %format!("{:04X}", pid),
        bcd = %format!("{:04X}", bcd_version),
        length,
        "Parsed DFU suffix"
    );
    Ok(Suffix {
        release,
        pid,
        vid,
        bcd_version,
        metadata,
        length,
    })
}

fn parse_metadata(table: &[u8], base: usize) -> Result<Vec<(String, String)>, FirmwareError> {
    if !table.starts_with(METADATA_SIGNATURE) || table.len() < 3 {
        return Err(FirmwareError::malformed(base, "invalid metadata signature"));
    }
    let count = table[2] as usize;
    let mut offset = 3;
    let read_string = |offset: &mut usize| -> Result<String, FirmwareError> {
        let len = *table
            .get(*offset)
            .ok_or_else(|| FirmwareError::malformed(base + *offset, "truncated metadata"))?
            as usize;
        let start = *offset + 1;
        let bytes = table
            .get(start..start + len)
            .ok_or_else(|| FirmwareError::malformed(base + start, "truncated metadata"))?;
        *offset = start + len;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| FirmwareError::malformed(base + start, "metadata is not UTF-8"))
    };
    let mut pairs = Vec::with_capacity(count);
    for _ in 0..count {
        let key = read_string(&mut offset)?;
        let value = read_string(&mut offset)?;
        pairs.push((key, value));
    }
    if offset != table.len() {
        warn!(
            unused = table.len() - offset,
            "Trailing bytes after metadata table"
        );
    }
    Ok(pairs)
}

fn metadata_table(pairs: &[(String, String)]) -> Result<Vec<u8>, FirmwareError> {
    if pairs.is_empty() {
        return Ok(Vec::new());
    }
    let count = u8::try_from(pairs.len())
        .map_err(|_| FirmwareError::Unsupported("too many metadata entries".into()))?;
    let mut table = Vec::new();
    table.extend_from_slice(METADATA_SIGNATURE);
    table.push(count);
    for s in pairs.iter().flat_map(|(k, v)| [k, v]) {
        let len = u8::try_from(s.len()).map_err(|_| {
            FirmwareError::Unsupported(format!("metadata string too long: {} bytes", s.len()))
        })?;
        table.push(len);
        table.extend_from_slice(s.as_bytes());
    }
    Ok(table)
}

/// Append metadata table, footer and CRC to `buf`.
pub(crate) fn append_suffix(
    buf: &mut Vec<u8>,
    firmware: &Firmware,
    bcd_version: u16,
) -> Result<(), FirmwareError> {
    let table = metadata_table(firmware.metadata_entries())?;
    let length = u8::try_from(SUFFIX_SIZE + table.len()).map_err(|_| {
        FirmwareError::Unsupported(format!(
            "metadata table of {} bytes does not fit the suffix",
            table.len()
        ))
    })?;
    buf.extend_from_slice(&table);
    buf.write_u16::<LittleEndian>(firmware.release())?;
    buf.write_u16::<LittleEndian>(firmware.pid())?;
    buf.write_u16::<LittleEndian>(firmware.vid())?;
    buf.write_u16::<LittleEndian>(bcd_version)?;
    buf.extend_from_slice(SUFFIX_SIGNATURE);
    buf.push(length);
    let crc = crc(buf);
    buf.write_u32::<LittleEndian>(crc)?;
    Ok(())
}

pub(crate) fn apply_suffix(firmware: &mut Firmware, suffix: Suffix) {
    firmware.set_vid(suffix.vid);
    firmware.set_pid(suffix.pid);
    firmware.set_release(suffix.release);
    firmware.set_metadata_entries(suffix.metadata);
}

/// Parse a payload with a DFU suffix. A DfuSe container inside the suffix
/// is parsed as DfuSe.
pub fn parse(data: &[u8], flags: ParseFlags) -> Result<Firmware, FirmwareError> {
    let suffix = parse_suffix(data, flags)?;
    let payload = &data[..data.len() - suffix.length];

    let mut firmware = if payload.starts_with(dfuse::PREFIX_SIGNATURE) {
        let mut fw = dfuse::parse_body(payload)?;
        fw.set_format(FirmwareFormat::DfuSe);
        fw
    } else {
        if suffix.bcd_version == DFU_VERSION_DFUSE {
            warn!("DfuSe version in suffix but payload has no DfuSe prefix");
        }
        let mut fw = Firmware::new();
        fw.add_image(raw::image_from_payload(payload)?);
        fw.set_format(FirmwareFormat::Dfu);
        fw
    };
    apply_suffix(&mut firmware, suffix);
    Ok(firmware)
}

pub fn write(firmware: &Firmware) -> Result<Vec<u8>, FirmwareError> {
    let mut buf = raw::payload(firmware)?;
    append_suffix(&mut buf, firmware, DFU_VERSION_1_0)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Firmware {
        let mut fw = raw::parse(&[0x11, 0x22, 0x33, 0x44]).unwrap();
        fw.set_format(FirmwareFormat::Dfu);
        fw.set_vid(0x1234);
        fw.set_pid(0x5678);
        fw.set_release(0x0102);
        fw
    }

    #[test]
    fn test_suffix_layout() {
        let data = write(&sample()).unwrap();
        assert_eq!(data.len(), 4 + SUFFIX_SIZE);
        assert_eq!(&data[4..6], &[0x02, 0x01]);
        assert_eq!(&data[6..8], &[0x78, 0x56]);
        assert_eq!(&data[8..10], &[0x34, 0x12]);
        assert_eq!(&data[10..12], &[0x00, 0x01]);
        assert_eq!(&data[12..15], b"UFD");
        assert_eq!(data[15], 16);
        let crc_stored = u32::from_le_bytes([data[16], data[17], data[18], data[19]]);
        assert_eq!(crc_stored, crc(&data[..16]));
    }

    #[test]
    fn test_crc_matches_reference() {
        // CRC-32 of "123456789" is 0xCBF43926; the suffix form is its inverse
        assert_eq!(crc(b"123456789"), !0xCBF4_3926);
    }

    #[test]
    fn test_roundtrip_with_metadata() {
        let mut fw = sample();
        fw.set_metadata("Licence", "GPL-2.0+");
        fw.set_metadata("CipherKind", "XTEA");
        let data = fw.write().unwrap();
        assert_eq!(data[data.len() - 5] as usize, SUFFIX_SIZE + 2 + 1 + 8 + 9 + 11 + 5);

        let parsed = Firmware::parse(&data, ParseFlags::empty()).unwrap();
        assert_eq!(parsed.format(), FirmwareFormat::Dfu);
        assert_eq!(parsed.vid(), 0x1234);
        assert_eq!(parsed.metadata("Licence"), Some("GPL-2.0+"));
        assert_eq!(parsed.cipher_kind(), crate::firmware::CipherKind::Xtea);
        assert_eq!(parsed.images()[0].elements()[0].data(), &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(parsed.write().unwrap(), data);

        let bare = Firmware::parse(&data, ParseFlags::NO_METADATA).unwrap();
        assert!(bare.metadata_entries().is_empty());
        assert_eq!(bare.size(), 4);
    }

    #[test]
    fn test_bit_flip_detected() {
        let mut data = write(&sample()).unwrap();
        data[1] ^= 0x08;
        assert!(matches!(
            parse(&data, ParseFlags::empty()),
            Err(FirmwareError::CrcMismatch { .. })
        ));
        let fw = parse(&data, ParseFlags::NO_CRC_TEST).unwrap();
        assert_eq!(fw.images()[0].elements()[0].data()[1], 0x22 ^ 0x08);
    }

    #[test]
    fn test_version_check() {
        let mut data = write(&sample()).unwrap();
        data[10] = 0x99;
        let len = data.len();
        let fixed = crc(&data[..len - 4]);
        data[len - 4..].copy_from_slice(&fixed.to_le_bytes());
        assert!(matches!(
            parse(&data, ParseFlags::empty()),
            Err(FirmwareError::Unsupported(_))
        ));
        assert!(parse(&data, ParseFlags::NO_VERSION_TEST).is_ok());
    }

    #[test]
    fn test_bad_signature() {
        let mut data = write(&sample()).unwrap();
        data[12] = b'X';
        assert!(!has_suffix(&data));
        assert!(matches!(
            parse(&data, ParseFlags::NO_CRC_TEST),
            Err(FirmwareError::Malformed { offset: 12, .. })
        ));
    }

    #[test]
    fn test_metadata_too_large() {
        let mut fw = sample();
        fw.set_metadata("Key", &"x".repeat(250));
        assert!(matches!(write(&fw), Err(FirmwareError::Unsupported(_))));
    }
}
