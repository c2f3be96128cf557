//! Intel HEX.
//!
//! Each line is `:LLAAAATT<data>CC` in hex: byte count, 16-bit address,
//! record type, data and a two's-complement checksum over everything before
//! it. Extended segment (02) and extended linear (04) records move the base
//! address; start address records (03, 05) carry nothing we store.

use std::fmt::Write as _;

use tracing::warn;

use super::{Element, Firmware, FirmwareError, FirmwareFormat, Image};

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;
const RECORD_EXTENDED_SEGMENT: u8 = 0x02;
const RECORD_START_SEGMENT: u8 = 0x03;
const RECORD_EXTENDED_LINEAR: u8 = 0x04;
const RECORD_START_LINEAR: u8 = 0x05;

/// Data bytes per record when writing.
pub const BYTES_PER_RECORD: usize = 16;

/// Heuristic used by format detection: only printable ASCII and line breaks.
pub fn looks_like_text(data: &[u8]) -> bool {
    data.iter()
        .take(1024)
        .all(|b| b.is_ascii_graphic() || b.is_ascii_whitespace())
}

fn line_error(line: usize, reason: impl Into<String>) -> FirmwareError {
    FirmwareError::MalformedLine {
        line,
        reason: reason.into(),
    }
}

fn decode_hex(line: usize, text: &str) -> Result<Vec<u8>, FirmwareError> {
    if text.len() % 2 != 0 {
        return Err(line_error(line, "odd number of hex digits"));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            text.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| line_error(line, format!("invalid hex at column {}", i + 2)))
        })
        .collect()
}

/// Element being accumulated from consecutive data records.
struct Pending {
    line: usize,
    address: u32,
    data: Vec<u8>,
}

impl Pending {
    fn end(&self) -> u64 {
        self.address as u64 + self.data.len() as u64
    }

    fn flush(self, image: &mut Image) -> Result<(), FirmwareError> {
        let element = Element::new(self.address, self.data)
            .map_err(|e| line_error(self.line, e.to_string()))?;
        image
            .add_element(element)
            .map_err(|e| line_error(self.line, e.to_string()))
    }
}

pub fn parse(data: &[u8]) -> Result<Firmware, FirmwareError> {
    let text = std::str::from_utf8(data)
        .map_err(|e| FirmwareError::malformed(e.valid_up_to(), "Intel HEX is not ASCII"))?;

    let mut image = Image::new();
    let mut pending: Option<Pending> = None;
    let mut base: u32 = 0;
    let mut seen_eof = false;

    for (index, raw_line) in text.lines().enumerate() {
        let line = index + 1;
        let record = raw_line.trim();
        if record.is_empty() {
            continue;
        }
        let Some(hex) = record.strip_prefix(':') else {
            return Err(line_error(line, "record does not start with ':'"));
        };
        let bytes = decode_hex(line, hex)?;
        if bytes.len() < 5 {
            return Err(line_error(line, "record too short"));
        }
        let count = bytes[0] as usize;
        if bytes.len() != count + 5 {
            return Err(line_error(
                line,
                format!("byte count {} does not match record length", count),
            ));
        }
        let checksum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if checksum != 0 {
            let expected = bytes[..bytes.len() - 1]
                .iter()
                .fold(0u8, |acc, b| acc.wrapping_add(*b))
                .wrapping_neg();
            return Err(line_error(
                line,
                format!(
                    "checksum mismatch: got 0x{:02X}, expected 0x{:02X}",
                    bytes[bytes.len() - 1],
                    expected
                ),
            ));
        }
        let offset = u16::from_be_bytes([bytes[1], bytes[2]]) as u32;
        let record_type = bytes[3];
        let payload = &bytes[4..4 + count];

        match record_type {
            RECORD_DATA => {
                if count == 0 {
                    continue;
                }
                let address = base
                    .checked_add(offset)
                    .ok_or_else(|| line_error(line, "address overflow"))?;
                match pending.as_mut() {
                    Some(p) if p.end() == address as u64 => p.data.extend_from_slice(payload),
                    _ => {
                        if let Some(p) = pending.take() {
                            p.flush(&mut image)?;
                        }
                        pending = Some(Pending {
                            line,
                            address,
                            data: payload.to_vec(),
                        });
                    }
                }
            }
            RECORD_EOF => {
                seen_eof = true;
                break;
            }
            RECORD_EXTENDED_SEGMENT | RECORD_EXTENDED_LINEAR => {
                if count != 2 {
                    return Err(line_error(line, "extended address record needs 2 bytes"));
                }
                let value = u16::from_be_bytes([payload[0], payload[1]]) as u32;
                base = if record_type == RECORD_EXTENDED_LINEAR {
                    value << 16
                } else {
                    value << 4
                };
            }
            RECORD_START_SEGMENT | RECORD_START_LINEAR => {}
            other => {
                return Err(line_error(
                    line,
                    format!("unsupported record type 0x{:02X}", other),
                ));
            }
        }
    }

    if let Some(p) = pending.take() {
        p.flush(&mut image)?;
    }
    if !seen_eof {
        warn!("Intel HEX file has no end-of-file record");
    }
    if image.elements().is_empty() {
        return Err(FirmwareError::malformed(0, "Intel HEX file has no data records"));
    }

    let mut firmware = Firmware::new();
    firmware.set_format(FirmwareFormat::IntelHex);
    firmware.add_image(image);
    Ok(firmware)
}

fn push_record(out: &mut String, address: u16, record_type: u8, data: &[u8]) {
    let mut bytes = Vec::with_capacity(data.len() + 5);
    bytes.push(data.len() as u8);
    bytes.extend_from_slice(&address.to_be_bytes());
    bytes.push(record_type);
    bytes.extend_from_slice(data);
    let checksum = bytes
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
        .wrapping_neg();
    bytes.push(checksum);
    out.push(':');
    for b in bytes {
        let _ = write!(out, "{:02X}", b);
    }
    out.push('\n');
}

pub fn write(firmware: &Firmware) -> Result<Vec<u8>, FirmwareError> {
    let image = match firmware.images() {
        [only] => only,
        [] => return Err(FirmwareError::Unsupported("firmware has no images".into())),
        _ => {
            return Err(FirmwareError::Unsupported(
                "Intel HEX holds a single image".into(),
            ));
        }
    };

    let mut elements: Vec<&Element> = image.elements().iter().collect();
    elements.sort_by_key(|e| e.address());

    let mut out = String::new();
    let mut upper: Option<u16> = None;
    for element in elements {
        let mut address = element.address();
        let mut data = element.data();
        while !data.is_empty() {
            let high = (address >> 16) as u16;
            if upper != Some(high) {
                push_record(&mut out, 0, RECORD_EXTENDED_LINEAR, &high.to_be_bytes());
                upper = Some(high);
            }
            // never cross a 64 KiB boundary within one record
            let room = 0x1_0000 - (address & 0xFFFF) as usize;
            let len = data.len().min(BYTES_PER_RECORD).min(room);
            push_record(&mut out, address as u16, RECORD_DATA, &data[..len]);
            data = &data[len..];
            address = address.wrapping_add(len as u32);
        }
    }
    push_record(&mut out, 0, RECORD_EOF, &[]);
    Ok(out.into_bytes())
}
