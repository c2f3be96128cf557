//! GETSTATUS response and functional descriptor structures.

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;

use super::constants::DFU_STATUS_LEN;
use super::state::{DfuState, DfuStatus};

#[derive(Error, Debug)]
pub enum StructError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Invalid descriptor type: expected 0x{expected:02X}, got 0x{actual:02X}")]
    InvalidDescriptorType { expected: u8, actual: u8 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// GETSTATUS response (6 bytes).
///
/// Layout: bStatus, bwPollTimeout (24-bit LE, milliseconds), bState, iString.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusResponse {
    pub status: DfuStatus,
    pub poll_timeout_ms: u32,
    pub state: DfuState,
    pub string_index: u8,
}

impl StatusResponse {
    pub const SIZE: usize = DFU_STATUS_LEN;

    pub fn new(status: DfuStatus, state: DfuState, poll_timeout_ms: u32) -> Self {
        Self {
            status,
            poll_timeout_ms: poll_timeout_ms & 0x00FF_FFFF,
            state,
            string_index: 0,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, StructError> {
        if data.len() < Self::SIZE {
            return Err(StructError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        let status = DfuStatus::from(cursor.read_u8()?);
        let poll_timeout_ms = cursor.read_u24::<LittleEndian>()?;
        let state = DfuState::from(cursor.read_u8()?);
        let string_index = cursor.read_u8()?;
        Ok(Self {
            status,
            poll_timeout_ms,
            state,
            string_index,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.push(u8::from(self.status));
        // a u24 write cannot fail on a Vec once masked
        let _ = buf.write_u24::<LittleEndian>(self.poll_timeout_ms & 0x00FF_FFFF);
        buf.push(u8::from(self.state));
        buf.push(self.string_index);
        buf
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms as u64)
    }
}

bitflags! {
    /// bmAttributes of the DFU functional descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DfuAttributes: u8 {
        const CAN_DOWNLOAD = 1 << 0;
        const CAN_UPLOAD = 1 << 1;
        const MANIFEST_TOLERANT = 1 << 2;
        const WILL_DETACH = 1 << 3;
        const CAN_ACCELERATE = 1 << 7;
    }
}

/// DFU functional descriptor (9 bytes, type 0x21).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionalDescriptor {
    pub attributes: DfuAttributes,
    pub detach_timeout_ms: u16,
    pub transfer_size: u16,
    pub dfu_version: u16,
}

impl FunctionalDescriptor {
    pub const SIZE: usize = 9;
    pub const DESCRIPTOR_TYPE: u8 = super::constants::DFU_FUNCTIONAL_DESCRIPTOR_TYPE;

    pub fn from_bytes(data: &[u8]) -> Result<Self, StructError> {
        if data.len() < Self::SIZE {
            return Err(StructError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        let length = cursor.read_u8()?;
        let descriptor_type = cursor.read_u8()?;
        if descriptor_type != Self::DESCRIPTOR_TYPE {
            return Err(StructError::InvalidDescriptorType {
                expected: Self::DESCRIPTOR_TYPE,
                actual: descriptor_type,
            });
        }
        if length as usize != Self::SIZE {
            tracing::warn!(length, "DFU functional descriptor has incorrect length");
        }
        Ok(Self {
            attributes: DfuAttributes::from_bits_retain(cursor.read_u8()?),
            detach_timeout_ms: cursor.read_u16::<LittleEndian>()?,
            transfer_size: cursor.read_u16::<LittleEndian>()?,
            dfu_version: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.push(Self::SIZE as u8);
        buf.push(Self::DESCRIPTOR_TYPE);
        buf.push(self.attributes.bits());
        for v in [self.detach_timeout_ms, self.transfer_size, self.dfu_version] {
            let _ = buf.write_u16::<LittleEndian>(v);
        }
        buf
    }

    /// Find a functional descriptor inside the extra bytes that follow an
    /// interface descriptor.
    pub fn find(extra: &[u8]) -> Option<Self> {
        let mut offset = 0;
        while offset + 2 <= extra.len() {
            let len = extra[offset] as usize;
            if len < 2 {
                return None;
            }
            if extra[offset + 1] == Self::DESCRIPTOR_TYPE {
                let end = (offset + len).min(extra.len());
                return Self::from_bytes(&extra[offset..end]).ok();
            }
            offset += len;
        }
        None
    }
}
