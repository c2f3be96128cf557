//! Firmware container model and codecs.
//!
//! A [`Firmware`] holds ordered [`Image`]s, each bound to an alternate
//! setting and made of non-overlapping [`Element`]s. The submodules convert
//! between that model and the on-disk formats:
//!
//! - [`raw`]: the whole buffer is one element at address 0
//! - [`dfu`]: payload followed by the 16-byte DFU 1.0 suffix
//! - [`dfuse`]: ST multi-target container inside a DFU suffix
//! - [`ihex`]: Intel HEX text records

pub mod dfu;
pub mod dfuse;
pub mod ihex;
pub mod image;
pub mod raw;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use bitflags::bitflags;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::protocol::WILDCARD_ID;

pub use image::{Element, Image};

/// Metadata key carrying the cipher kind of the payload.
pub const METADATA_CIPHER_KIND: &str = "CipherKind";

#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("Malformed file at offset 0x{offset:X}: {reason}")]
    Malformed { offset: usize, reason: String },

    #[error("Malformed record on line {line}: {reason}")]
    MalformedLine { line: usize, reason: String },

    #[error("CRC mismatch: file has 0x{expected:08X}, computed 0x{actual:08X}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Invalid element: {0}")]
    InvalidElement(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FirmwareError {
    pub(crate) fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        FirmwareError::Malformed {
            offset,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FirmwareError::Malformed { .. }
            | FirmwareError::MalformedLine { .. }
            | FirmwareError::CrcMismatch { .. }
            | FirmwareError::InvalidElement(_) => ErrorKind::Malformed,
            FirmwareError::Unsupported(_) => ErrorKind::Unsupported,
            FirmwareError::Io(_) => ErrorKind::Io,
        }
    }
}

bitflags! {
    /// Relaxations applied while parsing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ParseFlags: u8 {
        /// Do not verify the suffix CRC.
        const NO_CRC_TEST = 1 << 0;
        /// Accept unknown bcdDFU versions.
        const NO_VERSION_TEST = 1 << 1;
        /// Skip the metadata table.
        const NO_METADATA = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FirmwareFormat {
    #[default]
    Unknown,
    Raw,
    Dfu,
    DfuSe,
    IntelHex,
}

impl fmt::Display for FirmwareFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirmwareFormat::Unknown => write!(f, "unknown"),
            FirmwareFormat::Raw => write!(f, "raw"),
            FirmwareFormat::Dfu => write!(f, "dfu"),
            FirmwareFormat::DfuSe => write!(f, "dfuse"),
            FirmwareFormat::IntelHex => write!(f, "ihex"),
        }
    }
}

impl FromStr for FirmwareFormat {
    type Err = FirmwareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(FirmwareFormat::Raw),
            "dfu" | "dfu-1.0" => Ok(FirmwareFormat::Dfu),
            "dfuse" => Ok(FirmwareFormat::DfuSe),
            "ihex" | "hex" => Ok(FirmwareFormat::IntelHex),
            other => Err(FirmwareError::Unsupported(format!(
                "unknown firmware format '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CipherKind {
    #[default]
    None,
    Xtea,
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherKind::None => write!(f, "None"),
            CipherKind::Xtea => write!(f, "XTEA"),
        }
    }
}

impl FromStr for CipherKind {
    type Err = FirmwareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CipherKind::None),
            "xtea" => Ok(CipherKind::Xtea),
            other => Err(FirmwareError::Unsupported(format!(
                "unknown cipher kind '{}'",
                other
            ))),
        }
    }
}

/// Parsed representation of a firmware file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firmware {
    vid: u16,
    pid: u16,
    release: u16,
    format: FirmwareFormat,
    cipher_kind: CipherKind,
    metadata: Vec<(String, String)>,
    images: Vec<Image>,
}

impl Default for Firmware {
    fn default() -> Self {
        Self {
            vid: WILDCARD_ID,
            pid: WILDCARD_ID,
            release: WILDCARD_ID,
            format: FirmwareFormat::Unknown,
            cipher_kind: CipherKind::None,
            metadata: Vec::new(),
            images: Vec::new(),
        }
    }
}

impl Firmware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detect the container format from signatures.
    pub fn detect(data: &[u8]) -> FirmwareFormat {
        if data.is_empty() {
            FirmwareFormat::Unknown
        } else if data.starts_with(dfuse::PREFIX_SIGNATURE) {
            FirmwareFormat::DfuSe
        } else if dfu::has_suffix(data) {
            FirmwareFormat::Dfu
        } else if data[0] == b':' && ihex::looks_like_text(data) {
            FirmwareFormat::IntelHex
        } else {
            FirmwareFormat::Raw
        }
    }

    /// Parse `data`, auto-detecting the format.
    pub fn parse(data: &[u8], flags: ParseFlags) -> Result<Self, FirmwareError> {
        Self::parse_as(data, Self::detect(data), flags)
    }

    pub fn parse_as(
        data: &[u8],
        format: FirmwareFormat,
        flags: ParseFlags,
    ) -> Result<Self, FirmwareError> {
        debug!(format = %format, len = data.len(), "Parsing firmware");
        let mut firmware = match format {
            FirmwareFormat::Raw => raw::parse(data)?,
            FirmwareFormat::Dfu => dfu::parse(data, flags)?,
            FirmwareFormat::DfuSe => dfuse::parse(data, flags)?,
            FirmwareFormat::IntelHex => ihex::parse(data)?,
            FirmwareFormat::Unknown => {
                return Err(FirmwareError::Unsupported(
                    "cannot parse an empty or unrecognized file".into(),
                ));
            }
        };
        if let Some(kind) = firmware.metadata(METADATA_CIPHER_KIND) {
            match kind.parse() {
                Ok(kind) => firmware.cipher_kind = kind,
                Err(e) => warn!("Ignoring {} metadata: {}", METADATA_CIPHER_KIND, e),
            }
        }
        Ok(firmware)
    }

    /// Serialize in the current format.
    pub fn write(&self) -> Result<Vec<u8>, FirmwareError> {
        match self.format {
            FirmwareFormat::Raw => raw::write(self),
            FirmwareFormat::Dfu => dfu::write(self),
            FirmwareFormat::DfuSe => dfuse::write(self),
            FirmwareFormat::IntelHex => ihex::write(self),
            FirmwareFormat::Unknown => Err(FirmwareError::Unsupported(
                "firmware format not set".into(),
            )),
        }
    }

    pub fn parse_file<P: AsRef<Path>>(path: P, flags: ParseFlags) -> Result<Self, FirmwareError> {
        let data = std::fs::read(path)?;
        Self::parse(&data, flags)
    }

    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<(), FirmwareError> {
        let data = self.write()?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn vid(&self) -> u16 {
        self.vid
    }

    pub fn set_vid(&mut self, vid: u16) {
        self.vid = vid;
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    pub fn set_pid(&mut self, pid: u16) {
        self.pid = pid;
    }

    pub fn release(&self) -> u16 {
        self.release
    }

    pub fn set_release(&mut self, release: u16) {
        self.release = release;
    }

    pub fn format(&self) -> FirmwareFormat {
        self.format
    }

    pub fn set_format(&mut self, format: FirmwareFormat) {
        self.format = format;
    }

    pub fn cipher_kind(&self) -> CipherKind {
        self.cipher_kind
    }

    /// Set the cipher kind, keeping the metadata key in sync.
    pub fn set_cipher_kind(&mut self, kind: CipherKind) {
        self.cipher_kind = kind;
        match kind {
            CipherKind::None => {
                self.remove_metadata(METADATA_CIPHER_KIND);
            }
            other => self.set_metadata(METADATA_CIPHER_KIND, &other.to_string()),
        }
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All metadata pairs in insertion order.
    pub fn metadata_entries(&self) -> &[(String, String)] {
        &self.metadata
    }

    /// Insert or replace a metadata value; replaced keys keep their position.
    pub fn set_metadata(&mut self, key: &str, value: &str) {
        match self.metadata.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.metadata.push((key.to_string(), value.to_string())),
        }
    }

    pub fn remove_metadata(&mut self, key: &str) -> Option<String> {
        let index = self.metadata.iter().position(|(k, _)| k == key)?;
        Some(self.metadata.remove(index).1)
    }

    pub(crate) fn set_metadata_entries(&mut self, entries: Vec<(String, String)>) {
        self.metadata = entries;
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    pub fn image(&self, alt_setting: u8) -> Option<&Image> {
        self.images
            .iter()
            .find(|i| i.alt_setting() == Some(alt_setting))
    }

    pub fn image_by_name(&self, name: &str) -> Option<&Image> {
        self.images.iter().find(|i| i.name() == Some(name))
    }

    /// The image without an alternate setting, or the only image.
    pub fn image_default(&self) -> Option<&Image> {
        self.images
            .iter()
            .find(|i| i.alt_setting().is_none())
            .or_else(|| match self.images.as_slice() {
                [only] => Some(only),
                _ => None,
            })
    }

    /// Add an image, replacing any image with the same alternate setting.
    pub fn add_image(&mut self, image: Image) {
        match self
            .images
            .iter_mut()
            .find(|i| i.alt_setting() == image.alt_setting())
        {
            Some(existing) => *existing = image,
            None => self.images.push(image),
        }
    }

    /// Total payload bytes across all images.
    pub fn size(&self) -> usize {
        self.images.iter().map(Image::size).sum()
    }
}

impl fmt::Display for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Format:     {}", self.format)?;
        writeln!(f, "VID:        0x{:04x}", self.vid)?;
        writeln!(f, "PID:        0x{:04x}", self.pid)?;
        writeln!(f, "Release:    0x{:04x}", self.release)?;
        writeln!(f, "CipherKind: {}", self.cipher_kind)?;
        for (key, value) in &self.metadata {
            writeln!(f, "Metadata:   {}={}", key, value)?;
        }
        for (i, image) in self.images.iter().enumerate() {
            let alt = image
                .alt_setting()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "default".into());
            write!(f, "Image #{}:   alt {}", i, alt)?;
            if let Some(name) = image.name() {
                write!(f, " \"{}\"", name)?;
            }
            writeln!(f, ", {} element(s)", image.elements().len())?;
            for (j, element) in image.elements().iter().enumerate() {
                writeln!(
                    f,
                    "  Element #{}: address 0x{:08x}, size 0x{:x}",
                    j,
                    element.address(),
                    element.len()
                )?;
            }
        }
        Ok(())
    }
}
