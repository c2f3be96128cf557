//! Per-device workarounds.
//!
//! The table is pure data: supporting another misbehaving device means adding
//! a row to [`QUIRK_TABLE`] (or an `extra_quirks` entry in the config file),
//! never touching protocol logic.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

bitflags! {
    /// Behavioral workarounds applied to a device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Quirks: u16 {
        /// Ignore the poll timeout the device reports and poll immediately.
        const IGNORE_POLLTIMEOUT = 1 << 0;
        /// Treat the interface as DFU mode whatever protocol it reports.
        const FORCE_DFU_MODE = 1 << 1;
        /// Do not validate bcdDFUVersion.
        const IGNORE_INVALID_VERSION = 1 << 2;
        /// Interface protocol 0 means DFU mode.
        const USE_PROTOCOL_ZERO = 1 << 3;
        /// Same VID:PID in runtime and DFU mode.
        const NO_PID_CHANGE = 1 << 4;
        /// Skip GETSTATUS after each upload block.
        const NO_GET_STATUS_UPLOAD = 1 << 5;
        /// No DFU runtime interface is exposed.
        const NO_DFU_RUNTIME = 1 << 6;
        /// Attach only works after an upload or download.
        const ATTACH_UPLOAD_DOWNLOAD = 1 << 7;
    }
}

const QUIRK_NAMES: &[(Quirks, &str)] = &[
    (Quirks::IGNORE_POLLTIMEOUT, "ignore-polltimeout"),
    (Quirks::FORCE_DFU_MODE, "force-dfu-mode"),
    (Quirks::IGNORE_INVALID_VERSION, "ignore-invalid-version"),
    (Quirks::USE_PROTOCOL_ZERO, "use-protocol-zero"),
    (Quirks::NO_PID_CHANGE, "no-pid-change"),
    (Quirks::NO_GET_STATUS_UPLOAD, "no-get-status-upload"),
    (Quirks::NO_DFU_RUNTIME, "no-dfu-runtime"),
    (Quirks::ATTACH_UPLOAD_DOWNLOAD, "attach-upload-download"),
];

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Unknown quirk: {0}")]
pub struct UnknownQuirk(pub String);

impl fmt::Display for Quirks {
    /// Pipe-separated names, e.g. `ignore-polltimeout|no-pid-change`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = QUIRK_NAMES
            .iter()
            .filter(|(q, _)| self.contains(*q))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join("|"))
    }
}

impl FromStr for Quirks {
    type Err = UnknownQuirk;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut quirks = Quirks::empty();
        for token in s.split('|').map(str::trim).filter(|t| !t.is_empty()) {
            let (q, _) = QUIRK_NAMES
                .iter()
                .find(|(_, name)| *name == token)
                .ok_or_else(|| UnknownQuirk(token.to_string()))?;
            quirks |= *q;
        }
        Ok(quirks)
    }
}

/// One row of the quirk table.
#[derive(Debug, Clone)]
pub struct QuirkEntry {
    pub vid: u16,
    pub pids: RangeInclusive<u16>,
    /// `None` matches any device release.
    pub release: Option<u16>,
    pub quirks: Quirks,
}

impl QuirkEntry {
    const fn new(vid: u16, pid: u16, quirks: Quirks) -> Self {
        Self {
            vid,
            pids: pid..=pid,
            release: None,
            quirks,
        }
    }

    fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pids.contains(&pid)
    }
}

/// Known devices.
pub static QUIRK_TABLE: &[QuirkEntry] = &[
    // Openmoko Freerunner / GTA02
    QuirkEntry {
        vid: 0x1D50,
        pids: 0x5117..=0x5126,
        release: None,
        quirks: Quirks::IGNORE_POLLTIMEOUT
            .union(Quirks::NO_PID_CHANGE)
            .union(Quirks::NO_DFU_RUNTIME)
            .union(Quirks::NO_GET_STATUS_UPLOAD),
    },
    QuirkEntry {
        vid: 0x1457,
        pids: 0x5117..=0x5126,
        release: None,
        quirks: Quirks::IGNORE_POLLTIMEOUT
            .union(Quirks::NO_PID_CHANGE)
            .union(Quirks::NO_DFU_RUNTIME)
            .union(Quirks::NO_GET_STATUS_UPLOAD),
    },
    // OpenPCD Reader
    QuirkEntry::new(0x16C0, 0x076B, Quirks::IGNORE_POLLTIMEOUT),
    // Siemens AG, PXM 40 & PXM 50
    QuirkEntry {
        vid: 0x0908,
        pids: 0x02C4..=0x02C5,
        release: Some(0x0000),
        quirks: Quirks::IGNORE_POLLTIMEOUT,
    },
    // Midiman M-Audio Transit
    QuirkEntry::new(0x0763, 0x2806, Quirks::IGNORE_POLLTIMEOUT),
    // LPC DFU bootloader reports the wrong mode
    QuirkEntry::new(0x1FC9, 0x000C, Quirks::FORCE_DFU_MODE),
    // Leaflabs Maple3
    QuirkEntry {
        vid: 0x1EAF,
        pids: 0x0003..=0x0003,
        release: Some(0x0200),
        quirks: Quirks::IGNORE_INVALID_VERSION,
    },
    // m-stack DFU implementation
    QuirkEntry::new(0x273F, 0x1003, Quirks::ATTACH_UPLOAD_DOWNLOAD),
];

/// Resolve quirks for a device identity against `table`.
///
/// Rows with an exact release match win over rows that accept any release;
/// within each pass the first matching row is used.
pub fn lookup_in(table: &[QuirkEntry], vid: u16, pid: u16, release: u16) -> Quirks {
    if let Some(entry) = table
        .iter()
        .find(|e| e.matches(vid, pid) && e.release == Some(release))
    {
        return entry.quirks;
    }
    table
        .iter()
        .find(|e| e.matches(vid, pid) && e.release.is_none())
        .map(|e| e.quirks)
        .unwrap_or_default()
}

/// Resolve quirks against the static table.
pub fn lookup(vid: u16, pid: u16, release: u16) -> Quirks {
    lookup_in(QUIRK_TABLE, vid, pid, release)
}

/// Quirk row as written in the TOML configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuirkRule {
    pub vid: u16,
    pub pid: u16,
    #[serde(default)]
    pub release: Option<u16>,
    /// Pipe-separated quirk names.
    pub quirks: String,
}

impl QuirkRule {
    pub fn to_entry(&self) -> Result<QuirkEntry, UnknownQuirk> {
        Ok(QuirkEntry {
            vid: self.vid,
            pids: self.pid..=self.pid,
            release: self.release,
            quirks: self.quirks.parse()?,
        })
    }
}
