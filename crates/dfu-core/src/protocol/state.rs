//! DFU device states and status codes.
//!
//! Both enums mirror the values a device returns in its GETSTATUS and
//! GETSTATE responses. Unknown raw values are preserved rather than
//! rejected so the engine can still report what the device said.

use std::fmt;

/// Device state (bState).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DfuState {
    #[default]
    AppIdle,
    AppDetach,
    DfuIdle,
    DfuDnloadSync,
    DfuDnbusy,
    DfuDnloadIdle,
    DfuManifestSync,
    DfuManifest,
    DfuManifestWaitReset,
    DfuUploadIdle,
    DfuError,
    Unknown(u8),
}

impl From<u8> for DfuState {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::AppIdle,
            1 => Self::AppDetach,
            2 => Self::DfuIdle,
            3 => Self::DfuDnloadSync,
            4 => Self::DfuDnbusy,
            5 => Self::DfuDnloadIdle,
            6 => Self::DfuManifestSync,
            7 => Self::DfuManifest,
            8 => Self::DfuManifestWaitReset,
            9 => Self::DfuUploadIdle,
            10 => Self::DfuError,
            other => Self::Unknown(other),
        }
    }
}

impl From<DfuState> for u8 {
    fn from(s: DfuState) -> Self {
        match s {
            DfuState::AppIdle => 0,
            DfuState::AppDetach => 1,
            DfuState::DfuIdle => 2,
            DfuState::DfuDnloadSync => 3,
            DfuState::DfuDnbusy => 4,
            DfuState::DfuDnloadIdle => 5,
            DfuState::DfuManifestSync => 6,
            DfuState::DfuManifest => 7,
            DfuState::DfuManifestWaitReset => 8,
            DfuState::DfuUploadIdle => 9,
            DfuState::DfuError => 10,
            DfuState::Unknown(v) => v,
        }
    }
}

impl DfuState {
    /// Runtime (application) states.
    pub fn is_runtime(&self) -> bool {
        matches!(self, DfuState::AppIdle | DfuState::AppDetach)
    }

    /// States in which an upload or download is half-finished.
    pub fn is_transfer_pending(&self) -> bool {
        matches!(
            self,
            DfuState::DfuUploadIdle | DfuState::DfuDnloadIdle | DfuState::DfuDnloadSync
        )
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuState::AppIdle => write!(f, "appIDLE"),
            DfuState::AppDetach => write!(f, "appDETACH"),
            DfuState::DfuIdle => write!(f, "dfuIDLE"),
            DfuState::DfuDnloadSync => write!(f, "dfuDNLOAD-SYNC"),
            DfuState::DfuDnbusy => write!(f, "dfuDNBUSY"),
            DfuState::DfuDnloadIdle => write!(f, "dfuDNLOAD-IDLE"),
            DfuState::DfuManifestSync => write!(f, "dfuMANIFEST-SYNC"),
            DfuState::DfuManifest => write!(f, "dfuMANIFEST"),
            DfuState::DfuManifestWaitReset => write!(f, "dfuMANIFEST-WAIT-RESET"),
            DfuState::DfuUploadIdle => write!(f, "dfuUPLOAD-IDLE"),
            DfuState::DfuError => write!(f, "dfuERROR"),
            DfuState::Unknown(v) => write!(f, "unknown-state-0x{:02X}", v),
        }
    }
}

/// Device status (bStatus).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DfuStatus {
    #[default]
    Ok,
    ErrTarget,
    ErrFile,
    ErrWrite,
    ErrErase,
    ErrCheckErased,
    ErrProg,
    ErrVerify,
    ErrAddress,
    ErrNotDone,
    ErrFirmware,
    ErrVendor,
    ErrUsbReset,
    ErrPowerOnReset,
    ErrUnknown,
    ErrStalledPacket,
    Unknown(u8),
}

impl From<u8> for DfuStatus {
    fn from(v: u8) -> Self {
        match v {
            0x00 => Self::Ok,
            0x01 => Self::ErrTarget,
            0x02 => Self::ErrFile,
            0x03 => Self::ErrWrite,
            0x04 => Self::ErrErase,
            0x05 => Self::ErrCheckErased,
            0x06 => Self::ErrProg,
            0x07 => Self::ErrVerify,
            0x08 => Self::ErrAddress,
            0x09 => Self::ErrNotDone,
            0x0A => Self::ErrFirmware,
            0x0B => Self::ErrVendor,
            0x0C => Self::ErrUsbReset,
            0x0D => Self::ErrPowerOnReset,
            0x0E => Self::ErrUnknown,
            0x0F => Self::ErrStalledPacket,
            other => Self::Unknown(other),
        }
    }
}

impl From<DfuStatus> for u8 {
    fn from(s: DfuStatus) -> Self {
        match s {
            DfuStatus::Ok => 0x00,
            DfuStatus::ErrTarget => 0x01,
            DfuStatus::ErrFile => 0x02,
            DfuStatus::ErrWrite => 0x03,
            DfuStatus::ErrErase => 0x04,
            DfuStatus::ErrCheckErased => 0x05,
            DfuStatus::ErrProg => 0x06,
            DfuStatus::ErrVerify => 0x07,
            DfuStatus::ErrAddress => 0x08,
            DfuStatus::ErrNotDone => 0x09,
            DfuStatus::ErrFirmware => 0x0A,
            DfuStatus::ErrVendor => 0x0B,
            DfuStatus::ErrUsbReset => 0x0C,
            DfuStatus::ErrPowerOnReset => 0x0D,
            DfuStatus::ErrUnknown => 0x0E,
            DfuStatus::ErrStalledPacket => 0x0F,
            DfuStatus::Unknown(v) => v,
        }
    }
}

impl DfuStatus {
    /// Human readable description of the condition.
    pub fn description(&self) -> &'static str {
        match self {
            DfuStatus::Ok => "No error condition is present",
            DfuStatus::ErrTarget => "Firmware is not designed for this device",
            DfuStatus::ErrFile => "Firmware is for this device but fails verification",
            DfuStatus::ErrWrite => "Device is unable to write memory",
            DfuStatus::ErrErase => "Memory erase function failed",
            DfuStatus::ErrCheckErased => "Memory erase check failed",
            DfuStatus::ErrProg => "Program memory function failed",
            DfuStatus::ErrVerify => "Programmed memory failed verification",
            DfuStatus::ErrAddress => "Cannot program memory due to address out of range",
            DfuStatus::ErrNotDone => "Received zero-length download but data is incomplete",
            DfuStatus::ErrFirmware => "Device firmware is corrupt",
            DfuStatus::ErrVendor => "Vendor-specific error",
            DfuStatus::ErrUsbReset => "Device detected unexpected USB reset signaling",
            DfuStatus::ErrPowerOnReset => "Device detected unexpected power on reset",
            DfuStatus::ErrUnknown => "Something unexpected went wrong",
            DfuStatus::ErrStalledPacket => "Device stalled an unexpected request",
            DfuStatus::Unknown(_) => "Unrecognized status code",
        }
    }
}

impl fmt::Display for DfuStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuStatus::Ok => write!(f, "OK"),
            DfuStatus::ErrTarget => write!(f, "errTARGET"),
            DfuStatus::ErrFile => write!(f, "errFILE"),
            DfuStatus::ErrWrite => write!(f, "errWRITE"),
            DfuStatus::ErrErase => write!(f, "errERASE"),
            DfuStatus::ErrCheckErased => write!(f, "errCHECK_ERASED"),
            DfuStatus::ErrProg => write!(f, "errPROG"),
            DfuStatus::ErrVerify => write!(f, "errVERIFY"),
            DfuStatus::ErrAddress => write!(f, "errADDRESS"),
            DfuStatus::ErrNotDone => write!(f, "errNOTDONE"),
            DfuStatus::ErrFirmware => write!(f, "errFIRMWARE"),
            DfuStatus::ErrVendor => write!(f, "errVENDOR"),
            DfuStatus::ErrUsbReset => write!(f, "errUSBR"),
            DfuStatus::ErrPowerOnReset => write!(f, "errPOR"),
            DfuStatus::ErrUnknown => write!(f, "errUNKNOWN"),
            DfuStatus::ErrStalledPacket => write!(f, "errSTALLEDPKT"),
            DfuStatus::Unknown(v) => write!(f, "unknown-status-0x{:02X}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_raw_values() {
        assert_eq!(DfuState::from(2), DfuState::DfuIdle);
        assert_eq!(DfuState::from(10), DfuState::DfuError);
        assert_eq!(u8::from(DfuState::DfuUploadIdle), 9);
        assert_eq!(DfuState::from(42), DfuState::Unknown(42));
        assert_eq!(u8::from(DfuState::Unknown(42)), 42);
    }

    #[test]
    fn test_defaults() {
        assert_eq!(DfuState::default(), DfuState::AppIdle);
        assert_eq!(DfuStatus::default(), DfuStatus::Ok);
    }

    #[test]
    fn test_pending_transfer_states() {
        assert!(DfuState::DfuUploadIdle.is_transfer_pending());
        assert!(DfuState::DfuDnloadSync.is_transfer_pending());
        assert!(!DfuState::DfuIdle.is_transfer_pending());
        assert!(DfuState::AppDetach.is_runtime());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(DfuStatus::from(0x0B).to_string(), "errVENDOR");
        assert_eq!(
            DfuStatus::ErrAddress.description(),
            "Cannot program memory due to address out of range"
        );
    }
}
