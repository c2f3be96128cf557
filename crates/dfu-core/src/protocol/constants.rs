//! Protocol constants from the USB DFU 1.1 class specification and the
//! ST DfuSe extension (UM0424 / UM0391).

use std::time::Duration;

// ============================================================================
// Class Requests (bRequest)
// ============================================================================

pub const DFU_REQUEST_DETACH: u8 = 0x00;
pub const DFU_REQUEST_DNLOAD: u8 = 0x01;
pub const DFU_REQUEST_UPLOAD: u8 = 0x02;
pub const DFU_REQUEST_GETSTATUS: u8 = 0x03;
pub const DFU_REQUEST_CLRSTATUS: u8 = 0x04;
pub const DFU_REQUEST_GETSTATE: u8 = 0x05;
pub const DFU_REQUEST_ABORT: u8 = 0x06;

// ============================================================================
// DfuSe Commands (first byte of a block-0 DNLOAD)
// ============================================================================

pub const DFUSE_CMD_GET_COMMAND: u8 = 0x00;
pub const DFUSE_CMD_SET_ADDRESS_POINTER: u8 = 0x21;
pub const DFUSE_CMD_ERASE: u8 = 0x41;
pub const DFUSE_CMD_READ_UNPROTECT: u8 = 0x92;

/// DfuSe reserves wBlockNum 0 for commands and 1 for nothing; data starts at 2.
pub const DFUSE_DATA_BLOCK_OFFSET: u16 = 2;

// ============================================================================
// Interface Identification
// ============================================================================

/// Application-specific interface class.
pub const USB_CLASS_APPLICATION_SPECIFIC: u8 = 0xFE;
/// DFU interface subclass.
pub const USB_SUBCLASS_DFU: u8 = 0x01;
/// Interface protocol in runtime mode.
pub const DFU_PROTOCOL_RUNTIME: u8 = 0x01;
/// Interface protocol in DFU mode.
pub const DFU_PROTOCOL_DFU: u8 = 0x02;
/// DFU functional descriptor type.
pub const DFU_FUNCTIONAL_DESCRIPTOR_TYPE: u8 = 0x21;

// ============================================================================
// DFU Versions (bcdDFUVersion)
// ============================================================================

pub const DFU_VERSION_1_0: u16 = 0x0100;
pub const DFU_VERSION_1_0_ALT: u16 = 0x0101;
pub const DFU_VERSION_1_1: u16 = 0x0110;
pub const DFU_VERSION_DFUSE: u16 = 0x011A;

/// Versions accepted in a firmware suffix when version checking is enabled.
pub const KNOWN_DFU_VERSIONS: &[u16] = &[
    DFU_VERSION_1_0,
    DFU_VERSION_1_0_ALT,
    DFU_VERSION_1_1,
    DFU_VERSION_DFUSE,
];

// ============================================================================
// Sizes and Timing
// ============================================================================

/// Fallback when the functional descriptor reports wTransferSize == 0.
pub const DEFAULT_TRANSFER_SIZE: u16 = 64;
/// DfuSe devices advertising can-accelerate use this transfer size.
pub const DFUSE_ACCELERATED_TRANSFER_SIZE: u16 = 0x1000;
/// GETSTATUS response length.
pub const DFU_STATUS_LEN: usize = 6;

/// Default timeout for a single control transfer.
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_millis(500);
/// How long to wait for a device to come back after detach/attach/reset.
pub const DEFAULT_REPLUG_TIMEOUT: Duration = Duration::from_millis(5000);
/// Interval between enumeration checks while waiting for a replug.
pub const REPLUG_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Upper bound on GETSTATUS polls while the device reports busy.
pub const DEFAULT_MAX_BUSY_POLLS: u32 = 1000;

/// VID/PID/release value meaning "any".
pub const WILDCARD_ID: u16 = 0xFFFF;
