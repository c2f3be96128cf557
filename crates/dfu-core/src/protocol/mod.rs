//! DFU protocol definitions.

pub mod constants;
pub mod state;
pub mod status;

pub use constants::*;
pub use state::{DfuState, DfuStatus};
pub use status::{DfuAttributes, FunctionalDescriptor, StatusResponse, StructError};
