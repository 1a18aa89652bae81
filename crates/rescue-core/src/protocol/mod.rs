//! Protocol module - iRecovery USB identifiers and device modes.

pub mod constants;
pub mod mode;

pub use constants::*;
pub use mode::DeviceMode;
