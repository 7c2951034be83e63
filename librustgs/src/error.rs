/*
    Video memory error taxonomy
*/

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VramError {
    #[error("unknown pixel storage mode 0x{psm:02X}")]
    UnknownFormat { psm: u8 },

    #[error("pixel storage mode 0x{psm:02X} cannot be used as a render target")]
    UnsupportedTargetFormat { psm: u8 },

    #[error("failed to allocate a {width}x{height} texture")]
    AllocationFailure { width: u32, height: u32 },

    #[error("validation gave up after too many comparisons")]
    ValidationInconclusive,

    #[error("swizzle table for psm 0x{psm:02X} has {actual} entries, expected {expected}")]
    InvalidSwizzle { psm: u8, expected: usize, actual: usize },

    #[error("access of {len} bytes at 0x{addr:08X} is outside video memory")]
    OutOfBounds { addr: u32, len: usize },

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, VramError>;
