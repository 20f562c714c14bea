// Error types for the fallible aggregate operations.

use thiserror::Error;

use crate::device::DeviceId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("state stream truncated at offset {0}")]
    Truncated(usize),
    #[error("state stream has no terminator")]
    Unterminated,
    #[error("device {id} state size mismatch: expected {expected}, found {found}")]
    SizeMismatch {
        id: DeviceId,
        expected: usize,
        found: usize,
    },
    #[error("device {0} rejected its state")]
    Rejected(DeviceId),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("not a snapshot (bad magic)")]
    BadMagic,
    #[error("snapshot header truncated")]
    Truncated,
    #[error("snapshot version {major}.{minor} is not supported")]
    Version { major: u8, minor: u8 },
    #[error("snapshot body is {found} bytes, header says {expected}")]
    BodyLength { expected: usize, found: usize },
    #[error("snapshot body of {0} bytes is too large")]
    TooLarge(usize),
    #[error("snapshot body could not be decompressed: {0}")]
    Compression(#[from] std::io::Error),
    #[error(transparent)]
    Status(#[from] StatusError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TapeError {
    #[error("not a T88 tape image")]
    BadMagic,
    #[error("tape tag at offset {0} runs past the end of the image")]
    Truncated(usize),
    #[error("tape version tag missing or unsupported")]
    Version,
    #[error("no tape mounted")]
    NoTape,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{field} out of range: {value}")]
    Range { field: &'static str, value: u32 },
}
