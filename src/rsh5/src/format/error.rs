use thiserror::Error;

pub type Result<T> = std::result::Result<T, HdfError>;

/// Error taxonomy for the reader and writer.
///
/// Structural errors (`CorruptHeader`, `CorruptFile`) abort the enclosing
/// traversal. Path-resolution errors (`NotFound`, `WrongObjectKind`) are
/// recoverable at the caller and leave the open file usable. Per-element
/// conversion errors (`ValueOutOfRange`, `Undefined`, `NoConverter`) abort
/// the in-progress read or stream; no partial result is returned.
#[derive(Debug, Error)]
pub enum HdfError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid superblock: {0}")]
    InvalidSuperblock(String),

    #[error("unsupported {entity} version {version}")]
    UnsupportedVersion { entity: &'static str, version: u8 },

    #[error("unsupported datatype: {0}")]
    UnsupportedDatatype(String),

    #[error("unsupported layout: {0}")]
    UnsupportedLayout(String),

    #[error("corrupt object header: {0}")]
    CorruptHeader(String),

    #[error("corrupt file: {0}")]
    CorruptFile(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("wrong object kind: {0}")]
    WrongObjectKind(String),

    #[error("wrong rank: operation requires rank {expected}, dataset has rank {found}")]
    WrongRank { expected: usize, found: usize },

    #[error("value does not fit target type {target}: {value}")]
    ValueOutOfRange { target: &'static str, value: String },

    #[error("value is undefined (all bytes 0xff)")]
    Undefined,

    #[error("no converter registered for target type {0}")]
    NoConverter(&'static str),
}
