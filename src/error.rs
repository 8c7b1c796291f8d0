//! Error kinds surfaced across the allocator, store, and B+Tree layers.

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure modes described in the store/allocator/mapping design.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// `get`/`pop` of a key that is not present and no default was given.
    #[error("key not found")]
    Missing,

    /// The allocator could not satisfy a request at or below `max_order`.
    #[error("allocator out of space (requested order {requested}, max order {max})")]
    OutOfSpace {
        /// Order that was requested.
        requested: u8,
        /// Largest order the allocator can ever serve.
        max: u8,
    },

    /// CRC mismatch while loading a tree-state blob.
    #[error("corrupt header: crc32 mismatch (expected {expected:#010x}, got {actual:#010x})")]
    CorruptHeader {
        /// CRC recorded in the blob.
        expected: u32,
        /// CRC recomputed from the blob's payload.
        actual: u32,
    },

    /// A descriptor decoded to an `(order, offset)` pair that cannot exist.
    #[error("invalid descriptor: {0:#x}")]
    InvalidDescriptor(u64),

    /// `key_type`/`value_type` string did not parse.
    #[error("invalid codec type string: {0:?}")]
    InvalidType(String),

    /// A codec string parsed but names a family this implementation will
    /// not emulate (the host-language opaque "pickle" codec).
    #[error("unsupported codec: {0:?}")]
    UnsupportedCodec(String),

    /// File-store open mode was not one of `r`, `w`, `c`, `n`.
    #[error("invalid open mode: {0:?}")]
    InvalidMode(char),

    /// `whence` argument outside `{SET, CUR, END}` on the streaming layer.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Failure from the backing byte stream.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A `"json"`-coded key/value list, or the tree-state blob itself,
    /// failed to serialize or parse.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Construct `OutOfSpace` for a request that exceeds the allocator's
    /// largest order.
    pub(crate) fn out_of_space(requested: u8, max: u8) -> Self {
        Error::OutOfSpace { requested, max }
    }
}
