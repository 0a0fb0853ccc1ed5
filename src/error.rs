use thiserror::Error;

/// All errors that can occur across the remap table, metadata, and dispatch paths.
#[derive(Debug, Error)]
pub enum Error {
    #[error("device IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device '{0}' not found or cannot be opened")]
    DeviceNotFound(String),

    #[error("primary range [{start}, {end}) overlaps an existing remap entry")]
    Overlap { start: u64, end: u64 },

    #[error("spare sector {0} falls inside the reserved metadata region")]
    ReservedTarget(u64),

    #[error("spare sector {0} lies outside the spare's usable data region")]
    OutOfRange(u64),

    #[error("no free spare sector available for remap")]
    NoSpareCapacity,

    #[error("metadata header corrupt: {0}")]
    CorruptHeader(String),

    #[error("metadata entry table corrupt: {0}")]
    CorruptTable(String),

    #[error("unsupported metadata format version {0}")]
    UnsupportedVersion(u32),

    #[error("metadata magic bytes do not match")]
    BadMagic,

    #[error("no valid metadata copy found on spare; cannot activate")]
    NoValidCopy,

    #[error("metadata region too small for {entry_capacity} entries ({needed} sectors needed, {have} available)")]
    NoSpace {
        entry_capacity: u32,
        needed: u64,
        have: u64,
    },

    #[error("table resize allocation failed (requested {0} buckets)")]
    AllocFailure(usize),

    #[error("management operation refused: conflicting operation in progress")]
    Busy,

    #[error("no remap entry found starting at primary sector {0}")]
    NotFound(u64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, Error>;
