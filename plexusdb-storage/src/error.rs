use crate::segment::Order;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid file magic")]
    InvalidMagic,

    #[error("storage format mismatch: binary expects epoch {expected}, file has {found}")]
    StorageFormatMismatch { expected: u32, found: u32 },

    #[error("unsupported page size: {0}")]
    UnsupportedPageSize(u64),

    #[error("page id {0} out of range")]
    PageIdOutOfRange(u64),

    #[error("page {0} not allocated")]
    PageNotAllocated(u64),

    #[error("wal record too large: {0}")]
    WalRecordTooLarge(u32),

    #[error("unknown wal record type: {0}")]
    UnknownWalRecord(u8),

    #[error("wal protocol error: {0}")]
    WalProtocol(&'static str),

    #[error("manifest unreadable: {0}")]
    ManifestUnreadable(String),

    #[error(
        "page corrupt in {order} at offset {offset} (primary {primary}): \
         crc {actual_crc:#010x}, expected {expected_crc:#010x}"
    )]
    PageCorrupt {
        order: Order,
        primary: u32,
        offset: u64,
        expected_crc: u32,
        actual_crc: u32,
    },

    #[error("storage corrupted: {0}")]
    StorageCorrupted(&'static str),

    #[error("payload too large: {size} bytes exceeds the {limit} byte value limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("too many open readers (limit {0})")]
    TooManyOpenReaders(u32),

    #[error("database locked by pid {pid}: {path}")]
    DatabaseLocked { pid: u32, path: PathBuf },

    #[error("active readers pin older epochs; compaction refused")]
    ActiveReadersBlockCompaction,

    #[error("negative cycle reachable from the source node")]
    NegativeCycle,

    #[error("invalid edge weight: {0}")]
    InvalidWeight(&'static str),

    #[error("path hop limit exceeded: {requested} > {limit}")]
    PathHopLimitExceeded { requested: usize, limit: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("illegal batch nesting: {0}")]
    IllegalBatchNesting(&'static str),
}

impl Error {
    /// CLI exit-code class: 1 for usage errors, 2 for database errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) | Error::IllegalBatchNesting(_) => 1,
            _ => 2,
        }
    }
}
