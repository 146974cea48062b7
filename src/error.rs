use crate::config::PageId;

/// Failures surfaced by the engine, named by kind so callers can match on
/// them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database not open")]
    DatabaseNotOpen,
    #[error("database is in read-only mode")]
    DatabaseReadOnly,
    #[error("transaction closed")]
    TxClosed,
    #[error("transaction not writable")]
    TxNotWritable,
    #[error("managed transaction cannot be committed or rolled back manually")]
    TxManaged,

    #[error("bucket not found")]
    BucketNotFound,
    #[error("bucket already exists")]
    BucketExists,
    #[error("bucket name required")]
    BucketNameRequired,
    #[error("key required")]
    KeyRequired,
    #[error("key too large")]
    KeyTooLarge,
    #[error("value too large")]
    ValueTooLarge,
    #[error("incompatible value")]
    IncompatibleValue,

    #[error("cursor has no current entry")]
    CursorNotPositioned,

    #[error("invalid database magic 0x{0:08x}")]
    InvalidMagic(u32),
    #[error("unsupported database version {0}")]
    InvalidVersion(u32),
    #[error("meta checksum mismatch")]
    InvalidChecksum,

    #[error("page {0} above high water mark {1}")]
    PageIdAboveHighWaterMark(PageId, PageId),
    #[error("page {0} freed twice")]
    DoubleFree(PageId),
    #[error("page {0} referenced more than once")]
    CircularReference(PageId),
    #[error("invalid page flags 0x{0:04x} on page {1}")]
    InvalidPageFlags(u16, PageId),
    #[error("consistency check failed: {}", .0.join("; "))]
    CheckFailed(Vec<String>),

    #[error("commit failed: {0}")]
    CommitFailed(#[source] Box<Error>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
