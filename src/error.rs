use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("out of space")]
    OutOfSpace,

    #[error("not found")]
    NotFound,

    #[error("corrupted metadata: {0}")]
    CorruptedMetadata(String),

    #[error("no evictable frame available")]
    FrameUnavailable,

    #[error("value allocation failed: {0}")]
    ValueTooLarge(String),

    #[error("latch error: {0}")]
    Latch(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, DbError>;
