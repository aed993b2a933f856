use thiserror::Error;

/// Convenience alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced at the storage API.
///
/// Validation failures are returned before any side effect. Backing-store
/// failures during commit roll the tree reservation back before returning.
/// `InconsistentDigest` is fatal to the read that produced it but not to the
/// engine; callers should treat it as corruption.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid key")]
    InvalidKey,

    #[error("invalid key prefix")]
    InvalidKeyPrefix,

    #[error("invalid reference")]
    InvalidReference,

    #[error("invalid set name")]
    InvalidSet,

    #[error("key not found")]
    KeyNotFound,

    #[error("index not found")]
    IndexNotFound,

    #[error("inconsistent digest: insertion order index was tampered")]
    InconsistentDigest,

    #[error("obsolete data format: leaf reference carries no key")]
    ObsoleteDataFormat,

    #[error("empty batch")]
    EmptyBatch,

    #[error("corrupted store: {0}")]
    Corrupted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backing store error: {0}")]
    Backing(String),
}

impl StoreError {
    /// True for the two not-found kinds, which a health probe treats as a
    /// functioning store.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::KeyNotFound | StoreError::IndexNotFound)
    }
}
