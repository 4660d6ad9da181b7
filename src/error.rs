use zarrs::{
    array::{ArrayCreateError, ArrayError},
    group::GroupCreateError,
    storage::StorageError,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    General(String),
    /// A pushed frame does not match the configured plane shape.
    #[error("frame shape mismatch: expected {expected:?}, received {received:?}")]
    FrameShape {
        expected: [usize; 2],
        received: [usize; 2],
    },
    /// More frames were pushed than the configured Z upper bound allows.
    #[error("frame {index} exceeds the Z size estimate of {limit}")]
    DepthExceeded { index: u64, limit: u64 },
    /// Existing store content is incompatible with the current configuration.
    #[error("incompatible existing node at {path}: {reason}")]
    ConfigMismatch { path: String, reason: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The writer no longer accepts frames.
    #[error("writer is {0}")]
    Closed(&'static str),
    /// The ingestion thread stopped after an error; the cause is returned by `close`.
    #[error("writer failed while ingesting frames")]
    WriterFailed,
    #[error(transparent)]
    Array(#[from] ArrayError),
    #[error(transparent)]
    ArrayCreate(#[from] ArrayCreateError),
    #[error(transparent)]
    GroupCreate(#[from] GroupCreateError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Wrapped(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn general(message: impl Into<String>) -> Self {
        Self::General(message.into())
    }

    pub fn wrap(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Wrapped(Box::new(error))
    }

    pub(crate) fn mismatch(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigMismatch {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
