use thiserror::Error;

/// Classified failures. Every public operation returns `anyhow::Result`; when
/// the cause is one of these, callers can recover it with
/// `err.downcast_ref::<IngestError>()`.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Bad path, unresolvable format/codec, malformed hint.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The media (or a stream inside it) could not be opened.
    #[error("open failed: {0}")]
    Open(String),
    /// The session can no longer decode, e.g. the picture format changed.
    #[error("decode failed: {0}")]
    Decode(String),
    /// The caller broke a usage contract.
    #[error("logic error: {0}")]
    Logic(String),
    /// The emergency flag was raised while waiting.
    #[error("stopped by emergency shutdown")]
    Stopped,
}

impl IngestError {
    pub fn invalid(msg: impl Into<String>) -> anyhow::Error {
        IngestError::InvalidArgument(msg.into()).into()
    }

    pub fn open(msg: impl Into<String>) -> anyhow::Error {
        IngestError::Open(msg.into()).into()
    }

    pub fn decode(msg: impl Into<String>) -> anyhow::Error {
        IngestError::Decode(msg.into()).into()
    }

    pub fn logic(msg: impl Into<String>) -> anyhow::Error {
        IngestError::Logic(msg.into()).into()
    }

    /// Returns the classification carried by `err`, if any.
    pub fn of(err: &anyhow::Error) -> Option<&IngestError> {
        err.downcast_ref::<IngestError>()
    }
}
