use std::io;

/// Error kinds surfaced by the repository core.
///
/// The snapshot pipeline distinguishes per-entry failures (`Source`,
/// recorded in the snapshot and non-fatal) from repository-wide failures
/// (everything else, which abort the enclosing operation).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or incompatible repository configuration. Fatal at open.
    #[error("configuration error: {0}")]
    Config(String),

    /// Storage backend I/O failure. Retried a bounded number of times
    /// with exponential backoff before becoming fatal.
    #[error("storage error: {0}")]
    Transport(#[from] io::Error),

    /// Digest mismatch, footer magic mismatch or AEAD tag failure.
    /// Always fatal; the offending blob is never cached as valid.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Requested digest absent from the catalogue.
    #[error("{0} not found")]
    NotFound(String),

    /// Cooperative cancellation: in-flight work stops, nothing publishes.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid arguments from a caller.
    #[error("{0}")]
    Usage(String),

    /// Per-path failure during scan or import. Recorded as an error
    /// entry in the snapshot, never fatal.
    #[error("{pathname}: {message}")]
    Source { pathname: String, message: String },

    /// Input stream failure while chunking, tagged with the offset
    /// reached in the stream.
    #[error("read failed at offset {offset}: {source}")]
    Read {
        offset: u64,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Transport failures are worth retrying; everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    pub(crate) fn decode(what: &str, err: impl std::fmt::Display) -> Self {
        Error::Integrity(format!("unable to decode {} - {}", what, err))
    }

    pub(crate) fn encode(what: &str, err: impl std::fmt::Display) -> Self {
        Error::Usage(format!("unable to encode {} - {}", what, err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
