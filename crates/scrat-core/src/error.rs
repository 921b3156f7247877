use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScratError>;

#[derive(Debug, Error)]
pub enum ScratError {
    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("passphrase mismatch: cannot decrypt existing backups")]
    Passphrase,

    #[error("destination error: {0}")]
    Destination(String),

    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("source error on '{path}': {message}")]
    Source { path: String, message: String },

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ScratError {
    /// Stable kind label used in events and exit-code mapping.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ScratError::Validation(_) => "validation_error",
            ScratError::Passphrase => "passphrase_error",
            ScratError::Destination(_) => "destination_error",
            ScratError::TransientIo(_) | ScratError::Io(_) => "io_error",
            ScratError::Source { .. } => "io_error",
            ScratError::Integrity(_) => "io_error",
            ScratError::Cancelled => "cancelled",
            ScratError::Internal(_) | ScratError::Catalog(_) | ScratError::Serialization(_) => {
                "internal_error"
            }
        }
    }

    /// Whether retrying the failed destination operation can help.
    pub fn is_transient(&self) -> bool {
        match self {
            ScratError::TransientIo(_) => true,
            ScratError::Io(e) => is_transient_io(e),
            _ => false,
        }
    }
}

/// Transient I/O error kinds worth retrying at the destination level.
pub(crate) fn is_transient_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

/// Map an I/O error raised while parsing or decrypting archive bytes.
///
/// Inside a sealed segment, malformed framing and truncation are corruption,
/// not plumbing failures.
pub(crate) fn io_to_integrity(err: std::io::Error) -> ScratError {
    match err.kind() {
        std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
            ScratError::Integrity(err.to_string())
        }
        _ => ScratError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ScratError::TransientIo("reset".into()).is_transient());
        assert!(ScratError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "t"
        ))
        .is_transient());
        assert!(!ScratError::Passphrase.is_transient());
        assert!(!ScratError::Destination("down".into()).is_transient());
    }

    #[test]
    fn invalid_data_maps_to_integrity() {
        let e = std::io::Error::new(std::io::ErrorKind::InvalidData, "bad tag");
        assert!(matches!(io_to_integrity(e), ScratError::Integrity(_)));

        let e = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(io_to_integrity(e), ScratError::Io(_)));
    }
}
