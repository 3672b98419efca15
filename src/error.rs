use thiserror::Error;

#[derive(Error, Debug)]
pub enum BeamError {
    #[error("IO error: {context}: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Connection timeout")]
    Timeout,
    #[error("Connection closed after {received} of {expected} bytes")]
    IncompleteTransfer { expected: usize, received: usize },
    #[error("Transfer error: {context}")]
    Transfer {
        context: String,
        #[source]
        source: Box<BeamError>,
    },
    #[error("Schema error: {0}")]
    Schema(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl BeamError {
    /// Wrap an I/O error with a description of what was being attempted.
    pub fn io(source: std::io::Error, context: impl Into<String>) -> Self {
        if matches!(
            source.kind(),
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
        ) {
            return BeamError::Timeout;
        }
        BeamError::Io {
            source,
            context: context.into(),
        }
    }

    /// True for failures of the underlying byte stream.
    ///
    /// These terminate the connection; everything else leaves the transport
    /// usable (possibly after resynchronizing).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BeamError::Io { .. }
                | BeamError::Timeout
                | BeamError::IncompleteTransfer { .. }
                | BeamError::Transfer { .. }
        )
    }
}

impl From<std::io::Error> for BeamError {
    fn from(source: std::io::Error) -> Self {
        BeamError::io(source, "stream operation")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_kinds_collapse_to_timeout() {
        let err = BeamError::io(
            std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"),
            "reading samples",
        );
        assert!(matches!(err, BeamError::Timeout));
        assert!(err.is_transport());
    }

    #[test]
    fn test_transport_classification() {
        assert!(BeamError::IncompleteTransfer {
            expected: 4,
            received: 1
        }
        .is_transport());
        assert!(!BeamError::ShapeMismatch("x".into()).is_transport());
        assert!(!BeamError::Schema("x".into()).is_transport());
    }
}
