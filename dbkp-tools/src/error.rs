//! Error taxonomy shared by all dbkp crates.
//!
//! Every fallible operation surfaces one of these variants so callers can
//! react to the class of failure (retry on `Connection`, refuse on
//! `Security`, ...) without parsing message strings. Unexpected failures
//! are carried as [`anyhow::Error`] in the `Internal` variant.

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing dependency: {0}")]
    Dependency(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("security violation: {0}")]
    Security(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Resource(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Coarse classification used for exit codes and user-facing summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Dependency,
    Connection,
    Auth,
    Integrity,
    Security,
    Config,
    Resource,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Dependency(_) => ErrorKind::Dependency,
            Error::Connection(_) | Error::Timeout(_) | Error::Protocol(_) => ErrorKind::Connection,
            Error::Auth(_) => ErrorKind::Auth,
            Error::Integrity(_) => ErrorKind::Integrity,
            Error::Security(_) => ErrorKind::Security,
            Error::Config(_) => ErrorKind::Config,
            Error::Resource(_) | Error::NotFound(_) => ErrorKind::Resource,
            Error::Cancelled | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Recover a typed error that travelled through an `std::io::Error`
    /// wrapper (for example across a `Read`/`Write` adapter boundary).
    pub fn from_io(err: std::io::Error) -> Self {
        let typed = err
            .get_ref()
            .map(|inner| inner.is::<Error>())
            .unwrap_or(false);
        if typed {
            return *err
                .into_inner()
                .expect("io error with inner payload")
                .downcast::<Error>()
                .expect("checked downcast");
        }
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                Error::Resource(format!("permission denied - {err}"))
            }
            std::io::ErrorKind::TimedOut => Error::Timeout(err.to_string()),
            _ => Error::Resource(err.to_string()),
        }
    }
}

impl ErrorKind {
    /// Short hint shown to the operator alongside the error message.
    pub fn hint(self) -> &'static str {
        match self {
            ErrorKind::Dependency => "install the required native tool and retry",
            ErrorKind::Connection => "check network reachability and service status",
            ErrorKind::Auth => "check the supplied credentials",
            ErrorKind::Integrity => "the stored data is corrupted - restore from another backup",
            ErrorKind::Security => "check the encryption key or pass the confirmation flag",
            ErrorKind::Config => "fix the configuration value and retry",
            ErrorKind::Resource => "check storage permissions, free space and paths",
            ErrorKind::Internal => "this is likely a bug - please report it",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::from_io(err)
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::NotFound(_) => std::io::ErrorKind::NotFound,
            Error::Timeout(_) => std::io::ErrorKind::TimedOut,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Error::Internal(anyhow::anyhow!("openssl error - {err}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn io_round_trip_preserves_variant() {
        let original = Error::Security("gcm tag mismatch".to_string());
        let io: std::io::Error = original.into();
        let back = Error::from_io(io);
        assert!(matches!(back, Error::Security(_)));
        assert_eq!(back.kind(), ErrorKind::Security);
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such object");
        let err = Error::from_io(io);
        assert!(err.is_not_found());
        assert_eq!(err.kind(), ErrorKind::Resource);
    }
}
