//! Error taxonomy.
//!
//! Errors are values: every fallible operation returns [`Result`], and every
//! error carries a stable [`ErrorKind`] drawn from a closed set. Backend
//! failures are normalised where they cross the [`Transport`] boundary;
//! anything unrecognised becomes [`ErrorKind::PlatformError`] with the
//! original failure attached as the cause.
//!
//! The [`Display`] form is the safe, user-facing message and never contains
//! native handles or backend strings; the [`Debug`] form includes the full
//! cause chain for diagnostics.
//!
//! [`Transport`]: crate::transport::Transport
//! [`Display`]: std::fmt::Display
//! [`Debug`]: std::fmt::Debug

use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The closed set of error kinds surfaced by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrorKind {
    #[error("platform is not initialized")]
    NotInitialized,
    #[error("platform is already initialized")]
    AlreadyInitialized,
    #[error("no readers available")]
    NoReaders,
    #[error("reader error")]
    ReaderError,
    #[error("not connected")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("device is already acquired")]
    AlreadyAcquired,
    #[error("card is not present")]
    CardNotPresent,
    #[error("transmission error")]
    TransmissionError,
    #[error("protocol error")]
    ProtocolError,
    #[error("operation timed out")]
    Timeout,
    #[error("resource limit reached")]
    ResourceLimit,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("operation not supported")]
    UnsupportedOperation,
    #[error("platform error")]
    PlatformError,
}

/// An error value: an [`ErrorKind`], an optional human-readable message, and
/// an optional cause.
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    pub fn msg<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: Some(message.into()),
            source: None,
        }
    }

    /// Shorthand for an [`ErrorKind::ProtocolError`] with a message; the codec
    /// and TLV modules use this constantly.
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::msg(ErrorKind::ProtocolError, message)
    }

    /// Shorthand for an [`ErrorKind::InvalidParameter`] with a message.
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::msg(ErrorKind::InvalidParameter, message)
    }

    /// Attaches the underlying failure. The cause shows up in the [`Debug`]
    /// view and through [`std::error::Error::source`], never in [`Display`].
    ///
    /// [`Debug`]: std::fmt::Debug
    /// [`Display`]: std::fmt::Display
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {}", self.kind, msg),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Error");
        s.field("kind", &self.kind);
        if let Some(msg) = &self.message {
            s.field("message", msg);
        }
        if let Some(source) = &self.source {
            s.field("source", source);
        }
        s.finish()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

// Parser failures from nom are always protocol errors; the offending input
// stays out of the message.
impl<I> From<nom::Err<nom::error::Error<I>>> for Error {
    fn from(err: nom::Err<nom::error::Error<I>>) -> Self {
        let detail = match &err {
            nom::Err::Incomplete(_) => "truncated input",
            nom::Err::Error(e) | nom::Err::Failure(e) => e.code.description(),
        };
        Self::protocol(format!("parse error: {}", detail))
    }
}
