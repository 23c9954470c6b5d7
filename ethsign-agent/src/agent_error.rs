//! Errors returned to callers of the connector and the factory.

use ethsign_identity_hsm::{SignatureManagerError, SignatureManagerErrorKind};
use std::{
    error::Error,
    fmt::{Debug, Display, Formatter},
};

/// An error from the signing agent: a kind callers can branch on, a human-readable message, and
/// the lower-level error it came from, if any.
pub struct AgentError {
    inner: Box<AgentErrorInner>,
}

#[derive(Debug)]
struct AgentErrorInner {
    kind: ErrorKind,
    message: String,
    source: Option<Box<dyn Error + Send + Sync>>,
}

/// The category of an [`AgentError`].
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum ErrorKind {
    /// The request was malformed: a bad address, a missing field, an unknown module kind.
    InvalidArgument,
    /// The key pair does not exist.
    NotFound,
    /// The module cannot serve the request as configured: unreachable slot, wrong PIN.
    PreconditionFailed,
    /// The module was already set up.
    AlreadyExists,
    /// Anything else, including module failures without a more precise kind.
    Internal,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NotFound => "not found",
            ErrorKind::PreconditionFailed => "precondition failed",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(text)
    }
}

impl AgentError {
    /// An error without an underlying cause.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            inner: Box::new(AgentErrorInner {
                kind,
                message: message.into(),
                source: None,
            }),
        }
    }

    pub(crate) fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Box::new(AgentErrorInner {
                kind,
                message: message.into(),
                source: Some(Box::new(source)),
            }),
        }
    }

    /// The category of the error.
    pub fn kind(&self) -> ErrorKind {
        self.inner.kind
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        &self.inner.message
    }
}

impl Debug for AgentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.inner, f)
    }
}

impl Display for AgentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.inner.kind, self.inner.message)
    }
}

impl Error for AgentError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.source.as_ref().map(|s| &**s as _)
    }
}

impl PartialEq for AgentError {
    fn eq(&self, other: &Self) -> bool {
        // Sources are not comparable; kind and message identify the error to callers.
        self.kind() == other.kind() && self.message() == other.message()
    }
}

impl From<SignatureManagerError> for AgentError {
    fn from(err: SignatureManagerError) -> Self {
        let kind = match err.kind() {
            SignatureManagerErrorKind::NotFound => ErrorKind::NotFound,
            SignatureManagerErrorKind::InvalidArgument => ErrorKind::InvalidArgument,
            SignatureManagerErrorKind::InvalidSlot | SignatureManagerErrorKind::PinIncorrect => {
                ErrorKind::PreconditionFailed
            }
            SignatureManagerErrorKind::AlreadyInitialized => ErrorKind::AlreadyExists,
            SignatureManagerErrorKind::LibFailed
            | SignatureManagerErrorKind::KeyGenerationFailed
            | SignatureManagerErrorKind::Internal => ErrorKind::Internal,
        };
        AgentError::with_source(kind, err.to_string(), err)
    }
}

pub(crate) trait ResultExt<T> {
    /// Wraps the error with `kind` and a message describing what failed.
    fn context(self, kind: ErrorKind, message: impl Into<String>) -> Result<T, AgentError>;
}

impl<T, E: Error + Send + Sync + 'static> ResultExt<T> for Result<T, E> {
    fn context(self, kind: ErrorKind, message: impl Into<String>) -> Result<T, AgentError> {
        self.map_err(|e| AgentError::with_source(kind, message, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethsign_types::AddressError;

    #[test]
    fn displays_kind_and_message() {
        let err = AgentError::new(ErrorKind::NotFound, "key for address [0x00] not found");
        assert_eq!(
            err.to_string(),
            "not found: key for address [0x00] not found"
        );
        assert!(err.source().is_none());
    }

    #[test]
    fn keeps_the_source() {
        let result: Result<(), _> = Err(AddressError::BufferTooShort(3));
        let err = result
            .context(ErrorKind::InvalidArgument, "bad address")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(
            err.source().map(|source| source.to_string()),
            Some("buffer of 3 bytes is too short for an address".to_string())
        );
        assert_eq!(err, AgentError::new(ErrorKind::InvalidArgument, "bad address"));
    }

    #[test]
    fn classifies_manager_errors() {
        for (kind, expected) in [
            (SignatureManagerErrorKind::NotFound, ErrorKind::NotFound),
            (SignatureManagerErrorKind::InvalidSlot, ErrorKind::PreconditionFailed),
            (SignatureManagerErrorKind::PinIncorrect, ErrorKind::PreconditionFailed),
            (SignatureManagerErrorKind::AlreadyInitialized, ErrorKind::AlreadyExists),
            (SignatureManagerErrorKind::KeyGenerationFailed, ErrorKind::Internal),
            (SignatureManagerErrorKind::LibFailed, ErrorKind::Internal),
        ] {
            let err = AgentError::from(SignatureManagerError::new(kind, "failed"));
            assert_eq!(err.kind(), expected);
            assert!(err.source().is_some());
        }
    }
}
