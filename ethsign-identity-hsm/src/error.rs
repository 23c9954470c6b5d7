use crate::module::ModuleError;
use pkcs11::types::{
    CKR_CRYPTOKI_ALREADY_INITIALIZED, CKR_PIN_INCORRECT, CKR_SLOT_ID_INVALID, CK_RV,
};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// The category of a [`SignatureManagerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureManagerErrorKind {
    /// The module library could not be loaded or called.
    LibFailed,
    /// The slot does not exist or cannot be parsed.
    InvalidSlot,
    /// The PIN was rejected.
    PinIncorrect,
    /// The module was already initialized.
    AlreadyInitialized,
    /// The module failed to generate a key pair or to expose its public key.
    KeyGenerationFailed,
    /// Anything else.
    Internal,
    /// No key pair is stored for the address.
    NotFound,
    /// The request itself is malformed.
    InvalidArgument,
}

impl fmt::Display for SignatureManagerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::LibFailed => "library failure",
            Self::InvalidSlot => "invalid slot",
            Self::PinIncorrect => "incorrect pin",
            Self::AlreadyInitialized => "already initialized",
            Self::KeyGenerationFailed => "key generation failed",
            Self::Internal => "internal error",
            Self::NotFound => "not found",
            Self::InvalidArgument => "invalid argument",
        };
        f.write_str(text)
    }
}

/// An error returned by a [`DigitalSignatureManager`](crate::DigitalSignatureManager).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct SignatureManagerError {
    kind: SignatureManagerErrorKind,
    message: String,
    #[source]
    source: Option<ModuleError>,
}

impl SignatureManagerError {
    /// A new error without an underlying module error.
    pub fn new(kind: SignatureManagerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attaches the module error that caused this one.
    pub fn with_source(self, source: ModuleError) -> Self {
        Self {
            source: Some(source),
            ..self
        }
    }

    /// The category of the error.
    pub fn kind(&self) -> SignatureManagerErrorKind {
        self.kind
    }

    /// The human-readable description.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The module error this was translated from, if any.
    pub fn module_error(&self) -> Option<&ModuleError> {
        self.source.as_ref()
    }
}

/// Maps PKCS#11 return values to error kinds. Unmapped values are
/// [`Internal`](SignatureManagerErrorKind::Internal).
///
/// Built once and shared; it is never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnCodeTable {
    kinds: HashMap<CK_RV, SignatureManagerErrorKind>,
}

impl ReturnCodeTable {
    /// A table with no entries: every code is internal.
    pub fn empty() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }

    /// The codes every module reports the same way.
    pub fn standard() -> Self {
        Self::empty()
            .with_entry(CKR_SLOT_ID_INVALID, SignatureManagerErrorKind::InvalidSlot)
            .with_entry(CKR_PIN_INCORRECT, SignatureManagerErrorKind::PinIncorrect)
            .with_entry(
                CKR_CRYPTOKI_ALREADY_INITIALIZED,
                SignatureManagerErrorKind::AlreadyInitialized,
            )
    }

    /// Adds or replaces the mapping of `rv`.
    pub fn with_entry(mut self, rv: CK_RV, kind: SignatureManagerErrorKind) -> Self {
        self.kinds.insert(rv, kind);
        self
    }

    /// The kind `rv` translates to.
    pub fn kind_of(&self, rv: CK_RV) -> SignatureManagerErrorKind {
        self.kinds
            .get(&rv)
            .copied()
            .unwrap_or(SignatureManagerErrorKind::Internal)
    }

    /// Wraps a module error, classifying it by its return value. Library-level failures are
    /// [`LibFailed`](SignatureManagerErrorKind::LibFailed).
    pub fn translate(&self, err: ModuleError, message: impl Into<String>) -> SignatureManagerError {
        let kind = match &err {
            ModuleError::ReturnValue(rv) => self.kind_of(*rv),
            ModuleError::Library(_) => SignatureManagerErrorKind::LibFailed,
        };
        SignatureManagerError::new(kind, message).with_source(err)
    }
}

impl Default for ReturnCodeTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkcs11::types::{CKR_DEVICE_ERROR, CKR_TOKEN_NOT_PRESENT};

    #[test]
    fn standard_codes() {
        let table = ReturnCodeTable::standard();
        assert_eq!(
            table.kind_of(CKR_SLOT_ID_INVALID),
            SignatureManagerErrorKind::InvalidSlot
        );
        assert_eq!(
            table.kind_of(CKR_PIN_INCORRECT),
            SignatureManagerErrorKind::PinIncorrect
        );
        assert_eq!(
            table.kind_of(CKR_CRYPTOKI_ALREADY_INITIALIZED),
            SignatureManagerErrorKind::AlreadyInitialized
        );
        assert_eq!(
            table.kind_of(CKR_DEVICE_ERROR),
            SignatureManagerErrorKind::Internal
        );
    }

    #[test]
    fn extra_entries() {
        let table = ReturnCodeTable::standard()
            .with_entry(CKR_TOKEN_NOT_PRESENT, SignatureManagerErrorKind::InvalidSlot);
        assert_eq!(
            table.kind_of(CKR_TOKEN_NOT_PRESENT),
            SignatureManagerErrorKind::InvalidSlot
        );
    }

    #[test]
    fn translate_keeps_source() {
        let err = ReturnCodeTable::standard()
            .translate(ModuleError::ReturnValue(CKR_PIN_INCORRECT), "login failed");
        assert_eq!(err.kind(), SignatureManagerErrorKind::PinIncorrect);
        assert_eq!(err.message(), "login failed");
        assert_eq!(
            err.module_error(),
            Some(&ModuleError::ReturnValue(CKR_PIN_INCORRECT))
        );
        assert_eq!(err.to_string(), "incorrect pin: login failed");

        let err = ReturnCodeTable::standard()
            .translate(ModuleError::Library("dlopen failed".to_string()), "open");
        assert_eq!(err.kind(), SignatureManagerErrorKind::LibFailed);
    }
}
