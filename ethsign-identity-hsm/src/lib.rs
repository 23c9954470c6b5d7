//! Ethereum key management inside a hardware security module, over PKCS#11.
//!
//! A [`Pkcs11SignatureManager`] generates secp256k1 key pairs on a token slot, labels them with
//! the address they control, lists and removes them, and signs transaction digests with them.
//! The private keys never leave the module.
//!
//! # Example
//!
//! ```rust,no_run
//! use ethsign_identity_hsm::{DigitalSignatureManager, Pkcs11Library, Pkcs11SignatureManager, SlotAccess};
//! use std::sync::Arc;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let lib_path = "";
//! let logger = slog::Logger::root(slog::Discard, slog::o!());
//! let manager = Pkcs11SignatureManager::new(Arc::new(Pkcs11Library::load(lib_path)?));
//! manager.open(&logger)?;
//! let address = manager.generate_key(&SlotAccess::new("0", "1234"), &logger)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs, missing_debug_implementations)]
#![deny(elided_lifetimes_in_paths)]

pub(crate) mod error;
pub(crate) mod library;
pub(crate) mod manager;
pub mod module;
pub(crate) mod session;
#[cfg(any(test, feature = "soft-token"))]
pub mod soft_token;

pub use error::{ReturnCodeTable, SignatureManagerError, SignatureManagerErrorKind};
pub use library::Pkcs11Library;
pub use manager::{DigitalSignatureManager, Pkcs11SignatureManager, SlotAccess};
pub use module::{Attribute, Mechanism, ModuleError, Pkcs11Module};
#[cfg(any(test, feature = "soft-token"))]
pub use soft_token::SoftToken;
