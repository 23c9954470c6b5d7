//! Ethereum accounts whose keys live in a hardware security module.
//!
//! An [`HsmConnector`] generates, lists and removes accounts on a PKCS#11 slot, and signs legacy
//! transactions with them. Signing hashes the transaction with its EIP-155 chain id, has the
//! module sign the digest, normalizes the signature to low S, finds its recovery id by
//! recovering the sender's public key, and returns the `0x`-prefixed RLP encoding ready to
//! broadcast.
//!
//! The connector takes its signature managers from a [`SignatureManagerFactory`], which owns one
//! manager per [`ModuleKind`] for the life of the process.
//!
//! # Example
//!
//! ```rust,no_run
//! use ethsign_agent::{HsmConnection, HsmConnector, ModuleKind, SignTxRequest, SignatureManagerFactory};
//! use std::sync::Arc;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let lib_path = "";
//! let logger = ethsign_agent::logging::create_logger(slog::Level::Info);
//! let factory = SignatureManagerFactory::builder()
//!     .with_logger(logger.clone())
//!     .with_pkcs11_library(ModuleKind::SoftHsm, lib_path)
//!     .build()?;
//! let connector = HsmConnector::new(Arc::new(factory), logger);
//! let connection = HsmConnection {
//!     slot: "0".to_string(),
//!     pin: "1234".to_string(),
//!     module_kind: ModuleKind::SoftHsm,
//!     chain_id: 1u32.into(),
//! };
//! let from = connector.generate_address(&connection)?;
//! let signed = connector.sign_tx(&connection, &SignTxRequest { from, ..Default::default() })?;
//! println!("{}", signed.signed_tx);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs, missing_debug_implementations)]
#![deny(elided_lifetimes_in_paths)]

pub mod agent_error;
pub mod config;
pub mod connector;
pub mod factory;
pub mod logging;
pub mod signing;

pub use agent_error::{AgentError, ErrorKind};
pub use config::{FactoryConfig, ModuleKind};
pub use connector::{HsmConnection, HsmConnector, SignTxRequest, SignedTransaction};
pub use factory::{FactoryBuilder, SignatureManagerFactory};
