//! Value types shared by the HSM-backed Ethereum signer: the RLP codec, 20-byte account
//! addresses with EIP-55 checksums, and legacy transactions with EIP-155 signing hashes.

#![warn(missing_docs, missing_debug_implementations)]
#![deny(elided_lifetimes_in_paths)]

pub mod address;
pub mod hash;
pub mod rlp;
pub mod transaction;

#[doc(inline)]
pub use address::{Address, AddressError};
#[doc(inline)]
pub use hash::{keccak256, Keccak256Hash};
#[doc(inline)]
pub use transaction::{EthereumTransaction, TransactionError, TransactionSignature};
