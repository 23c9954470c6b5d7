//! Legacy (pre EIP-1559) Ethereum transactions with EIP-155 replay protection.
use crate::address::Address;
use crate::hash::{keccak256, Keccak256Hash};
use crate::rlp::{self, Encodable, RlpError};
use num_bigint::BigUint;
use thiserror::Error;

/// An error while encoding a transaction or attaching its signature.
#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum TransactionError {
    /// The transaction has no signature yet, so it has no broadcastable encoding.
    #[error("the transaction is not signed")]
    MissingSignature,

    /// The transaction already carries a signature.
    #[error("the transaction is already signed")]
    AlreadySigned,

    /// The RLP encoding failed.
    #[error(transparent)]
    Rlp(#[from] RlpError),
}

/// The `v`, `r` and `s` values of a recoverable ECDSA signature, with `v` already bound to the
/// chain per EIP-155.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionSignature {
    /// Recovery value.
    pub v: BigUint,
    /// The `r` half of the signature.
    pub r: BigUint,
    /// The `s` half of the signature.
    pub s: BigUint,
}

impl Encodable for Address {
    fn rlp_append(&self, out: &mut Vec<u8>) -> Result<(), RlpError> {
        self.as_bytes()[..].rlp_append(out)
    }
}

/// A legacy transaction. Fields are set at construction through the `with_*` methods; the
/// signature is attached once, after the [hash](EthereumTransaction::hash) has been signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthereumTransaction {
    from: Address,
    to: Option<Address>,
    gas: u64,
    gas_price: BigUint,
    value: Option<BigUint>,
    data: Vec<u8>,
    nonce: u64,
    chain_id: BigUint,
    signature: Option<TransactionSignature>,
}

impl EthereumTransaction {
    /// A contract creation from `from` on `chain_id`, with every other field zeroed.
    pub fn new(from: Address, chain_id: BigUint) -> Self {
        Self {
            from,
            to: None,
            gas: 0,
            gas_price: BigUint::default(),
            value: None,
            data: Vec::new(),
            nonce: 0,
            chain_id,
            signature: None,
        }
    }

    /// Sets the recipient. `None` deploys a contract.
    pub fn with_to(self, to: Option<Address>) -> Self {
        Self { to, ..self }
    }

    /// Sets the gas limit.
    pub fn with_gas(self, gas: u64) -> Self {
        Self { gas, ..self }
    }

    /// Sets the gas price, in wei.
    pub fn with_gas_price(self, gas_price: BigUint) -> Self {
        Self { gas_price, ..self }
    }

    /// Sets the transferred value, in wei.
    pub fn with_value(self, value: Option<BigUint>) -> Self {
        Self { value, ..self }
    }

    /// Sets the call data or contract code.
    pub fn with_data(self, data: Vec<u8>) -> Self {
        Self { data, ..self }
    }

    /// Sets the sender nonce.
    pub fn with_nonce(self, nonce: u64) -> Self {
        Self { nonce, ..self }
    }

    /// The sender, whose key signs the transaction.
    pub fn from(&self) -> &Address {
        &self.from
    }

    /// The recipient, or `None` for a contract creation.
    pub fn to(&self) -> Option<&Address> {
        self.to.as_ref()
    }

    /// The gas limit.
    pub fn gas(&self) -> u64 {
        self.gas
    }

    /// The gas price, in wei.
    pub fn gas_price(&self) -> &BigUint {
        &self.gas_price
    }

    /// The transferred value, in wei.
    pub fn value(&self) -> Option<&BigUint> {
        self.value.as_ref()
    }

    /// The call data or contract code.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The sender nonce.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// The EIP-155 chain id.
    pub fn chain_id(&self) -> &BigUint {
        &self.chain_id
    }

    /// The attached signature, if any.
    pub fn signature(&self) -> Option<&TransactionSignature> {
        self.signature.as_ref()
    }

    /// Attaches the signature. Fails if one is already attached.
    pub fn set_signature(
        &mut self,
        signature: TransactionSignature,
    ) -> Result<(), TransactionError> {
        if self.signature.is_some() {
            return Err(TransactionError::AlreadySigned);
        }
        self.signature = Some(signature);
        Ok(())
    }

    /// The EIP-155 signing hash: Keccak-256 of
    /// `rlp([nonce, gasPrice, gas, to, value, data, chainId, 0, 0])`.
    ///
    /// It does not depend on the signature.
    pub fn hash(&self) -> Result<Keccak256Hash, RlpError> {
        let fields: [&dyn Encodable; 9] = [
            &self.nonce,
            &self.gas_price,
            &self.gas,
            &self.to,
            &self.value,
            &self.data,
            &self.chain_id,
            &0u8,
            &0u8,
        ];
        Ok(keccak256(rlp::encode_list(&fields)?))
    }

    /// The broadcastable encoding `rlp([nonce, gasPrice, gas, to, value, data, v, r, s])`.
    pub fn rlp_encode(&self) -> Result<Vec<u8>, TransactionError> {
        let signature = self
            .signature
            .as_ref()
            .ok_or(TransactionError::MissingSignature)?;
        let fields: [&dyn Encodable; 9] = [
            &self.nonce,
            &self.gas_price,
            &self.gas,
            &self.to,
            &self.value,
            &self.data,
            &signature.v,
            &signature.r,
            &signature.s,
        ];
        Ok(rlp::encode_list(&fields)?)
    }
}
