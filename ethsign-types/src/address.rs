//! Ethereum account addresses and their EIP-55 checksummed text form.
use crate::hash::keccak256;
use std::convert::TryFrom;
use std::fmt;
use thiserror::Error;

/// An error while building an [`Address`].
#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum AddressError {
    /// The text was not exactly 40 hexadecimal digits after an optional `0x` prefix.
    #[error("invalid address {0:?}: expected 40 hexadecimal characters")]
    InvalidHexString(String),

    /// Fewer than 20 bytes were supplied.
    #[error("buffer of {0} bytes is too short for an address")]
    BufferTooShort(usize),

    /// The public key was not a 65-byte uncompressed SEC1 point.
    #[error("invalid uncompressed public key of {0} bytes")]
    InvalidPublicKey(usize),
}

/// A 20-byte Ethereum account address.
///
/// The textual form is the `0x`-prefixed EIP-55 checksummed hex string. The all-zero address
/// is the [empty](Address::is_empty) address and stands for "no address".
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; Address::LEN]);

impl Address {
    /// Length of an address in bytes.
    pub const LEN: usize = 20;

    /// The empty (all-zero) address.
    pub const EMPTY: Address = Address([0; Address::LEN]);

    /// Parses a hex address, with or without a `0x`/`0X` prefix, in any letter case.
    ///
    /// The checksum casing is not verified.
    pub fn from_hex_str<S: AsRef<str>>(text: S) -> Result<Self, AddressError> {
        let text = text.as_ref();
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(text);
        if digits.len() != Self::LEN * 2 {
            return Err(AddressError::InvalidHexString(text.to_string()));
        }
        let mut bytes = [0; Self::LEN];
        hex::decode_to_slice(digits, &mut bytes)
            .map_err(|_| AddressError::InvalidHexString(text.to_string()))?;
        Ok(Self(bytes))
    }

    /// Builds an address from the last 20 bytes of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, AddressError> {
        if bytes.len() < Self::LEN {
            return Err(AddressError::BufferTooShort(bytes.len()));
        }
        let mut address = [0; Self::LEN];
        address.copy_from_slice(&bytes[bytes.len() - Self::LEN..]);
        Ok(Self(address))
    }

    /// Derives the address of an uncompressed secp256k1 public key (`0x04 || x || y`): the low
    /// 20 bytes of the Keccak-256 of `x || y`.
    pub fn from_public_key(public_key: &[u8]) -> Result<Self, AddressError> {
        match public_key {
            [0x04, point @ ..] if point.len() == 64 => Self::from_slice(&keccak256(point)),
            _ => Err(AddressError::InvalidPublicKey(public_key.len())),
        }
    }

    /// Whether this is the all-zero address.
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; Address::LEN] {
        &self.0
    }

    /// The EIP-55 checksummed form, `0x` prefixed.
    pub fn to_checksum_string(&self) -> String {
        let lower = hex::encode(self.0);
        let hash = keccak256(lower.as_bytes());
        let mut out = String::with_capacity(2 + lower.len());
        out.push_str("0x");
        for (i, c) in lower.chars().enumerate() {
            let byte = hash[i / 2];
            let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
            if nibble > 7 {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c);
            }
        }
        out
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_checksum_string())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl std::str::FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::from_hex_str(s)
    }
}

impl TryFrom<&[u8]> for Address {
    type Error = AddressError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Address::from_slice(bytes)
    }
}

impl From<[u8; Address::LEN]> for Address {
    fn from(bytes: [u8; Address::LEN]) -> Self {
        Address(bytes)
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl serde::Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_checksum_string())
    }
}

mod deserialize {
    use super::Address;

    /// Visitor for the textual form. Raw byte forms are not accepted.
    pub(super) struct AddressVisitor;

    impl<'de> serde::de::Visitor<'de> for AddressVisitor {
        type Value = Address;

        fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            formatter.write_str("a hex encoded address")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Address::from_hex_str(value).map_err(E::custom)
        }
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Address, D::Error> {
        deserializer.deserialize_str(deserialize::AddressVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const TEST_PUBLIC_KEY: &str = "041b486b06fcc9adbf74ea87d87944294f6375060289b6fa402ffc4f4045e608a635c5ba6bc5e12c6e8c31d903fcb555148f71bf9bfcb558fecd8ea3d9f2937302";

    #[test]
    fn renders_eip55_checksum() {
        let address = Address::from_hex_str("970e8128ab834e8eac17ab8e3812f010678cf791")
            .expect("valid address");
        assert_eq!(
            address.to_string(),
            "0x970E8128AB834E8EAC17Ab8E3812F010678CF791"
        );
        assert_eq!(
            Address::from_str("0xFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF")
                .unwrap()
                .to_string(),
            "0xFFfFfFffFFfffFFfFFfFFFFFffFFFffffFfFFFfF"
        );
    }

    #[test]
    fn empty_address() {
        let address = Address::default();
        assert!(address.is_empty());
        assert_eq!(
            address.to_string(),
            "0x0000000000000000000000000000000000000000"
        );
        assert!(!Address::from_str("0x970e8128ab834e8eac17ab8e3812f010678cf791")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn parses_prefixes_and_case() {
        let expected = Address::from_hex_str("a2c16184fa76cd6d16685900292683df905e4bf2").unwrap();
        for text in [
            "0xa2c16184fA76cD6D16685900292683dF905e4Bf2",
            "0Xa2c16184fA76cD6D16685900292683dF905e4Bf2",
            "A2C16184FA76CD6D16685900292683DF905E4BF2",
        ] {
            assert_eq!(Address::from_hex_str(text).unwrap(), expected);
        }
    }

    #[test]
    fn rejects_malformed_hex() {
        for text in [
            "",
            "0x",
            "0x970e8128ab834e8eac17ab8e3812f010678cf79",
            "0x970e8128ab834e8eac17ab8e3812f010678cf7911",
            "0x970e8128ab834e8eac17ab8e3812f010678cf79g",
            "0x0x970e8128ab834e8eac17ab8e3812f010678cf7",
        ] {
            let result = Address::from_hex_str(text);
            assert_eq!(
                result,
                Err(AddressError::InvalidHexString(text.to_string()))
            );
            assert!(result.unwrap_or_default().is_empty());
        }
    }

    #[test]
    fn keeps_last_twenty_bytes() {
        let mut bytes = vec![0xff; 12];
        bytes.extend_from_slice(&[0x11; 20]);
        assert_eq!(
            Address::from_slice(&bytes).unwrap(),
            Address::from([0x11; 20])
        );
        assert_eq!(
            Address::try_from(&[0u8; 19][..]),
            Err(AddressError::BufferTooShort(19))
        );
    }

    #[test]
    fn derives_from_public_key() {
        let public_key = hex::decode(TEST_PUBLIC_KEY).unwrap();
        assert_eq!(
            Address::from_public_key(&public_key).unwrap().to_string(),
            "0xa2c16184fA76cD6D16685900292683dF905e4Bf2"
        );
        assert_eq!(
            Address::from_public_key(&public_key[..33]),
            Err(AddressError::InvalidPublicKey(33))
        );
    }

    #[test]
    fn serializes_as_checksum_string() {
        let address = Address::from_str("0xa2c16184fa76cd6d16685900292683df905e4bf2").unwrap();
        let json = serde_json::to_string(&address).expect("Failed to serialize");
        assert_eq!(json, "\"0xa2c16184fA76cD6D16685900292683dF905e4Bf2\"");
        assert_eq!(
            serde_json::from_str::<Address>(&json).expect("Failed to deserialize"),
            address
        );
        assert!(serde_json::from_str::<Address>("\"0x1234\"").is_err());
    }
}
