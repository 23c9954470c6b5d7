//! Error type for RLP encoding and decoding.
use thiserror::Error;

/// An error while encoding a value to RLP, or while decoding RLP bytes back into a value.
#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum RlpError {
    /// A string or list payload is too large to have its length written in 64 bits.
    #[error("input size too long to encode")]
    EncodingInputSizeTooLong,

    /// Only non-negative integers have an RLP encoding.
    #[error("cannot encode a negative big integer")]
    EncodingNegativeBigInt,

    /// The decoder was given no bytes.
    #[error("cannot decode empty input")]
    DecodingNullInput,

    /// The prefix announced more length bytes than the input holds.
    #[error("length field too short: expected {expected} bytes, found {actual}")]
    DecodingLengthFieldTooShort {
        /// Number of length bytes announced by the prefix.
        expected: usize,
        /// Number of bytes actually available.
        actual: usize,
    },

    /// The announced payload runs past the end of the input.
    #[error("payload too short: expected {expected} bytes, found {actual}")]
    DecodingPayloadTooShort {
        /// Number of payload bytes announced by the prefix.
        expected: usize,
        /// Number of bytes actually available.
        actual: usize,
    },

    /// The decoded list does not have one element per field of the target shape.
    #[error("mismatched length: the target has {expected} fields but the list has {actual} elements")]
    DeserializationMismatchedLength {
        /// Number of fields of the target shape.
        expected: usize,
        /// Number of elements in the decoded list.
        actual: usize,
    },

    /// A decoded value cannot be converted to the kind of the field it is assigned to.
    #[error("unsupported type conversion for field `{0}`")]
    DeserializationUnsupportedTypeConversion(String),
}
