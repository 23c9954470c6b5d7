//! Recursive Length Prefix serialization, the binary format Ethereum uses for transactions,
//! receipts and block headers.
//!
//! See the [RLP documentation](https://ethereum.org/en/developers/docs/data-structures-and-encoding/rlp/)
//! for the wire format. Encoding goes through the [`Encodable`] trait; decoding yields a generic
//! [`RlpItem`] tree which can be mapped positionally onto a typed shape with [`decode_into`].
use num_bigint::{BigInt, BigUint, Sign};
use num_traits::Zero;

mod error;
#[doc(inline)]
pub use error::RlpError;

const SINGLE_BYTE_MAX: u8 = 0x7F;
const SHORT_STRING_OFFSET: u8 = 0x80;
const LONG_STRING_OFFSET: u8 = 0xB7;
const LONG_STRING_MAX: u8 = 0xBF;
const SHORT_LIST_OFFSET: u8 = 0xC0;
const LONG_LIST_OFFSET: u8 = 0xF7;

/// Payloads shorter than this get their length folded into the prefix byte.
const SHORT_PAYLOAD_LIMIT: usize = 56;

/// A decoded RLP value: either a byte string or a list of nested values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RlpItem {
    /// A byte string. Single bytes below `0x80` decode into a one-byte string.
    String(Vec<u8>),
    /// A list of values.
    List(Vec<RlpItem>),
}

/// The two shapes an RLP value can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemShape {
    /// A byte string.
    String,
    /// A list.
    List,
}

impl RlpItem {
    /// The shape of this value.
    pub fn shape(&self) -> ItemShape {
        match self {
            RlpItem::String(_) => ItemShape::String,
            RlpItem::List(_) => ItemShape::List,
        }
    }

    /// The bytes of a string value, or `None` for a list.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RlpItem::String(bytes) => Some(bytes),
            RlpItem::List(_) => None,
        }
    }

    /// The elements of a list value, or `None` for a string.
    pub fn as_list(&self) -> Option<&[RlpItem]> {
        match self {
            RlpItem::String(_) => None,
            RlpItem::List(items) => Some(items),
        }
    }
}

/// A value with an RLP encoding.
///
/// Strings and byte slices encode as byte strings, unsigned integers as their minimal big-endian
/// bytes, and `Option::None` as the empty value of the wrapped type: an empty list for list-like
/// types and an empty string for everything else.
pub trait Encodable {
    /// Appends the encoding of `self` to `out`.
    fn rlp_append(&self, out: &mut Vec<u8>) -> Result<(), RlpError>;

    /// Appends the encoding of an absent value of this type to `out`.
    fn rlp_append_null(out: &mut Vec<u8>)
    where
        Self: Sized,
    {
        out.push(SHORT_STRING_OFFSET);
    }
}

/// Encodes a single value.
pub fn encode<T: Encodable + ?Sized>(value: &T) -> Result<Vec<u8>, RlpError> {
    let mut out = Vec::new();
    value.rlp_append(&mut out)?;
    Ok(out)
}

/// Encodes a heterogeneous list, in order.
pub fn encode_list(items: &[&dyn Encodable]) -> Result<Vec<u8>, RlpError> {
    encode(items)
}

fn append_bytes(bytes: &[u8], out: &mut Vec<u8>) -> Result<(), RlpError> {
    if let [byte] = bytes {
        if *byte <= SINGLE_BYTE_MAX {
            out.push(*byte);
            return Ok(());
        }
    }
    append_header(bytes.len(), SHORT_STRING_OFFSET, LONG_STRING_OFFSET, out)?;
    out.extend_from_slice(bytes);
    Ok(())
}

fn append_list<F>(out: &mut Vec<u8>, write_payload: F) -> Result<(), RlpError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<(), RlpError>,
{
    let mut payload = Vec::new();
    write_payload(&mut payload)?;
    append_header(payload.len(), SHORT_LIST_OFFSET, LONG_LIST_OFFSET, out)?;
    out.extend_from_slice(&payload);
    Ok(())
}

fn append_header(
    len: usize,
    short_offset: u8,
    long_offset: u8,
    out: &mut Vec<u8>,
) -> Result<(), RlpError> {
    if len < SHORT_PAYLOAD_LIMIT {
        out.push(short_offset + len as u8);
        return Ok(());
    }
    let len = u64::try_from(len).map_err(|_| RlpError::EncodingInputSizeTooLong)?;
    let len_bytes = len.to_be_bytes();
    let len_bytes = trim_leading_zeros(&len_bytes);
    out.push(long_offset + len_bytes.len() as u8);
    out.extend_from_slice(len_bytes);
    Ok(())
}

fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

impl Encodable for [u8] {
    fn rlp_append(&self, out: &mut Vec<u8>) -> Result<(), RlpError> {
        append_bytes(self, out)
    }
}

impl Encodable for Vec<u8> {
    fn rlp_append(&self, out: &mut Vec<u8>) -> Result<(), RlpError> {
        append_bytes(self, out)
    }
}

impl Encodable for str {
    fn rlp_append(&self, out: &mut Vec<u8>) -> Result<(), RlpError> {
        append_bytes(self.as_bytes(), out)
    }
}

impl Encodable for String {
    fn rlp_append(&self, out: &mut Vec<u8>) -> Result<(), RlpError> {
        append_bytes(self.as_bytes(), out)
    }
}

macro_rules! impl_encodable_for_uint {
    ($($t: ty),+) => {
        $(
            impl Encodable for $t {
                fn rlp_append(&self, out: &mut Vec<u8>) -> Result<(), RlpError> {
                    append_bytes(trim_leading_zeros(&self.to_be_bytes()), out)
                }
            }
        )*
    };
}
impl_encodable_for_uint!(u8, u16, u32, u64, u128, usize);

impl Encodable for BigUint {
    fn rlp_append(&self, out: &mut Vec<u8>) -> Result<(), RlpError> {
        if self.is_zero() {
            return append_bytes(&[], out);
        }
        append_bytes(&self.to_bytes_be(), out)
    }
}

impl Encodable for BigInt {
    fn rlp_append(&self, out: &mut Vec<u8>) -> Result<(), RlpError> {
        match self.to_bytes_be() {
            (Sign::Minus, _) => Err(RlpError::EncodingNegativeBigInt),
            (Sign::NoSign, _) => append_bytes(&[], out),
            (Sign::Plus, bytes) => append_bytes(&bytes, out),
        }
    }
}

impl Encodable for RlpItem {
    fn rlp_append(&self, out: &mut Vec<u8>) -> Result<(), RlpError> {
        match self {
            RlpItem::String(bytes) => append_bytes(bytes, out),
            RlpItem::List(items) => items.rlp_append(out),
        }
    }
}

impl Encodable for Vec<RlpItem> {
    fn rlp_append(&self, out: &mut Vec<u8>) -> Result<(), RlpError> {
        append_list(out, |payload| {
            self.iter().try_for_each(|item| item.rlp_append(payload))
        })
    }

    fn rlp_append_null(out: &mut Vec<u8>) {
        out.push(SHORT_LIST_OFFSET);
    }
}

impl Encodable for Vec<String> {
    fn rlp_append(&self, out: &mut Vec<u8>) -> Result<(), RlpError> {
        append_list(out, |payload| {
            self.iter().try_for_each(|item| item.rlp_append(payload))
        })
    }

    fn rlp_append_null(out: &mut Vec<u8>) {
        out.push(SHORT_LIST_OFFSET);
    }
}

impl Encodable for Vec<Vec<u8>> {
    fn rlp_append(&self, out: &mut Vec<u8>) -> Result<(), RlpError> {
        append_list(out, |payload| {
            self.iter().try_for_each(|item| item.rlp_append(payload))
        })
    }

    fn rlp_append_null(out: &mut Vec<u8>) {
        out.push(SHORT_LIST_OFFSET);
    }
}

impl<'a> Encodable for [&'a dyn Encodable] {
    fn rlp_append(&self, out: &mut Vec<u8>) -> Result<(), RlpError> {
        append_list(out, |payload| {
            self.iter().try_for_each(|item| item.rlp_append(payload))
        })
    }
}

impl<T: Encodable> Encodable for Option<T> {
    fn rlp_append(&self, out: &mut Vec<u8>) -> Result<(), RlpError> {
        match self {
            Some(value) => value.rlp_append(out),
            None => {
                T::rlp_append_null(out);
                Ok(())
            }
        }
    }
}

impl<T: Encodable + ?Sized> Encodable for &T {
    fn rlp_append(&self, out: &mut Vec<u8>) -> Result<(), RlpError> {
        (**self).rlp_append(out)
    }
}

/// Decodes the first RLP value of `input`. Trailing bytes after that value are ignored.
pub fn decode(input: &[u8]) -> Result<RlpItem, RlpError> {
    decode_item(input).map(|(item, _)| item)
}

/// Decodes one value and returns it together with the number of bytes it spans.
fn decode_item(input: &[u8]) -> Result<(RlpItem, usize), RlpError> {
    let prefix = *input.first().ok_or(RlpError::DecodingNullInput)?;
    match prefix {
        0..=SINGLE_BYTE_MAX => Ok((RlpItem::String(vec![prefix]), 1)),
        SHORT_STRING_OFFSET..=LONG_STRING_OFFSET => {
            let len = usize::from(prefix - SHORT_STRING_OFFSET);
            let payload = payload(input, 1, len)?;
            Ok((RlpItem::String(payload.to_vec()), 1 + len))
        }
        0xB8..=LONG_STRING_MAX => {
            let len_of_len = usize::from(prefix - LONG_STRING_OFFSET);
            let len = read_length(input, len_of_len)?;
            let payload = payload(input, 1 + len_of_len, len)?;
            Ok((RlpItem::String(payload.to_vec()), 1 + len_of_len + len))
        }
        SHORT_LIST_OFFSET..=LONG_LIST_OFFSET => {
            let len = usize::from(prefix - SHORT_LIST_OFFSET);
            let payload = payload(input, 1, len)?;
            Ok((RlpItem::List(decode_list_payload(payload)?), 1 + len))
        }
        _ => {
            let len_of_len = usize::from(prefix - LONG_LIST_OFFSET);
            let len = read_length(input, len_of_len)?;
            let payload = payload(input, 1 + len_of_len, len)?;
            Ok((
                RlpItem::List(decode_list_payload(payload)?),
                1 + len_of_len + len,
            ))
        }
    }
}

fn decode_list_payload(mut payload: &[u8]) -> Result<Vec<RlpItem>, RlpError> {
    let mut items = Vec::new();
    while !payload.is_empty() {
        let (item, consumed) = decode_item(payload)?;
        items.push(item);
        payload = &payload[consumed..];
    }
    Ok(items)
}

/// Reads the big-endian length field that follows a long-form prefix.
fn read_length(input: &[u8], len_of_len: usize) -> Result<usize, RlpError> {
    let field = input
        .get(1..1 + len_of_len)
        .ok_or(RlpError::DecodingLengthFieldTooShort {
            expected: len_of_len,
            actual: input.len() - 1,
        })?;
    let len = field
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
    usize::try_from(len).map_err(|_| RlpError::DecodingPayloadTooShort {
        expected: usize::MAX,
        actual: input.len(),
    })
}

fn payload(input: &[u8], start: usize, len: usize) -> Result<&[u8], RlpError> {
    let too_short = || RlpError::DecodingPayloadTooShort {
        expected: len,
        actual: input.len().saturating_sub(start),
    };
    let end = start.checked_add(len).ok_or_else(too_short)?;
    input.get(start..end).ok_or_else(too_short)
}

enum Conversion<T> {
    String(fn(&mut T, String)),
    StringList(fn(&mut T, Vec<String>)),
    Bytes(fn(&mut T, Vec<u8>)),
    Uint(fn(&mut T, u64)),
    Nested(fn(&mut T, &[RlpItem]) -> Result<(), RlpError>),
}

/// Describes how one positional field of `T` is filled from a decoded value: the shape the value
/// must have and the function that stores it.
pub struct FieldDescriptor<T> {
    name: &'static str,
    conversion: Conversion<T>,
}

impl<T> FieldDescriptor<T> {
    /// A UTF-8 string field.
    pub fn string(name: &'static str, assign: fn(&mut T, String)) -> Self {
        Self {
            name,
            conversion: Conversion::String(assign),
        }
    }

    /// A field holding a list of UTF-8 strings.
    pub fn string_list(name: &'static str, assign: fn(&mut T, Vec<String>)) -> Self {
        Self {
            name,
            conversion: Conversion::StringList(assign),
        }
    }

    /// A raw byte field.
    pub fn bytes(name: &'static str, assign: fn(&mut T, Vec<u8>)) -> Self {
        Self {
            name,
            conversion: Conversion::Bytes(assign),
        }
    }

    /// An unsigned integer field of at most 64 bits.
    pub fn uint(name: &'static str, assign: fn(&mut T, u64)) -> Self {
        Self {
            name,
            conversion: Conversion::Uint(assign),
        }
    }

    /// A nested list, usually decoded with [`decode_fields`] into another [`Decodable`].
    pub fn nested(
        name: &'static str,
        assign: fn(&mut T, &[RlpItem]) -> Result<(), RlpError>,
    ) -> Self {
        Self {
            name,
            conversion: Conversion::Nested(assign),
        }
    }

    /// The field name, used in error messages.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The shape the decoded value must have.
    pub fn shape(&self) -> ItemShape {
        match self.conversion {
            Conversion::String(_) | Conversion::Bytes(_) | Conversion::Uint(_) => {
                ItemShape::String
            }
            Conversion::StringList(_) | Conversion::Nested(_) => ItemShape::List,
        }
    }

    fn apply(&self, target: &mut T, item: &RlpItem) -> Result<(), RlpError> {
        let unsupported =
            || RlpError::DeserializationUnsupportedTypeConversion(self.name.to_string());
        if item.shape() != self.shape() {
            return Err(unsupported());
        }
        match (&self.conversion, item) {
            (Conversion::String(assign), RlpItem::String(bytes)) => {
                let value = String::from_utf8(bytes.clone()).map_err(|_| unsupported())?;
                assign(target, value);
            }
            (Conversion::Bytes(assign), RlpItem::String(bytes)) => assign(target, bytes.clone()),
            (Conversion::Uint(assign), RlpItem::String(bytes)) => {
                if bytes.len() > 8 {
                    return Err(unsupported());
                }
                let value = bytes
                    .iter()
                    .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
                assign(target, value);
            }
            (Conversion::StringList(assign), RlpItem::List(items)) => {
                let values = items
                    .iter()
                    .map(|item| {
                        item.as_bytes()
                            .and_then(|bytes| String::from_utf8(bytes.to_vec()).ok())
                            .ok_or_else(unsupported)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                assign(target, values);
            }
            (Conversion::Nested(assign), RlpItem::List(items)) => assign(target, items)?,
            _ => return Err(unsupported()),
        }
        Ok(())
    }
}

impl<T> std::fmt::Debug for FieldDescriptor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("shape", &self.shape())
            .finish()
    }
}

/// A type that can be filled from a decoded RLP list, field by field, in encoding order.
///
/// Fields are matched by position, never by name, so the descriptor order must be the order in
/// which the fields were encoded.
pub trait Decodable: Default {
    /// One descriptor per field, in encoding order.
    fn field_descriptors() -> Vec<FieldDescriptor<Self>>;
}

/// Decodes `input` and maps the result onto `T`.
///
/// A bare string is accepted when `T` has exactly one string-shaped field.
pub fn decode_into<T: Decodable>(input: &[u8]) -> Result<T, RlpError> {
    match decode(input)? {
        RlpItem::List(items) => decode_fields(&items),
        item @ RlpItem::String(_) => {
            let descriptors = T::field_descriptors();
            match descriptors.as_slice() {
                [descriptor] => {
                    let mut target = T::default();
                    descriptor.apply(&mut target, &item)?;
                    Ok(target)
                }
                _ => Err(RlpError::DeserializationMismatchedLength {
                    expected: descriptors.len(),
                    actual: 1,
                }),
            }
        }
    }
}

/// Maps already decoded list elements onto `T`.
pub fn decode_fields<T: Decodable>(items: &[RlpItem]) -> Result<T, RlpError> {
    let descriptors = T::field_descriptors();
    if descriptors.len() != items.len() {
        return Err(RlpError::DeserializationMismatchedLength {
            expected: descriptors.len(),
            actual: items.len(),
        });
    }
    let mut target = T::default();
    for (descriptor, item) in descriptors.iter().zip(items) {
        descriptor.apply(&mut target, item)?;
    }
    Ok(target)
}
