//! Property value codec
//!
//! A value is stored either inline in the 8-byte payload of its
//! [`PropertyRecord`] or, for long strings and byte arrays, in a chain of
//! [`DynamicRecord`](super::DynamicRecord) blocks whose head id sits in the
//! payload. The numeric subtype is part of the encoding, so an `Int(1)` never
//! comes back as a `Long(1)` or a `Double(1.0)`.
//!
//! Arrays always go to dynamic records:
//!
//! ```text
//! [element kind: u8][count: u32 LE][elements]
//! ```
//!
//! Numeric elements are little-endian at their own width, chars are u32,
//! and string elements are `[len: u32 LE][utf-8 bytes]`.

use super::record::PropertyRecord;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Longest string stored inline in a property record
pub const SHORT_STRING_MAX: usize = 8;

/// Property value types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    /// Boolean value
    Bool = 1,
    /// 8-bit integer
    Byte = 2,
    /// 16-bit integer
    Short = 3,
    /// Unicode scalar
    Char = 4,
    /// 32-bit integer
    Int = 5,
    /// 64-bit integer
    Long = 6,
    /// 32-bit float
    Float = 7,
    /// 64-bit float
    Double = 8,
    /// String of at most [`SHORT_STRING_MAX`] bytes, inline
    ShortString = 9,
    /// Longer string in dynamic records
    String = 10,
    /// Byte array in dynamic records
    Bytes = 11,
    /// Typed array in dynamic records
    Array = 12,
}

impl PropertyKind {
    /// Decode the on-disk tag
    pub fn from_u8(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => Self::Bool,
            2 => Self::Byte,
            3 => Self::Short,
            4 => Self::Char,
            5 => Self::Int,
            6 => Self::Long,
            7 => Self::Float,
            8 => Self::Double,
            9 => Self::ShortString,
            10 => Self::String,
            11 => Self::Bytes,
            12 => Self::Array,
            other => return Err(Error::storage(format!("unknown property kind tag {}", other))),
        })
    }

    /// Kind whose payload is a dynamic record id
    pub fn is_dynamic(self) -> bool {
        matches!(self, Self::String | Self::Bytes | Self::Array)
    }
}

/// Property value with its exact numeric subtype
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Boolean value
    Bool(bool),
    /// 8-bit integer
    Byte(i8),
    /// 16-bit integer
    Short(i16),
    /// Unicode scalar
    Char(char),
    /// 32-bit integer
    Int(i32),
    /// 64-bit integer
    Long(i64),
    /// 32-bit float
    Float(f32),
    /// 64-bit float
    Double(f64),
    /// UTF-8 string
    String(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Homogeneous array
    Array(PropertyArray),
}

/// Array value; every element keeps the array's subtype
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyArray {
    /// Booleans
    Bool(Vec<bool>),
    /// 8-bit integers
    Byte(Vec<i8>),
    /// 16-bit integers
    Short(Vec<i16>),
    /// Unicode scalars
    Char(Vec<char>),
    /// 32-bit integers
    Int(Vec<i32>),
    /// 64-bit integers
    Long(Vec<i64>),
    /// 32-bit floats
    Float(Vec<f32>),
    /// 64-bit floats
    Double(Vec<f64>),
    /// Strings
    String(Vec<String>),
}

impl PropertyArray {
    /// Kind of every element
    pub fn element_kind(&self) -> PropertyKind {
        match self {
            Self::Bool(_) => PropertyKind::Bool,
            Self::Byte(_) => PropertyKind::Byte,
            Self::Short(_) => PropertyKind::Short,
            Self::Char(_) => PropertyKind::Char,
            Self::Int(_) => PropertyKind::Int,
            Self::Long(_) => PropertyKind::Long,
            Self::Float(_) => PropertyKind::Float,
            Self::Double(_) => PropertyKind::Double,
            Self::String(_) => PropertyKind::String,
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        match self {
            Self::Bool(v) => v.len(),
            Self::Byte(v) => v.len(),
            Self::Short(v) => v.len(),
            Self::Char(v) => v.len(),
            Self::Int(v) => v.len(),
            Self::Long(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Double(v) => v.len(),
            Self::String(v) => v.len(),
        }
    }

    /// No elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.len() * 8);
        out.push(self.element_kind() as u8);
        out.extend_from_slice(&(self.len() as u32).to_le_bytes());
        match self {
            Self::Bool(v) => out.extend(v.iter().map(|b| *b as u8)),
            Self::Byte(v) => out.extend(v.iter().map(|b| *b as u8)),
            Self::Short(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Self::Char(v) => v
                .iter()
                .for_each(|c| out.extend_from_slice(&(*c as u32).to_le_bytes())),
            Self::Int(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Self::Long(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Self::Float(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Self::Double(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Self::String(v) => {
                for s in v {
                    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                    out.extend_from_slice(s.as_bytes());
                }
            }
        }
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = ArrayReader { bytes, pos: 0 };
        let [tag] = reader.take::<1>()?;
        let count = u32::from_le_bytes(reader.take::<4>()?) as usize;
        // Every element takes at least one byte
        if count > bytes.len() {
            return Err(corrupt_array("element count exceeds payload"));
        }

        let elements = 0..count;
        let array = match PropertyKind::from_u8(tag)? {
            PropertyKind::Bool => Self::Bool(
                elements
                    .map(|_| reader.take::<1>().map(|[b]| b != 0))
                    .collect::<Result<_>>()?,
            ),
            PropertyKind::Byte => Self::Byte(
                elements
                    .map(|_| reader.take::<1>().map(|[b]| b as i8))
                    .collect::<Result<_>>()?,
            ),
            PropertyKind::Short => Self::Short(
                elements
                    .map(|_| reader.take().map(i16::from_le_bytes))
                    .collect::<Result<_>>()?,
            ),
            PropertyKind::Char => Self::Char(
                elements
                    .map(|_| {
                        let raw = u32::from_le_bytes(reader.take()?);
                        char::from_u32(raw).ok_or_else(|| corrupt_array("invalid char"))
                    })
                    .collect::<Result<_>>()?,
            ),
            PropertyKind::Int => Self::Int(
                elements
                    .map(|_| reader.take().map(i32::from_le_bytes))
                    .collect::<Result<_>>()?,
            ),
            PropertyKind::Long => Self::Long(
                elements
                    .map(|_| reader.take().map(i64::from_le_bytes))
                    .collect::<Result<_>>()?,
            ),
            PropertyKind::Float => Self::Float(
                elements
                    .map(|_| reader.take().map(f32::from_le_bytes))
                    .collect::<Result<_>>()?,
            ),
            PropertyKind::Double => Self::Double(
                elements
                    .map(|_| reader.take().map(f64::from_le_bytes))
                    .collect::<Result<_>>()?,
            ),
            PropertyKind::String => Self::String(
                elements
                    .map(|_| {
                        let len = u32::from_le_bytes(reader.take()?) as usize;
                        utf8(reader.slice(len)?.to_vec())
                    })
                    .collect::<Result<_>>()?,
            ),
            other => {
                return Err(corrupt_array(&format!("{:?} is not an element kind", other)));
            }
        };

        if reader.pos != bytes.len() {
            return Err(corrupt_array("trailing bytes"));
        }
        Ok(array)
    }
}

struct ArrayReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ArrayReader<'a> {
    fn slice(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| corrupt_array("truncated"))?;
        let bytes = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.slice(N)?);
        Ok(out)
    }
}

fn corrupt_array(reason: &str) -> Error {
    Error::storage(format!("corrupt array property: {}", reason))
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<PropertyArray> for PropertyValue {
    fn from(value: PropertyArray) -> Self {
        Self::Array(value)
    }
}

impl From<Vec<i32>> for PropertyValue {
    fn from(value: Vec<i32>) -> Self {
        Self::Array(PropertyArray::Int(value))
    }
}

impl From<Vec<i64>> for PropertyValue {
    fn from(value: Vec<i64>) -> Self {
        Self::Array(PropertyArray::Long(value))
    }
}

impl From<Vec<f64>> for PropertyValue {
    fn from(value: Vec<f64>) -> Self {
        Self::Array(PropertyArray::Double(value))
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(value: Vec<String>) -> Self {
        Self::Array(PropertyArray::String(value))
    }
}

/// A value split into its record fields plus any overflow bytes
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedValue {
    /// Kind tag
    pub kind: PropertyKind,
    /// Inline bits (ignored for dynamic kinds until the head id is known)
    pub payload: u64,
    /// Byte length of an inline short string
    pub inline_len: u8,
    /// Bytes that must go to dynamic records
    pub overflow: Option<Vec<u8>>,
}

impl EncodedValue {
    fn inline(kind: PropertyKind, payload: u64) -> Self {
        Self {
            kind,
            payload,
            inline_len: 0,
            overflow: None,
        }
    }

    fn dynamic(kind: PropertyKind, bytes: Vec<u8>) -> Self {
        Self {
            kind,
            payload: 0,
            inline_len: 0,
            overflow: Some(bytes),
        }
    }
}

/// Split a value into record fields
pub fn encode(value: &PropertyValue) -> EncodedValue {
    match value {
        PropertyValue::Bool(v) => EncodedValue::inline(PropertyKind::Bool, *v as u64),
        PropertyValue::Byte(v) => EncodedValue::inline(PropertyKind::Byte, *v as u8 as u64),
        PropertyValue::Short(v) => EncodedValue::inline(PropertyKind::Short, *v as u16 as u64),
        PropertyValue::Char(v) => EncodedValue::inline(PropertyKind::Char, *v as u32 as u64),
        PropertyValue::Int(v) => EncodedValue::inline(PropertyKind::Int, *v as u32 as u64),
        PropertyValue::Long(v) => EncodedValue::inline(PropertyKind::Long, *v as u64),
        PropertyValue::Float(v) => {
            EncodedValue::inline(PropertyKind::Float, v.to_bits() as u64)
        }
        PropertyValue::Double(v) => EncodedValue::inline(PropertyKind::Double, v.to_bits()),
        PropertyValue::String(s) if s.len() <= SHORT_STRING_MAX => {
            let mut bytes = [0u8; 8];
            bytes[..s.len()].copy_from_slice(s.as_bytes());
            EncodedValue {
                kind: PropertyKind::ShortString,
                payload: u64::from_le_bytes(bytes),
                inline_len: s.len() as u8,
                overflow: None,
            }
        }
        PropertyValue::String(s) => {
            EncodedValue::dynamic(PropertyKind::String, s.as_bytes().to_vec())
        }
        PropertyValue::Bytes(b) => EncodedValue::dynamic(PropertyKind::Bytes, b.clone()),
        PropertyValue::Array(a) => EncodedValue::dynamic(PropertyKind::Array, a.to_bytes()),
    }
}

/// Rebuild a value from its record, loading overflow bytes on demand
pub fn decode<F>(record: &PropertyRecord, load_dynamic: F) -> Result<PropertyValue>
where
    F: FnOnce(u64) -> Result<Vec<u8>>,
{
    let payload = record.payload;
    let value = match PropertyKind::from_u8(record.kind)? {
        PropertyKind::Bool => PropertyValue::Bool(payload != 0),
        PropertyKind::Byte => PropertyValue::Byte(payload as u8 as i8),
        PropertyKind::Short => PropertyValue::Short(payload as u16 as i16),
        PropertyKind::Char => PropertyValue::Char(
            char::from_u32(payload as u32)
                .ok_or_else(|| Error::storage(format!("invalid char payload {:#x}", payload)))?,
        ),
        PropertyKind::Int => PropertyValue::Int(payload as u32 as i32),
        PropertyKind::Long => PropertyValue::Long(payload as i64),
        PropertyKind::Float => PropertyValue::Float(f32::from_bits(payload as u32)),
        PropertyKind::Double => PropertyValue::Double(f64::from_bits(payload)),
        PropertyKind::ShortString => {
            let bytes = payload.to_le_bytes();
            let len = (record.inline_len as usize).min(SHORT_STRING_MAX);
            PropertyValue::String(utf8(bytes[..len].to_vec())?)
        }
        PropertyKind::String => PropertyValue::String(utf8(load_dynamic(payload)?)?),
        PropertyKind::Bytes => PropertyValue::Bytes(load_dynamic(payload)?),
        PropertyKind::Array => {
            PropertyValue::Array(PropertyArray::from_bytes(&load_dynamic(payload)?)?)
        }
    };
    Ok(value)
}

fn utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| Error::storage(format!("corrupt string property: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn through_record(value: &PropertyValue) -> PropertyValue {
        let encoded = encode(value);
        let mut record = PropertyRecord::new_in_use(0);
        record.kind = encoded.kind as u8;
        record.payload = encoded.payload;
        record.inline_len = encoded.inline_len;
        let overflow = encoded.overflow.clone();
        decode(&record, |_| Ok(overflow.unwrap_or_default())).unwrap()
    }

    #[test]
    fn test_numeric_subtypes_survive() {
        for value in [
            PropertyValue::Byte(-3),
            PropertyValue::Short(-300),
            PropertyValue::Int(1),
            PropertyValue::Int(-1),
            PropertyValue::Long(i64::MIN),
            PropertyValue::Float(1.5),
            PropertyValue::Double(-0.25),
        ] {
            assert_eq!(through_record(&value), value);
        }
    }

    #[test]
    fn test_int_is_not_widened() {
        assert_eq!(encode(&PropertyValue::Int(1)).kind, PropertyKind::Int);
        assert_eq!(encode(&PropertyValue::Long(1)).kind, PropertyKind::Long);
        assert_ne!(
            through_record(&PropertyValue::Int(1)),
            PropertyValue::Long(1)
        );
    }

    #[test]
    fn test_short_string_inline() {
        let encoded = encode(&PropertyValue::from("bob"));
        assert_eq!(encoded.kind, PropertyKind::ShortString);
        assert!(encoded.overflow.is_none());
        assert_eq!(through_record(&"bob".into()), PropertyValue::from("bob"));
        assert_eq!(through_record(&"".into()), PropertyValue::from(""));
    }

    #[test]
    fn test_long_values_overflow() {
        let long = PropertyValue::from("a string that does not fit inline");
        let encoded = encode(&long);
        assert_eq!(encoded.kind, PropertyKind::String);
        assert!(encoded.kind.is_dynamic());
        assert_eq!(through_record(&long), long);

        let bytes = PropertyValue::Bytes(vec![1, 2, 3]);
        assert_eq!(encode(&bytes).kind, PropertyKind::Bytes);
        assert_eq!(through_record(&bytes), bytes);
    }

    #[test]
    fn test_char_and_bool() {
        assert_eq!(through_record(&PropertyValue::Char('é')), PropertyValue::Char('é'));
        assert_eq!(through_record(&PropertyValue::Bool(true)), PropertyValue::Bool(true));
    }

    #[test]
    fn test_arrays_keep_element_subtype() {
        for array in [
            PropertyArray::Bool(vec![true, false, true]),
            PropertyArray::Byte(vec![-1, 0, 127]),
            PropertyArray::Short(vec![-300, 300]),
            PropertyArray::Char(vec!['a', 'é', '漢']),
            PropertyArray::Int(vec![1, -1, i32::MAX]),
            PropertyArray::Long(vec![1, i64::MIN]),
            PropertyArray::Float(vec![1.5, -0.0]),
            PropertyArray::Double(vec![2.25, f64::MAX]),
            PropertyArray::String(vec!["".into(), "bob".into(), "a longer element".into()]),
            PropertyArray::Int(Vec::new()),
        ] {
            let value = PropertyValue::Array(array);
            let encoded = encode(&value);
            assert_eq!(encoded.kind, PropertyKind::Array);
            assert!(encoded.kind.is_dynamic());
            assert_eq!(through_record(&value), value);
        }
    }

    #[test]
    fn test_int_array_is_not_long_array() {
        let ints = through_record(&vec![1i32, 2].into());
        assert_eq!(ints, PropertyValue::Array(PropertyArray::Int(vec![1, 2])));
        assert_ne!(ints, PropertyValue::Array(PropertyArray::Long(vec![1, 2])));
    }

    #[test]
    fn test_corrupt_arrays_rejected() {
        let bytes = PropertyArray::Long(vec![7, 8]).to_bytes();
        assert!(PropertyArray::from_bytes(&bytes[..bytes.len() - 1]).is_err());

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(PropertyArray::from_bytes(&trailing).is_err());

        let mut huge = vec![PropertyKind::Int as u8];
        huge.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(PropertyArray::from_bytes(&huge).is_err());

        let nested = [PropertyKind::Array as u8, 0, 0, 0, 0];
        assert!(PropertyArray::from_bytes(&nested).is_err());
        assert!(PropertyArray::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(PropertyKind::from_u8(0).is_err());
        assert!(PropertyKind::from_u8(13).is_err());
        assert!(PropertyKind::from_u8(200).is_err());
    }
}
