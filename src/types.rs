//! Property type specifiers.
//!
//! A type specifier is attached to every KV and event descriptor and gates
//! the bytes that cross the wire: `parse` turns received bytes into a typed
//! value, `encode` does the reverse, and both reject values that violate the
//! declared constraints *before* any wire activity.
//!
//! Wire form (`encode_type`): a tag byte followed by tag-specific data. The
//! tag dispatch is exhaustive; unknown tags reject the whole message.

use anyhow::{anyhow, bail, Result};

use crate::magics::{TYPE_BYTES, TYPE_INT, TYPE_UNSPEC};
use crate::seg;

/// A value passing through a typed KV or event slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    /// Raw byte string.
    Bytes(Vec<u8>),
    /// 32-bit signed integer.
    Int(i32),
}

impl PropertyValue {
    /// Borrow the byte payload, if this is a byte value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            PropertyValue::Bytes(b) => Some(b),
            PropertyValue::Int(_) => None,
        }
    }

    /// The integer payload, if this is an integer value.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            PropertyValue::Bytes(_) => None,
        }
    }
}

impl From<&[u8]> for PropertyValue {
    fn from(b: &[u8]) -> Self {
        PropertyValue::Bytes(b.to_vec())
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Int(v)
    }
}

/// Sealed registry of payload codecs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeSpecifier {
    /// No declared type; carries no values.
    Unspec,
    /// Arbitrary byte strings.
    Bytes,
    /// 32-bit signed big-endian integer with an optional inclusive range.
    Int {
        /// Inclusive `(min, max)` bound, if constrained.
        range: Option<(i32, i32)>,
    },
}

impl TypeSpecifier {
    /// Unconstrained integer specifier.
    pub fn int() -> Self {
        TypeSpecifier::Int { range: None }
    }

    /// Integer specifier accepting `min..=max`.
    pub fn int_range(min: i32, max: i32) -> Self {
        TypeSpecifier::Int { range: Some((min, max)) }
    }

    /// Parse received bytes into a typed value.
    ///
    /// # Errors
    ///
    /// Rejects byte lengths and values that do not fit the declared type.
    pub fn parse(&self, data: &[u8]) -> Result<PropertyValue> {
        match self {
            TypeSpecifier::Unspec => bail!("property type is unspecified"),
            TypeSpecifier::Bytes => Ok(PropertyValue::Bytes(data.to_vec())),
            TypeSpecifier::Int { range } => {
                let raw: [u8; 4] = data
                    .try_into()
                    .map_err(|_| anyhow!("integer value must be 4 bytes, got {}", data.len()))?;
                let v = i32::from_be_bytes(raw);
                check_range(*range, v)?;
                Ok(PropertyValue::Int(v))
            }
        }
    }

    /// Encode a typed value for transmission.
    ///
    /// # Errors
    ///
    /// Rejects values of the wrong variant or outside the declared range.
    pub fn encode(&self, value: &PropertyValue) -> Result<Vec<u8>> {
        match (self, value) {
            (TypeSpecifier::Unspec, _) => bail!("property type is unspecified"),
            (TypeSpecifier::Bytes, PropertyValue::Bytes(b)) => Ok(b.clone()),
            (TypeSpecifier::Int { range }, PropertyValue::Int(v)) => {
                check_range(*range, *v)?;
                Ok(v.to_be_bytes().to_vec())
            }
            _ => bail!("value variant does not match declared type"),
        }
    }

    /// Encode the specifier itself (tag byte + tag data).
    pub fn encode_type(&self) -> Vec<u8> {
        match self {
            TypeSpecifier::Unspec => vec![TYPE_UNSPEC],
            TypeSpecifier::Bytes => vec![TYPE_BYTES],
            TypeSpecifier::Int { range: None } => vec![TYPE_INT],
            TypeSpecifier::Int { range: Some((min, max)) } => {
                let mut out = vec![TYPE_INT];
                // encode() on a 4-byte array cannot exceed the segment cap.
                let bounds = seg::encode(&[min.to_be_bytes(), max.to_be_bytes()])
                    .unwrap_or_default();
                out.extend_from_slice(&bounds);
                out
            }
        }
    }

    /// Decode a specifier from its wire form.
    ///
    /// # Errors
    ///
    /// Rejects empty input, unknown tags and malformed range data.
    pub fn decode_type(data: &[u8]) -> Result<TypeSpecifier> {
        let (tag, rest) = data
            .split_first()
            .ok_or_else(|| anyhow!("empty type specifier"))?;
        match *tag {
            TYPE_UNSPEC => Ok(TypeSpecifier::Unspec),
            TYPE_BYTES => Ok(TypeSpecifier::Bytes),
            TYPE_INT => {
                if rest.is_empty() {
                    return Ok(TypeSpecifier::Int { range: None });
                }
                let [min, max] = seg::decode_exact::<2>(rest)?;
                let min = i32::from_be_bytes(
                    min.as_slice()
                        .try_into()
                        .map_err(|_| anyhow!("range bound must be 4 bytes"))?,
                );
                let max = i32::from_be_bytes(
                    max.as_slice()
                        .try_into()
                        .map_err(|_| anyhow!("range bound must be 4 bytes"))?,
                );
                Ok(TypeSpecifier::Int { range: Some((min, max)) })
            }
            other => bail!("unknown type tag: 0x{other:02x}"),
        }
    }
}

fn check_range(range: Option<(i32, i32)>, v: i32) -> Result<()> {
    if let Some((min, max)) = range {
        if v < min || v > max {
            bail!("value {v} outside declared range {min}..={max}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip() {
        let ty = TypeSpecifier::Bytes;
        let v = PropertyValue::Bytes(b"payload".to_vec());
        let encoded = ty.encode(&v).unwrap();
        assert_eq!(ty.parse(&encoded).unwrap(), v);
    }

    #[test]
    fn int_round_trip() {
        let ty = TypeSpecifier::int();
        let encoded = ty.encode(&PropertyValue::Int(-7)).unwrap();
        assert_eq!(encoded, (-7i32).to_be_bytes());
        assert_eq!(ty.parse(&encoded).unwrap(), PropertyValue::Int(-7));
    }

    #[test]
    fn int_range_accepts_inclusive_bounds() {
        let ty = TypeSpecifier::int_range(-5, 10);
        for v in [-5, 0, 10] {
            assert!(ty.encode(&PropertyValue::Int(v)).is_ok(), "{v} should encode");
            assert!(ty.parse(&v.to_be_bytes()).is_ok(), "{v} should parse");
        }
        for v in [-6, 11] {
            assert!(ty.encode(&PropertyValue::Int(v)).is_err(), "{v} should be rejected");
            assert!(ty.parse(&v.to_be_bytes()).is_err(), "{v} should be rejected");
        }
    }

    #[test]
    fn int_rejects_wrong_width() {
        let ty = TypeSpecifier::int();
        assert!(ty.parse(b"abc").is_err());
        assert!(ty.parse(b"abcde").is_err());
    }

    #[test]
    fn wrong_variant_rejected_before_wire() {
        let ty = TypeSpecifier::int();
        assert!(ty.encode(&PropertyValue::Bytes(b"nope".to_vec())).is_err());
    }

    #[test]
    fn type_tag_round_trips() {
        for ty in [
            TypeSpecifier::Unspec,
            TypeSpecifier::Bytes,
            TypeSpecifier::int(),
            TypeSpecifier::int_range(i32::MIN, i32::MAX),
        ] {
            let decoded = TypeSpecifier::decode_type(&ty.encode_type()).unwrap();
            assert_eq!(decoded, ty);
        }
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(TypeSpecifier::decode_type(&[0x7f]).is_err());
        assert!(TypeSpecifier::decode_type(&[]).is_err());
    }

    #[test]
    fn unspec_carries_no_values() {
        let ty = TypeSpecifier::Unspec;
        assert!(ty.parse(b"x").is_err());
        assert!(ty.encode(&PropertyValue::Int(1)).is_err());
    }
}
