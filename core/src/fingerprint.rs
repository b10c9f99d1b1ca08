use std::fmt::{self, Debug, Display};

use miette::Diagnostic;
use serde::{
    ser::{
        self, SerializeMap, SerializeSeq, SerializeStruct, SerializeStructVariant, SerializeTuple,
        SerializeTupleStruct, SerializeTupleVariant,
    },
    Serialize,
};
use thiserror::Error;

/// Structural digest of an argument tuple.
///
/// Two argument values that serialize to the same structure always produce the
/// same fingerprint. Maps are compared by content, not by iteration order;
/// sequences are compared element by element, in order. Integers are compared
/// by value regardless of their width.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

#[derive(Debug, Error, Diagnostic)]
pub enum FingerprintError {
    #[error("Non-finite float {0} cannot be fingerprinted")]
    #[diagnostic(
        code(async_resource::fingerprint::non_finite),
        help("NaN and infinities have no stable identity as cache keys, pass finite values")
    )]
    NonFinite(f64),
    #[error("Arguments cannot be fingerprinted: {0}")]
    #[diagnostic(code(async_resource::fingerprint::unserializable))]
    Custom(String),
}

impl ser::Error for FingerprintError {
    fn custom<T: Display>(msg: T) -> Self {
        Self::Custom(msg.to_string())
    }
}

impl Fingerprint {
    /// Domain separation prefix for the digest.
    const DOMAIN_SEP: &'static [u8] = b"async-resource:args:v2";

    pub fn of<A: Serialize + ?Sized>(args: &A) -> Result<Self, FingerprintError> {
        let encoded = encode(args)?;

        let mut hasher = blake3::Hasher::new();
        hasher.update(Self::DOMAIN_SEP);
        hasher.update(&encoded);

        Ok(Self(*hasher.finalize().as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", blake3::Hash::from(self.0).to_hex())
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first 8 bytes are plenty to tell keys apart in logs
        let hex = blake3::Hash::from(self.0).to_hex();
        write!(f, "Fingerprint({})", &hex[..16])
    }
}

// Every node starts with a tag and is self-delimiting, so distinct trees
// can't produce the same byte stream.
mod tag {
    pub const UNIT: u8 = 0;
    pub const FALSE: u8 = 1;
    pub const TRUE: u8 = 2;
    pub const INT: u8 = 3;
    pub const NEG_INT: u8 = 4;
    pub const FLOAT: u8 = 5;
    pub const STR: u8 = 6;
    pub const NONE: u8 = 7;
    pub const SOME: u8 = 8;
    pub const UNIT_STRUCT: u8 = 9;
    pub const VARIANT: u8 = 10;
    pub const SEQ: u8 = 11;
    pub const END: u8 = 12;
    pub const MAP: u8 = 13;
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, FingerprintError> {
    let mut buf = Vec::new();
    value.serialize(Encoder { out: &mut buf })?;
    Ok(buf)
}

fn put_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&(len as u64).to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.push(tag::STR);
    put_len(out, s.len());
    out.extend_from_slice(s.as_bytes());
}

struct Encoder<'a> {
    out: &'a mut Vec<u8>,
}

impl<'a> Encoder<'a> {
    fn uint(self, v: u128) -> Result<(), FingerprintError> {
        self.out.push(tag::INT);
        self.out.extend_from_slice(&v.to_le_bytes());
        Ok(())
    }

    fn int(self, v: i128) -> Result<(), FingerprintError> {
        match u128::try_from(v) {
            Ok(v) => self.uint(v),
            Err(_) => {
                self.out.push(tag::NEG_INT);
                self.out.extend_from_slice(&v.unsigned_abs().to_le_bytes());
                Ok(())
            }
        }
    }

    /// Writes the variant header, the payload follows.
    fn variant(self, name: &str) -> Self {
        self.out.push(tag::VARIANT);
        put_str(self.out, name);
        self
    }

    fn seq(self) -> SeqEncoder<'a> {
        self.out.push(tag::SEQ);
        SeqEncoder { out: self.out }
    }

    fn map(self, len: usize) -> MapEncoder<'a> {
        MapEncoder {
            out: self.out,
            entries: Vec::with_capacity(len),
            key: None,
        }
    }
}

impl<'a> ser::Serializer for Encoder<'a> {
    type Ok = ();
    type Error = FingerprintError;

    type SerializeSeq = SeqEncoder<'a>;
    type SerializeTuple = SeqEncoder<'a>;
    type SerializeTupleStruct = SeqEncoder<'a>;
    type SerializeTupleVariant = SeqEncoder<'a>;
    type SerializeMap = MapEncoder<'a>;
    type SerializeStruct = MapEncoder<'a>;
    type SerializeStructVariant = MapEncoder<'a>;

    fn serialize_bool(self, v: bool) -> Result<(), FingerprintError> {
        self.out.push(if v { tag::TRUE } else { tag::FALSE });
        Ok(())
    }

    fn serialize_i8(self, v: i8) -> Result<(), FingerprintError> {
        self.int(v.into())
    }

    fn serialize_i16(self, v: i16) -> Result<(), FingerprintError> {
        self.int(v.into())
    }

    fn serialize_i32(self, v: i32) -> Result<(), FingerprintError> {
        self.int(v.into())
    }

    fn serialize_i64(self, v: i64) -> Result<(), FingerprintError> {
        self.int(v.into())
    }

    fn serialize_i128(self, v: i128) -> Result<(), FingerprintError> {
        self.int(v)
    }

    fn serialize_u8(self, v: u8) -> Result<(), FingerprintError> {
        self.uint(v.into())
    }

    fn serialize_u16(self, v: u16) -> Result<(), FingerprintError> {
        self.uint(v.into())
    }

    fn serialize_u32(self, v: u32) -> Result<(), FingerprintError> {
        self.uint(v.into())
    }

    fn serialize_u64(self, v: u64) -> Result<(), FingerprintError> {
        self.uint(v.into())
    }

    fn serialize_u128(self, v: u128) -> Result<(), FingerprintError> {
        self.uint(v)
    }

    fn serialize_f32(self, v: f32) -> Result<(), FingerprintError> {
        self.serialize_f64(v.into())
    }

    fn serialize_f64(self, v: f64) -> Result<(), FingerprintError> {
        if !v.is_finite() {
            return Err(FingerprintError::NonFinite(v));
        }
        // -0.0 and 0.0 compare equal, so they must share a key
        let v = if v == 0.0 { 0.0 } else { v };

        self.out.push(tag::FLOAT);
        self.out.extend_from_slice(&v.to_bits().to_le_bytes());
        Ok(())
    }

    fn serialize_char(self, v: char) -> Result<(), FingerprintError> {
        self.serialize_str(v.encode_utf8(&mut [0; 4]))
    }

    fn serialize_str(self, v: &str) -> Result<(), FingerprintError> {
        put_str(self.out, v);
        Ok(())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<(), FingerprintError> {
        let mut seq = self.seq();
        for byte in v {
            seq.element(byte)?;
        }
        seq.finish()
    }

    fn serialize_none(self) -> Result<(), FingerprintError> {
        self.out.push(tag::NONE);
        Ok(())
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<(), FingerprintError> {
        self.out.push(tag::SOME);
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), FingerprintError> {
        self.out.push(tag::UNIT);
        Ok(())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), FingerprintError> {
        self.out.push(tag::UNIT_STRUCT);
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<(), FingerprintError> {
        self.variant(variant).serialize_unit()
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<(), FingerprintError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<(), FingerprintError> {
        value.serialize(self.variant(variant))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<SeqEncoder<'a>, FingerprintError> {
        Ok(self.seq())
    }

    fn serialize_tuple(self, _len: usize) -> Result<SeqEncoder<'a>, FingerprintError> {
        Ok(self.seq())
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<SeqEncoder<'a>, FingerprintError> {
        Ok(self.seq())
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<SeqEncoder<'a>, FingerprintError> {
        Ok(self.variant(variant).seq())
    }

    fn serialize_map(self, len: Option<usize>) -> Result<MapEncoder<'a>, FingerprintError> {
        Ok(self.map(len.unwrap_or(0)))
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<MapEncoder<'a>, FingerprintError> {
        Ok(self.map(len))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<MapEncoder<'a>, FingerprintError> {
        Ok(self.variant(variant).map(len))
    }
}

struct SeqEncoder<'a> {
    out: &'a mut Vec<u8>,
}

impl SeqEncoder<'_> {
    fn element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), FingerprintError> {
        value.serialize(Encoder {
            out: &mut *self.out,
        })
    }

    fn finish(self) -> Result<(), FingerprintError> {
        self.out.push(tag::END);
        Ok(())
    }
}

impl SerializeSeq for SeqEncoder<'_> {
    type Ok = ();
    type Error = FingerprintError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), FingerprintError> {
        self.element(value)
    }

    fn end(self) -> Result<(), FingerprintError> {
        self.finish()
    }
}

impl SerializeTuple for SeqEncoder<'_> {
    type Ok = ();
    type Error = FingerprintError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), FingerprintError> {
        self.element(value)
    }

    fn end(self) -> Result<(), FingerprintError> {
        self.finish()
    }
}

impl SerializeTupleStruct for SeqEncoder<'_> {
    type Ok = ();
    type Error = FingerprintError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), FingerprintError> {
        self.element(value)
    }

    fn end(self) -> Result<(), FingerprintError> {
        self.finish()
    }
}

impl SerializeTupleVariant for SeqEncoder<'_> {
    type Ok = ();
    type Error = FingerprintError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), FingerprintError> {
        self.element(value)
    }

    fn end(self) -> Result<(), FingerprintError> {
        self.finish()
    }
}

/// Buffers encoded entries so they can be written out sorted by key.
struct MapEncoder<'a> {
    out: &'a mut Vec<u8>,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    key: Option<Vec<u8>>,
}

impl MapEncoder<'_> {
    fn entry<K, V>(&mut self, key: &K, value: &V) -> Result<(), FingerprintError>
    where
        K: ?Sized + Serialize,
        V: ?Sized + Serialize,
    {
        self.entries.push((encode(key)?, encode(value)?));
        Ok(())
    }

    fn finish(mut self) -> Result<(), FingerprintError> {
        if self.key.is_some() {
            return Err(FingerprintError::Custom("map key without a value".to_string()));
        }

        self.entries.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));

        self.out.push(tag::MAP);
        put_len(self.out, self.entries.len());
        for (key, value) in &self.entries {
            self.out.extend_from_slice(key);
            self.out.extend_from_slice(value);
        }
        Ok(())
    }
}

impl SerializeMap for MapEncoder<'_> {
    type Ok = ();
    type Error = FingerprintError;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), FingerprintError> {
        self.key = Some(encode(key)?);
        Ok(())
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), FingerprintError> {
        let key = self
            .key
            .take()
            .ok_or_else(|| FingerprintError::Custom("map value without a key".to_string()))?;
        self.entries.push((key, encode(value)?));
        Ok(())
    }

    fn end(self) -> Result<(), FingerprintError> {
        self.finish()
    }
}

// Field names are encoded like string keys, so a struct matches the
// equivalent string-keyed map.
impl SerializeStruct for MapEncoder<'_> {
    type Ok = ();
    type Error = FingerprintError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), FingerprintError> {
        self.entry(key, value)
    }

    fn end(self) -> Result<(), FingerprintError> {
        self.finish()
    }
}

impl SerializeStructVariant for MapEncoder<'_> {
    type Ok = ();
    type Error = FingerprintError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), FingerprintError> {
        self.entry(key, value)
    }

    fn end(self) -> Result<(), FingerprintError> {
        self.finish()
    }
}
