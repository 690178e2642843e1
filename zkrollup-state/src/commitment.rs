//! Commitment primitive.
//!
//! A [`Commitment`] is a 32-byte BLAKE3 digest. Records that take part in a
//! commitment declare their fields, in order, through [`CanonicalFields`];
//! the resulting byte stream is what gets hashed (and, for transactions,
//! what gets signed).

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Domain tag for accumulator leaves.
pub const LEAF_DOMAIN: &[u8] = b"zkrollup_leaf_v1";
/// Domain tag for accumulator internal nodes.
pub const NODE_DOMAIN: &[u8] = b"zkrollup_node_v1";
/// Domain tag for pending deposit stack links.
pub const STACK_DOMAIN: &[u8] = b"zkrollup_stack_v1";
/// Domain tag for witness commitments.
pub const WITNESS_DOMAIN: &[u8] = b"zkrollup_witness_v1";

/// A digest binding to the content of some structure.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Commitment([u8; 32]);

impl Commitment {
    /// The empty commitment (empty stack, empty leaf).
    pub const ZERO: Commitment = Commitment([0u8; 32]);

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Hash a canonical record under a domain tag.
    pub fn of<T: CanonicalFields + ?Sized>(domain: &[u8], value: &T) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(domain);
        hasher.update(&value.to_field_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Hash two child commitments into a parent node.
    pub fn node(left: &Commitment, right: &Commitment) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(NODE_DOMAIN);
        hasher.update(&left.0);
        hasher.update(&right.0);
        Self(*hasher.finalize().as_bytes())
    }

    /// Parse `0x`-prefixed (or bare) hex.
    pub fn from_hex(s: &str) -> Result<Self, String> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        if s.len() != 64 {
            return Err(format!("expected 64 hex chars, got {}", s.len()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| e.to_string())?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Commitment(0x{})", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Commitment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Commitment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Commitment::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl CanonicalFields for Commitment {
    fn write_fields(&self, out: &mut FieldEncoder) {
        out.bytes32(&self.0);
    }
}

/// Order-declared field list of a record.
///
/// Implementors write every field, in declaration order, into the encoder.
/// Two values with equal fields always produce equal bytes.
pub trait CanonicalFields {
    fn write_fields(&self, out: &mut FieldEncoder);

    fn to_field_bytes(&self) -> Vec<u8> {
        let mut encoder = FieldEncoder::default();
        self.write_fields(&mut encoder);
        encoder.finish()
    }
}

/// Fixed-width little-endian field writer.
#[derive(Debug, Default)]
pub struct FieldEncoder {
    buf: Vec<u8>,
}

impl FieldEncoder {
    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn bytes32(&mut self, value: &[u8; 32]) -> &mut Self {
        self.buf.extend_from_slice(value);
        self
    }

    /// Raw bytes of a fixed-size value (no length prefix).
    pub fn raw(&mut self, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(value);
        self
    }

    pub fn field<T: CanonicalFields + ?Sized>(&mut self, value: &T) -> &mut Self {
        value.write_fields(self);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
