#![allow(clippy::module_name_repetitions)]

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Length in bytes of an account address (raw Ed25519 public key).
pub const ADDRESS_LEN: usize = 32;

/// Canonical encoding/decoding errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("hex decode error: {0}")]
    FromHex(String),
    #[error("invalid length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("json error: {0}")]
    Json(String),
    #[error("merkle tree error: {0}")]
    Tree(String),
}

impl CoreError {
    fn from_hex(err: impl ToString) -> Self {
        Self::FromHex(err.to_string())
    }
}

/// Strip an optional `0x` prefix and lowercase the remaining hex digits.
pub fn normalize_hex(s: &str) -> String {
    let trimmed = s.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    body.to_ascii_lowercase()
}

/// Decode hex (with or without `0x`) into raw bytes.
pub fn decode_hex(s: &str) -> Result<Vec<u8>, CoreError> {
    hex::decode(normalize_hex(s)).map_err(CoreError::from_hex)
}

fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], CoreError> {
    let bytes = decode_hex(s)?;
    let got = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CoreError::InvalidLength { expected: N, got })
}

/// 32-byte hash wrapper used for roots and block hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    pub const ZERO: Hash32 = Hash32([0u8; 32]);

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, CoreError> {
        decode_fixed::<32>(hex_str).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Account address: the owner's raw Ed25519 public key.
///
/// Serialized as 64 lowercase hex characters. A `0x` prefix is accepted
/// when parsing and never emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        decode_fixed::<ADDRESS_LEN>(s).map(Self)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::str::FromStr for Address {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Deterministic canonical JSON bytes.
///
/// Object keys are sorted recursively and the output is compact (no
/// whitespace between tokens).
pub fn canonical_json_bytes<T: Serialize>(v: &T) -> Result<Vec<u8>, CoreError> {
    let value = serde_json::to_value(v).map_err(|e| CoreError::Json(e.to_string()))?;
    serde_json::to_vec(&sorted(value)).map_err(|e| CoreError::Json(e.to_string()))
}

/// Rebuild `value` with every object's keys in byte order, independent of
/// the map type serde_json was built with.
fn sorted(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let ordered: BTreeMap<String, Value> =
                map.into_iter().map(|(k, v)| (k, sorted(v))).collect();
            Value::Object(ordered.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}
