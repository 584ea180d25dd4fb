//! Ciphertext handles.
//!
//! A handle is the 32-byte on-chain reference to an encrypted value.
//! Its layout is:
//!
//! | bytes   | content                                  |
//! |---------|------------------------------------------|
//! | 0..21   | prefix of the hash of the input batch     |
//! | 21      | index of the value in its input batch    |
//! | 22..30  | big-endian chain id                      |
//! | 30      | fhe type code                            |
//! | 31      | handle version                           |
use crate::fhe_types::{FheType, FheTypeError};
use alloy_primitives::{hex, B256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub const HANDLE_LENGTH: usize = 32;
pub const HANDLE_VERSION: u8 = 0;

const HASH_PREFIX_LEN: usize = 21;
const INDEX_BYTE: usize = 21;
const CHAIN_ID_RANGE: std::ops::Range<usize> = 22..30;
const TYPE_BYTE: usize = 30;
const VERSION_BYTE: usize = 31;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum HandleError {
    #[error("Invalid handle length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid hex format in handle: {0}")]
    InvalidHexFormat(String),

    #[error(transparent)]
    FheType(#[from] FheTypeError),
}

/// An opaque reference to a ciphertext stored by the coprocessor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CiphertextHandle([u8; HANDLE_LENGTH]);

impl CiphertextHandle {
    pub fn from_bytes(bytes: [u8; HANDLE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Derives the handle of the `index`-th value of an input batch whose
    /// hash is `batch_hash`.
    pub fn derive(batch_hash: &B256, index: u8, chain_id: u64, fhe_type: FheType) -> Self {
        let mut bytes = [0u8; HANDLE_LENGTH];
        bytes[..HASH_PREFIX_LEN].copy_from_slice(&batch_hash[..HASH_PREFIX_LEN]);
        bytes[INDEX_BYTE] = index;
        bytes[CHAIN_ID_RANGE].copy_from_slice(&chain_id.to_be_bytes());
        bytes[TYPE_BYTE] = fhe_type.type_code();
        bytes[VERSION_BYTE] = HANDLE_VERSION;
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HANDLE_LENGTH] {
        &self.0
    }

    pub fn into_bytes(self) -> [u8; HANDLE_LENGTH] {
        self.0
    }

    /// Position of the value in the input batch that created it.
    pub fn index(&self) -> u8 {
        self.0[INDEX_BYTE]
    }

    pub fn chain_id(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[CHAIN_ID_RANGE]);
        u64::from_be_bytes(buf)
    }

    pub fn fhe_type(&self) -> Result<FheType, HandleError> {
        Ok(FheType::from_type_code(self.0[TYPE_BYTE])?)
    }

    pub fn version(&self) -> u8 {
        self.0[VERSION_BYTE]
    }

    /// Lowercase hex with `0x` prefix.
    pub fn to_hex(&self) -> String {
        hex::encode_prefixed(self.0)
    }
}

impl TryFrom<&[u8]> for CiphertextHandle {
    type Error = HandleError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; HANDLE_LENGTH] =
            value.try_into().map_err(|_| HandleError::InvalidLength {
                expected: HANDLE_LENGTH,
                actual: value.len(),
            })?;
        Ok(Self(bytes))
    }
}

impl From<B256> for CiphertextHandle {
    fn from(value: B256) -> Self {
        Self(value.0)
    }
}

impl From<CiphertextHandle> for B256 {
    fn from(value: CiphertextHandle) -> Self {
        B256::from(value.0)
    }
}

impl FromStr for CiphertextHandle {
    type Err = HandleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| HandleError::InvalidHexFormat(e.to_string()))?;
        Self::try_from(bytes.as_slice())
    }
}

impl fmt::Display for CiphertextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for CiphertextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CiphertextHandle({})", self.to_hex())
    }
}

impl Serialize for CiphertextHandle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CiphertextHandle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        CiphertextHandle::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::keccak256;

    #[test]
    fn derived_handle_layout() {
        let hash = keccak256(b"batch");
        let handle = CiphertextHandle::derive(&hash, 3, 31337, FheType::Uint64);
        assert_eq!(&handle.as_bytes()[..21], &hash[..21]);
        assert_eq!(handle.index(), 3);
        assert_eq!(handle.chain_id(), 31337);
        assert_eq!(handle.fhe_type().unwrap(), FheType::Uint64);
        assert_eq!(handle.version(), HANDLE_VERSION);
        assert_eq!(CiphertextHandle::from_bytes(handle.into_bytes()), handle);
    }

    #[test]
    fn hex_parsing() {
        let handle = CiphertextHandle::derive(&keccak256(b"x"), 0, 1, FheType::Bool);
        let parsed: CiphertextHandle = handle.to_string().parse().unwrap();
        assert_eq!(parsed, handle);
        // the prefix is optional
        let parsed: CiphertextHandle = handle.to_string()[2..].parse().unwrap();
        assert_eq!(parsed, handle);

        assert!(matches!(
            "0x1234".parse::<CiphertextHandle>(),
            Err(HandleError::InvalidLength {
                expected: 32,
                actual: 2
            })
        ));
        assert!(matches!(
            "0xzz".parse::<CiphertextHandle>(),
            Err(HandleError::InvalidHexFormat(_))
        ));
    }

    #[test]
    fn unknown_type_code() {
        let mut bytes = [0u8; 32];
        bytes[30] = 42;
        let handle = CiphertextHandle::from_bytes(bytes);
        assert!(matches!(
            handle.fhe_type(),
            Err(HandleError::FheType(FheTypeError::UnknownTypeCode(42)))
        ));
    }
}
