//! Encrypted value types understood by the fhEVM and their clear counterparts.
use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::{Display, EnumIter, EnumString};

/// Maximum number of bits a single input batch may pack.
pub const MAX_INPUT_BITS: u32 = 2048;
/// Maximum number of values in a single input batch, bounded by the one-byte
/// handle count of the input proof.
pub const MAX_INPUT_VALUES: usize = u8::MAX as usize;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum FheTypeError {
    #[error("unknown fhe type code {0}")]
    UnknownTypeCode(u8),

    #[error("unknown fhe type name {0}")]
    UnknownTypeName(String),
}

/// The encrypted types that can be used as inputs.
///
/// The string form (`"bool"`, `"uint8"`, ..., `"address"`) is what
/// callers pass when building an input dynamically.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FheType {
    Bool,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Uint128,
    Uint256,
    Address,
}

impl FheType {
    /// The type code embedded in byte 30 of a ciphertext handle.
    pub fn type_code(&self) -> u8 {
        match self {
            FheType::Bool => 0,
            FheType::Uint8 => 2,
            FheType::Uint16 => 3,
            FheType::Uint32 => 4,
            FheType::Uint64 => 5,
            FheType::Uint128 => 6,
            FheType::Address => 7,
            FheType::Uint256 => 8,
        }
    }

    pub fn from_type_code(code: u8) -> Result<Self, FheTypeError> {
        match code {
            0 => Ok(FheType::Bool),
            2 => Ok(FheType::Uint8),
            3 => Ok(FheType::Uint16),
            4 => Ok(FheType::Uint32),
            5 => Ok(FheType::Uint64),
            6 => Ok(FheType::Uint128),
            7 => Ok(FheType::Address),
            8 => Ok(FheType::Uint256),
            other => Err(FheTypeError::UnknownTypeCode(other)),
        }
    }

    /// Number of bits the value occupies in an input batch.
    /// Booleans are packed on two bits.
    pub fn packed_bits(&self) -> u32 {
        match self {
            FheType::Bool => 2,
            FheType::Uint8 => 8,
            FheType::Uint16 => 16,
            FheType::Uint32 => 32,
            FheType::Uint64 => 64,
            FheType::Uint128 => 128,
            FheType::Uint256 => 256,
            FheType::Address => 160,
        }
    }

    /// Number of bits of the clear value, `None` for booleans.
    pub fn value_bits(&self) -> Option<usize> {
        match self {
            FheType::Bool => None,
            FheType::Address => Some(160),
            other => Some(other.packed_bits() as usize),
        }
    }

    pub fn is_unsigned(&self) -> bool {
        !matches!(self, FheType::Bool | FheType::Address)
    }
}

/// A decrypted (or to-be-encrypted) clear value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ClearValue {
    Bool(bool),
    Uint(U256),
    Address(Address),
}

impl ClearValue {
    /// Interpret a raw 256-bit plaintext according to the type of its handle.
    pub fn from_raw(fhe_type: FheType, raw: U256) -> Self {
        match fhe_type {
            FheType::Bool => ClearValue::Bool(!raw.is_zero()),
            FheType::Address => {
                ClearValue::Address(Address::from_word(B256::from(raw.to_be_bytes::<32>())))
            }
            _ => ClearValue::Uint(raw),
        }
    }

    /// The raw 256-bit plaintext, as stored by a coprocessor.
    pub fn to_raw(&self) -> U256 {
        match self {
            ClearValue::Bool(b) => U256::from(*b as u8),
            ClearValue::Uint(v) => *v,
            ClearValue::Address(a) => U256::from_be_slice(a.as_slice()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ClearValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<U256> {
        match self {
            ClearValue::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_address(&self) -> Option<Address> {
        match self {
            ClearValue::Address(a) => Some(*a),
            _ => None,
        }
    }
}

impl fmt::Display for ClearValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClearValue::Bool(b) => write!(f, "{b}"),
            ClearValue::Uint(v) => write!(f, "{v}"),
            ClearValue::Address(a) => write!(f, "{}", a.to_checksum(None)),
        }
    }
}

impl From<bool> for ClearValue {
    fn from(value: bool) -> Self {
        ClearValue::Bool(value)
    }
}

impl From<u64> for ClearValue {
    fn from(value: u64) -> Self {
        ClearValue::Uint(U256::from(value))
    }
}

impl From<U256> for ClearValue {
    fn from(value: U256) -> Self {
        ClearValue::Uint(value)
    }
}

impl From<Address> for ClearValue {
    fn from(value: Address) -> Self {
        ClearValue::Address(value)
    }
}
