//! Accumulates typed clear values into one encrypted input batch.
use crate::engine::instance::SessionInstance;
use crate::error::SessionError;
use crate::relayer::{EncryptRequest, EncryptedInput, TypedValue};
use alloy_primitives::{Address, U256};
use fhevm_types::{ClearValue, FheType};
use std::str::FromStr;
use std::sync::Arc;

/// A clear value as a caller hands it over, before it is checked against
/// the type it is encrypted as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputValue {
    Bool(bool),
    Number(i128),
    Uint(U256),
    Text(String),
    Address(Address),
}

impl From<bool> for InputValue {
    fn from(value: bool) -> Self {
        InputValue::Bool(value)
    }
}

macro_rules! impl_from_number {
    ($($t:ty),*) => {
        $(impl From<$t> for InputValue {
            fn from(value: $t) -> Self {
                InputValue::Number(value as i128)
            }
        })*
    };
}

impl_from_number!(i8, i16, i32, i64, i128, u8, u16, u32, u64);

impl From<u128> for InputValue {
    fn from(value: u128) -> Self {
        InputValue::Uint(U256::from(value))
    }
}

impl From<U256> for InputValue {
    fn from(value: U256) -> Self {
        InputValue::Uint(value)
    }
}

impl From<Address> for InputValue {
    fn from(value: Address) -> Self {
        InputValue::Address(value)
    }
}

impl From<&str> for InputValue {
    fn from(value: &str) -> Self {
        InputValue::Text(value.to_string())
    }
}

impl From<String> for InputValue {
    fn from(value: String) -> Self {
        InputValue::Text(value)
    }
}

impl InputValue {
    /// Checks the value against `fhe_type` and converts it.
    pub fn to_clear(&self, fhe_type: FheType) -> Result<ClearValue, SessionError> {
        match fhe_type {
            FheType::Bool => self.to_bool().map(ClearValue::Bool),
            FheType::Address => self.to_address().map(ClearValue::Address),
            _ => self.to_uint(fhe_type).map(ClearValue::Uint),
        }
    }

    fn to_bool(&self) -> Result<bool, SessionError> {
        match self {
            InputValue::Bool(b) => Ok(*b),
            InputValue::Number(0) => Ok(false),
            InputValue::Number(1) => Ok(true),
            InputValue::Text(s) if s == "true" => Ok(true),
            InputValue::Text(s) if s == "false" => Ok(false),
            other => Err(SessionError::type_mismatch(
                FheType::Bool,
                format!("{other:?} is not a boolean"),
            )),
        }
    }

    fn to_address(&self) -> Result<Address, SessionError> {
        match self {
            InputValue::Address(a) => Ok(*a),
            InputValue::Text(s) => Address::from_str(s.trim()).map_err(|e| {
                SessionError::type_mismatch(
                    FheType::Address,
                    format!("{s:?} is not an address: {e}"),
                )
            }),
            other => Err(SessionError::type_mismatch(
                FheType::Address,
                format!("{other:?} is not an address"),
            )),
        }
    }

    fn to_uint(&self, fhe_type: FheType) -> Result<U256, SessionError> {
        let value = match self {
            InputValue::Number(n) if *n < 0 => {
                return Err(SessionError::type_mismatch(
                    fhe_type,
                    format!("{n} is negative"),
                ))
            }
            InputValue::Number(n) => U256::from(n.unsigned_abs()),
            InputValue::Uint(x) => *x,
            InputValue::Text(s) => U256::from_str(s.trim()).map_err(|e| {
                SessionError::type_mismatch(fhe_type, format!("{s:?} is not an integer: {e}"))
            })?,
            other => {
                return Err(SessionError::type_mismatch(
                    fhe_type,
                    format!("{other:?} is not an integer"),
                ))
            }
        };
        let bits = fhe_type.value_bits().unwrap_or(0);
        if value.bit_len() > bits {
            return Err(SessionError::type_mismatch(
                fhe_type,
                format!("{value} does not fit in {bits} bits"),
            ));
        }
        Ok(value)
    }
}

/// Builds one encrypted input bound to a contract and a user. Values keep
/// the order in which they are added, and so do the returned handles.
#[derive(Debug)]
pub struct EncryptRequestBuilder {
    instance: Arc<SessionInstance>,
    contract_address: Address,
    user_address: Address,
    values: Vec<TypedValue>,
}

impl EncryptRequestBuilder {
    pub(crate) fn new(
        instance: Arc<SessionInstance>,
        contract_address: Address,
        user_address: Address,
    ) -> Self {
        Self {
            instance,
            contract_address,
            user_address,
            values: Vec::new(),
        }
    }

    /// Appends a value. Nothing is appended when the value does not match `fhe_type`.
    pub fn add(
        &mut self,
        fhe_type: FheType,
        value: impl Into<InputValue>,
    ) -> Result<&mut Self, SessionError> {
        let value = value.into().to_clear(fhe_type)?;
        self.values.push(TypedValue { fhe_type, value });
        Ok(self)
    }

    pub fn add_bool(&mut self, value: bool) -> &mut Self {
        self.values.push(TypedValue {
            fhe_type: FheType::Bool,
            value: ClearValue::Bool(value),
        });
        self
    }

    pub fn add_u64(&mut self, value: u64) -> &mut Self {
        self.values.push(TypedValue {
            fhe_type: FheType::Uint64,
            value: ClearValue::from(value),
        });
        self
    }

    pub fn add_address(&mut self, value: Address) -> &mut Self {
        self.values.push(TypedValue {
            fhe_type: FheType::Address,
            value: ClearValue::Address(value),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[TypedValue] {
        &self.values
    }

    pub fn contract_address(&self) -> Address {
        self.contract_address
    }

    pub fn user_address(&self) -> Address {
        self.user_address
    }

    /// Sends the batch to the relayer. An empty batch is allowed.
    #[tracing::instrument(
        skip_all,
        fields(contract = %self.contract_address, values = self.values.len())
    )]
    pub async fn encrypt(self) -> Result<EncryptedInput, SessionError> {
        let request = EncryptRequest {
            contract_address: self.contract_address,
            user_address: self.user_address,
            values: self.values,
        };
        let input = self.instance.encrypt(request).await?;
        tracing::info!("Encrypted {} value(s)", input.handles.len());
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ChainConfig;
    use crate::relayer::{DefaultConnector, RelayerConnector};
    use crate::storage::RamStore;
    use crate::wallet::LocalWallet;
    use rstest::rstest;
    use tokio_util::sync::CancellationToken;

    async fn instance() -> Arc<SessionInstance> {
        let connector: Arc<dyn RelayerConnector> = Arc::new(DefaultConnector::default());
        Arc::new(
            SessionInstance::initialize(
                ChainConfig::hardhat(),
                Arc::new(LocalWallet::random(31337)),
                connector,
                Arc::new(RamStore::new()),
                CancellationToken::new(),
            )
            .await
            .unwrap(),
        )
    }

    #[rstest]
    #[case(FheType::Bool, InputValue::from(true), ClearValue::Bool(true))]
    #[case(FheType::Bool, InputValue::from(0u8), ClearValue::Bool(false))]
    #[case(FheType::Uint8, InputValue::from(255u8), ClearValue::from(255u64))]
    #[case(FheType::Uint64, InputValue::from("1337"), ClearValue::from(1337u64))]
    #[case(FheType::Uint16, InputValue::from("0x10"), ClearValue::from(16u64))]
    #[case(
        FheType::Uint256,
        InputValue::from(U256::MAX),
        ClearValue::Uint(U256::MAX)
    )]
    #[case(
        FheType::Address,
        InputValue::from("0x00000000000000000000000000000000000000aa"),
        ClearValue::Address(Address::with_last_byte(0xaa))
    )]
    fn accepted_values(
        #[case] fhe_type: FheType,
        #[case] value: InputValue,
        #[case] expected: ClearValue,
    ) {
        assert_eq!(value.to_clear(fhe_type).unwrap(), expected);
    }

    #[rstest]
    #[case(FheType::Uint8, InputValue::from(-1))]
    #[case(FheType::Uint8, InputValue::from(256u16))]
    #[case(FheType::Uint32, InputValue::from(true))]
    #[case(FheType::Uint64, InputValue::from("12abc"))]
    #[case(FheType::Bool, InputValue::from(2))]
    #[case(FheType::Address, InputValue::from("0x1234"))]
    #[case(FheType::Address, InputValue::from(5))]
    fn rejected_values(#[case] fhe_type: FheType, #[case] value: InputValue) {
        match value.to_clear(fhe_type) {
            Err(SessionError::TypeMismatch { fhe_type: t, .. }) => assert_eq!(t, fhe_type),
            other => panic!("expected a type mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handles_match_call_order() {
        let instance = instance().await;
        let contract = Address::repeat_byte(0xaa);
        let user = instance.user_address();
        let mut builder = instance.create_encrypted_input(contract, user);
        builder
            .add(FheType::Uint8, 5u8)
            .unwrap()
            .add(FheType::Uint8, 9u8)
            .unwrap()
            .add(FheType::Uint8, 1u8)
            .unwrap();
        assert!(builder.add(FheType::Uint8, -3).is_err());
        assert_eq!(builder.len(), 3);
        let input = builder.encrypt().await.unwrap();
        assert_eq!(input.handles.len(), 3);
        for (i, handle) in input.handles.iter().enumerate() {
            assert_eq!(handle.index() as usize, i);
        }
    }

    #[tokio::test]
    async fn typed_shortcuts_set_handle_types() {
        let instance = instance().await;
        let mut builder =
            instance.create_encrypted_input(Address::repeat_byte(1), instance.user_address());
        builder
            .add_bool(true)
            .add_u64(7)
            .add_address(Address::repeat_byte(0xcd));
        let input = builder.encrypt().await.unwrap();
        let types: Vec<FheType> = input
            .handles
            .iter()
            .map(|h| h.fhe_type().unwrap())
            .collect();
        assert_eq!(types, vec![FheType::Bool, FheType::Uint64, FheType::Address]);
    }

    #[tokio::test]
    async fn empty_batch() {
        let instance = instance().await;
        let builder =
            instance.create_encrypted_input(Address::repeat_byte(1), instance.user_address());
        assert!(builder.is_empty());
        let input = builder.encrypt().await.unwrap();
        assert!(input.handles.is_empty());
        assert!(!input.input_proof.is_empty());
    }

    #[tokio::test]
    async fn oversized_batch_is_an_encryption_error() {
        let instance = instance().await;
        let mut builder =
            instance.create_encrypted_input(Address::repeat_byte(1), instance.user_address());
        for _ in 0..33 {
            builder.add_u64(1);
        }
        assert!(matches!(
            builder.encrypt().await,
            Err(SessionError::Encryption(_))
        ));
    }
}
