//! The relayer capability: the remote (or mocked) service that performs
//! FHE encryption and user decryption on behalf of the client.
//!
//! Implementations are injected into a [`crate::SessionInstance`] through a
//! [`RelayerConnector`], so mock and live relayers are swapped without the
//! rest of the session knowing which one it talks to.
use crate::conf::RelayerConnConfig;
use crate::error::SessionError;
use crate::registry::{ChainConfig, RelayerMode};
use crate::storage::KeyValueStore;
use alloy_primitives::{Address, Bytes};
use async_trait::async_trait;
use fhevm_types::eip712::{decryption_domain, UserDecryptEip712};
use fhevm_types::{CiphertextHandle, ClearValue, FheType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

pub mod http;
pub mod mock;

pub use http::HttpRelayer;
pub use mock::{MockCoprocessor, MockRelayer};

/// Ephemeral keypair of the user decryption protocol. Unrelated to the wallet key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keypair {
    pub public_key: Bytes,
    pub private_key: Bytes,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = k256::SecretKey::random(&mut rand::rngs::OsRng);
        Self {
            public_key: Bytes::from(secret.public_key().to_sec1_bytes().to_vec()),
            private_key: Bytes::from(secret.to_bytes().to_vec()),
        }
    }

    /// Whether the private key is the one the public key was derived from.
    pub fn is_consistent(&self) -> bool {
        match k256::SecretKey::from_slice(&self.private_key) {
            Ok(secret) => secret.public_key().to_sec1_bytes()[..] == self.public_key[..],
            Err(_) => false,
        }
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// A value to encrypt together with the type it is encrypted as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedValue {
    #[serde(rename = "type")]
    pub fhe_type: FheType,
    pub value: ClearValue,
}

/// Handles and proof of an encrypted input batch, in the order values were added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedInput {
    pub handles: Vec<CiphertextHandle>,
    pub input_proof: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptRequest {
    pub contract_address: Address,
    pub user_address: Address,
    pub values: Vec<TypedValue>,
}

/// One handle to decrypt and the contract whose ACL grants access to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleContractPair {
    pub handle: CiphertextHandle,
    pub contract_address: Address,
}

/// Everything a relayer needs to run a user decryption.
#[derive(Debug, Clone)]
pub struct UserDecryptRequest {
    pub pairs: Vec<HandleContractPair>,
    pub keypair: Keypair,
    pub signature: Bytes,
    pub contract_addresses: Vec<Address>,
    pub user_address: Address,
    pub start_timestamp: u64,
    pub duration_days: u64,
}

pub type DecryptedValues = HashMap<CiphertextHandle, ClearValue>;

/// The operations a relayer exposes to the session.
#[async_trait]
pub trait RelayerClient: Send + Sync {
    fn chain(&self) -> &ChainConfig;

    fn mode(&self) -> RelayerMode {
        self.chain().mode
    }

    /// Fetches the FHE public key of the chain.
    async fn fetch_public_key(&self) -> Result<Bytes, SessionError>;

    /// Encrypts a batch of values bound to a contract and a user.
    async fn encrypt(&self, request: EncryptRequest) -> Result<EncryptedInput, SessionError>;

    /// Decrypts a batch of handles. Handles the relayer does not know are
    /// absent from the result.
    async fn user_decrypt(
        &self,
        request: UserDecryptRequest,
    ) -> Result<DecryptedValues, SessionError>;

    fn generate_keypair(&self) -> Keypair {
        Keypair::generate()
    }

    /// Builds the typed data a wallet signs to authorize a user decryption.
    fn create_eip712(
        &self,
        public_key: &[u8],
        contract_addresses: &[Address],
        start_timestamp: u64,
        duration_days: u64,
    ) -> UserDecryptEip712 {
        let chain = self.chain();
        UserDecryptEip712::new(
            decryption_domain(
                chain.gateway_chain_id,
                chain.verifying_contract_address_decryption,
            ),
            public_key,
            contract_addresses,
            start_timestamp,
            duration_days,
        )
    }
}

/// Opens a relayer client for a chain.
#[async_trait]
pub trait RelayerConnector: Send + Sync {
    async fn connect(
        &self,
        chain: &ChainConfig,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Arc<dyn RelayerClient>, SessionError>;
}

/// Connects to an HTTP relayer in live mode and to an in-process mock
/// otherwise. Mock coprocessors are kept per chain so that handles created
/// before a refresh can still be decrypted after it.
#[derive(Debug, Default)]
pub struct DefaultConnector {
    http: RelayerConnConfig,
    coprocessors: Mutex<HashMap<u64, Arc<MockCoprocessor>>>,
}

impl DefaultConnector {
    pub fn new(http: RelayerConnConfig) -> Self {
        Self {
            http,
            coprocessors: Mutex::new(HashMap::new()),
        }
    }

    /// The mock coprocessor of a chain, if a mock session was opened on it.
    pub async fn coprocessor(&self, chain_id: u64) -> Option<Arc<MockCoprocessor>> {
        self.coprocessors.lock().await.get(&chain_id).cloned()
    }
}

#[async_trait]
impl RelayerConnector for DefaultConnector {
    async fn connect(
        &self,
        chain: &ChainConfig,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Arc<dyn RelayerClient>, SessionError> {
        match chain.mode {
            RelayerMode::Mock => {
                let coprocessor = {
                    let mut guard = self.coprocessors.lock().await;
                    Arc::clone(
                        guard
                            .entry(chain.chain_id)
                            .or_insert_with(|| Arc::new(MockCoprocessor::new(chain.clone()))),
                    )
                };
                let relayer = MockRelayer::bootstrap(chain.clone(), coprocessor, store).await?;
                Ok(Arc::new(relayer))
            }
            RelayerMode::Live => {
                let relayer = HttpRelayer::connect(chain.clone(), &self.http).await?;
                Ok(Arc::new(relayer))
            }
        }
    }
}
