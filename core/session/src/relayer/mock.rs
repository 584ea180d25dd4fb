//! In-process stand-in for the relayer and the coprocessor behind it.
//!
//! Clear values are kept in memory next to an access list per handle. Input
//! proofs are signed by a local coprocessor key over the same EIP-712
//! attestation the real gateway checks, and user decryptions are validated
//! the way the gateway validates them: signer, validity window and access
//! rights of both the user and the contract.
use super::{
    DecryptedValues, EncryptRequest, EncryptedInput, RelayerClient, TypedValue,
    UserDecryptRequest,
};
use crate::consts::{
    MAX_DURATION_DAYS, MOCK_PUBLIC_KEY_PREFIX, MOCK_PUBLIC_PARAMS_PREFIX, SECONDS_PER_DAY,
};
use crate::error::SessionError;
use crate::now_unix;
use crate::registry::ChainConfig;
use crate::storage::KeyValueStore;
use alloy_primitives::{hex, keccak256, Address, Bytes, B256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::SolStruct;
use async_trait::async_trait;
use fhevm_types::eip712::{
    ciphertext_verification, decryption_domain, input_verification_domain, recover_signer,
    UserDecryptEip712, SIGNATURE_LENGTH,
};
use fhevm_types::fhe_types::{MAX_INPUT_BITS, MAX_INPUT_VALUES};
use fhevm_types::input_proof::InputProof;
use fhevm_types::{CiphertextHandle, ClearValue, FheType};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

const PUBLIC_KEY_LEN: usize = 256;
const PUBLIC_PARAMS_LEN: usize = 128;

#[derive(Debug, Clone)]
struct MockEntry {
    value: ClearValue,
    allowed: HashSet<Address>,
}

/// Holds the clear values and access lists of one mocked chain.
pub struct MockCoprocessor {
    chain: ChainConfig,
    signer: PrivateKeySigner,
    entries: RwLock<HashMap<CiphertextHandle, MockEntry>>,
    nonce: AtomicU64,
}

impl fmt::Debug for MockCoprocessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockCoprocessor")
            .field("chain_id", &self.chain.chain_id)
            .field("signer", &self.signer.address())
            .finish()
    }
}

impl MockCoprocessor {
    pub fn new(chain: ChainConfig) -> Self {
        Self {
            chain,
            signer: PrivateKeySigner::random(),
            entries: RwLock::new(HashMap::new()),
            nonce: AtomicU64::new(0),
        }
    }

    /// Grants `account` access to `handle`, as the ACL contract would.
    pub async fn allow(&self, handle: &CiphertextHandle, account: Address) -> bool {
        match self.entries.write().await.get_mut(handle) {
            Some(entry) => {
                entry.allowed.insert(account);
                true
            }
            None => false,
        }
    }

    pub async fn contains(&self, handle: &CiphertextHandle) -> bool {
        self.entries.read().await.contains_key(handle)
    }

    /// Number of handles stored so far.
    pub async fn handle_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Stores a batch of values and returns their handles with a signed proof.
    pub async fn store_batch(
        &self,
        contract_address: Address,
        user_address: Address,
        values: &[TypedValue],
    ) -> Result<EncryptedInput, SessionError> {
        if values.len() > MAX_INPUT_VALUES {
            return Err(SessionError::Encryption(format!(
                "batch holds {} values, at most {MAX_INPUT_VALUES} are accepted",
                values.len()
            )));
        }
        let total_bits: u32 = values.iter().map(|v| v.fhe_type.packed_bits()).sum();
        if total_bits > MAX_INPUT_BITS {
            return Err(SessionError::Encryption(format!(
                "batch packs {total_bits} bits, at most {MAX_INPUT_BITS} are accepted"
            )));
        }
        for v in values {
            check_value(v)?;
        }

        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let batch_hash = self.batch_hash(contract_address, user_address, nonce, values);
        let handles: Vec<CiphertextHandle> = values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                // at most MAX_INPUT_VALUES entries, so the index fits
                CiphertextHandle::derive(&batch_hash, i as u8, self.chain.chain_id, v.fhe_type)
            })
            .collect();

        let signature = self.sign_proof(&handles, contract_address, user_address)?;
        let input_proof = InputProof {
            handles: handles.clone(),
            signatures: vec![signature],
            extra_data: Vec::new(),
        }
        .to_bytes()?;

        {
            let mut entries = self.entries.write().await;
            for (handle, v) in handles.iter().zip(values) {
                entries.insert(
                    *handle,
                    MockEntry {
                        value: v.value,
                        allowed: HashSet::from([contract_address, user_address]),
                    },
                );
            }
        }
        tracing::debug!(
            "Mock coprocessor stored {} values for contract {contract_address} and user {user_address}",
            handles.len()
        );
        Ok(EncryptedInput {
            handles,
            input_proof: Bytes::from(input_proof),
        })
    }

    /// Checks that `proof` was issued by this coprocessor for exactly this
    /// contract and user, and returns the handles it covers.
    pub fn verify_input_proof(
        &self,
        proof: &[u8],
        contract_address: Address,
        user_address: Address,
    ) -> Result<Vec<CiphertextHandle>, SessionError> {
        let proof = InputProof::from_bytes(proof)?;
        let hash = self.proof_hash(&proof.handles, contract_address, user_address);
        for signature in &proof.signatures {
            let signer = recover_signer(signature, &hash)
                .map_err(|e| SessionError::Encryption(e.to_string()))?;
            if signer != self.signer.address() {
                return Err(SessionError::Encryption(format!(
                    "input proof was not issued for contract {contract_address} and user {user_address}"
                )));
            }
        }
        if proof.signatures.is_empty() {
            return Err(SessionError::Encryption(
                "input proof carries no signature".to_string(),
            ));
        }
        Ok(proof.handles)
    }

    /// Validates a user decryption request and returns the values the user may see.
    pub async fn user_decrypt(
        &self,
        request: &UserDecryptRequest,
        now: u64,
    ) -> Result<DecryptedValues, SessionError> {
        if request.duration_days == 0 || request.duration_days > MAX_DURATION_DAYS {
            return Err(SessionError::Decryption(format!(
                "duration of {} days is outside 1..={MAX_DURATION_DAYS}",
                request.duration_days
            )));
        }
        if now < request.start_timestamp {
            return Err(SessionError::Decryption(
                "authorization is not valid yet".to_string(),
            ));
        }
        let end = request
            .start_timestamp
            .saturating_add(request.duration_days.saturating_mul(SECONDS_PER_DAY));
        if now >= end {
            return Err(SessionError::Decryption("authorization expired".to_string()));
        }
        if !request.keypair.is_consistent() {
            return Err(SessionError::Decryption(
                "private key does not match the signed public key".to_string(),
            ));
        }

        let typed_data = self.typed_data(
            &request.keypair.public_key,
            &request.contract_addresses,
            request.start_timestamp,
            request.duration_days,
        );
        let signer = recover_signer(&request.signature, &typed_data.signing_hash())?;
        if signer != request.user_address {
            return Err(SessionError::Decryption(format!(
                "authorization was signed by {signer}, not by {}",
                request.user_address
            )));
        }

        let entries = self.entries.read().await;
        let mut res = HashMap::new();
        for pair in &request.pairs {
            if !request.contract_addresses.contains(&pair.contract_address) {
                return Err(SessionError::Decryption(format!(
                    "contract {} is not covered by the authorization",
                    pair.contract_address
                )));
            }
            let Some(entry) = entries.get(&pair.handle) else {
                tracing::debug!("Mock coprocessor does not know handle {}", pair.handle);
                continue;
            };
            for account in [request.user_address, pair.contract_address] {
                if !entry.allowed.contains(&account) {
                    return Err(SessionError::Decryption(format!(
                        "{account} is not allowed to decrypt handle {}",
                        pair.handle
                    )));
                }
            }
            res.insert(pair.handle, entry.value);
        }
        Ok(res)
    }

    fn batch_hash(
        &self,
        contract_address: Address,
        user_address: Address,
        nonce: u64,
        values: &[TypedValue],
    ) -> B256 {
        let mut buf = Vec::with_capacity(56 + values.len() * 33);
        buf.extend_from_slice(contract_address.as_slice());
        buf.extend_from_slice(user_address.as_slice());
        buf.extend_from_slice(&self.chain.chain_id.to_be_bytes());
        buf.extend_from_slice(&nonce.to_be_bytes());
        for v in values {
            buf.push(v.fhe_type.type_code());
            buf.extend_from_slice(&v.value.to_raw().to_be_bytes::<32>());
        }
        keccak256(buf)
    }

    fn proof_hash(
        &self,
        handles: &[CiphertextHandle],
        contract_address: Address,
        user_address: Address,
    ) -> B256 {
        let domain = input_verification_domain(
            self.chain.gateway_chain_id,
            self.chain.verifying_contract_address_input_verification,
        );
        ciphertext_verification(
            handles,
            user_address,
            contract_address,
            self.chain.chain_id,
            &[],
        )
        .eip712_signing_hash(&domain)
    }

    fn sign_proof(
        &self,
        handles: &[CiphertextHandle],
        contract_address: Address,
        user_address: Address,
    ) -> Result<[u8; SIGNATURE_LENGTH], SessionError> {
        let hash = self.proof_hash(handles, contract_address, user_address);
        let signature = self
            .signer
            .sign_hash_sync(&hash)
            .map_err(|e| SessionError::Encryption(e.to_string()))?;
        Ok(signature.as_bytes())
    }

    fn typed_data(
        &self,
        public_key: &[u8],
        contract_addresses: &[Address],
        start_timestamp: u64,
        duration_days: u64,
    ) -> UserDecryptEip712 {
        UserDecryptEip712::new(
            decryption_domain(
                self.chain.gateway_chain_id,
                self.chain.verifying_contract_address_decryption,
            ),
            public_key,
            contract_addresses,
            start_timestamp,
            duration_days,
        )
    }
}

/// Rejects values whose shape does not fit their declared type.
fn check_value(v: &TypedValue) -> Result<(), SessionError> {
    let fits = match (v.fhe_type, v.value) {
        (FheType::Bool, ClearValue::Bool(_)) => true,
        (FheType::Address, ClearValue::Address(_)) => true,
        (t, ClearValue::Uint(x)) if t.is_unsigned() => {
            t.value_bits().is_some_and(|bits| x.bit_len() <= bits)
        }
        _ => false,
    };
    if fits {
        Ok(())
    } else {
        Err(SessionError::Encryption(format!(
            "value {} cannot be encrypted as {}",
            v.value, v.fhe_type
        )))
    }
}

/// Relayer backed by a [`MockCoprocessor`].
#[derive(Debug)]
pub struct MockRelayer {
    chain: ChainConfig,
    coprocessor: Arc<MockCoprocessor>,
    public_key: Bytes,
    public_params: Bytes,
}

impl MockRelayer {
    /// Loads the chain's mock key material from `store`, deriving and
    /// persisting it on first use.
    #[tracing::instrument(skip_all, fields(chain_id = chain.chain_id))]
    pub async fn bootstrap(
        chain: ChainConfig,
        coprocessor: Arc<MockCoprocessor>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self, SessionError> {
        let public_key = load_or_derive(
            store.as_ref(),
            MOCK_PUBLIC_KEY_PREFIX,
            &chain,
            PUBLIC_KEY_LEN,
        )
        .await?;
        let public_params = load_or_derive(
            store.as_ref(),
            MOCK_PUBLIC_PARAMS_PREFIX,
            &chain,
            PUBLIC_PARAMS_LEN,
        )
        .await?;
        Ok(Self {
            chain,
            coprocessor,
            public_key,
            public_params,
        })
    }

    pub fn coprocessor(&self) -> &Arc<MockCoprocessor> {
        &self.coprocessor
    }

    pub fn public_params(&self) -> &Bytes {
        &self.public_params
    }
}

async fn load_or_derive(
    store: &dyn KeyValueStore,
    prefix: &str,
    chain: &ChainConfig,
    len: usize,
) -> Result<Bytes, SessionError> {
    let key = format!(
        "{prefix}:{}:{}",
        chain.chain_id, chain.acl_contract_address
    );
    if let Some(stored) = store.get_item(&key).await? {
        match hex::decode(&stored) {
            Ok(bytes) if bytes.len() == len => {
                tracing::debug!("Reusing mock key material stored under {key}");
                return Ok(Bytes::from(bytes));
            }
            _ => tracing::warn!("Ignoring malformed mock key material stored under {key}"),
        }
    }
    let material = derive_material(prefix, chain.chain_id, chain.acl_contract_address, len);
    store.set_item(&key, hex::encode(&material)).await?;
    tracing::info!("Derived mock key material for chain {}", chain.chain_id);
    Ok(Bytes::from(material))
}

/// Deterministic filler standing in for FHE key material.
fn derive_material(label: &str, chain_id: u64, acl: Address, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut counter = 0u64;
    while out.len() < len {
        let mut buf = Vec::with_capacity(label.len() + 36);
        buf.extend_from_slice(label.as_bytes());
        buf.extend_from_slice(&chain_id.to_be_bytes());
        buf.extend_from_slice(acl.as_slice());
        buf.extend_from_slice(&counter.to_be_bytes());
        out.extend_from_slice(keccak256(buf).as_slice());
        counter += 1;
    }
    out.truncate(len);
    out
}

#[async_trait]
impl RelayerClient for MockRelayer {
    fn chain(&self) -> &ChainConfig {
        &self.chain
    }

    async fn fetch_public_key(&self) -> Result<Bytes, SessionError> {
        Ok(self.public_key.clone())
    }

    async fn encrypt(&self, request: EncryptRequest) -> Result<EncryptedInput, SessionError> {
        self.coprocessor
            .store_batch(
                request.contract_address,
                request.user_address,
                &request.values,
            )
            .await
    }

    async fn user_decrypt(
        &self,
        request: UserDecryptRequest,
    ) -> Result<DecryptedValues, SessionError> {
        self.coprocessor.user_decrypt(&request, now_unix()).await
    }
}
