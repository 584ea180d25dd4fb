//! Decryption authorizations: the EIP-712 signature by which a wallet lets
//! the relayer re-encrypt values of a set of contracts for an ephemeral key.
//!
//! Signing interrupts the user, so authorizations are persisted under a key
//! that does not depend on their timestamps and reused until they expire.
use crate::conf::AuthorizationConfig;
use crate::consts::{MAX_DURATION_DAYS, SECONDS_PER_DAY};
use crate::engine::instance::SessionInstance;
use crate::error::SessionError;
use crate::relayer::{Keypair, RelayerClient};
use crate::storage::KeyValueStore;
use crate::wallet::WalletProvider;
use crate::{now_unix, record_error, record_request};
use alloy_primitives::{hex, keccak256, Address, Bytes};
use fhevm_types::eip712::{recover_signer, SIGNATURE_LENGTH};
use itertools::Itertools;
use observability::metrics::METRICS;
use observability::metrics_names::{OP_LOAD_AUTHORIZATION, OP_SIGN_AUTHORIZATION};
use serde::{Deserialize, Serialize};
use std::fmt;
use validator::{Validate, ValidationError};

/// A wallet signature allowing decryption on a sorted set of contracts for
/// a bounded time window. Never mutated; expiry means replacement.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[validate(schema(function = validate_authorization))]
pub struct AuthorizationSignature {
    pub public_key: Bytes,
    pub private_key: Bytes,
    pub signature: Bytes,
    pub user_address: Address,
    #[validate(length(min = 1))]
    pub contract_addresses: Vec<Address>,
    pub start_timestamp: u64,
    #[validate(range(min = 1, max = MAX_DURATION_DAYS))]
    pub duration_days: u64,
}

fn validate_authorization(sig: &AuthorizationSignature) -> Result<(), ValidationError> {
    if sig.public_key.is_empty() || sig.private_key.is_empty() {
        return Err(ValidationError::new("Missing Keypair")
            .with_message("The ephemeral keypair is incomplete.".into()));
    }
    if sig.signature.len() != SIGNATURE_LENGTH {
        return Err(ValidationError::new("Bad Signature").with_message(
            format!(
                "The signature has {} bytes instead of {SIGNATURE_LENGTH}.",
                sig.signature.len()
            )
            .into(),
        ));
    }
    if !sig
        .contract_addresses
        .iter()
        .tuple_windows()
        .all(|(a, b)| a < b)
    {
        return Err(ValidationError::new("Unsorted Contracts")
            .with_message("Contract addresses must be sorted and unique.".into()));
    }
    Ok(())
}

impl fmt::Debug for AuthorizationSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationSignature")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .field("signature", &self.signature)
            .field("user_address", &self.user_address)
            .field("contract_addresses", &self.contract_addresses)
            .field("start_timestamp", &self.start_timestamp)
            .field("duration_days", &self.duration_days)
            .finish()
    }
}

/// Sorts and deduplicates contract addresses.
pub fn normalize_contracts(contract_addresses: &[Address]) -> Vec<Address> {
    contract_addresses.iter().copied().sorted().dedup().collect()
}

/// Store key of the authorization for `user` on `contract_addresses`.
///
/// The key hashes the user, the EIP-712 digest of the request with both
/// timestamps set to zero, and the public key when one is imposed by the
/// caller. `contract_addresses` must already be normalized.
pub fn storage_key(
    relayer: &dyn RelayerClient,
    prefix: &str,
    user_address: Address,
    contract_addresses: &[Address],
    public_key: Option<&[u8]>,
) -> String {
    let zeroed = relayer
        .create_eip712(public_key.unwrap_or_default(), contract_addresses, 0, 0)
        .signing_hash();
    let mut buf = Vec::with_capacity(20 + 32 + public_key.map_or(0, |k| k.len()));
    buf.extend_from_slice(user_address.as_slice());
    buf.extend_from_slice(zeroed.as_slice());
    if let Some(pk) = public_key {
        buf.extend_from_slice(pk);
    }
    format!("{prefix}:{}", hex::encode(keccak256(buf)))
}

impl AuthorizationSignature {
    pub fn keypair(&self) -> Keypair {
        Keypair {
            public_key: self.public_key.clone(),
            private_key: self.private_key.clone(),
        }
    }

    /// First second at which the authorization is no longer valid.
    pub fn expires_at(&self) -> u64 {
        self.start_timestamp
            .saturating_add(self.duration_days.saturating_mul(SECONDS_PER_DAY))
    }

    pub fn is_valid_at(&self, now: u64) -> bool {
        now < self.expires_at()
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(now_unix())
    }

    pub fn authorizes(&self, contract_address: &Address) -> bool {
        self.contract_addresses
            .binary_search(contract_address)
            .is_ok()
    }

    pub fn to_json(&self) -> Result<String, SessionError> {
        serde_json::to_string(self).map_err(|e| SessionError::InvalidSignatureShape(e.to_string()))
    }

    /// Parses and checks every field. Nothing partially valid is returned.
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        let sig: Self = serde_json::from_str(json)
            .map_err(|e| SessionError::InvalidSignatureShape(e.to_string()))?;
        sig.validate()
            .map_err(|e| SessionError::InvalidSignatureShape(e.to_string()))?;
        Ok(sig)
    }

    /// Reads the authorization stored under `key`. Corrupt entries are
    /// reported as [`SessionError::InvalidSignatureShape`].
    pub async fn load(store: &dyn KeyValueStore, key: &str) -> Result<Option<Self>, SessionError> {
        match store.get_item(key).await? {
            Some(json) => Self::from_json(&json).map(Some),
            None => Ok(None),
        }
    }

    fn covers_exactly(&self, user_address: Address, contract_addresses: &[Address]) -> bool {
        self.user_address == user_address && self.contract_addresses == contract_addresses
    }

    /// Whether the ephemeral keys belong together and the signature recovers
    /// to the user over exactly the signed fields.
    fn is_authentic(&self, relayer: &dyn RelayerClient) -> bool {
        if !self.keypair().is_consistent() {
            return false;
        }
        let hash = relayer
            .create_eip712(
                &self.public_key,
                &self.contract_addresses,
                self.start_timestamp,
                self.duration_days,
            )
            .signing_hash();
        matches!(recover_signer(&self.signature, &hash), Ok(signer) if signer == self.user_address)
    }

    /// Returns a valid authorization for `contract_addresses`, prompting the
    /// wallet only when none is stored.
    ///
    /// Order and duplicates in `contract_addresses` do not matter. A corrupt
    /// or mismatching stored entry is treated as absent.
    #[tracing::instrument(
        skip_all,
        fields(chain_id = instance.chain_id(), contracts = contract_addresses.len())
    )]
    pub async fn load_or_sign(
        instance: &SessionInstance,
        contract_addresses: &[Address],
        wallet: &dyn WalletProvider,
        store: &dyn KeyValueStore,
        conf: &AuthorizationConfig,
        keypair: Option<Keypair>,
    ) -> Result<Self, SessionError> {
        let contracts = normalize_contracts(contract_addresses);
        if contracts.is_empty() {
            return Err(SessionError::Signature(
                "an authorization needs at least one contract".to_string(),
            ));
        }
        let user_address = instance.user_address();
        let relayer = instance.relayer().as_ref();
        let key = storage_key(
            relayer,
            &conf.storage_prefix,
            user_address,
            &contracts,
            keypair.as_ref().map(|k| &k.public_key[..]),
        );

        record_request(OP_LOAD_AUTHORIZATION);
        match Self::load(store, &key).await {
            Ok(Some(sig)) if !sig.covers_exactly(user_address, &contracts) => {
                tracing::warn!("Stored authorization under {key} does not match the request");
            }
            Ok(Some(sig)) if !sig.is_authentic(relayer) => {
                tracing::warn!(
                    "Discarding stored authorization {key}: keys or signature do not check out"
                );
            }
            Ok(Some(sig)) if sig.is_valid() => {
                tracing::info!("Reusing stored authorization {key}");
                if let Err(e) = METRICS.increment_cache_hit_counter(OP_LOAD_AUTHORIZATION) {
                    tracing::warn!("Failed to increment cache hit counter: {e}");
                }
                return Ok(sig);
            }
            Ok(Some(sig)) => {
                tracing::info!(
                    "Stored authorization {key} expired at {}",
                    sig.expires_at()
                );
            }
            Ok(None) => tracing::debug!("No stored authorization under {key}"),
            Err(e @ SessionError::InvalidSignatureShape(_)) => {
                tracing::warn!("Discarding stored authorization {key}: {e}");
            }
            Err(e) => {
                record_error(OP_LOAD_AUTHORIZATION, &e);
                return Err(e);
            }
        }

        let res = Self::sign(instance, &contracts, wallet, conf, keypair).await;
        let sig = match res {
            Ok(sig) => sig,
            Err(e) => {
                record_error(OP_SIGN_AUTHORIZATION, &e);
                return Err(e);
            }
        };
        match sig.to_json() {
            Ok(json) => {
                if let Err(e) = store.set_item(&key, json).await {
                    tracing::warn!("Could not persist authorization {key}: {e}");
                }
            }
            Err(e) => tracing::warn!("Could not serialize authorization {key}: {e}"),
        }
        Ok(sig)
    }

    async fn sign(
        instance: &SessionInstance,
        contracts: &[Address],
        wallet: &dyn WalletProvider,
        conf: &AuthorizationConfig,
        keypair: Option<Keypair>,
    ) -> Result<Self, SessionError> {
        record_request(OP_SIGN_AUTHORIZATION);
        let _timer = METRICS
            .time_operation(OP_SIGN_AUTHORIZATION)
            .map(|b| b.start())
            .map_err(|e| tracing::warn!("Failed to time {OP_SIGN_AUTHORIZATION}: {e}"))
            .ok();
        let relayer = instance.relayer();
        let keypair = keypair.unwrap_or_else(|| relayer.generate_keypair());
        let start_timestamp = now_unix();
        let typed_data = relayer.create_eip712(
            &keypair.public_key,
            contracts,
            start_timestamp,
            conf.duration_days,
        );

        if let Err(e) = METRICS.increment_wallet_prompt_counter(instance.chain_id()) {
            tracing::warn!("Failed to increment wallet prompt counter: {e}");
        }
        tracing::info!(
            "Requesting a decryption authorization for {} contract(s) from {}",
            contracts.len(),
            instance.user_address()
        );
        let signature = wallet
            .sign_typed_data(instance.user_address(), &typed_data)
            .await
            .map_err(|e| match e {
                SessionError::Signature(_) => e,
                other => SessionError::Signature(other.to_string()),
            })?;

        let sig = Self {
            public_key: keypair.public_key,
            private_key: keypair.private_key,
            signature: Bytes::from(signature),
            user_address: instance.user_address(),
            contract_addresses: contracts.to_vec(),
            start_timestamp,
            duration_days: conf.duration_days,
        };
        sig.validate().map_err(|e| {
            SessionError::Signature(format!("wallet returned an unusable signature: {e}"))
        })?;
        Ok(sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ChainConfig;
    use crate::relayer::DefaultConnector;
    use crate::storage::RamStore;
    use crate::wallet::LocalWallet;
    use rstest::rstest;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    const A: Address = Address::new([0xaa; 20]);
    const B: Address = Address::new([0xbb; 20]);

    async fn load_or_sign(
        instance: &SessionInstance,
        contracts: &[Address],
        wallet: &LocalWallet,
        store: &RamStore,
        conf: &AuthorizationConfig,
    ) -> Result<AuthorizationSignature, SessionError> {
        AuthorizationSignature::load_or_sign(instance, contracts, wallet, store, conf, None).await
    }

    async fn setup() -> (SessionInstance, Arc<LocalWallet>, RamStore) {
        let wallet = Arc::new(LocalWallet::random(31337));
        let instance = SessionInstance::initialize(
            ChainConfig::hardhat(),
            wallet.clone(),
            Arc::new(DefaultConnector::default()),
            Arc::new(RamStore::new()),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        (instance, wallet, RamStore::new())
    }

    fn sample(start_timestamp: u64, duration_days: u64) -> AuthorizationSignature {
        let keypair = Keypair::generate();
        AuthorizationSignature {
            public_key: keypair.public_key,
            private_key: keypair.private_key,
            signature: Bytes::from(vec![7u8; SIGNATURE_LENGTH]),
            user_address: Address::repeat_byte(0x11),
            contract_addresses: vec![A, B],
            start_timestamp,
            duration_days,
        }
    }

    #[rstest]
    #[case(1)]
    #[case(7)]
    #[case(365)]
    fn expiry_boundary(#[case] days: u64) {
        let t0 = 1_700_000_000;
        let sig = sample(t0, days);
        assert!(sig.is_valid_at(t0));
        assert!(sig.is_valid_at(t0 + days * SECONDS_PER_DAY - 1));
        assert!(!sig.is_valid_at(t0 + days * SECONDS_PER_DAY));
        assert!(!sig.is_valid_at(u64::MAX));
    }

    #[test]
    fn json_round_trip() {
        let sig = sample(1_700_000_000, 1);
        let json = sig.to_json().unwrap();
        assert!(json.contains("\"contractAddresses\""));
        let back = AuthorizationSignature::from_json(&json).unwrap();
        assert_eq!(back, sig);
        assert_eq!(back.is_valid(), sig.is_valid());
        assert!(back.authorizes(&A));
        assert!(!back.authorizes(&Address::ZERO));
    }

    #[rstest]
    #[case::not_json("not json")]
    #[case::missing_field(r#"{"publicKey":"0x01"}"#)]
    #[case::unknown_field("unknown")]
    #[case::short_signature("short")]
    #[case::unsorted("unsorted")]
    #[case::zero_duration("zero")]
    #[case::wrong_type("type")]
    fn malformed_json_is_rejected(#[case] variant: &str) {
        let valid = serde_json::to_value(sample(1_700_000_000, 1)).unwrap();
        let json = match variant {
            "unknown" => {
                let mut v = valid.clone();
                v["extra"] = serde_json::json!(1);
                v.to_string()
            }
            "short" => {
                let mut v = valid.clone();
                v["signature"] = serde_json::json!("0x0102");
                v.to_string()
            }
            "unsorted" => {
                let mut v = valid.clone();
                v["contractAddresses"] = serde_json::json!([B, A]);
                v.to_string()
            }
            "zero" => {
                let mut v = valid.clone();
                v["durationDays"] = serde_json::json!(0);
                v.to_string()
            }
            "type" => {
                let mut v = valid.clone();
                v["startTimestamp"] = serde_json::json!("yesterday");
                v.to_string()
            }
            other => other.to_string(),
        };
        assert!(matches!(
            AuthorizationSignature::from_json(&json),
            Err(SessionError::InvalidSignatureShape(_))
        ));
    }

    #[tokio::test]
    async fn key_ignores_order_and_depends_on_public_key() {
        let (instance, _, _) = setup().await;
        let relayer = instance.relayer().as_ref();
        let user = instance.user_address();
        let ab = storage_key(relayer, "p", user, &normalize_contracts(&[A, B]), None);
        let ba = storage_key(relayer, "p", user, &normalize_contracts(&[B, A, B]), None);
        assert_eq!(ab, ba);
        assert!(ab.starts_with("p:"));
        let with_pk = storage_key(relayer, "p", user, &[A, B], Some(&[1, 2, 3]));
        assert_ne!(ab, with_pk);
        let other_user = storage_key(relayer, "p", Address::ZERO, &[A, B], None);
        assert_ne!(ab, other_user);
    }

    #[tokio::test]
    async fn one_prompt_for_repeated_requests() {
        let (instance, wallet, store) = setup().await;
        let conf = AuthorizationConfig::default();
        let first = load_or_sign(&instance, &[A, B], &wallet, &store, &conf).await.unwrap();
        let second = load_or_sign(&instance, &[B, A], &wallet, &store, &conf).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(wallet.prompt_count(), 1);
        assert_eq!(first.contract_addresses, vec![A, B]);
        assert_eq!(first.duration_days, 1);
        assert!(first.is_valid());
        assert_eq!(store.len().await, 1);

        // a different set is a different authorization
        load_or_sign(&instance, &[A], &wallet, &store, &conf).await.unwrap();
        assert_eq!(wallet.prompt_count(), 2);
    }

    #[tokio::test]
    async fn expired_or_corrupt_entries_are_replaced() {
        let (instance, wallet, store) = setup().await;
        let conf = AuthorizationConfig {
            duration_days: 7,
            ..Default::default()
        };
        let sig = load_or_sign(&instance, &[A], &wallet, &store, &conf).await.unwrap();
        assert_eq!(sig.duration_days, 7);
        let key = storage_key(
            instance.relayer().as_ref(),
            &conf.storage_prefix,
            instance.user_address(),
            &[A],
            None,
        );

        let mut expired = sig.clone();
        expired.start_timestamp = 0;
        store.set_item(&key, expired.to_json().unwrap()).await.unwrap();
        let renewed = load_or_sign(&instance, &[A], &wallet, &store, &conf).await.unwrap();
        assert!(renewed.is_valid());
        assert_eq!(wallet.prompt_count(), 2);

        store.set_item(&key, "{\"garbage\":true}".to_string()).await.unwrap();
        let renewed = load_or_sign(&instance, &[A], &wallet, &store, &conf).await.unwrap();
        assert_eq!(wallet.prompt_count(), 3);
        let stored = AuthorizationSignature::load(&store, &key).await.unwrap().unwrap();
        assert_eq!(stored, renewed);
    }

    #[tokio::test]
    async fn tampered_entries_are_signed_again() {
        let (instance, wallet, store) = setup().await;
        let conf = AuthorizationConfig::default();
        let sig = load_or_sign(&instance, &[A, B], &wallet, &store, &conf).await.unwrap();
        assert!(sig.is_authentic(instance.relayer().as_ref()));
        let key = storage_key(
            instance.relayer().as_ref(),
            &conf.storage_prefix,
            instance.user_address(),
            &[A, B],
            None,
        );

        // private key no longer matches the signed public key
        let mut swapped = sig.clone();
        swapped.private_key = Keypair::generate().private_key;
        store.set_item(&key, swapped.to_json().unwrap()).await.unwrap();
        let renewed = load_or_sign(&instance, &[A, B], &wallet, &store, &conf).await.unwrap();
        assert_eq!(wallet.prompt_count(), 2);
        assert!(renewed.keypair().is_consistent());

        // signature no longer covers the stored fields
        let mut shifted = renewed.clone();
        shifted.start_timestamp += 1;
        store.set_item(&key, shifted.to_json().unwrap()).await.unwrap();
        let renewed = load_or_sign(&instance, &[A, B], &wallet, &store, &conf).await.unwrap();
        assert_eq!(wallet.prompt_count(), 3);
        assert!(renewed.is_authentic(instance.relayer().as_ref()));
        let stored = AuthorizationSignature::load(&store, &key).await.unwrap().unwrap();
        assert_eq!(stored, renewed);

        // a sound entry is still reused
        load_or_sign(&instance, &[A, B], &wallet, &store, &conf).await.unwrap();
        assert_eq!(wallet.prompt_count(), 3);
    }

    #[tokio::test]
    async fn supplied_keypair_is_used() {
        let (instance, wallet, store) = setup().await;
        let keypair = Keypair::generate();
        let sig = AuthorizationSignature::load_or_sign(
            &instance,
            &[A],
            wallet.as_ref(),
            &store,
            &AuthorizationConfig::default(),
            Some(keypair.clone()),
        )
        .await
        .unwrap();
        assert_eq!(sig.keypair(), keypair);
    }

    #[tokio::test]
    async fn wallet_rejection_is_a_signature_error() {
        let (instance, wallet, store) = setup().await;
        wallet.set_rejecting(true);
        let res = AuthorizationSignature::load_or_sign(
            &instance,
            &[A],
            wallet.as_ref(),
            &store,
            &AuthorizationConfig::default(),
            None,
        )
        .await;
        assert!(matches!(res, Err(SessionError::Signature(_))));
        assert!(store.is_empty().await);
    }
}
