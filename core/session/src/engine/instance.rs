use super::until_cancelled;
use crate::client::authorization::AuthorizationSignature;
use crate::client::encrypt::EncryptRequestBuilder;
use crate::error::SessionError;
use crate::record_error;
use crate::record_request;
use crate::registry::{ChainConfig, RelayerMode};
use crate::relayer::{
    DecryptedValues, EncryptRequest, EncryptedInput, HandleContractPair, RelayerClient,
    RelayerConnector, UserDecryptRequest,
};
use crate::storage::KeyValueStore;
use crate::wallet::WalletProvider;
use alloy_primitives::{Address, Bytes};
use observability::metrics::METRICS;
use observability::metrics_names::{
    OP_ENCRYPT, OP_FETCH_PK, OP_INITIALIZE, OP_USER_DECRYPT_INNER, TAG_CHAIN_ID, TAG_RELAYER_MODE,
};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The relayer client of one chain, together with the wallet account it
/// acts for. Immutable once built; a chain switch replaces the instance.
pub struct SessionInstance {
    chain: ChainConfig,
    client: Arc<dyn RelayerClient>,
    wallet: Arc<dyn WalletProvider>,
    store: Arc<dyn KeyValueStore>,
    user_address: Address,
    public_key: Bytes,
}

impl fmt::Debug for SessionInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInstance")
            .field("chain_id", &self.chain.chain_id)
            .field("mode", &self.chain.mode)
            .field("user_address", &self.user_address)
            .finish()
    }
}

impl SessionInstance {
    /// Discovers the wallet account, opens the relayer and fetches the
    /// chain's public key.
    ///
    /// Every suspension point observes `cancel`. A cancelled attempt returns
    /// [`SessionError::Cancelled`] and leaves nothing behind.
    #[tracing::instrument(skip_all, fields(chain_id = chain.chain_id))]
    pub async fn initialize(
        chain: ChainConfig,
        wallet: Arc<dyn WalletProvider>,
        connector: Arc<dyn RelayerConnector>,
        store: Arc<dyn KeyValueStore>,
        cancel: CancellationToken,
    ) -> Result<Self, SessionError> {
        record_request(OP_INITIALIZE);
        let _timer = METRICS
            .time_operation(OP_INITIALIZE)
            .and_then(|b| b.tag(TAG_CHAIN_ID, chain.chain_id.to_string()))
            .and_then(|b| b.tag(TAG_RELAYER_MODE, chain.mode.to_string()))
            .map(|b| b.start())
            .map_err(|e| tracing::warn!("Failed to time {OP_INITIALIZE}: {e}"))
            .ok();

        let res = Self::initialize_inner(chain, wallet, connector, store, &cancel).await;
        if let Err(e) = &res {
            record_error(OP_INITIALIZE, e);
        }
        res
    }

    async fn initialize_inner(
        chain: ChainConfig,
        wallet: Arc<dyn WalletProvider>,
        connector: Arc<dyn RelayerConnector>,
        store: Arc<dyn KeyValueStore>,
        cancel: &CancellationToken,
    ) -> Result<Self, SessionError> {
        let accounts = until_cancelled(cancel, async {
            wallet
                .request_accounts()
                .await
                .map_err(|e| SessionError::NoProvider(e.to_string()))
        })
        .await?;
        let user_address = *accounts
            .first()
            .ok_or_else(|| SessionError::NoProvider("wallet exposes no account".to_string()))?;
        let wallet_chain = until_cancelled(cancel, async {
            wallet
                .chain_id()
                .await
                .map_err(|e| SessionError::NoProvider(e.to_string()))
        })
        .await?;
        if wallet_chain != chain.chain_id {
            tracing::warn!(
                "Wallet is connected to chain {wallet_chain} while the session targets chain {}",
                chain.chain_id
            );
        }

        let client = until_cancelled(cancel, connector.connect(&chain, Arc::clone(&store))).await?;
        let public_key = until_cancelled(cancel, async {
            record_request(OP_FETCH_PK);
            client.fetch_public_key().await
        })
        .await?;
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        tracing::info!(
            "Session ready on chain {} ({} relayer) for {user_address}",
            chain.chain_id,
            chain.mode
        );
        Ok(Self {
            chain,
            client,
            wallet,
            store,
            user_address,
            public_key,
        })
    }

    pub fn chain(&self) -> &ChainConfig {
        &self.chain
    }

    pub fn chain_id(&self) -> u64 {
        self.chain.chain_id
    }

    pub fn mode(&self) -> RelayerMode {
        self.chain.mode
    }

    /// The wallet account the session acts for.
    pub fn user_address(&self) -> Address {
        self.user_address
    }

    /// The chain's FHE public key.
    pub fn public_key(&self) -> &Bytes {
        &self.public_key
    }

    pub fn relayer(&self) -> &Arc<dyn RelayerClient> {
        &self.client
    }

    pub fn wallet(&self) -> &Arc<dyn WalletProvider> {
        &self.wallet
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// A fresh accumulator bound to `contract_address` and `user_address`.
    pub fn create_encrypted_input(
        self: &Arc<Self>,
        contract_address: Address,
        user_address: Address,
    ) -> EncryptRequestBuilder {
        EncryptRequestBuilder::new(Arc::clone(self), contract_address, user_address)
    }

    pub(crate) async fn encrypt(
        &self,
        request: EncryptRequest,
    ) -> Result<EncryptedInput, SessionError> {
        record_request(OP_ENCRYPT);
        if let Err(e) = METRICS.observe_batch_size(OP_ENCRYPT, request.values.len()) {
            tracing::warn!("Failed to observe batch size of {OP_ENCRYPT}: {e}");
        }
        let _timer = METRICS
            .time_operation(OP_ENCRYPT)
            .map(|b| b.start())
            .map_err(|e| tracing::warn!("Failed to time {OP_ENCRYPT}: {e}"))
            .ok();
        let res = self.client.encrypt(request).await.map_err(|e| match e {
            SessionError::Encryption(_) | SessionError::TypeMismatch { .. } => e,
            other => SessionError::Encryption(other.to_string()),
        });
        if let Err(e) = &res {
            record_error(OP_ENCRYPT, e);
        }
        res
    }

    /// Runs one user decryption round-trip with the material of `authorization`.
    pub async fn decrypt_batch(
        &self,
        pairs: &[HandleContractPair],
        authorization: &AuthorizationSignature,
    ) -> Result<DecryptedValues, SessionError> {
        record_request(OP_USER_DECRYPT_INNER);
        if let Err(e) = METRICS.observe_batch_size(OP_USER_DECRYPT_INNER, pairs.len()) {
            tracing::warn!("Failed to observe batch size of {OP_USER_DECRYPT_INNER}: {e}");
        }
        let _timer = METRICS
            .time_operation(OP_USER_DECRYPT_INNER)
            .map(|b| b.start())
            .map_err(|e| tracing::warn!("Failed to time {OP_USER_DECRYPT_INNER}: {e}"))
            .ok();
        let request = UserDecryptRequest {
            pairs: pairs.to_vec(),
            keypair: authorization.keypair(),
            signature: authorization.signature.clone(),
            contract_addresses: authorization.contract_addresses.clone(),
            user_address: authorization.user_address,
            start_timestamp: authorization.start_timestamp,
            duration_days: authorization.duration_days,
        };
        let res = self.client.user_decrypt(request).await.map_err(|e| match e {
            SessionError::Decryption(_) => e,
            other => SessionError::Decryption(other.to_string()),
        });
        if let Err(e) = &res {
            record_error(OP_USER_DECRYPT_INNER, e);
        }
        res
    }
}
