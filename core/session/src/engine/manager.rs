//! Owner of the single active session.
//!
//! The manager holds at most one [`SessionInstance`] at a time. Initializing
//! a different chain aborts any attempt still in flight; only the most
//! recently requested attempt may publish its result.
use crate::client::decrypt::{DecryptRequestCoordinator, HandleContractPair};
use crate::client::encrypt::{EncryptRequestBuilder, InputValue};
use crate::conf::{AuthorizationConfig, SessionConfig};
use crate::consts::DEFAULT_ENCRYPT_TYPE;
use crate::engine::instance::SessionInstance;
use crate::error::SessionError;
use crate::record_error;
use crate::record_request;
use crate::registry::{ChainConfig, ChainRegistry};
use crate::relayer::{DecryptedValues, DefaultConnector, EncryptedInput, RelayerConnector};
use crate::storage::KeyValueStore;
use crate::wallet::WalletProvider;
use alloy_primitives::{Address, Bytes};
use fhevm_types::{CiphertextHandle, ClearValue, FheType};
use futures::future::{BoxFuture, FutureExt, Shared};
use observability::metrics_names::{OP_DISCONNECT, OP_INITIALIZE, OP_REFRESH};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use strum_macros::{Display, EnumIs};
use tokio_util::sync::CancellationToken;

type InitAttempt = Shared<BoxFuture<'static, Result<Arc<SessionInstance>, SessionError>>>;

/// Externally visible state of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumIs)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Initializing,
    Ready,
    Error,
}

enum Slot {
    Idle,
    Initializing {
        chain_id: u64,
        cancel: CancellationToken,
        attempt: InitAttempt,
    },
    Ready(Arc<SessionInstance>),
    Error {
        chain_id: u64,
        error: SessionError,
    },
}

struct SlotState {
    /// Bumped whenever the slot is handed to a new attempt or reset.
    generation: u64,
    slot: Slot,
}

impl SlotState {
    /// Cancels the attempt in flight, if any, and claims the slot.
    fn supersede(&mut self) -> u64 {
        if let Slot::Initializing {
            chain_id, cancel, ..
        } = &self.slot
        {
            tracing::info!("Aborting the initialization of chain {chain_id}");
            cancel.cancel();
        }
        self.generation += 1;
        self.generation
    }
}

enum Next {
    Reuse(Arc<SessionInstance>),
    Join(InitAttempt),
    Start,
}

/// Entry point of the library: opens a session on a chain and serves
/// encryption and decryption requests against it.
pub struct SessionManager {
    registry: ChainRegistry,
    connector: Arc<dyn RelayerConnector>,
    store: Arc<dyn KeyValueStore>,
    state: Arc<Mutex<SlotState>>,
    decryptor: DecryptRequestCoordinator,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("chains", &self.registry.chain_ids().collect::<Vec<_>>())
            .field("status", &self.status())
            .finish()
    }
}

fn lock(state: &Mutex<SlotState>) -> MutexGuard<'_, SlotState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionManager {
    pub fn new(
        registry: ChainRegistry,
        connector: Arc<dyn RelayerConnector>,
        store: Arc<dyn KeyValueStore>,
        authorization: AuthorizationConfig,
    ) -> Self {
        Self {
            registry,
            connector,
            store,
            state: Arc::new(Mutex::new(SlotState {
                generation: 0,
                slot: Slot::Idle,
            })),
            decryptor: DecryptRequestCoordinator::new(authorization),
        }
    }

    /// Builds a manager whose relayers are opened by a [`DefaultConnector`].
    pub fn from_config(
        conf: &SessionConfig,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self, SessionError> {
        Ok(Self::new(
            conf.registry()?,
            Arc::new(DefaultConnector::new(conf.relayer.clone())),
            store,
            conf.authorization.clone(),
        ))
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.registry
    }

    /// Opens a session on `chain_id`.
    ///
    /// A no-op when a session on that chain is already ready, and joins the
    /// attempt in flight when one targets the same chain. Any other attempt
    /// is cancelled and its callers receive [`SessionError::Cancelled`].
    pub async fn initialize(
        &self,
        chain_id: u64,
        wallet: Arc<dyn WalletProvider>,
    ) -> Result<Arc<SessionInstance>, SessionError> {
        self.start(chain_id, wallet, false).await
    }

    /// Rebuilds the session on `chain_id` even if one is ready, for example
    /// after the wallet switched accounts.
    pub async fn refresh(
        &self,
        chain_id: u64,
        wallet: Arc<dyn WalletProvider>,
    ) -> Result<Arc<SessionInstance>, SessionError> {
        record_request(OP_REFRESH);
        let res = self.start(chain_id, wallet, true).await;
        if let Err(e) = &res {
            record_error(OP_REFRESH, e);
        }
        res
    }

    async fn start(
        &self,
        chain_id: u64,
        wallet: Arc<dyn WalletProvider>,
        force: bool,
    ) -> Result<Arc<SessionInstance>, SessionError> {
        let chain = match self.registry.lookup(chain_id) {
            Ok(chain) => chain.clone(),
            Err(error) => {
                {
                    let mut state = lock(&self.state);
                    state.supersede();
                    state.slot = Slot::Error {
                        chain_id,
                        error: error.clone(),
                    };
                }
                record_error(OP_INITIALIZE, &error);
                return Err(error);
            }
        };

        let attempt = {
            let mut state = lock(&self.state);
            let next = match &state.slot {
                Slot::Ready(instance) if !force && instance.chain_id() == chain_id => {
                    Next::Reuse(Arc::clone(instance))
                }
                Slot::Initializing {
                    chain_id: current,
                    attempt,
                    ..
                } if !force && *current == chain_id => Next::Join(attempt.clone()),
                _ => Next::Start,
            };
            match next {
                Next::Reuse(instance) => {
                    tracing::debug!("Session on chain {chain_id} is already ready");
                    return Ok(instance);
                }
                Next::Join(attempt) => {
                    tracing::debug!("Joining the initialization of chain {chain_id}");
                    attempt
                }
                Next::Start => {
                    let generation = state.supersede();
                    let cancel = CancellationToken::new();
                    let attempt = self.spawn_attempt(chain, wallet, generation, cancel.clone());
                    state.slot = Slot::Initializing {
                        chain_id,
                        cancel,
                        attempt: attempt.clone(),
                    };
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Runs the initialization on its own task so it makes progress and
    /// publishes its outcome even if every caller stops polling.
    fn spawn_attempt(
        &self,
        chain: ChainConfig,
        wallet: Arc<dyn WalletProvider>,
        generation: u64,
        cancel: CancellationToken,
    ) -> InitAttempt {
        let state = Arc::clone(&self.state);
        let connector = Arc::clone(&self.connector);
        let store = Arc::clone(&self.store);
        let chain_id = chain.chain_id;
        let task = tokio::spawn(async move {
            let res = SessionInstance::initialize(chain, wallet, connector, store, cancel.clone())
                .await
                .map(Arc::new);
            let mut state = lock(&state);
            if state.generation != generation || cancel.is_cancelled() {
                tracing::debug!("Discarding the superseded initialization of chain {chain_id}");
                return Err(SessionError::Cancelled);
            }
            state.slot = match &res {
                Ok(instance) => Slot::Ready(Arc::clone(instance)),
                Err(error) => Slot::Error {
                    chain_id,
                    error: error.clone(),
                },
            };
            res
        });
        async move {
            match task.await {
                Ok(res) => res,
                Err(e) if e.is_cancelled() => Err(SessionError::Cancelled),
                Err(e) => Err(SessionError::Relayer(format!(
                    "initialization task failed: {e}"
                ))),
            }
        }
        .boxed()
        .shared()
    }

    /// Drops the session and every cached result. Cancels any attempt in flight.
    pub async fn disconnect(&self) {
        record_request(OP_DISCONNECT);
        {
            let mut state = lock(&self.state);
            state.supersede();
            state.slot = Slot::Idle;
        }
        self.decryptor.clear_results().await;
        tracing::info!("Session disconnected");
    }

    pub fn status(&self) -> SessionStatus {
        match lock(&self.state).slot {
            Slot::Idle => SessionStatus::Idle,
            Slot::Initializing { .. } => SessionStatus::Initializing,
            Slot::Ready(_) => SessionStatus::Ready,
            Slot::Error { .. } => SessionStatus::Error,
        }
    }

    /// Chain of the current session or attempt.
    pub fn chain_id(&self) -> Option<u64> {
        match &lock(&self.state).slot {
            Slot::Idle => None,
            Slot::Initializing { chain_id, .. } | Slot::Error { chain_id, .. } => Some(*chain_id),
            Slot::Ready(instance) => Some(instance.chain_id()),
        }
    }

    /// Why the last initialization failed, while the manager is in [`SessionStatus::Error`].
    pub fn last_error(&self) -> Option<SessionError> {
        match &lock(&self.state).slot {
            Slot::Error { error, .. } => Some(error.clone()),
            _ => None,
        }
    }

    /// The ready session, or [`SessionError::NotReady`] explaining why there is none.
    pub fn instance(&self) -> Result<Arc<SessionInstance>, SessionError> {
        match &lock(&self.state).slot {
            Slot::Ready(instance) => Ok(Arc::clone(instance)),
            Slot::Idle => Err(SessionError::NotReady(
                "no session was initialized".to_string(),
            )),
            Slot::Initializing { chain_id, .. } => Err(SessionError::NotReady(format!(
                "chain {chain_id} is still initializing"
            ))),
            Slot::Error { chain_id, error } => Err(SessionError::NotReady(format!(
                "initialization of chain {chain_id} failed: {error}"
            ))),
        }
    }

    /// Public key of the current chain.
    pub fn public_key(&self) -> Result<Bytes, SessionError> {
        Ok(self.instance()?.public_key().clone())
    }

    /// A builder bound to `contract_address` for the session's account.
    pub fn create_encrypted_input(
        &self,
        contract_address: Address,
    ) -> Result<EncryptRequestBuilder, SessionError> {
        let instance = self.instance()?;
        let user_address = instance.user_address();
        Ok(instance.create_encrypted_input(contract_address, user_address))
    }

    /// Encrypts a single value, as [`FheType::Uint64`] unless a type is given.
    pub async fn encrypt_single(
        &self,
        contract_address: Address,
        fhe_type: Option<FheType>,
        value: impl Into<InputValue>,
    ) -> Result<EncryptedInput, SessionError> {
        let fhe_type = fhe_type.unwrap_or(DEFAULT_ENCRYPT_TYPE);
        self.encrypt_with(contract_address, |builder| {
            builder.add(fhe_type, value)?;
            Ok(())
        })
        .await
    }

    /// Encrypts `values` as one batch, keeping their order.
    pub async fn encrypt_batch(
        &self,
        contract_address: Address,
        values: impl IntoIterator<Item = (FheType, InputValue)>,
    ) -> Result<EncryptedInput, SessionError> {
        self.encrypt_with(contract_address, |builder| {
            for (fhe_type, value) in values {
                builder.add(fhe_type, value)?;
            }
            Ok(())
        })
        .await
    }

    /// Lets `fill` populate a builder, then submits it.
    pub async fn encrypt_with<F>(
        &self,
        contract_address: Address,
        fill: F,
    ) -> Result<EncryptedInput, SessionError>
    where
        F: FnOnce(&mut EncryptRequestBuilder) -> Result<(), SessionError>,
    {
        let mut builder = self
            .create_encrypted_input(contract_address)
            .map_err(|e| SessionError::Encryption(e.to_string()))?;
        fill(&mut builder)?;
        builder.encrypt().await
    }

    /// Decrypts the handles of `requests` for the session's account,
    /// prompting the wallet only when no valid authorization is stored.
    pub async fn decrypt(
        &self,
        requests: &[HandleContractPair],
    ) -> Result<DecryptedValues, SessionError> {
        self.decryptor.decrypt(self.instance().ok(), requests).await
    }

    pub async fn results(&self) -> HashMap<HandleContractPair, ClearValue> {
        self.decryptor.results().await
    }

    pub async fn result(
        &self,
        handle: &CiphertextHandle,
        contract_address: &Address,
    ) -> Option<ClearValue> {
        self.decryptor.result(handle, contract_address).await
    }

    pub async fn clear_results(&self) {
        self.decryptor.clear_results().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HARDHAT_CHAIN_ID;
    use crate::relayer::RelayerClient;
    use crate::storage::RamStore;
    use crate::wallet::LocalWallet;
    use async_trait::async_trait;
    use std::time::Duration;
    use tracing_test::traced_test;

    const OTHER_CHAIN_ID: u64 = 31338;
    const CONTRACT: Address = Address::new([0xaa; 20]);

    /// Never finishes connecting to the `stalled` chain.
    #[derive(Default)]
    struct StallingConnector {
        inner: DefaultConnector,
        stalled: Option<u64>,
    }

    #[async_trait]
    impl RelayerConnector for StallingConnector {
        async fn connect(
            &self,
            chain: &ChainConfig,
            store: Arc<dyn KeyValueStore>,
        ) -> Result<Arc<dyn RelayerClient>, SessionError> {
            if self.stalled == Some(chain.chain_id) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.inner.connect(chain, store).await
        }
    }

    fn manager(stalled: Option<u64>) -> SessionManager {
        let mut other = ChainConfig::hardhat();
        other.chain_id = OTHER_CHAIN_ID;
        other.name = "hardhat-2".to_string();
        let registry = ChainRegistry::new([ChainConfig::hardhat(), other]).unwrap();
        SessionManager::new(
            registry,
            Arc::new(StallingConnector {
                stalled,
                ..Default::default()
            }),
            Arc::new(RamStore::new()),
            AuthorizationConfig::default(),
        )
    }

    async fn until_initializing(manager: &SessionManager) {
        while !manager.status().is_initializing() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn lifecycle() {
        let manager = manager(None);
        let wallet = Arc::new(LocalWallet::random(HARDHAT_CHAIN_ID));
        assert_eq!(manager.status(), SessionStatus::Idle);
        assert!(matches!(
            manager.public_key(),
            Err(SessionError::NotReady(_))
        ));
        assert!(matches!(
            manager.encrypt_single(CONTRACT, None, 1u64).await,
            Err(SessionError::Encryption(_))
        ));

        let instance = manager
            .initialize(HARDHAT_CHAIN_ID, wallet.clone())
            .await
            .unwrap();
        assert_eq!(manager.status(), SessionStatus::Ready);
        assert_eq!(manager.chain_id(), Some(HARDHAT_CHAIN_ID));
        assert_eq!(&manager.public_key().unwrap(), instance.public_key());
        let again = manager
            .initialize(HARDHAT_CHAIN_ID, wallet.clone())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&instance, &again));

        let input = manager
            .encrypt_single(CONTRACT, None, 1337u64)
            .await
            .unwrap();
        assert_eq!(input.handles.len(), 1);
        assert_eq!(input.handles[0].fhe_type().unwrap(), FheType::Uint64);
        let pair = HandleContractPair {
            handle: input.handles[0],
            contract_address: CONTRACT,
        };
        let values = manager.decrypt(&[pair]).await.unwrap();
        assert_eq!(values[&input.handles[0]], ClearValue::from(1337u64));
        assert_eq!(
            manager.result(&input.handles[0], &CONTRACT).await,
            Some(ClearValue::from(1337u64))
        );

        manager.disconnect().await;
        assert_eq!(manager.status(), SessionStatus::Idle);
        assert_eq!(manager.chain_id(), None);
        assert!(manager.results().await.is_empty());
        assert!(matches!(
            manager.decrypt(&[pair]).await,
            Err(SessionError::NotReady(_))
        ));
    }

    #[tokio::test]
    async fn unsupported_chain() {
        let manager = manager(None);
        let wallet = Arc::new(LocalWallet::random(1));
        assert_eq!(
            manager.initialize(1, wallet).await.unwrap_err(),
            SessionError::UnsupportedChain(1)
        );
        assert_eq!(manager.status(), SessionStatus::Error);
        assert_eq!(manager.chain_id(), Some(1));
        assert_eq!(manager.last_error(), Some(SessionError::UnsupportedChain(1)));
        assert!(matches!(
            manager.instance(),
            Err(SessionError::NotReady(_))
        ));
    }

    #[traced_test]
    #[tokio::test]
    async fn switching_chain_cancels_pending_initialization() {
        let manager = manager(Some(HARDHAT_CHAIN_ID));
        let wallet = Arc::new(LocalWallet::random(HARDHAT_CHAIN_ID));
        let (first, second) = tokio::join!(
            manager.initialize(HARDHAT_CHAIN_ID, wallet.clone()),
            async {
                until_initializing(&manager).await;
                manager.initialize(OTHER_CHAIN_ID, wallet.clone()).await
            }
        );
        assert_eq!(first.unwrap_err(), SessionError::Cancelled);
        assert_eq!(second.unwrap().chain_id(), OTHER_CHAIN_ID);
        assert_eq!(manager.status(), SessionStatus::Ready);
        assert_eq!(manager.chain_id(), Some(OTHER_CHAIN_ID));
        assert_eq!(manager.last_error(), None);
        assert!(logs_contain("Aborting the initialization of chain 31337"));
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_initialization() {
        let manager = manager(Some(HARDHAT_CHAIN_ID));
        let wallet = Arc::new(LocalWallet::random(HARDHAT_CHAIN_ID));
        let (res, ()) = tokio::join!(manager.initialize(HARDHAT_CHAIN_ID, wallet), async {
            until_initializing(&manager).await;
            manager.disconnect().await;
        });
        assert_eq!(res.unwrap_err(), SessionError::Cancelled);
        assert_eq!(manager.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn concurrent_initializations_share_one_attempt() {
        let manager = manager(None);
        let wallet = Arc::new(LocalWallet::random(HARDHAT_CHAIN_ID));
        let (a, b) = tokio::join!(
            manager.initialize(HARDHAT_CHAIN_ID, wallet.clone()),
            manager.initialize(HARDHAT_CHAIN_ID, wallet.clone()),
        );
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    }

    #[tokio::test]
    async fn refresh_keeps_ciphertexts_decryptable() {
        let manager = manager(None);
        let wallet = Arc::new(LocalWallet::random(HARDHAT_CHAIN_ID));
        let before = manager
            .initialize(HARDHAT_CHAIN_ID, wallet.clone())
            .await
            .unwrap();
        let input = manager
            .encrypt_batch(
                CONTRACT,
                [
                    (FheType::Bool, InputValue::from(true)),
                    (FheType::Uint8, InputValue::from(200u8)),
                ],
            )
            .await
            .unwrap();

        let after = manager
            .refresh(HARDHAT_CHAIN_ID, wallet.clone())
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        let pairs: Vec<_> = input
            .handles
            .iter()
            .map(|handle| HandleContractPair {
                handle: *handle,
                contract_address: CONTRACT,
            })
            .collect();
        let values = manager.decrypt(&pairs).await.unwrap();
        assert_eq!(values[&input.handles[0]], ClearValue::Bool(true));
        assert_eq!(values[&input.handles[1]], ClearValue::from(200u64));
    }

    #[tokio::test]
    async fn builder_errors_are_not_wrapped() {
        let manager = manager(None);
        let wallet = Arc::new(LocalWallet::random(HARDHAT_CHAIN_ID));
        manager.initialize(HARDHAT_CHAIN_ID, wallet).await.unwrap();
        let res = manager
            .encrypt_with(CONTRACT, |builder| {
                builder.add_bool(true);
                builder.add(FheType::Uint8, 300u64)?;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(SessionError::TypeMismatch { .. })));
    }
}
