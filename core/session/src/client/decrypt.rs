//! Resolves handles to clear values and keeps the results per (handle, contract).
use crate::client::authorization::{normalize_contracts, AuthorizationSignature};
use crate::conf::AuthorizationConfig;
use crate::engine::instance::SessionInstance;
use crate::error::SessionError;
use crate::relayer::DecryptedValues;
use crate::{record_error, record_request};
use alloy_primitives::Address;
use fhevm_types::{CiphertextHandle, ClearValue};
use futures::future::{BoxFuture, FutureExt, Shared};
use itertools::Itertools;
use observability::metrics_names::OP_USER_DECRYPT;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;

pub use crate::relayer::HandleContractPair;

type DecryptAttempt = Shared<BoxFuture<'static, Result<DecryptedValues, SessionError>>>;

/// Identifies a request set: chain, user and the sorted pairs.
type AttemptKey = (u64, Address, Vec<HandleContractPair>);

type ResultCache = HashMap<HandleContractPair, ClearValue>;

/// Runs user decryptions, obtaining authorizations on the way, and caches
/// what the relayer resolved.
///
/// Identical request sets issued while one is running share its outcome.
/// Failures never touch entries cached by earlier calls.
pub struct DecryptRequestCoordinator {
    conf: AuthorizationConfig,
    results: Arc<RwLock<ResultCache>>,
    epoch: Arc<AtomicU64>,
    in_flight: Arc<Mutex<HashMap<AttemptKey, DecryptAttempt>>>,
}

impl fmt::Debug for DecryptRequestCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptRequestCoordinator")
            .field("conf", &self.conf)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl DecryptRequestCoordinator {
    pub fn new(conf: AuthorizationConfig) -> Self {
        Self {
            conf,
            results: Arc::new(RwLock::new(HashMap::new())),
            epoch: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Decrypts `requests` with `instance`.
    ///
    /// Fails with [`SessionError::NotReady`] without any network call when
    /// there is nothing to decrypt or no ready instance. Handles the relayer
    /// does not resolve are absent from the returned map and from the cache.
    #[tracing::instrument(skip_all, fields(requests = requests.len()))]
    pub async fn decrypt(
        &self,
        instance: Option<Arc<SessionInstance>>,
        requests: &[HandleContractPair],
    ) -> Result<DecryptedValues, SessionError> {
        record_request(OP_USER_DECRYPT);
        let res = self.decrypt_inner(instance, requests).await;
        if let Err(e) = &res {
            record_error(OP_USER_DECRYPT, e);
        }
        res
    }

    async fn decrypt_inner(
        &self,
        instance: Option<Arc<SessionInstance>>,
        requests: &[HandleContractPair],
    ) -> Result<DecryptedValues, SessionError> {
        if requests.is_empty() {
            return Err(SessionError::NotReady("no handle to decrypt".to_string()));
        }
        let instance = instance
            .ok_or_else(|| SessionError::NotReady("no session is ready".to_string()))?;
        let pairs: Vec<HandleContractPair> = requests.iter().copied().sorted().dedup().collect();
        let key = (instance.chain_id(), instance.user_address(), pairs.clone());

        let attempt = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(&key) {
                Some(attempt) => {
                    tracing::debug!("Joining an identical decryption in flight");
                    attempt.clone()
                }
                None => {
                    let attempt = self.spawn_attempt(instance, pairs, key.clone());
                    in_flight.insert(key, attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Runs the attempt on its own task so it completes, and leaves
    /// `in_flight`, even when every caller stops waiting.
    fn spawn_attempt(
        &self,
        instance: Arc<SessionInstance>,
        pairs: Vec<HandleContractPair>,
        key: AttemptKey,
    ) -> DecryptAttempt {
        let task = tokio::spawn(run_attempt(
            instance,
            pairs,
            self.conf.clone(),
            Arc::clone(&self.results),
            Arc::clone(&self.epoch),
            Arc::clone(&self.in_flight),
            key,
        ));
        async move {
            match task.await {
                Ok(res) => res,
                Err(e) if e.is_cancelled() => Err(SessionError::Cancelled),
                Err(e) => Err(SessionError::Decryption(format!(
                    "decryption task failed: {e}"
                ))),
            }
        }
        .boxed()
        .shared()
    }

    /// Snapshot of every cached result.
    pub async fn results(&self) -> HashMap<HandleContractPair, ClearValue> {
        self.results.read().await.clone()
    }

    pub async fn result(
        &self,
        handle: &CiphertextHandle,
        contract_address: &Address,
    ) -> Option<ClearValue> {
        self.results
            .read()
            .await
            .get(&HandleContractPair {
                handle: *handle,
                contract_address: *contract_address,
            })
            .copied()
    }

    /// Drops every cached result. Decryptions still running will not
    /// populate the cache when they finish.
    pub async fn clear_results(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.results.write().await.clear();
    }
}

async fn run_attempt(
    instance: Arc<SessionInstance>,
    pairs: Vec<HandleContractPair>,
    conf: AuthorizationConfig,
    results: Arc<RwLock<ResultCache>>,
    epoch: Arc<AtomicU64>,
    in_flight: Arc<Mutex<HashMap<AttemptKey, DecryptAttempt>>>,
    key: AttemptKey,
) -> Result<DecryptedValues, SessionError> {
    let started_at = epoch.load(Ordering::SeqCst);
    let res = resolve(&instance, &pairs, &conf).await;
    in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&key);
    let values = res?;

    let mut resolved = HashMap::with_capacity(values.len());
    let mut cache = results.write().await;
    let publish = epoch.load(Ordering::SeqCst) == started_at;
    for pair in &pairs {
        if let Some(value) = values.get(&pair.handle) {
            resolved.insert(pair.handle, *value);
            if publish {
                cache.insert(*pair, *value);
            }
        }
    }
    tracing::info!("Decrypted {} of {} handle(s)", resolved.len(), pairs.len());
    Ok(resolved)
}

async fn resolve(
    instance: &SessionInstance,
    pairs: &[HandleContractPair],
    conf: &AuthorizationConfig,
) -> Result<DecryptedValues, SessionError> {
    let contracts =
        normalize_contracts(&pairs.iter().map(|p| p.contract_address).collect::<Vec<_>>());
    let authorization = AuthorizationSignature::load_or_sign(
        instance,
        &contracts,
        instance.wallet().as_ref(),
        instance.store().as_ref(),
        conf,
        None,
    )
    .await?;
    if let Some(pair) = pairs
        .iter()
        .find(|p| !authorization.authorizes(&p.contract_address))
    {
        return Err(SessionError::Decryption(format!(
            "authorization does not cover contract {}",
            pair.contract_address
        )));
    }
    instance.decrypt_batch(pairs, &authorization).await
}
