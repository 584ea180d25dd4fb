//! Client of a live relayer speaking JSON over HTTP.
use super::{
    DecryptedValues, EncryptRequest, EncryptedInput, HandleContractPair, RelayerClient,
    TypedValue, UserDecryptRequest,
};
use crate::conf::RelayerConnConfig;
use crate::error::SessionError;
use crate::registry::ChainConfig;
use crate::top_n_chars;
use alloy_primitives::{hex, Address, Bytes};
use async_trait::async_trait;
use fhevm_types::eip712::SIGNATURE_LENGTH;
use fhevm_types::input_proof::InputProof;
use fhevm_types::{CiphertextHandle, ClearValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

pub const KEY_URL_PATH: &str = "v1/keyurl";
pub const INPUT_PROOF_PATH: &str = "v1/input-proof";
pub const USER_DECRYPT_PATH: &str = "v1/user-decrypt";

/// Every relayer answer wraps its payload in a `response` field.
#[derive(Debug, Serialize, Deserialize)]
pub struct RelayerResponse<T> {
    pub response: T,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyUrlResponse {
    pub fhe_key_info: Vec<FheKeyInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FheKeyInfo {
    pub fhe_public_key: KeyLocation,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyLocation {
    pub data_id: String,
    pub urls: Vec<Url>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputProofPayload {
    pub contract_address: Address,
    pub user_address: Address,
    pub contract_chain_id: u64,
    pub values: Vec<TypedValue>,
    pub extra_data: Bytes,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InputProofResponse {
    pub handles: Vec<CiphertextHandle>,
    pub signatures: Vec<Bytes>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestValidity {
    pub start_timestamp: u64,
    pub duration_days: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDecryptPayload {
    pub handle_contract_pairs: Vec<HandleContractPair>,
    pub request_validity: RequestValidity,
    pub contracts_chain_id: u64,
    pub contract_addresses: Vec<Address>,
    pub user_address: Address,
    /// Hex without prefix.
    pub signature: String,
    /// Hex without prefix.
    pub public_key: String,
    pub extra_data: Bytes,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DecryptedHandle {
    pub handle: CiphertextHandle,
    pub value: ClearValue,
}

/// Relayer reached over HTTP. The FHE public key is fetched once when
/// connecting.
#[derive(Debug)]
pub struct HttpRelayer {
    chain: ChainConfig,
    base_url: Url,
    client: reqwest::Client,
    conf: RelayerConnConfig,
    public_key: Bytes,
}

impl HttpRelayer {
    #[tracing::instrument(skip_all, fields(chain_id = chain.chain_id))]
    pub async fn connect(
        chain: ChainConfig,
        conf: &RelayerConnConfig,
    ) -> Result<Self, SessionError> {
        let base_url = chain.relayer_url.clone().ok_or_else(|| {
            SessionError::Config(format!("chain {} has no relayer url", chain.chain_id))
        })?;
        let client = reqwest::Client::builder()
            .timeout(conf.timeout())
            .build()
            .map_err(|e| SessionError::Relayer(format!("could not build http client: {e}")))?;
        let mut relayer = Self {
            chain,
            base_url,
            client,
            conf: conf.clone(),
            public_key: Bytes::new(),
        };
        relayer.public_key = relayer.download_public_key().await?;
        tracing::info!(
            "Connected to relayer {} ({} byte public key)",
            relayer.base_url,
            relayer.public_key.len()
        );
        Ok(relayer)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, SessionError> {
        let url = format!("{}/{path}", self.base_url.as_str().trim_end_matches('/'));
        Url::parse(&url).map_err(|e| SessionError::Config(format!("invalid relayer url {url}: {e}")))
    }

    async fn get_bytes(&self, url: &Url) -> Result<Vec<u8>, SessionError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            let content = response.text().await.unwrap_or_default();
            return Err(SessionError::Relayer(format!(
                "GET {url} returned {status}: {}",
                top_n_chars(content)
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn get_json<R: DeserializeOwned>(&self, url: &Url) -> Result<R, SessionError> {
        let bytes = self.get_bytes(url).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| SessionError::Relayer(format!("malformed answer from {url}: {e}")))
    }

    /// Posts `body` and decodes the answer. Failures are returned as plain
    /// messages so each call can pick its error kind.
    async fn post_json<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, String> {
        let url = self.endpoint(path).map_err(|e| e.to_string())?;
        let response = self
            .client
            .post(url.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| format!("POST {url} failed: {e}"))?;
        let status = response.status();
        let content = response
            .text()
            .await
            .map_err(|e| format!("could not read answer from {url}: {e}"))?;
        if !status.is_success() {
            tracing::error!("Relayer returned {status} for {url}: {content}");
            return Err(format!(
                "POST {url} returned {status}: {}",
                top_n_chars(content)
            ));
        }
        serde_json::from_str(&content).map_err(|e| format!("malformed answer from {url}: {e}"))
    }

    async fn download_public_key(&self) -> Result<Bytes, SessionError> {
        let key_url = self.endpoint(KEY_URL_PATH)?;
        let sleep_ms = self.conf.retry_sleep_ms;
        let max_iter = self.conf.retry_max_iter;
        let info: RelayerResponse<KeyUrlResponse> =
            crate::retry_loop!(|| self.get_json(&key_url), sleep_ms, max_iter)?;
        let location = info
            .response
            .fhe_key_info
            .first()
            .map(|info| &info.fhe_public_key)
            .ok_or_else(|| SessionError::Relayer("relayer advertises no public key".to_string()))?;
        let url = location.urls.first().ok_or_else(|| {
            SessionError::Relayer(format!("public key {} has no url", location.data_id))
        })?;
        let key = crate::retry_loop!(|| self.get_bytes(url), sleep_ms, max_iter)?;
        if key.is_empty() {
            return Err(SessionError::Relayer(format!(
                "public key {} is empty",
                location.data_id
            )));
        }
        Ok(Bytes::from(key))
    }
}

#[async_trait]
impl RelayerClient for HttpRelayer {
    fn chain(&self) -> &ChainConfig {
        &self.chain
    }

    async fn fetch_public_key(&self) -> Result<Bytes, SessionError> {
        Ok(self.public_key.clone())
    }

    async fn encrypt(&self, request: EncryptRequest) -> Result<EncryptedInput, SessionError> {
        let expected = request.values.len();
        let payload = InputProofPayload {
            contract_address: request.contract_address,
            user_address: request.user_address,
            contract_chain_id: self.chain.chain_id,
            values: request.values,
            extra_data: Bytes::from_static(&[0]),
        };
        let answer: RelayerResponse<InputProofResponse> = self
            .post_json(INPUT_PROOF_PATH, &payload)
            .await
            .map_err(SessionError::Encryption)?;
        let InputProofResponse {
            handles,
            signatures,
        } = answer.response;
        if handles.len() != expected {
            return Err(SessionError::Encryption(format!(
                "relayer returned {} handles for {expected} values",
                handles.len()
            )));
        }
        let signatures = signatures
            .iter()
            .map(|sig| {
                <[u8; SIGNATURE_LENGTH]>::try_from(&sig[..]).map_err(|_| {
                    SessionError::Encryption(format!(
                        "coprocessor signature has {} bytes",
                        sig.len()
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let proof = InputProof {
            handles: handles.clone(),
            signatures,
            extra_data: Vec::new(),
        };
        Ok(EncryptedInput {
            handles,
            input_proof: Bytes::from(proof.to_bytes()?),
        })
    }

    async fn user_decrypt(
        &self,
        request: UserDecryptRequest,
    ) -> Result<DecryptedValues, SessionError> {
        if !request.keypair.is_consistent() {
            return Err(SessionError::Decryption(
                "private key does not match the signed public key".to_string(),
            ));
        }
        let payload = UserDecryptPayload {
            handle_contract_pairs: request.pairs,
            request_validity: RequestValidity {
                start_timestamp: request.start_timestamp,
                duration_days: request.duration_days,
            },
            contracts_chain_id: self.chain.chain_id,
            contract_addresses: request.contract_addresses,
            user_address: request.user_address,
            signature: hex::encode(&request.signature),
            public_key: hex::encode(&request.keypair.public_key),
            extra_data: Bytes::from_static(&[0]),
        };
        let answer: RelayerResponse<Vec<DecryptedHandle>> = self
            .post_json(USER_DECRYPT_PATH, &payload)
            .await
            .map_err(SessionError::Decryption)?;
        Ok(answer
            .response
            .into_iter()
            .map(|d| (d.handle, d.value))
            .collect::<HashMap<_, _>>())
    }
}
