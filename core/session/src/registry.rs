//! Static description of the chains a session can be opened on.
use crate::error::SessionError;
use alloy_primitives::{address, Address};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::{Display, EnumIs, EnumString};
use url::Url;
use validator::{Validate, ValidationError};

pub const SEPOLIA_CHAIN_ID: u64 = 11155111;
pub const HARDHAT_CHAIN_ID: u64 = 31337;
pub const GATEWAY_CHAIN_ID: u64 = 55815;

/// Whether the chain is served by a real relayer or a local stand-in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIs,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RelayerMode {
    Mock,
    Live,
}

/// Endpoints and contract addresses of one fhEVM-enabled chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = validate_chain_config))]
pub struct ChainConfig {
    #[validate(range(min = 1))]
    pub chain_id: u64,
    #[validate(length(min = 1))]
    pub name: String,
    pub mode: RelayerMode,
    /// Base url of the relayer, required in live mode.
    pub relayer_url: Option<Url>,
    pub rpc_url: Option<Url>,
    #[validate(range(min = 1))]
    pub gateway_chain_id: u64,
    pub acl_contract_address: Address,
    pub kms_contract_address: Address,
    pub input_verifier_contract_address: Address,
    pub verifying_contract_address_decryption: Address,
    pub verifying_contract_address_input_verification: Address,
}

fn validate_chain_config(conf: &ChainConfig) -> Result<(), ValidationError> {
    if conf.mode.is_live() && conf.relayer_url.is_none() {
        return Err(ValidationError::new("Missing Relayer URL").with_message(
            format!(
                "Chain {} ({}) is in live mode but has no relayer_url.",
                conf.chain_id, conf.name
            )
            .into(),
        ));
    }
    Ok(())
}

impl ChainConfig {
    /// Sepolia testnet, served by the public testnet relayer.
    pub fn sepolia() -> Self {
        Self {
            chain_id: SEPOLIA_CHAIN_ID,
            name: "sepolia".to_string(),
            mode: RelayerMode::Live,
            relayer_url: Url::parse("https://relayer.testnet.zama.cloud").ok(),
            rpc_url: Url::parse("https://eth-sepolia.public.blastapi.io").ok(),
            gateway_chain_id: GATEWAY_CHAIN_ID,
            acl_contract_address: address!("687820221192C5B662b25367F70076A37bc79b6c"),
            kms_contract_address: address!("1364cBBf2cDF5032C47d8226a6f6FBD2AFCDacAC"),
            input_verifier_contract_address: address!("bc91f3daD1A5F19F8390c400196e58073B6a0BC4"),
            verifying_contract_address_decryption: address!(
                "b6E160B1ff80D67Bfe90A85eE06Ce0A2613607D1"
            ),
            verifying_contract_address_input_verification: address!(
                "7048C39f048125eDa9d678AEbaDfB22F7900a29F"
            ),
        }
    }

    /// Local hardhat node, served by the in-process mock relayer.
    pub fn hardhat() -> Self {
        Self {
            chain_id: HARDHAT_CHAIN_ID,
            name: "hardhat".to_string(),
            mode: RelayerMode::Mock,
            relayer_url: None,
            rpc_url: Url::parse("http://127.0.0.1:8545").ok(),
            gateway_chain_id: GATEWAY_CHAIN_ID,
            acl_contract_address: address!("50157CFfD6bBFA2DECe204a89ec419c23ef5755D"),
            kms_contract_address: address!("901F8942346f7AB3a01F6D7613119Bca447Bb030"),
            input_verifier_contract_address: address!("36772142b74871f255CbD7A3e89B401d3e45825f"),
            verifying_contract_address_decryption: address!(
                "5ffdaAB0373E62E2ea2944776209aEf29E631A64"
            ),
            verifying_contract_address_input_verification: address!(
                "812b06e1CDCE800494b79fFE4f925A504a9A9810"
            ),
        }
    }
}

/// Maps chain ids to their configuration. Pure lookup, no I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainRegistry {
    chains: BTreeMap<u64, ChainConfig>,
}

impl Default for ChainRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ChainRegistry {
    /// Builds a registry from explicit entries. Duplicate chain ids are rejected.
    pub fn new(chains: impl IntoIterator<Item = ChainConfig>) -> Result<Self, SessionError> {
        let mut map = BTreeMap::new();
        for chain in chains {
            chain
                .validate()
                .map_err(|e| SessionError::Config(format!("chain {}: {e}", chain.chain_id)))?;
            let chain_id = chain.chain_id;
            if map.insert(chain_id, chain).is_some() {
                return Err(SessionError::Config(format!(
                    "chain {chain_id} is registered twice"
                )));
            }
        }
        Ok(Self { chains: map })
    }

    /// The built-in Sepolia and hardhat entries.
    pub fn with_defaults() -> Self {
        let chains = [ChainConfig::sepolia(), ChainConfig::hardhat()]
            .into_iter()
            .map(|c| (c.chain_id, c))
            .collect();
        Self { chains }
    }

    pub fn lookup(&self, chain_id: u64) -> Result<&ChainConfig, SessionError> {
        self.chains
            .get(&chain_id)
            .ok_or(SessionError::UnsupportedChain(chain_id))
    }

    pub fn contains(&self, chain_id: u64) -> bool {
        self.chains.contains_key(&chain_id)
    }

    pub fn chain_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.chains.keys().copied()
    }
}
