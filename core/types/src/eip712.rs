//! EIP-712 domains and typed messages for user decryption and input verification.
use crate::handle::CiphertextHandle;
use crate::solidity_types::{CiphertextVerification, UserDecryptRequestVerification};
use alloy_primitives::{Address, Bytes, Signature, B256, U256};
use alloy_sol_types::{Eip712Domain, SolStruct};
use std::borrow::Cow;
use std::fmt;

pub const DECRYPTION_DOMAIN_NAME: &str = "Decryption";
pub const INPUT_VERIFICATION_DOMAIN_NAME: &str = "InputVerification";
pub const DOMAIN_VERSION: &str = "1";
pub const SIGNATURE_LENGTH: usize = 65;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum Eip712Error {
    #[error("signature must be {SIGNATURE_LENGTH} bytes, got {0}")]
    BadSignatureLength(usize),

    #[error("signature recovery failed: {0}")]
    Recovery(String),
}

/// Domain of the gateway contract that verifies user decryption requests.
pub fn decryption_domain(gateway_chain_id: u64, verifying_contract: Address) -> Eip712Domain {
    Eip712Domain::new(
        Some(Cow::Borrowed(DECRYPTION_DOMAIN_NAME)),
        Some(Cow::Borrowed(DOMAIN_VERSION)),
        Some(U256::from(gateway_chain_id)),
        Some(verifying_contract),
        None,
    )
}

/// Domain of the gateway contract that verifies encrypted inputs.
pub fn input_verification_domain(
    gateway_chain_id: u64,
    verifying_contract: Address,
) -> Eip712Domain {
    Eip712Domain::new(
        Some(Cow::Borrowed(INPUT_VERIFICATION_DOMAIN_NAME)),
        Some(Cow::Borrowed(DOMAIN_VERSION)),
        Some(U256::from(gateway_chain_id)),
        Some(verifying_contract),
        None,
    )
}

/// The typed data a wallet signs to authorize user decryption.
#[derive(Clone)]
pub struct UserDecryptEip712 {
    pub domain: Eip712Domain,
    pub message: UserDecryptRequestVerification,
}

impl UserDecryptEip712 {
    pub const PRIMARY_TYPE: &'static str = "UserDecryptRequestVerification";

    pub fn new(
        domain: Eip712Domain,
        public_key: &[u8],
        contract_addresses: &[Address],
        start_timestamp: u64,
        duration_days: u64,
    ) -> Self {
        Self {
            domain,
            message: UserDecryptRequestVerification {
                publicKey: Bytes::copy_from_slice(public_key),
                contractAddresses: contract_addresses.to_vec(),
                startTimestamp: U256::from(start_timestamp),
                durationDays: U256::from(duration_days),
                extraData: Bytes::new(),
            },
        }
    }

    /// The digest a wallet signs for `eth_signTypedData_v4`.
    pub fn signing_hash(&self) -> B256 {
        self.message.eip712_signing_hash(&self.domain)
    }

    pub fn contract_addresses(&self) -> &[Address] {
        &self.message.contractAddresses
    }

    /// Start and duration as plain integers, saturating on overflow.
    pub fn validity(&self) -> (u64, u64) {
        (
            self.message.startTimestamp.saturating_to::<u64>(),
            self.message.durationDays.saturating_to::<u64>(),
        )
    }
}

impl fmt::Debug for UserDecryptEip712 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserDecryptEip712")
            .field("domain", &self.domain)
            .field("public_key", &self.message.publicKey)
            .field("contract_addresses", &self.message.contractAddresses)
            .field("start_timestamp", &self.message.startTimestamp)
            .field("duration_days", &self.message.durationDays)
            .finish()
    }
}

/// Builds the coprocessor attestation message for an input batch.
pub fn ciphertext_verification(
    handles: &[CiphertextHandle],
    user_address: Address,
    contract_address: Address,
    contract_chain_id: u64,
    extra_data: &[u8],
) -> CiphertextVerification {
    CiphertextVerification {
        ctHandles: handles.iter().map(|h| B256::from(*h)).collect(),
        userAddress: user_address,
        contractAddress: contract_address,
        contractChainId: U256::from(contract_chain_id),
        extraData: Bytes::copy_from_slice(extra_data),
    }
}

/// Recovers the address that produced `signature` over `hash`.
pub fn recover_signer(signature: &[u8], hash: &B256) -> Result<Address, Eip712Error> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(Eip712Error::BadSignatureLength(signature.len()));
    }
    let sig = Signature::from_raw(signature).map_err(|e| Eip712Error::Recovery(e.to_string()))?;
    sig.recover_address_from_prehash(hash)
        .map_err(|e| Eip712Error::Recovery(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    fn sample(contracts: &[Address], start: u64) -> UserDecryptEip712 {
        let domain = decryption_domain(
            55815,
            address!("b6E160B1ff80D67Bfe90A85eE06Ce0A2613607D1"),
        );
        UserDecryptEip712::new(domain, &[1, 2, 3], contracts, start, 1)
    }

    #[test]
    fn hash_depends_on_every_field() {
        let a = Address::repeat_byte(0xaa);
        let b = Address::repeat_byte(0xbb);
        let base = sample(&[a, b], 0).signing_hash();
        assert_eq!(base, sample(&[a, b], 0).signing_hash());
        assert_ne!(base, sample(&[b, a], 0).signing_hash());
        assert_ne!(base, sample(&[a, b], 1).signing_hash());
        assert_ne!(base, sample(&[a], 0).signing_hash());
    }

    #[test]
    fn validity_is_exposed() {
        let eip712 = sample(&[Address::ZERO], 1_700_000_000);
        assert_eq!(eip712.validity(), (1_700_000_000, 1));
        assert_eq!(eip712.contract_addresses(), &[Address::ZERO]);
        assert_eq!(
            UserDecryptEip712::PRIMARY_TYPE,
            UserDecryptRequestVerification::NAME
        );
    }

    #[test]
    fn recover_rejects_bad_length() {
        assert_eq!(
            recover_signer(&[0u8; 64], &B256::ZERO),
            Err(Eip712Error::BadSignatureLength(64))
        );
    }
}
