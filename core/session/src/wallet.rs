//! The subset of an EIP-1193 wallet the session needs.
use crate::error::SessionError;
use alloy_primitives::Address;
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use fhevm_types::eip712::UserDecryptEip712;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Wallet boundary. The session only discovers the account and chain and
/// asks for typed-data signatures, never for transaction signatures.
#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// `eth_requestAccounts`
    async fn request_accounts(&self) -> Result<Vec<Address>, SessionError>;

    /// `eth_chainId`
    async fn chain_id(&self) -> Result<u64, SessionError>;

    /// `eth_signTypedData_v4`, returning the 65-byte signature.
    async fn sign_typed_data(
        &self,
        account: Address,
        typed_data: &UserDecryptEip712,
    ) -> Result<Vec<u8>, SessionError>;
}

/// Wallet backed by a local private key, for development and tests.
#[derive(Debug)]
pub struct LocalWallet {
    signer: PrivateKeySigner,
    chain_id: u64,
    prompts: AtomicUsize,
    rejecting: AtomicBool,
}

impl LocalWallet {
    pub fn new(signer: PrivateKeySigner, chain_id: u64) -> Self {
        Self {
            signer,
            chain_id,
            prompts: AtomicUsize::new(0),
            rejecting: AtomicBool::new(false),
        }
    }

    pub fn random(chain_id: u64) -> Self {
        Self::new(PrivateKeySigner::random(), chain_id)
    }

    /// Create a wallet from a hex encoded private key, with or without `0x`.
    pub fn from_private_key_hex(key: &str, chain_id: u64) -> Result<Self, SessionError> {
        let signer = PrivateKeySigner::from_str(key.trim())
            .map_err(|e| SessionError::NoProvider(format!("invalid wallet key: {e}")))?;
        Ok(Self::new(signer, chain_id))
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Number of signing prompts received so far, including rejected ones.
    pub fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    /// When set, every signing prompt is declined as a user would.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }
}

#[async_trait]
impl WalletProvider for LocalWallet {
    async fn request_accounts(&self) -> Result<Vec<Address>, SessionError> {
        Ok(vec![self.signer.address()])
    }

    async fn chain_id(&self) -> Result<u64, SessionError> {
        Ok(self.chain_id)
    }

    async fn sign_typed_data(
        &self,
        account: Address,
        typed_data: &UserDecryptEip712,
    ) -> Result<Vec<u8>, SessionError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(SessionError::Signature(
                "user rejected the request".to_string(),
            ));
        }
        if account != self.signer.address() {
            return Err(SessionError::Signature(format!(
                "account {account} is not managed by this wallet"
            )));
        }
        let signature = self
            .signer
            .sign_hash_sync(&typed_data.signing_hash())
            .map_err(|e| SessionError::Signature(e.to_string()))?;
        Ok(signature.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use fhevm_types::eip712::{decryption_domain, recover_signer};

    fn typed_data() -> UserDecryptEip712 {
        UserDecryptEip712::new(
            decryption_domain(55815, address!("5ffdaAB0373E62E2ea2944776209aEf29E631A64")),
            &[4u8; 33],
            &[Address::repeat_byte(1)],
            1_700_000_000,
            1,
        )
    }

    #[tokio::test]
    async fn signature_recovers_to_wallet() {
        let wallet = LocalWallet::random(31337);
        let data = typed_data();
        let sig = wallet
            .sign_typed_data(wallet.address(), &data)
            .await
            .unwrap();
        assert_eq!(sig.len(), 65);
        assert_eq!(
            recover_signer(&sig, &data.signing_hash()).unwrap(),
            wallet.address()
        );
        assert_eq!(wallet.prompt_count(), 1);
        assert_eq!(wallet.chain_id().await.unwrap(), 31337);
    }

    #[test]
    fn from_hex_key() {
        // first hardhat development account
        let wallet = LocalWallet::from_private_key_hex(
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
            31337,
        )
        .unwrap();
        assert_eq!(
            wallet.address(),
            address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266")
        );
        assert!(LocalWallet::from_private_key_hex("0x1234", 31337).is_err());
    }

    #[tokio::test]
    async fn rejection_and_foreign_account() {
        let wallet = LocalWallet::random(31337);
        let data = typed_data();
        assert!(matches!(
            wallet.sign_typed_data(Address::ZERO, &data).await,
            Err(SessionError::Signature(_))
        ));
        wallet.set_rejecting(true);
        assert!(matches!(
            wallet.sign_typed_data(wallet.address(), &data).await,
            Err(SessionError::Signature(_))
        ));
        assert_eq!(wallet.prompt_count(), 2);
    }
}
