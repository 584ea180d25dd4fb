use fhevm_types::eip712::Eip712Error;
use fhevm_types::input_proof::InputProofError;
use fhevm_types::{FheType, FheTypeError, HandleError};
use observability::metrics_names::{
    ERR_CANCELLED, ERR_CONFIG, ERR_DECRYPTION, ERR_ENCRYPTION, ERR_INVALID_SIGNATURE_SHAPE,
    ERR_NOT_READY, ERR_NO_PROVIDER, ERR_RELAYER, ERR_SIGNATURE, ERR_STORAGE, ERR_TYPE_MISMATCH,
    ERR_UNSUPPORTED_CHAIN,
};

/// Every failure the session manager reports to its caller.
///
/// The enum is `Clone` so a single in-flight result can be handed to every
/// caller that joined it.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("chain {0} is not registered")]
    UnsupportedChain(u64),

    #[error("no wallet or rpc provider is reachable: {0}")]
    NoProvider(String),

    #[error("relayer error: {0}")]
    Relayer(String),

    #[error("session is not ready: {0}")]
    NotReady(String),

    #[error("wallet did not sign the decryption authorization: {0}")]
    Signature(String),

    #[error("stored decryption authorization is malformed: {0}")]
    InvalidSignatureShape(String),

    #[error("value does not match type {fhe_type}: {reason}")]
    TypeMismatch { fhe_type: FheType, reason: String },

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The initialization was superseded or aborted. Callers treat this as a no-op.
    #[error("operation was cancelled")]
    Cancelled,
}

impl SessionError {
    pub fn type_mismatch(fhe_type: FheType, reason: impl Into<String>) -> Self {
        SessionError::TypeMismatch {
            fhe_type,
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SessionError::Cancelled)
    }

    /// Tag used when counting this error in metrics.
    pub fn metric_tag(&self) -> &'static str {
        match self {
            SessionError::UnsupportedChain(_) => ERR_UNSUPPORTED_CHAIN,
            SessionError::NoProvider(_) => ERR_NO_PROVIDER,
            SessionError::Relayer(_) => ERR_RELAYER,
            SessionError::NotReady(_) => ERR_NOT_READY,
            SessionError::Signature(_) => ERR_SIGNATURE,
            SessionError::InvalidSignatureShape(_) => ERR_INVALID_SIGNATURE_SHAPE,
            SessionError::TypeMismatch { .. } => ERR_TYPE_MISMATCH,
            SessionError::Encryption(_) => ERR_ENCRYPTION,
            SessionError::Decryption(_) => ERR_DECRYPTION,
            SessionError::Storage(_) => ERR_STORAGE,
            SessionError::Config(_) => ERR_CONFIG,
            SessionError::Cancelled => ERR_CANCELLED,
        }
    }
}

impl From<HandleError> for SessionError {
    fn from(e: HandleError) -> Self {
        SessionError::Relayer(format!("malformed handle: {e}"))
    }
}

impl From<FheTypeError> for SessionError {
    fn from(e: FheTypeError) -> Self {
        SessionError::Relayer(format!("unexpected fhe type: {e}"))
    }
}

impl From<InputProofError> for SessionError {
    fn from(e: InputProofError) -> Self {
        SessionError::Encryption(e.to_string())
    }
}

impl From<Eip712Error> for SessionError {
    fn from(e: Eip712Error) -> Self {
        SessionError::Decryption(e.to_string())
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(e: reqwest::Error) -> Self {
        SessionError::Relayer(e.to_string())
    }
}
