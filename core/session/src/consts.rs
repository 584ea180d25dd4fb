pub const SECONDS_PER_DAY: u64 = 86_400;

/// Validity window of a freshly signed decryption authorization.
pub const DEFAULT_DURATION_DAYS: u64 = 1;
/// Longest validity window the gateway accepts.
pub const MAX_DURATION_DAYS: u64 = 365;

/// Prefix of the store keys under which decryption authorizations live.
pub const DEFAULT_SIGNATURE_STORAGE_PREFIX: &str = "fhevm-decsig";
pub const MOCK_PUBLIC_KEY_PREFIX: &str = "fhevm-mock:public-key";
pub const MOCK_PUBLIC_PARAMS_PREFIX: &str = "fhevm-mock:public-params";

/// Type used by `encrypt_single` when the caller does not name one.
pub const DEFAULT_ENCRYPT_TYPE: fhevm_types::FheType = fhevm_types::FheType::Uint64;

pub const DEFAULT_RELAYER_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RELAYER_RETRY_SLEEP_MS: u64 = 500;
pub const DEFAULT_RELAYER_RETRY_MAX_ITER: u64 = 3;

/// Env prefix used when loading the session configuration.
pub const CONF_ENV_PREFIX: &str = "FHEVM_SESSION";
