/// Constants for metric operation names to ensure consistency and prevent typos.
/// These match the public operations of the session manager.
//
// Session lifecycle
pub const OP_INITIALIZE: &str = "initialize";
pub const OP_REFRESH: &str = "refresh";
pub const OP_DISCONNECT: &str = "disconnect";
pub const OP_FETCH_PK: &str = "fetch_pk";

// Authorization
pub const OP_SIGN_AUTHORIZATION: &str = "sign_authorization";
pub const OP_LOAD_AUTHORIZATION: &str = "load_authorization";

// Encryption and user decryption
// Corresponds to a request, a request may contain several values or handles
pub const OP_ENCRYPT: &str = "encrypt";
pub const OP_USER_DECRYPT: &str = "user_decrypt";
// Corresponds to one relayer round-trip for a batch of handles
pub const OP_USER_DECRYPT_INNER: &str = "user_decrypt_inner";

// Common metric tag keys
pub const TAG_OPERATION: &str = "operation";
pub const TAG_ERROR: &str = "error";
pub const TAG_CHAIN_ID: &str = "chain_id";
pub const TAG_RELAYER_MODE: &str = "relayer_mode";

// Common error tag values
pub const ERR_CANCELLED: &str = "cancelled";
pub const ERR_UNSUPPORTED_CHAIN: &str = "unsupported_chain";
pub const ERR_NO_PROVIDER: &str = "no_provider";
pub const ERR_RELAYER: &str = "relayer";
pub const ERR_NOT_READY: &str = "not_ready";
pub const ERR_SIGNATURE: &str = "signature";
pub const ERR_INVALID_SIGNATURE_SHAPE: &str = "invalid_signature_shape";
pub const ERR_TYPE_MISMATCH: &str = "type_mismatch";
pub const ERR_ENCRYPTION: &str = "encryption";
pub const ERR_DECRYPTION: &str = "decryption";
pub const ERR_STORAGE: &str = "storage";
pub const ERR_CONFIG: &str = "config";
