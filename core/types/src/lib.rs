//! Domain types shared between the session manager and relayer implementations:
//! ciphertext handles, encrypted value types, and the EIP-712 messages
//! exchanged with wallets and the gateway.

pub mod eip712;
pub mod fhe_types;
pub mod handle;
pub mod input_proof;
pub mod solidity_types;

pub use fhe_types::{ClearValue, FheType, FheTypeError};
pub use handle::{CiphertextHandle, HandleError};
