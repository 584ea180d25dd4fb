//! Solidity types used in EIP-712 signing and verification.
//! WARNING: any changes to these structures is a breaking change.

// Struct needs to match what the gateway `Decryption` contract verifies,
// and the name must be the primary type of the typed data sent to the wallet.
alloy_sol_types::sol! {
    struct UserDecryptRequestVerification {
        /// @notice The ephemeral public key the result is re-encrypted under.
        bytes publicKey;
        /// @notice The contracts whose ciphertexts the user may decrypt.
        address[] contractAddresses;
        /// @notice Start of the validity window, in seconds since the epoch.
        uint256 startTimestamp;
        /// @notice Length of the validity window, in days.
        uint256 durationDays;
        bytes extraData;
    }
}

// Signed by coprocessors to attest that an input batch was verified
// for a given (contract, user) pair.
alloy_sol_types::sol! {
    struct CiphertextVerification {
        bytes32[] ctHandles;
        address userAddress;
        address contractAddress;
        uint256 contractChainId;
        bytes extraData;
    }
}
