use observability::metrics::METRICS;
use std::panic::Location;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod client;
pub mod conf;
pub mod consts;
pub mod engine;
pub mod error;
pub mod registry;
pub mod relayer;
pub mod storage;
pub mod util;
pub mod wallet;

pub use client::authorization::AuthorizationSignature;
pub use client::decrypt::{DecryptRequestCoordinator, HandleContractPair};
pub use client::encrypt::{EncryptRequestBuilder, InputValue};
pub use engine::instance::SessionInstance;
pub use engine::manager::{SessionManager, SessionStatus};
pub use error::SessionError;
pub use registry::{ChainConfig, ChainRegistry, RelayerMode};
pub use relayer::{EncryptedInput, Keypair};

/// Truncate s to a maximum of 128 chars.
pub(crate) fn top_n_chars(mut s: String) -> String {
    s.truncate(128);
    s
}

/// Seconds since the unix epoch, zero if the clock is before it.
pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Counts a failed operation and logs it with the location of the caller.
///
/// Cancellations are the expected outcome of a superseded initialization
/// and are only logged at debug level.
#[track_caller]
pub(crate) fn record_error(operation: &'static str, err: &SessionError) {
    if err.is_cancelled() {
        tracing::debug!("{operation} was cancelled in {}", Location::caller());
    } else {
        tracing::error!("Error in {}: {operation} failed: {err}", Location::caller());
    }
    if let Err(e) = METRICS.increment_error_counter(operation, err.metric_tag()) {
        tracing::warn!("Failed to increment error counter for {operation}: {e}");
    }
}

pub(crate) fn record_request(operation: &'static str) {
    if let Err(e) = METRICS.increment_request_counter(operation) {
        tracing::warn!("Failed to increment request counter for {operation}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_messages() {
        assert_eq!(top_n_chars("a".repeat(300)).len(), 128);
        assert_eq!(top_n_chars("short".to_string()), "short");
    }
}
