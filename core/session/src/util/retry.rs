/// The maximum number of iterations before giving up on a transient failure.
pub const RETRY_MAX_ITER: u64 = 3;
/// The number of milliseconds to sleep between iterations of a loop.
pub const RETRY_SLEEP_MS: u64 = 500;

pub enum TimeoutStrategy {
    /// The timeout is constant for each iteration.
    Constant,
    /// The timeout is increased exponentially after each iteration.
    Exponential,
}

#[macro_export]
/// Helper macro to retry an async call until it succeeds, but not more than `$max_iter` times.
///
/// # Arguments
///
/// * `$func` - The asynchronous closure to be retried. It must return a `Result<_, SessionError>`.
/// * `$ms_sleep` - The initial sleep time in milliseconds between retries.
/// * `$max_iter` - The maximum number of retry attempts.
/// * `$timeout_strategy` - Either `TimeoutStrategy::Constant` or `TimeoutStrategy::Exponential`.
///
/// # Usage
///
/// ```ignore
/// use fhevm_session::retry_loop;
/// retry_loop!(|| client.get(url), 500, 3, TimeoutStrategy::Exponential);
/// retry_loop!(|| client.get(url), 500, 3);
/// retry_loop!(|| client.get(url));
/// ```
///
/// # Errors
///
/// After the last attempt the macro evaluates to `SessionError::Relayer` carrying the last error.
macro_rules! retry_loop {
    ($func:expr,$ms_sleep:expr,$max_iter:expr,$timeout_strategy:expr) => {{
        use $crate::util::retry::TimeoutStrategy;

        let mut ctr = 0;
        let mut sleep_time = $ms_sleep;
        let mut last_error = "".to_string();
        loop {
            if ctr > $max_iter {
                let msg = format!(
                    "Loop failed to get result after {} tries. The last error was: {}.",
                    $max_iter, last_error
                );
                tracing::error!(msg);
                break Err($crate::error::SessionError::Relayer(msg));
            }
            match $func().await {
                Ok(inner_res) => break Ok(inner_res),
                Err(e) => {
                    tracing::warn!("Loop failed with transient error: {e}");
                    match $timeout_strategy {
                        TimeoutStrategy::Constant => {}
                        TimeoutStrategy::Exponential => {
                            sleep_time *= 2;
                        }
                    }
                    tokio::time::sleep(tokio::time::Duration::from_millis(sleep_time)).await;
                    ctr += 1;
                    last_error = e.to_string();
                }
            }
        }
    }};
    ($func:expr,$ms_sleep:expr,$max_iter:expr) => {{
        $crate::retry_loop!(
            $func,
            $ms_sleep,
            $max_iter,
            $crate::util::retry::TimeoutStrategy::Constant
        )
    }};
    ($func:expr) => {{
        $crate::retry_loop!(
            $func,
            $crate::util::retry::RETRY_SLEEP_MS,
            $crate::util::retry::RETRY_MAX_ITER
        )
    }};
}

#[cfg(test)]
mod tests {
    use crate::error::SessionError;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_errors() {
        let calls = AtomicU64::new(0);
        let res: Result<u64, SessionError> = retry_loop!(
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(SessionError::Relayer(format!("attempt {n}")))
                } else {
                    Ok(n)
                }
            },
            1,
            5
        );
        assert_eq!(res.unwrap(), 2);
    }

    #[tokio::test]
    async fn gives_up_with_last_error() {
        let calls = AtomicU64::new(0);
        let res: Result<(), SessionError> = retry_loop!(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SessionError::Relayer("down".to_string()))
            },
            1,
            2,
            TimeoutStrategy::Exponential
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match res {
            Err(SessionError::Relayer(msg)) => assert!(msg.contains("down")),
            other => panic!("unexpected result {other:?}"),
        }
    }
}
