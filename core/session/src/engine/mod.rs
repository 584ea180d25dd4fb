use crate::error::SessionError;
use std::future::Future;
use tokio_util::sync::CancellationToken;

pub mod instance;
pub mod manager;

/// Runs `fut` unless `token` is cancelled first, in which case the future is
/// dropped and [`SessionError::Cancelled`] is returned.
pub(crate) async fn until_cancelled<T>(
    token: &CancellationToken,
    fut: impl Future<Output = Result<T, SessionError>>,
) -> Result<T, SessionError> {
    tokio::select! {
        biased;
        () = token.cancelled() => Err(SessionError::Cancelled),
        res = fut => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancelled_token_wins() {
        let token = CancellationToken::new();
        token.cancel();
        let res = until_cancelled(&token, async { Ok::<_, SessionError>(1) }).await;
        assert_eq!(res, Err(SessionError::Cancelled));
    }

    #[tokio::test]
    async fn pending_future_is_interrupted() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });
        let res = until_cancelled(&token, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, SessionError>(())
        })
        .await;
        assert_eq!(res, Err(SessionError::Cancelled));
    }
}
