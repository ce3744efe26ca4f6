//! Re-authenticate once, replay once.
//!
//! ```text
//!   Initial --ok--> Done
//!   Initial --unauthorized--> (refresh) --> Retrying
//!   Initial --other error--> Failed
//!   Retrying --ok--> Done
//!   Retrying --any error--> Failed
//! ```
//!
//! A failed refresh also ends in `Failed`. Nothing else is retried here;
//! network level backoff belongs to the caller.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::crypto::CryptoSessionCache;
use crate::error::{AgentlessError, Result};
use crate::session::SessionContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    Retrying,
    Done,
    Failed,
}

#[derive(Clone)]
pub struct RetryRecoveryExecutor {
    session: Arc<SessionContext>,
    cache: Option<Arc<CryptoSessionCache>>,
}

impl RetryRecoveryExecutor {
    pub fn new(session: Arc<SessionContext>) -> Self {
        Self {
            session,
            cache: None,
        }
    }

    /// Evict the superseded pair's crypto session from `cache` after each
    /// successful refresh.
    pub fn with_cache(mut self, cache: Arc<CryptoSessionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    /// Run `operation`, refreshing the session and replaying it exactly once
    /// if the first attempt is rejected as unauthorized.
    ///
    /// `operation` must be safe to repeat. Sends are not deduplicated.
    pub async fn execute_with_recovery<T, F, Fut>(
        &self,
        name: &str,
        address: &str,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = State::Initial;
        loop {
            debug!(op = %name, %address, ?state, "executing");
            let err = match operation().await {
                Ok(value) => {
                    state = State::Done;
                    debug!(op = %name, %address, ?state, "operation succeeded");
                    return Ok(value);
                }
                Err(err) => err,
            };

            state = match state {
                State::Initial if err.is_unauthorized() => {
                    info!(op = %name, %address, "unauthorized, refreshing session");
                    self.refresh(name, address).await?;
                    State::Retrying
                }
                _ => State::Failed,
            };

            if state == State::Failed {
                warn!(op = %name, %address, error = %err, "operation failed");
                return Err(err);
            }
        }
    }

    async fn refresh(&self, name: &str, address: &str) -> Result<()> {
        let previous = self.session.refresh().await.map_err(|err| {
            warn!(op = %name, %address, error = %err, "session refresh failed");
            match err {
                AgentlessError::Authentication(_) => err,
                other => AgentlessError::Authentication(other.to_string()),
            }
        })?;
        if let Some(cache) = &self.cache {
            cache.evict(&previous);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionAuthenticator, TokenPair};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting(AtomicUsize);

    #[async_trait]
    impl SessionAuthenticator for Counting {
        async fn authenticate(&self) -> Result<TokenPair> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(TokenPair::new(format!("st-{n}"), format!("km-{n}")))
        }
    }

    fn executor() -> (RetryRecoveryExecutor, Arc<Counting>) {
        let auth = Arc::new(Counting::default());
        let session = SessionContext::new(TokenPair::new("st-init", "km-init"), auth.clone());
        (RetryRecoveryExecutor::new(Arc::new(session)), auth)
    }

    fn unauthorized() -> AgentlessError {
        AgentlessError::Unauthorized {
            address: "/v1/message".into(),
        }
    }

    #[tokio::test]
    async fn unauthorized_once_then_success() {
        let (executor, auth) = executor();
        let calls = &AtomicUsize::new(0);
        let session = executor.session();

        let value = executor
            .execute_with_recovery("getMessage", "/v1/message", || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(unauthorized()),
                    _ => Ok(session.session_token()),
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "st-0");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(auth.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persistent_unauthorized_refreshes_once() {
        let (executor, auth) = executor();
        let calls = &AtomicUsize::new(0);

        let err = executor
            .execute_with_recovery("send", "/v1/stream", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(unauthorized())
            })
            .await
            .unwrap_err();

        assert!(err.is_unauthorized());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(auth.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_failures_are_not_retried() {
        let (executor, auth) = executor();
        let calls = &AtomicUsize::new(0);

        let err = executor
            .execute_with_recovery("status", "/v1/status", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AgentlessError::decryption(Some("m1"), "bad tag"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AgentlessError::DecryptionFailure { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(auth.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refresh_evicts_the_superseded_crypto_session() {
        let (executor, _) = executor();
        let provider = Arc::new(crate::keyring::DerivedKeyProvider::new([1u8; 32]));
        let cache = Arc::new(CryptoSessionCache::new(provider));
        let executor = executor.with_cache(Arc::clone(&cache));
        cache.for_context(executor.session()).await.unwrap();

        let calls = &AtomicUsize::new(0);
        executor
            .execute_with_recovery("list", "/v1/stream", || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(unauthorized()),
                    _ => Ok(()),
                }
            })
            .await
            .unwrap();

        assert!(cache.is_empty());
    }
}
