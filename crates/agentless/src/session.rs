//! Authenticated session state.
//!
//! A `SessionContext` owns the current `(session token, key-manager token)`
//! pair. The pair is only ever replaced as a whole: readers see either the
//! old pair or the new one, never a mix, so crypto sessions are never derived
//! from a stale half and a fresh half.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

use crate::error::Result;

/// The two-part credential. Also the key of the crypto session cache.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TokenPair {
    pub session_token: String,
    pub key_manager_token: String,
}

impl TokenPair {
    pub fn new(session_token: impl Into<String>, key_manager_token: impl Into<String>) -> Self {
        Self {
            session_token: session_token.into(),
            key_manager_token: key_manager_token.into(),
        }
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("session_token", &"<redacted>")
            .field("key_manager_token", &"<redacted>")
            .finish()
    }
}

/// Issues fresh token pairs. Backed by whatever authentication subsystem the
/// deployment uses (RSA/JWT login, certificate auth, OBO exchange...).
#[async_trait]
pub trait SessionAuthenticator: Send + Sync {
    async fn authenticate(&self) -> Result<TokenPair>;
}

pub struct SessionContext {
    tokens: RwLock<TokenPair>,
    authenticator: Arc<dyn SessionAuthenticator>,
}

impl SessionContext {
    pub fn new(tokens: TokenPair, authenticator: Arc<dyn SessionAuthenticator>) -> Self {
        Self {
            tokens: RwLock::new(tokens),
            authenticator,
        }
    }

    /// Authenticate once and build a context from the issued pair.
    pub async fn authenticate(authenticator: Arc<dyn SessionAuthenticator>) -> Result<Self> {
        let tokens = authenticator.authenticate().await?;
        Ok(Self::new(tokens, authenticator))
    }

    /// Snapshot of the current pair.
    pub fn tokens(&self) -> TokenPair {
        self.tokens.read().clone()
    }

    pub fn session_token(&self) -> String {
        self.tokens.read().session_token.clone()
    }

    /// Obtain a new pair and swap it in. Returns the superseded pair.
    ///
    /// Concurrent refreshes are not coalesced; each one swaps in whatever
    /// the authenticator returned, and the last writer wins.
    pub async fn refresh(&self) -> Result<TokenPair> {
        let fresh = self.authenticator.authenticate().await?;
        let previous = std::mem::replace(&mut *self.tokens.write(), fresh);
        info!("session tokens refreshed");
        Ok(previous)
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("tokens", &*self.tokens.read())
            .finish_non_exhaustive()
    }
}
