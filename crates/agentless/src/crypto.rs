//! The opaque crypto capability and its per-token-pair cache.
//!
//! Key derivation, ciphers and key exchange live behind `CryptoProvider`;
//! this crate only ever asks for "a session for these tokens" and then for
//! `encrypt(key_id, bytes)` / `decrypt(key_id, bytes)`.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::RwLock;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::Result;
use crate::session::{SessionContext, TokenPair};
use crate::stream_id::StreamKeyId;

/// Token pairs remembered when no capacity is given.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Encrypt/decrypt capability bound to exactly one token pair.
#[async_trait]
pub trait CryptoSession: Send + Sync {
    async fn encrypt(&self, key_id: &StreamKeyId, plaintext: &[u8]) -> Result<Vec<u8>>;
    async fn decrypt(&self, key_id: &StreamKeyId, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Derives crypto sessions. Derivation may hit a key manager and may fail.
#[async_trait]
pub trait CryptoProvider: Send + Sync {
    async fn derive(&self, tokens: &TokenPair) -> Result<Arc<dyn CryptoSession>>;
}

type SessionCell = Arc<OnceCell<Arc<dyn CryptoSession>>>;

/// Memoizes one crypto session per distinct token pair.
///
/// # Invariants
///
/// - The cache key is the token pair value, so a refreshed `SessionContext`
///   misses and derives afresh; OBO pairs get their own entries.
/// - Derivation for a given pair runs at most once at a time. Concurrent
///   first callers wait on the same cell instead of deriving again.
/// - A failed derivation is not cached and leaves no entry behind.
/// - At most `capacity` pairs are held. The oldest pair is dropped first,
///   so superseded pairs age out even when nobody evicts them.
/// - Cache hits only take the read lock and never block each other.
pub struct CryptoSessionCache {
    provider: Arc<dyn CryptoProvider>,
    sessions: RwLock<LruCache<TokenPair, SessionCell>>,
}

impl CryptoSessionCache {
    pub fn new(provider: Arc<dyn CryptoProvider>) -> Self {
        Self::with_capacity(provider, DEFAULT_CACHE_CAPACITY)
    }

    /// A capacity of zero is treated as one.
    pub fn with_capacity(provider: Arc<dyn CryptoProvider>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            provider,
            sessions: RwLock::new(LruCache::new(capacity)),
        }
    }

    pub async fn get(&self, tokens: &TokenPair) -> Result<Arc<dyn CryptoSession>> {
        let cell = self.cell_for(tokens);
        let derived = cell
            .get_or_try_init(|| async {
                debug!("deriving crypto session");
                self.provider.derive(tokens).await
            })
            .await;
        match derived {
            Ok(session) => Ok(Arc::clone(session)),
            Err(err) => {
                let mut sessions = self.sessions.write();
                let stale = sessions
                    .peek(tokens)
                    .is_some_and(|held| Arc::ptr_eq(held, &cell) && !held.initialized());
                if stale {
                    sessions.pop(tokens);
                }
                Err(err)
            }
        }
    }

    /// Session for whatever pair the context currently holds.
    pub async fn for_context(&self, context: &SessionContext) -> Result<Arc<dyn CryptoSession>> {
        self.get(&context.tokens()).await
    }

    /// Drop the entry for a superseded pair. Returns whether one existed.
    pub fn evict(&self, tokens: &TokenPair) -> bool {
        self.sessions.write().pop(tokens).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.sessions.read().cap().get()
    }

    fn cell_for(&self, tokens: &TokenPair) -> SessionCell {
        if let Some(cell) = self.sessions.read().peek(tokens) {
            return Arc::clone(cell);
        }
        let mut sessions = self.sessions.write();
        if let Some(cell) = sessions.peek(tokens) {
            return Arc::clone(cell);
        }
        let cell = SessionCell::default();
        if sessions.push(tokens.clone(), Arc::clone(&cell)).is_some() {
            debug!(capacity = sessions.cap().get(), "oldest crypto session dropped");
        }
        cell
    }
}
