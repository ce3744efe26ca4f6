//! Local key provider.
//!
//! Stream keys are derived from a 32-byte master secret with HKDF-SHA256,
//! one key per stream key id. Messages are sealed with XChaCha20-Poly1305
//! and the key id is bound as associated data.
//!
//! Wire format of a sealed field:
//!   [ nonce (24 bytes) | ciphertext + tag ]
//!
//! The token pair gates derivation (a session is only handed out for a
//! complete pair) but does not enter the stream key: every participant of
//! a stream must arrive at the same key.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::crypto::{CryptoProvider, CryptoSession};
use crate::error::{AgentlessError, Result};
use crate::session::TokenPair;
use crate::stream_id::StreamKeyId;

const NONCE_LEN: usize = 24;
const STREAM_KEY_SALT: &[u8] = b"agentless-stream-key-v1";

pub struct DerivedKeyProvider {
    master: Zeroizing<[u8; 32]>,
}

impl DerivedKeyProvider {
    pub fn new(master: [u8; 32]) -> Self {
        Self {
            master: Zeroizing::new(master),
        }
    }

    /// Master secret as standard base64 (e.g. from `AGENTLESS_MASTER_KEY`).
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = Zeroizing::new(STANDARD.decode(encoded.trim())?);
        let master: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| AgentlessError::KeyDerivation("master key must be 32 bytes".into()))?;
        Ok(Self::new(master))
    }
}

#[async_trait]
impl CryptoProvider for DerivedKeyProvider {
    async fn derive(&self, tokens: &TokenPair) -> Result<Arc<dyn CryptoSession>> {
        if tokens.session_token.is_empty() || tokens.key_manager_token.is_empty() {
            return Err(AgentlessError::KeyDerivation(
                "both session and key manager tokens are required".into(),
            ));
        }
        Ok(Arc::new(DerivedSession {
            master: self.master.clone(),
        }))
    }
}

struct DerivedSession {
    master: Zeroizing<[u8; 32]>,
}

impl DerivedSession {
    fn stream_cipher(&self, key_id: &StreamKeyId) -> Result<XChaCha20Poly1305> {
        let hk = Hkdf::<Sha256>::new(Some(STREAM_KEY_SALT), self.master.as_slice());
        let mut key = Zeroizing::new([0u8; 32]);
        hk.expand(key_id.as_str().as_bytes(), key.as_mut_slice())
            .map_err(|e| AgentlessError::KeyDerivation(e.to_string()))?;
        XChaCha20Poly1305::new_from_slice(key.as_slice())
            .map_err(|e| AgentlessError::KeyDerivation(e.to_string()))
    }
}

#[async_trait]
impl CryptoSession for DerivedSession {
    async fn encrypt(&self, key_id: &StreamKeyId, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.stream_cipher(key_id)?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: key_id.as_str().as_bytes(),
                },
            )
            .map_err(|e| AgentlessError::EncryptionFailure(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    async fn decrypt(&self, key_id: &StreamKeyId, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN {
            return Err(AgentlessError::decryption(None, "ciphertext shorter than nonce"));
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        let cipher = self.stream_cipher(key_id)?;
        cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: key_id.as_str().as_bytes(),
                },
            )
            .map_err(|_| AgentlessError::decryption(None, "authentication tag mismatch"))
    }
}
