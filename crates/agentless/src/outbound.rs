//! Outbound message encryption.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::CryptoSessionCache;
use crate::error::{AgentlessError, Result};
use crate::markup::RenderedMessage;
use crate::session::TokenPair;
use crate::stream_id::to_key_id;

/// Both representations of a message, each sealed independently under the
/// same stream key and base64-encoded for transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessagePayload {
    pub text: String,
    #[serde(rename = "presentationML")]
    pub presentation_ml: String,
}

#[derive(Clone)]
pub struct OutboundEncryptionFilter {
    cache: Arc<CryptoSessionCache>,
}

impl OutboundEncryptionFilter {
    pub fn new(cache: Arc<CryptoSessionCache>) -> Self {
        Self { cache }
    }

    /// Encrypt a pre-split message for `api_stream_id` under the session
    /// identified by `tokens`. Either both fields come back sealed or the
    /// call fails; there is no partially encrypted result.
    pub async fn encrypt_for_send(
        &self,
        tokens: &TokenPair,
        api_stream_id: &str,
        message: &RenderedMessage,
    ) -> Result<EncryptedMessagePayload> {
        let text = message
            .text
            .as_deref()
            .ok_or(AgentlessError::MissingRepresentation("text"))?;
        let presentation = message
            .presentation_ml
            .as_deref()
            .ok_or(AgentlessError::MissingRepresentation("presentationML"))?;

        let key_id = to_key_id(api_stream_id)?;
        let session = self.cache.get(tokens).await?;

        let (sealed_text, sealed_presentation) = tokio::try_join!(
            session.encrypt(&key_id, text.as_bytes()),
            session.encrypt(&key_id, presentation.as_bytes()),
        )?;
        debug!(stream = %api_stream_id, "message encrypted for send");

        Ok(EncryptedMessagePayload {
            text: STANDARD.encode(sealed_text),
            presentation_ml: STANDARD.encode(sealed_presentation),
        })
    }
}
