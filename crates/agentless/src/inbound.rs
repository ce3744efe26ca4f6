//! Inbound message decryption.
//!
//! Only the `message` field of a record is ever rewritten. Identifiers,
//! timestamps and sender metadata pass through untouched.
//!
//! Batches are decrypted in one of two modes:
//!
//! - `ReportAll`: every record is attempted; a failure is reported on that
//!   record as `DecryptedRecord::Failed` and the others still come back in
//!   clear. Used for list and datafeed reads.
//! - `Strict`: the first failure aborts the whole batch. Single-record
//!   reads always behave this way.
//!
//! Where a failed record is handed on as JSON it carries a
//! `decryptionError` field next to its untouched ciphertext.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::crypto::{CryptoSession, CryptoSessionCache};
use crate::error::{AgentlessError, Result};
use crate::model::MessageRecord;
use crate::session::TokenPair;
use crate::stream_id::to_key_id;

/// Field added to a record that could not be decrypted.
pub const DECRYPTION_ERROR_FIELD: &str = "decryptionError";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecryptionMode {
    #[default]
    ReportAll,
    Strict,
}

/// Outcome for one record of a report-all batch.
#[derive(Debug)]
pub enum DecryptedRecord {
    Clear(MessageRecord),
    /// `record` is returned exactly as received.
    Failed {
        record: MessageRecord,
        error: AgentlessError,
    },
}

impl DecryptedRecord {
    pub fn is_clear(&self) -> bool {
        matches!(self, Self::Clear(_))
    }

    pub fn record(&self) -> &MessageRecord {
        match self {
            Self::Clear(record) | Self::Failed { record, .. } => record,
        }
    }

    pub fn error(&self) -> Option<&AgentlessError> {
        match self {
            Self::Clear(_) => None,
            Self::Failed { error, .. } => Some(error),
        }
    }

    pub fn into_result(self) -> Result<MessageRecord> {
        match self {
            Self::Clear(record) => Ok(record),
            Self::Failed { error, .. } => Err(error),
        }
    }

    /// The record as it should be handed on. A failed record keeps its
    /// ciphertext and gains a `decryptionError` field.
    pub fn into_marked(self) -> MessageRecord {
        match self {
            Self::Clear(record) => record,
            Self::Failed { mut record, error } => {
                record
                    .extra
                    .insert(DECRYPTION_ERROR_FIELD.into(), Value::String(error.to_string()));
                record
            }
        }
    }
}

#[derive(Clone)]
pub struct InboundDecryptionFilter {
    cache: Arc<CryptoSessionCache>,
}

impl InboundDecryptionFilter {
    pub fn new(cache: Arc<CryptoSessionCache>) -> Self {
        Self { cache }
    }

    /// Decrypt one record. Any failure is returned as is.
    pub async fn decrypt_record(
        &self,
        tokens: &TokenPair,
        record: MessageRecord,
    ) -> Result<MessageRecord> {
        let session = self.cache.get(tokens).await?;
        open_record(session.as_ref(), record).await
    }

    /// Decrypt a batch, preserving order.
    ///
    /// In `Strict` mode the first failure is returned as `Err`. In
    /// `ReportAll` mode the call only fails when no crypto session can be
    /// obtained at all.
    pub async fn decrypt_all(
        &self,
        tokens: &TokenPair,
        records: Vec<MessageRecord>,
        mode: DecryptionMode,
    ) -> Result<Vec<DecryptedRecord>> {
        let session = self.cache.get(tokens).await?;
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let original = record.clone();
            match open_record(session.as_ref(), record).await {
                Ok(clear) => out.push(DecryptedRecord::Clear(clear)),
                Err(err) if mode == DecryptionMode::Strict => return Err(err),
                Err(error) => {
                    warn!(
                        message_id = original.message_id.as_deref().unwrap_or("<unknown>"),
                        error = %error,
                        "message left encrypted"
                    );
                    out.push(DecryptedRecord::Failed {
                        record: original,
                        error,
                    });
                }
            }
        }
        debug!(
            total = out.len(),
            failed = out.iter().filter(|r| !r.is_clear()).count(),
            "batch decrypted"
        );
        Ok(out)
    }

    /// Decrypt the message records embedded in a datafeed event list, in
    /// place, including records nested inside other records. Returns the
    /// per-record failures, each attributed to its message id (always empty
    /// in `Strict` mode, which aborts on the first one instead). Failing
    /// records keep their ciphertext and gain a `decryptionError` field.
    pub async fn decrypt_events(
        &self,
        tokens: &TokenPair,
        events: &mut Value,
        mode: DecryptionMode,
    ) -> Result<Vec<AgentlessError>> {
        let mut slots = Vec::new();
        collect_message_slots(events, String::new(), &mut slots);
        if slots.is_empty() {
            return Ok(Vec::new());
        }

        let session = self.cache.get(tokens).await?;
        let mut failures = Vec::new();
        for pointer in slots {
            let Some(slot) = events.pointer_mut(&pointer) else {
                continue;
            };
            let message_id = slot
                .get("messageId")
                .and_then(Value::as_str)
                .map(str::to_owned);
            let outcome = match serde_json::from_value::<MessageRecord>(slot.clone()) {
                Ok(record) => open_record(session.as_ref(), record).await,
                Err(err) => Err(AgentlessError::decryption(
                    message_id.as_deref(),
                    format!("malformed message record: {err}"),
                )),
            };
            let Some(obj) = slot.as_object_mut() else {
                continue;
            };
            match outcome {
                Ok(clear) => {
                    obj.insert("message".into(), Value::String(clear.message));
                }
                Err(err) if mode == DecryptionMode::Strict => return Err(err),
                Err(err) => {
                    let err = match err {
                        err @ AgentlessError::DecryptionFailure { .. } => err,
                        other => {
                            AgentlessError::decryption(message_id.as_deref(), other.to_string())
                        }
                    };
                    warn!(
                        message_id = message_id.as_deref().unwrap_or("<unknown>"),
                        error = %err,
                        "event message left encrypted"
                    );
                    obj.insert(DECRYPTION_ERROR_FIELD.into(), Value::String(err.to_string()));
                    failures.push(err);
                }
            }
        }
        Ok(failures)
    }
}

async fn open_record(
    session: &dyn CryptoSession,
    mut record: MessageRecord,
) -> Result<MessageRecord> {
    let message_id = record.message_id.clone();
    let fail = |reason: String| AgentlessError::decryption(message_id.as_deref(), reason);

    let stream_id = record
        .stream_id()
        .ok_or_else(|| fail("record carries no stream id".into()))?;
    let key_id = to_key_id(stream_id)?;
    let ciphertext = STANDARD
        .decode(record.message.trim())
        .map_err(|e| fail(format!("message is not base64: {e}")))?;

    let plaintext = session.decrypt(&key_id, &ciphertext).await.map_err(|err| match err {
        AgentlessError::DecryptionFailure { reason, .. } => fail(reason),
        other => other,
    })?;
    record.message =
        String::from_utf8(plaintext).map_err(|_| fail("cleartext is not UTF-8".into()))?;
    Ok(record)
}

/// JSON pointers to every object under `value` that looks like a message
/// record: a `message` string next to a `stream` object. Records nested in a
/// matched record (shared or forwarded posts) are collected too, after
/// their parent.
fn collect_message_slots(value: &Value, pointer: String, out: &mut Vec<String>) {
    if is_message_record(value) {
        out.push(pointer.clone());
    }
    match value {
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                collect_message_slots(item, format!("{pointer}/{index}"), out);
            }
        }
        Value::Object(map) => {
            for (key, child) in map {
                let escaped = key.replace('~', "~0").replace('/', "~1");
                collect_message_slots(child, format!("{pointer}/{escaped}"), out);
            }
        }
        _ => {}
    }
}

fn is_message_record(value: &Value) -> bool {
    value.get("message").is_some_and(Value::is_string)
        && value.get("stream").is_some_and(Value::is_object)
}
