//! agentless — transparent field encryption for chat messages
//!
//! Message bodies are encrypted on the client before they leave the process
//! and decrypted after retrieval, under a key scoped to the stream and to the
//! key manager session. No intermediary agent tier is involved.
//!
//! # Module layout
//! - `session`    — token pair + refreshable session context
//! - `stream_id`  — URL-safe / standard stream identifier conversion
//! - `crypto`     — opaque crypto capability + single-flight session cache
//! - `keyring`    — local HKDF + XChaCha20-Poly1305 key provider
//! - `retry`      — re-authenticate-once recovery executor
//! - `model`      — backend record shapes
//! - `markup`     — messageML rendering collaborator
//! - `outbound`   — encryption of outgoing message representations
//! - `inbound`    — in-place decryption of message records and events
//! - `api`        — backend paths and status classification
//! - `gateway`    — typed message operations (embedded shape)
//! - `proxy`      — URL-pattern request/response filter (transport shape)
//! - `config`     — runtime configuration
//! - `error`      — unified error type

pub mod api;
pub mod config;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod inbound;
pub mod keyring;
pub mod markup;
pub mod model;
pub mod outbound;
pub mod proxy;
pub mod retry;
pub mod session;
pub mod stream_id;

pub use config::AgentlessConfig;
pub use crypto::{CryptoProvider, CryptoSession, CryptoSessionCache};
pub use error::{AgentlessError, Result};
pub use gateway::MessageGateway;
pub use inbound::{DecryptedRecord, DecryptionMode, InboundDecryptionFilter};
pub use outbound::{EncryptedMessagePayload, OutboundEncryptionFilter};
pub use proxy::{FilteredTransport, InterceptingProxyFilter};
pub use retry::RetryRecoveryExecutor;
pub use session::{SessionAuthenticator, SessionContext, TokenPair};
pub use stream_id::StreamKeyId;
