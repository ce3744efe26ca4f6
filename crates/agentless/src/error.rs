use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentlessError {
    #[error("Session token rejected by {address}")]
    Unauthorized { address: String },

    #[error("Invalid stream identifier: {0}")]
    InvalidStreamIdentifier(String),

    #[error("Message is missing its {0} representation")]
    MissingRepresentation(&'static str),

    #[error("Decryption failed for message {}: {reason}", .message_id.as_deref().unwrap_or("<unknown>"))]
    DecryptionFailure {
        message_id: Option<String>,
        reason: String,
    },

    #[error("Encryption failed: {0}")]
    EncryptionFailure(String),

    #[error("Crypto session derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Session refresh failed: {0}")]
    Authentication(String),

    #[error("Attachment key strategy not supported yet")]
    UnsupportedAttachmentKey,

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{address} answered {status}: {body}")]
    Status {
        address: String,
        status: u16,
        body: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Multipart body error: {0}")]
    Multipart(#[from] multer::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentlessError {
    /// The only failure class the retry executor recovers from.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// The message a decryption failure was attributed to, if any.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::DecryptionFailure { message_id, .. } => message_id.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn decryption(message_id: Option<&str>, reason: impl Into<String>) -> Self {
        Self::DecryptionFailure {
            message_id: message_id.map(str::to_owned),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = AgentlessError> = std::result::Result<T, E>;
