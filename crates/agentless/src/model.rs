//! Backend record shapes touched by this crate.
//!
//! Only the fields interception reads or writes are typed; everything else
//! is carried in a flattened map so it round-trips untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A message record as returned by the message endpoints. `message` holds
/// base64 ciphertext on the wire and cleartext after decryption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamRef>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRef {
    pub stream_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageRecord {
    pub fn stream_id(&self) -> Option<&str> {
        self.stream.as_ref().map(|s| s.stream_id.as_str())
    }
}

/// Optional paging for message listing. Unset fields fall back to the
/// backend's own defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pagination {
    pub skip: Option<u32>,
    pub limit: Option<u32>,
}

impl Pagination {
    pub fn new(skip: u32, limit: u32) -> Self {
        Self {
            skip: Some(skip),
            limit: Some(limit),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AttachmentSort {
    #[default]
    Asc,
    Desc,
}

impl AttachmentSort {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Which key opens an attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentKey {
    /// The key of the stream the message was posted to.
    Stream,
    /// A per-attachment ephemeral key referenced by the attachment metadata.
    /// Not supported yet; requests fail with `UnsupportedAttachmentKey`.
    Ephemeral(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSuppressionResponse {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub suppressed: bool,
    #[serde(default)]
    pub suppression_date: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStatus {
    #[serde(default)]
    pub author: Option<Value>,
    #[serde(default)]
    pub creation_date: Option<i64>,
    #[serde(default)]
    pub read: Vec<Value>,
    #[serde(default)]
    pub delivered: Vec<Value>,
    #[serde(default)]
    pub sent: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamAttachmentItem {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub ingestion_date: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReceiptDetailResponse {
    #[serde(default)]
    pub total_receipts: Option<u64>,
    #[serde(default)]
    pub items: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadataResponse {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub parent: Option<Value>,
    #[serde(default)]
    pub replies: Vec<Value>,
    #[serde(default)]
    pub forwards: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
