//! Backend REST surface: paths, headers and status classification.
//!
//! Two backends are addressed. The relay serves the message endpoints
//! (`/api/v1/...`) and stands in for the usual agent tier. The pod serves
//! metadata endpoints and the ingestor submit route.

use base64::{
    alphabet,
    engine::{
        general_purpose::{GeneralPurpose, GeneralPurposeConfig},
        DecodePaddingMode,
    },
    Engine as _,
};
use reqwest::{Response, StatusCode};
use serde_json::Value;

use crate::error::{AgentlessError, Result};

/// Header carrying the session token on pod calls and intercepted requests
/// (`sessionToken` on the wire; header names are case-insensitive and kept
/// lowercase here).
pub const SESSION_TOKEN_HEADER: &str = "sessiontoken";
/// Header carrying the key manager token on intercepted requests.
pub const KEY_MANAGER_TOKEN_HEADER: &str = "keymanagertoken";
pub const CSRF_TOKEN_HEADER: &str = "x-symphony-csrf-token";

pub const INGESTOR_PATH: &str = "/webcontroller/ingestor/v2/MessageService";
pub const ATTACHMENT_TYPES_PATH: &str = "/v1/files/allowedTypes";

pub fn stream_messages_path(stream_id: &str) -> String {
    format!("/api/v1/streams/{stream_id}/messages")
}

pub fn message_path(message_id: &str) -> String {
    format!("/api/v1/messages/{message_id}")
}

pub fn attachment_path(stream_id: &str, message_id: &str, attachment_id: &str) -> String {
    format!("/api/v1/streams/{stream_id}/messages/{message_id}/attachments/{attachment_id}")
}

pub fn suppress_path(message_id: &str) -> String {
    format!("/v1/admin/messagesuppression/{message_id}/suppress")
}

pub fn message_status_path(message_id: &str) -> String {
    format!("/v1/message/{message_id}/status")
}

pub fn stream_attachments_path(stream_id: &str) -> String {
    format!("/v1/streams/{stream_id}/attachments")
}

pub fn receipts_path(message_id: &str) -> String {
    format!("/v1/admin/messages/{message_id}/receipts")
}

pub fn relationships_path(message_id: &str) -> String {
    format!("/v1/admin/messages/{message_id}/metadata/relationships")
}

/// Datafeed read on the agent surface. Used through the proxy shape.
pub fn datafeed_read_path(datafeed_id: &str) -> String {
    format!("/agent/v5/datafeeds/{datafeed_id}/read")
}

/// Join a base URL and an absolute path without doubling the slash.
pub fn join(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

/// Classify a response: 401 is `Unauthorized`, any other non-success
/// status is `Status` with the body text attached.
pub async fn check_status(address: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(AgentlessError::Unauthorized {
            address: address.to_string(),
        });
    }
    let body = response.text().await.unwrap_or_default();
    Err(AgentlessError::Status {
        address: address.to_string(),
        status: status.as_u16(),
        body,
    })
}

const JWT_SEGMENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// The `sessionId` claim of a JWT session token, read without verifying the
/// signature. The ingestor expects it as the `skey` cookie.
pub fn session_id_claim(session_token: &str) -> Result<String> {
    let payload = session_token
        .split('.')
        .nth(1)
        .ok_or_else(|| AgentlessError::Authentication("session token is not a JWT".into()))?;
    let claims: Value = serde_json::from_slice(&JWT_SEGMENT.decode(payload)?)?;
    claims
        .get("sessionId")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| {
            AgentlessError::Authentication("session token has no sessionId claim".into())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    #[test]
    fn join_tolerates_trailing_slash() {
        assert_eq!(
            join("http://relay:9090/", &message_path("m1")),
            "http://relay:9090/api/v1/messages/m1"
        );
        assert_eq!(
            join("http://pod/pod", &suppress_path("m1")),
            "http://pod/pod/v1/admin/messagesuppression/m1/suppress"
        );
    }

    #[test]
    fn session_id_is_read_from_jwt_payload() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"bot","sessionId":"skey-123"}"#);
        let token = format!("eyJhbGciOiJSUzUxMiJ9.{payload}.c2ln");
        assert_eq!(session_id_claim(&token).unwrap(), "skey-123");
    }

    #[test]
    fn opaque_session_token_has_no_session_id() {
        assert!(matches!(
            session_id_claim("opaque-token"),
            Err(AgentlessError::Authentication(_))
        ));
    }
}
