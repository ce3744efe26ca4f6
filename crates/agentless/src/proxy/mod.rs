//! Transport-level interception.
//!
//! Requests and responses are matched against a fixed rule table by URL
//! shape and method, and the matching transform rewrites the body in place.
//! The token pair comes from the intercepted request's own headers; the
//! filter holds no session of its own.
//!
//! | # | direction | method | path suffix                     | transform            |
//! |---|-----------|--------|---------------------------------|----------------------|
//! | 1 | outbound  | POST   | `v4/stream/{sid}/message/create`| encrypt              |
//! | 2 | inbound   | any    | `v1/message/{id}`               | decrypt one, strict  |
//! | 3 | inbound   | any    | `v4/stream/{sid}/message`       | decrypt list         |
//! | 4 | inbound   | any    | `v5/datafeeds/{id}/read`        | decrypt events       |
//!
//! Rules are evaluated in order and the first match wins. List and event
//! reads are report-all: a record that cannot be decrypted keeps its
//! ciphertext, gains a `decryptionError` field, and its message id is
//! listed in the `x-agentless-decryption-failed` response header.
//!
//! Message creation bodies may be JSON, urlencoded or multipart. In every
//! case `message` is replaced by the encrypted PresentationML, a `text`
//! field with the encrypted text is added, and everything else is kept.

mod transport;

pub use transport::FilteredTransport;

use std::sync::Arc;

use bytes::Bytes;
use futures::stream;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};
use url::{form_urlencoded, Url};

use crate::api::{KEY_MANAGER_TOKEN_HEADER, SESSION_TOKEN_HEADER};
use crate::crypto::CryptoSessionCache;
use crate::error::{AgentlessError, Result};
use crate::inbound::{DecryptedRecord, DecryptionMode, InboundDecryptionFilter};
use crate::markup::MarkupRenderer;
use crate::model::MessageRecord;
use crate::outbound::{EncryptedMessagePayload, OutboundEncryptionFilter};
use crate::session::TokenPair;

/// Response header listing the ids of records left encrypted.
pub const DECRYPTION_FAILED_HEADER: &str = "x-agentless-decryption-failed";

#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl InterceptedRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// Attach the token pair the filter will read.
    pub fn with_tokens(mut self, tokens: &TokenPair) -> Result<Self> {
        self.headers
            .insert(SESSION_TOKEN_HEADER, header_value(&tokens.session_token)?);
        self.headers
            .insert(KEY_MANAGER_TOKEN_HEADER, header_value(&tokens.key_manager_token)?);
        Ok(self)
    }

    pub fn with_form(mut self, fields: &[(&str, &str)]) -> Self {
        self.body = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish()
            .into_bytes();
        self.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        self
    }
}

#[derive(Debug, Clone)]
pub struct InterceptedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl InterceptedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transform {
    EncryptMessageCreate,
    DecryptSingle,
    DecryptList,
    DecryptEvents,
}

/// `"*"` matches any one segment and captures it.
struct Rule {
    direction: Direction,
    method: Option<&'static str>,
    suffix: &'static [&'static str],
    transform: Transform,
}

const RULES: &[Rule] = &[
    Rule {
        direction: Direction::Outbound,
        method: Some("POST"),
        suffix: &["v4", "stream", "*", "message", "create"],
        transform: Transform::EncryptMessageCreate,
    },
    Rule {
        direction: Direction::Inbound,
        method: None,
        suffix: &["v1", "message", "*"],
        transform: Transform::DecryptSingle,
    },
    Rule {
        direction: Direction::Inbound,
        method: None,
        suffix: &["v4", "stream", "*", "message"],
        transform: Transform::DecryptList,
    },
    Rule {
        direction: Direction::Inbound,
        method: None,
        suffix: &["v5", "datafeeds", "*", "read"],
        transform: Transform::DecryptEvents,
    },
];

struct Matched {
    transform: Transform,
    captures: Vec<String>,
}

fn match_rule(direction: Direction, method: &Method, url: &Url) -> Option<Matched> {
    let segments: Vec<&str> = url
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .collect();
    RULES
        .iter()
        .filter(|rule| rule.direction == direction)
        .filter(|rule| rule.method.map_or(true, |m| m == method.as_str()))
        .find_map(|rule| {
            let captures = match_suffix(&segments, rule.suffix)?;
            Some(Matched {
                transform: rule.transform,
                captures,
            })
        })
}

fn match_suffix(segments: &[&str], suffix: &[&str]) -> Option<Vec<String>> {
    let start = segments.len().checked_sub(suffix.len())?;
    let mut captures = Vec::new();
    for (segment, expected) in segments[start..].iter().zip(suffix) {
        match *expected {
            "*" => captures.push((*segment).to_string()),
            literal if literal == *segment => {}
            _ => return None,
        }
    }
    Some(captures)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| {
        AgentlessError::Authentication(format!("token is not a valid header value: {e}"))
    })
}

fn tokens_from(headers: &HeaderMap, url: &Url) -> Result<TokenPair> {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
    };
    match (read(SESSION_TOKEN_HEADER), read(KEY_MANAGER_TOKEN_HEADER)) {
        (Some(session), Some(key_manager)) => Ok(TokenPair::new(session, key_manager)),
        _ => Err(AgentlessError::Unauthorized {
            address: url.to_string(),
        }),
    }
}

#[derive(Clone)]
pub struct InterceptingProxyFilter {
    renderer: Arc<dyn MarkupRenderer>,
    outbound: OutboundEncryptionFilter,
    inbound: InboundDecryptionFilter,
}

impl InterceptingProxyFilter {
    pub fn new(cache: Arc<CryptoSessionCache>, renderer: Arc<dyn MarkupRenderer>) -> Self {
        Self {
            renderer,
            outbound: OutboundEncryptionFilter::new(Arc::clone(&cache)),
            inbound: InboundDecryptionFilter::new(cache),
        }
    }

    /// Rewrite an outgoing request. Agent calls gain a bearer header built
    /// from the `sessionToken` header; message creation gets its body
    /// encrypted.
    pub async fn on_request(&self, request: &mut InterceptedRequest) -> Result<()> {
        if request.url.path().contains("/agent/") && !request.headers.contains_key(AUTHORIZATION) {
            if let Some(session) = request.headers.get(SESSION_TOKEN_HEADER).cloned() {
                let bearer = format!("Bearer {}", session.to_str().unwrap_or_default());
                request.headers.insert(AUTHORIZATION, header_value(&bearer)?);
            }
        }

        let Some(matched) = match_rule(Direction::Outbound, &request.method, &request.url) else {
            return Ok(());
        };
        let tokens = tokens_from(&request.headers, &request.url)?;
        match matched.transform {
            Transform::EncryptMessageCreate => {
                let stream_id = matched.captures.first().map(String::as_str).unwrap_or_default();
                request.body = self.encrypt_create_body(&tokens, stream_id, request).await?;
                request.headers.remove(CONTENT_LENGTH);
                debug!(stream = %stream_id, "message create body encrypted");
            }
            other => debug!(?other, "inbound transform on outbound rule ignored"),
        }
        Ok(())
    }

    /// Rewrite an incoming response for `request`. Only successful responses
    /// are touched.
    pub async fn on_response(
        &self,
        request: &InterceptedRequest,
        response: &mut InterceptedResponse,
    ) -> Result<()> {
        if !response.status.is_success() {
            return Ok(());
        }
        let Some(matched) = match_rule(Direction::Inbound, &request.method, &request.url) else {
            return Ok(());
        };
        let tokens = tokens_from(&request.headers, &request.url)?;

        let mut failed_ids = Vec::new();
        let body = match matched.transform {
            Transform::DecryptSingle => {
                let record: MessageRecord = serde_json::from_slice(&response.body)?;
                let clear = self.inbound.decrypt_record(&tokens, record).await?;
                serde_json::to_vec(&clear)?
            }
            Transform::DecryptList => {
                let records: Vec<MessageRecord> = serde_json::from_slice(&response.body)?;
                let outcome = self
                    .inbound
                    .decrypt_all(&tokens, records, DecryptionMode::ReportAll)
                    .await?;
                let records: Vec<MessageRecord> = outcome
                    .into_iter()
                    .map(|outcome| {
                        if let DecryptedRecord::Failed { record, .. } = &outcome {
                            failed_ids.push(record.message_id.clone().unwrap_or_default());
                        }
                        outcome.into_marked()
                    })
                    .collect();
                serde_json::to_vec(&records)?
            }
            Transform::DecryptEvents => {
                let mut events: Value = serde_json::from_slice(&response.body)?;
                let failures = self
                    .inbound
                    .decrypt_events(&tokens, &mut events, DecryptionMode::ReportAll)
                    .await?;
                failed_ids.extend(
                    failures
                        .iter()
                        .map(|err| err.message_id().unwrap_or_default().to_owned()),
                );
                serde_json::to_vec(&events)?
            }
            Transform::EncryptMessageCreate => return Ok(()),
        };
        response.body = body;
        response.headers.remove(CONTENT_LENGTH);
        if !failed_ids.is_empty() {
            warn!(
                url = %request.url,
                failed = failed_ids.len(),
                "records left encrypted"
            );
            if let Ok(value) = HeaderValue::from_str(&failed_ids.join(",")) {
                response.headers.insert(DECRYPTION_FAILED_HEADER, value);
            }
        }
        Ok(())
    }

    async fn encrypt_create_body(
        &self,
        tokens: &TokenPair,
        stream_id: &str,
        request: &InterceptedRequest,
    ) -> Result<Vec<u8>> {
        let content_type = request
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if content_type.starts_with("application/json") {
            let mut body: Value = serde_json::from_slice(&request.body)?;
            let markup = body
                .get("message")
                .and_then(Value::as_str)
                .ok_or(AgentlessError::MissingRepresentation("message"))?;
            let payload = self.seal(tokens, stream_id, markup).await?;
            if let Some(obj) = body.as_object_mut() {
                obj.insert("message".into(), Value::String(payload.presentation_ml));
                obj.insert("text".into(), Value::String(payload.text));
            }
            return Ok(serde_json::to_vec(&body)?);
        }

        if content_type.starts_with("multipart/form-data") {
            let boundary = multer::parse_boundary(content_type)?;
            return self
                .encrypt_multipart(tokens, stream_id, boundary, &request.body)
                .await;
        }

        let mut fields: Vec<(String, String)> = form_urlencoded::parse(&request.body)
            .into_owned()
            .collect();
        let markup = fields
            .iter()
            .find(|(name, _)| name == "message")
            .map(|(_, value)| value.clone())
            .ok_or(AgentlessError::MissingRepresentation("message"))?;
        let payload = self.seal(tokens, stream_id, &markup).await?;

        fields.retain(|(name, _)| name != "message" && name != "text");
        fields.push(("message".into(), payload.presentation_ml));
        fields.push(("text".into(), payload.text));
        Ok(form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&fields)
            .finish()
            .into_bytes())
    }

    /// The body is written back under its own boundary. Kept parts could
    /// not contain it before, and the new parts are base64.
    async fn encrypt_multipart(
        &self,
        tokens: &TokenPair,
        stream_id: &str,
        boundary: String,
        body: &[u8],
    ) -> Result<Vec<u8>> {
        let chunk = Bytes::copy_from_slice(body);
        let mut multipart = multer::Multipart::new(
            stream::once(async move { Ok::<_, std::io::Error>(chunk) }),
            boundary.clone(),
        );

        let mut kept: Vec<(Vec<(String, Vec<u8>)>, Bytes)> = Vec::new();
        let mut markup = None;
        while let Some(field) = multipart.next_field().await? {
            let name = field.name().map(str::to_owned);
            let headers: Vec<(String, Vec<u8>)> = field
                .headers()
                .iter()
                .map(|(name, value)| (name.as_str().to_owned(), value.as_bytes().to_vec()))
                .collect();
            let data = field.bytes().await?;
            match name.as_deref() {
                Some("message") => markup = Some(String::from_utf8_lossy(&data).into_owned()),
                Some("text") => {}
                _ => kept.push((headers, data)),
            }
        }
        let markup = markup.ok_or(AgentlessError::MissingRepresentation("message"))?;
        let payload = self.seal(tokens, stream_id, &markup).await?;

        let mut out = Vec::with_capacity(body.len() * 2);
        for (headers, data) in &kept {
            out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            for (name, value) in headers {
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(b": ");
                out.extend_from_slice(value);
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(data);
            out.extend_from_slice(b"\r\n");
        }
        for (name, value) in [("message", &payload.presentation_ml), ("text", &payload.text)] {
            out.extend_from_slice(
                format!(
                    "--{boundary}\r\ncontent-disposition: form-data; name=\"{name}\"\r\n\r\n\
                     {value}\r\n"
                )
                .as_bytes(),
            );
        }
        out.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        Ok(out)
    }

    async fn seal(
        &self,
        tokens: &TokenPair,
        stream_id: &str,
        markup: &str,
    ) -> Result<EncryptedMessagePayload> {
        let rendered = self.renderer.render(markup)?;
        self.outbound.encrypt_for_send(tokens, stream_id, &rendered).await
    }
}
