//! In-process stand-in for the relay, pod and agent endpoints.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use agentless::{Result, SessionAuthenticator, TokenPair};
use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;

pub const MASTER_KEY: [u8; 32] = [42u8; 32];

#[derive(Default)]
pub struct Backend {
    pub accepted_token: Mutex<String>,
    pub records: Mutex<Vec<Value>>,
    pub attachments: Mutex<HashMap<String, Vec<u8>>>,
    pub last_query: Mutex<HashMap<String, String>>,
    pub last_ingest: Mutex<Option<(HeaderMap, HashMap<String, String>)>>,
    pub last_pod_call: Mutex<Option<(HeaderMap, HashMap<String, String>)>>,
    pub rejected: AtomicUsize,
}

impl Backend {
    pub fn accepting(token: &str) -> Arc<Self> {
        let backend = Self::default();
        *backend.accepted_token.lock() = token.to_string();
        Arc::new(backend)
    }

    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn corrupt(&self, message_id: &str) {
        for record in self.records.lock().iter_mut() {
            if record["messageId"] == message_id {
                record["message"] =
                    json!("Y29ycnVwdGVkIGNpcGhlcnRleHQgdGhhdCBpcyBsb25nIGVub3VnaA==");
            }
        }
    }

    fn bearer_ok(&self, headers: &HeaderMap) -> bool {
        let expected = format!("Bearer {}", self.accepted_token.lock());
        let ok = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == expected);
        if !ok {
            self.rejected.fetch_add(1, Ordering::SeqCst);
        }
        ok
    }

    /// Pod calls need the bearer and the `sessionToken` header. Accepted
    /// calls are recorded.
    fn pod_ok(&self, headers: &HeaderMap, query: HashMap<String, String>) -> bool {
        let session_header_ok = headers
            .get("sessiontoken")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == *self.accepted_token.lock());
        if !session_header_ok {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return false;
        }
        if !self.bearer_ok(headers) {
            return false;
        }
        *self.last_pod_call.lock() = Some((headers.clone(), query));
        true
    }

    fn store(&self, stream_id: &str, message: &str) -> Value {
        let mut records = self.records.lock();
        let n = records.len() + 1;
        let record = json!({
            "messageId": format!("m{n}"),
            "timestamp": 1_700_000_000_000_i64 + n as i64,
            "message": message,
            "stream": { "streamId": stream_id, "streamType": "ROOM" },
            "user": { "userId": 7, "displayName": "bot" },
        });
        records.push(record.clone());
        record
    }

    fn find(&self, message_id: &str) -> Option<Value> {
        self.records
            .lock()
            .iter()
            .find(|r| r["messageId"] == message_id)
            .cloned()
    }

    fn in_stream(&self, stream_id: &str, query: &HashMap<String, String>) -> Vec<Value> {
        let skip = query.get("skip").and_then(|v| v.parse().ok()).unwrap_or(0);
        let limit = query.get("limit").and_then(|v| v.parse().ok()).unwrap_or(usize::MAX);
        self.records
            .lock()
            .iter()
            .filter(|r| r["stream"]["streamId"] == stream_id)
            .skip(skip)
            .take(limit)
            .cloned()
            .collect()
    }
}

type Shared = State<Arc<Backend>>;
type Reply = std::result::Result<Json<Value>, StatusCode>;

async fn relay_send(
    State(backend): Shared,
    Path(stream_id): Path<String>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Reply {
    if !backend.bearer_ok(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    if !form.contains_key("text") {
        return Err(StatusCode::BAD_REQUEST);
    }
    let message = form.get("message").ok_or(StatusCode::BAD_REQUEST)?;
    Ok(Json(backend.store(&stream_id, message)))
}

async fn relay_list(
    State(backend): Shared,
    Path(stream_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Reply {
    if !backend.bearer_ok(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let records = backend.in_stream(&stream_id, &query);
    *backend.last_query.lock() = query;
    Ok(Json(Value::Array(records)))
}

async fn relay_get(
    State(backend): Shared,
    Path(message_id): Path<String>,
    headers: HeaderMap,
) -> Reply {
    if !backend.bearer_ok(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    backend.find(&message_id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn relay_attachment(
    State(backend): Shared,
    Path((_stream_id, _message_id, attachment_id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> std::result::Result<Vec<u8>, StatusCode> {
    if !backend.bearer_ok(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    backend
        .attachments
        .lock()
        .get(&attachment_id)
        .cloned()
        .ok_or(StatusCode::NOT_FOUND)
}

async fn pod_status(
    State(backend): Shared,
    Path(message_id): Path<String>,
    headers: HeaderMap,
) -> Reply {
    if !backend.pod_ok(&headers, HashMap::new()) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(json!({
        "author": { "userId": 7 },
        "creationDate": 1_700_000_000_000_i64,
        "read": [],
        "delivered": [{ "userId": 8 }],
        "sent": [],
        "messageId": message_id,
    })))
}

async fn pod_suppress(
    State(backend): Shared,
    Path(message_id): Path<String>,
    headers: HeaderMap,
) -> Reply {
    if !backend.pod_ok(&headers, HashMap::new()) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(json!({
        "messageId": message_id,
        "suppressed": true,
        "suppressionDate": 1_700_000_100_000_i64,
    })))
}

async fn pod_attachment_types(State(backend): Shared, headers: HeaderMap) -> Reply {
    if !backend.pod_ok(&headers, HashMap::new()) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(json!([".pdf", ".png", ".txt"])))
}

async fn pod_stream_attachments(
    State(backend): Shared,
    Path(stream_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Reply {
    if !backend.pod_ok(&headers, query) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(json!([{
        "messageId": "m1",
        "fileId": format!("internal_{stream_id}_a1"),
        "name": "report.pdf",
        "size": 2048,
        "ingestionDate": 1_700_000_000_000_i64,
    }])))
}

async fn pod_receipts(
    State(backend): Shared,
    Path(message_id): Path<String>,
    headers: HeaderMap,
) -> Reply {
    if !backend.pod_ok(&headers, HashMap::new()) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(json!({
        "creator": { "id": 7 },
        "totalReceipts": 1,
        "items": [{
            "user": { "id": 8 },
            "readDate": 1_700_000_000_500_i64,
            "messageId": message_id,
        }],
    })))
}

async fn pod_relationships(
    State(backend): Shared,
    Path(message_id): Path<String>,
    headers: HeaderMap,
) -> Reply {
    if !backend.pod_ok(&headers, HashMap::new()) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(json!({
        "messageId": message_id,
        "parent": { "messageId": "m0", "relationshipType": "REPLY" },
        "replies": ["m3"],
        "forwards": [],
    })))
}

async fn pod_ingest(
    State(backend): Shared,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Reply {
    let payload: Value = form
        .get("messagepayload")
        .and_then(|p| serde_json::from_str(p).ok())
        .ok_or(StatusCode::BAD_REQUEST)?;
    let thread_id = payload["threadId"].as_str().unwrap_or_default().to_string();
    let presentation = payload["presentationML"].as_str().unwrap_or_default().to_string();
    *backend.last_ingest.lock() = Some((headers, form));
    Ok(Json(backend.store(&thread_id, &presentation)))
}

async fn agent_create(
    State(backend): Shared,
    Path(stream_id): Path<String>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Reply {
    relay_send(State(backend), Path(stream_id), headers, Form(form)).await
}

async fn agent_list(
    State(backend): Shared,
    Path(stream_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Reply {
    relay_list(State(backend), Path(stream_id), headers, Query(query)).await
}

async fn agent_datafeed(
    State(backend): Shared,
    Path(_datafeed_id): Path<String>,
    headers: HeaderMap,
) -> Reply {
    if !backend.bearer_ok(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let events: Vec<Value> = backend
        .records
        .lock()
        .iter()
        .map(|record| {
            json!({
                "id": format!("evt-{}", record["messageId"].as_str().unwrap_or_default()),
                "type": "MESSAGESENT",
                "initiator": { "user": { "userId": 7 } },
                "payload": { "messageSent": { "message": record } },
            })
        })
        .collect();
    Ok(Json(json!({ "events": events, "ackId": "ack-1" })))
}

/// Serve the mock on an ephemeral port. Returns the base URL.
pub async fn spawn(backend: Arc<Backend>) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new()
        .route("/relay/api/v1/streams/:sid/messages", post(relay_send).get(relay_list))
        .route("/relay/api/v1/messages/:id", get(relay_get))
        .route(
            "/relay/api/v1/streams/:sid/messages/:mid/attachments/:aid",
            get(relay_attachment),
        )
        .route("/pod/v1/message/:id/status", get(pod_status))
        .route("/pod/v1/admin/messagesuppression/:id/suppress", post(pod_suppress))
        .route("/pod/v1/files/allowedTypes", get(pod_attachment_types))
        .route("/pod/v1/streams/:sid/attachments", get(pod_stream_attachments))
        .route("/pod/v1/admin/messages/:id/receipts", get(pod_receipts))
        .route(
            "/pod/v1/admin/messages/:id/metadata/relationships",
            get(pod_relationships),
        )
        .route("/pod/webcontroller/ingestor/v2/MessageService", post(pod_ingest))
        .route("/agent/v4/stream/:sid/message/create", post(agent_create))
        .route("/agent/v4/stream/:sid/message", get(agent_list))
        .route("/agent/v1/message/:id", get(relay_get))
        .route("/agent/v5/datafeeds/:id/read", get(agent_datafeed))
        .with_state(backend);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

/// Hands out `st-1`, `st-2`, ... on each authentication.
#[derive(Default)]
pub struct SequenceAuthenticator {
    pub calls: AtomicUsize,
}

impl SequenceAuthenticator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionAuthenticator for SequenceAuthenticator {
    async fn authenticate(&self) -> Result<TokenPair> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TokenPair::new(format!("st-{n}"), format!("km-{n}")))
    }
}
