//! Typed message operations over the relay and pod backends.
//!
//! Every backend call runs through the `RetryRecoveryExecutor`, and each
//! attempt reads the session's current token pair, so a replay after a
//! refresh authenticates and encrypts with the fresh pair.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::{header, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info};

use crate::api;
use crate::config::{AgentlessConfig, SubmitRoute};
use crate::crypto::{CryptoProvider, CryptoSessionCache};
use crate::error::{AgentlessError, Result};
use crate::inbound::{DecryptedRecord, InboundDecryptionFilter};
use crate::markup::{BasicMarkupRenderer, MarkupRenderer, RenderedMessage};
use crate::model::{
    AttachmentKey, AttachmentSort, MessageMetadataResponse, MessageReceiptDetailResponse,
    MessageRecord, MessageStatus, MessageSuppressionResponse, Pagination, StreamAttachmentItem,
};
use crate::outbound::OutboundEncryptionFilter;
use crate::retry::RetryRecoveryExecutor;
use crate::session::{SessionContext, TokenPair};
use crate::stream_id::to_key_id;

pub struct MessageGateway {
    http: reqwest::Client,
    config: Arc<AgentlessConfig>,
    session: Arc<SessionContext>,
    cache: Arc<CryptoSessionCache>,
    renderer: Arc<dyn MarkupRenderer>,
    outbound: OutboundEncryptionFilter,
    inbound: InboundDecryptionFilter,
    executor: RetryRecoveryExecutor,
}

impl MessageGateway {
    pub fn new(
        config: AgentlessConfig,
        session: Arc<SessionContext>,
        provider: Arc<dyn CryptoProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.request_timeout())
            .build()?;
        let cache = Arc::new(CryptoSessionCache::with_capacity(
            provider,
            config.session_cache_capacity,
        ));
        Ok(Self::from_parts(
            http,
            Arc::new(config),
            session,
            cache,
            Arc::new(BasicMarkupRenderer),
        ))
    }

    fn from_parts(
        http: reqwest::Client,
        config: Arc<AgentlessConfig>,
        session: Arc<SessionContext>,
        cache: Arc<CryptoSessionCache>,
        renderer: Arc<dyn MarkupRenderer>,
    ) -> Self {
        Self {
            outbound: OutboundEncryptionFilter::new(Arc::clone(&cache)),
            inbound: InboundDecryptionFilter::new(Arc::clone(&cache)),
            executor: RetryRecoveryExecutor::new(Arc::clone(&session))
                .with_cache(Arc::clone(&cache)),
            http,
            config,
            session,
            cache,
            renderer,
        }
    }

    pub fn with_renderer(self, renderer: Arc<dyn MarkupRenderer>) -> Self {
        Self::from_parts(self.http, self.config, self.session, self.cache, renderer)
    }

    /// A gateway acting on behalf of another identity. HTTP client, config,
    /// renderer and the crypto session cache are shared; the OBO token pair
    /// gets its own cache entry.
    pub fn obo(&self, session: Arc<SessionContext>) -> Self {
        Self::from_parts(
            self.http.clone(),
            Arc::clone(&self.config),
            session,
            Arc::clone(&self.cache),
            Arc::clone(&self.renderer),
        )
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    pub fn cache(&self) -> &Arc<CryptoSessionCache> {
        &self.cache
    }

    pub fn config(&self) -> &AgentlessConfig {
        &self.config
    }

    /// Render `message_ml`, encrypt both representations and submit them.
    ///
    /// The returned record is the backend's echo as is. It is not decrypted;
    /// the caller already holds the clear form.
    pub async fn send(&self, stream_id: &str, message_ml: &str) -> Result<MessageRecord> {
        let rendered = self.renderer.render(message_ml)?;
        self.send_rendered(stream_id, &rendered).await
    }

    /// Submit a message whose text and presentation forms are already split.
    pub async fn send_rendered(
        &self,
        stream_id: &str,
        message: &RenderedMessage,
    ) -> Result<MessageRecord> {
        let record = match self.config.submit_route {
            SubmitRoute::Relay => self.submit_to_relay(stream_id, message).await?,
            SubmitRoute::Ingestor => self.submit_to_ingestor(stream_id, message).await?,
        };
        info!(
            stream = %stream_id,
            message_id = record.message_id.as_deref().unwrap_or("<unknown>"),
            "message sent"
        );
        Ok(record)
    }

    async fn submit_to_relay(
        &self,
        stream_id: &str,
        message: &RenderedMessage,
    ) -> Result<MessageRecord> {
        let url = api::join(&self.config.relay_base_url, &api::stream_messages_path(stream_id));
        let url = url.as_str();
        self.executor
            .execute_with_recovery("send", url, move || async move {
                let tokens = self.session.tokens();
                let payload = self
                    .outbound
                    .encrypt_for_send(&tokens, stream_id, message)
                    .await?;
                let request = self
                    .relay_request(Method::POST, url, &tokens)
                    .form(&[("message", payload.presentation_ml), ("text", payload.text)]);
                json_response(url, request).await
            })
            .await
    }

    async fn submit_to_ingestor(
        &self,
        stream_id: &str,
        message: &RenderedMessage,
    ) -> Result<MessageRecord> {
        let url = api::join(&self.config.pod_base_url, api::INGESTOR_PATH);
        let url = url.as_str();
        let thread_id = to_key_id(stream_id)?;
        let thread_id = &thread_id;
        self.executor
            .execute_with_recovery("send", url, move || async move {
                let tokens = self.session.tokens();
                let skey = api::session_id_claim(&tokens.session_token)?;
                let payload = self
                    .outbound
                    .encrypt_for_send(&tokens, stream_id, message)
                    .await?;
                let document = json!({
                    "version": "SOCIALMESSAGE",
                    "sendingApp": "lc",
                    "threadId": thread_id.as_str(),
                    "clientVersionInfo": self.config.user_agent,
                    "attachments": [],
                    "format": "com.symphony.messageml.v2",
                    "text": payload.text,
                    "entities": {},
                    "presentationML": payload.presentation_ml,
                    "enforceExpressionFiltering": true,
                    "msgFeatures": 3,
                    "tokenIds": [],
                });
                let request = self
                    .http
                    .post(url)
                    .header(header::COOKIE, format!("skey={skey}"))
                    .header(
                        api::CSRF_TOKEN_HEADER,
                        Utc::now().timestamp_millis().to_string(),
                    )
                    .form(&[("messagepayload", document.to_string())]);
                json_response(url, request).await
            })
            .await
    }

    /// List a stream's messages since `since`, decrypting each one.
    ///
    /// Backend order is preserved. With the default report-all policy a
    /// record that fails to decrypt comes back as `DecryptedRecord::Failed`
    /// next to the others; with `strict` the first failure aborts the call.
    pub async fn list_messages(
        &self,
        stream_id: &str,
        since: DateTime<Utc>,
        pagination: Option<Pagination>,
    ) -> Result<Vec<DecryptedRecord>> {
        let url = api::join(&self.config.relay_base_url, &api::stream_messages_path(stream_id));
        let url = url.as_str();

        let mut query = vec![("since", since.timestamp_millis().to_string())];
        let pagination = pagination.unwrap_or_default();
        if let Some(skip) = pagination.skip {
            query.push(("skip", skip.to_string()));
        }
        if let Some(limit) = pagination.limit {
            query.push(("limit", limit.to_string()));
        }
        let query = query.as_slice();

        let records: Vec<MessageRecord> = self
            .executor
            .execute_with_recovery("listMessages", url, move || async move {
                let tokens = self.session.tokens();
                let request = self.relay_request(Method::GET, url, &tokens).query(query);
                json_response(url, request).await
            })
            .await?;
        debug!(stream = %stream_id, count = records.len(), "messages listed");

        self.inbound
            .decrypt_all(&self.session.tokens(), records, self.config.batch_decryption)
            .await
    }

    /// Fetch one message and decrypt it. Any decryption failure is returned.
    pub async fn get_message(&self, message_id: &str) -> Result<MessageRecord> {
        let url = api::join(&self.config.relay_base_url, &api::message_path(message_id));
        let url = url.as_str();
        let record: MessageRecord = self
            .executor
            .execute_with_recovery("getMessage", url, move || async move {
                let tokens = self.session.tokens();
                json_response(url, self.relay_request(Method::GET, url, &tokens)).await
            })
            .await?;
        self.inbound
            .decrypt_record(&self.session.tokens(), record)
            .await
    }

    /// Download an attachment and decrypt it under its stream's key.
    pub async fn get_attachment(
        &self,
        stream_id: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>> {
        self.get_attachment_with(stream_id, message_id, attachment_id, &AttachmentKey::Stream)
            .await
    }

    pub async fn get_attachment_with(
        &self,
        stream_id: &str,
        message_id: &str,
        attachment_id: &str,
        key: &AttachmentKey,
    ) -> Result<Vec<u8>> {
        // TODO: decrypt with the ephemeral key once the key manager exposes
        // per-attachment key retrieval.
        if let AttachmentKey::Ephemeral(_) = key {
            return Err(AgentlessError::UnsupportedAttachmentKey);
        }
        let key_id = to_key_id(stream_id)?;
        let url = api::join(
            &self.config.relay_base_url,
            &api::attachment_path(stream_id, message_id, attachment_id),
        );
        let url = url.as_str();

        let ciphertext = self
            .executor
            .execute_with_recovery("getAttachment", url, move || async move {
                let tokens = self.session.tokens();
                let request = self
                    .relay_request(Method::GET, url, &tokens)
                    .header(header::ACCEPT, "application/octet-stream");
                let response = api::check_status(url, request.send().await?).await?;
                Ok::<_, AgentlessError>(response.bytes().await?)
            })
            .await?;

        let session = self.cache.for_context(&self.session).await?;
        let plaintext = session
            .decrypt(&key_id, &ciphertext)
            .await
            .map_err(|err| match err {
                AgentlessError::DecryptionFailure { reason, .. } => {
                    AgentlessError::decryption(Some(message_id), reason)
                }
                other => other,
            })?;
        debug!(stream = %stream_id, message_id, bytes = plaintext.len(), "attachment decrypted");
        Ok(plaintext)
    }

    pub async fn suppress_message(&self, message_id: &str) -> Result<MessageSuppressionResponse> {
        self.pod_call("suppressMessage", Method::POST, &api::suppress_path(message_id), &[])
            .await
    }

    pub async fn get_message_status(&self, message_id: &str) -> Result<MessageStatus> {
        self.pod_call("getMessageStatus", Method::GET, &api::message_status_path(message_id), &[])
            .await
    }

    pub async fn get_attachment_types(&self) -> Result<Vec<String>> {
        self.pod_call("getAttachmentTypes", Method::GET, api::ATTACHMENT_TYPES_PATH, &[])
            .await
    }

    /// Attachments posted to a stream. `sort` defaults to ascending.
    pub async fn list_attachments(
        &self,
        stream_id: &str,
        since: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: Option<u32>,
        sort: Option<AttachmentSort>,
    ) -> Result<Vec<StreamAttachmentItem>> {
        let mut query = Vec::new();
        if let Some(since) = since {
            query.push(("since", since.timestamp_millis().to_string()));
        }
        if let Some(to) = to {
            query.push(("to", to.timestamp_millis().to_string()));
        }
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        query.push(("sort", sort.unwrap_or_default().as_str().to_string()));

        self.pod_call(
            "listAttachments",
            Method::GET,
            &api::stream_attachments_path(stream_id),
            &query,
        )
        .await
    }

    pub async fn list_message_receipts(
        &self,
        message_id: &str,
    ) -> Result<MessageReceiptDetailResponse> {
        self.pod_call("listMessageReceipts", Method::GET, &api::receipts_path(message_id), &[])
            .await
    }

    pub async fn get_message_relationships(
        &self,
        message_id: &str,
    ) -> Result<MessageMetadataResponse> {
        self.pod_call(
            "getMessageRelationships",
            Method::GET,
            &api::relationships_path(message_id),
            &[],
        )
        .await
    }

    fn relay_request(&self, method: Method, url: &str, tokens: &TokenPair) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&tokens.session_token)
            .header(header::ACCEPT, "application/json")
    }

    /// Metadata call against the pod. No payload is encrypted, but the call
    /// still goes through session recovery.
    async fn pod_call<T: DeserializeOwned>(
        &self,
        name: &str,
        method: Method,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = api::join(&self.config.pod_base_url, path);
        let url = url.as_str();
        let method = &method;
        self.executor
            .execute_with_recovery(name, url, move || async move {
                let tokens = self.session.tokens();
                let request = self
                    .http
                    .request(method.clone(), url)
                    .bearer_auth(&tokens.session_token)
                    .header(api::SESSION_TOKEN_HEADER, &tokens.session_token)
                    .header(header::USER_AGENT, self.config.user_agent.as_str())
                    .query(query);
                json_response(url, request).await
            })
            .await
    }
}

impl std::fmt::Debug for MessageGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageGateway")
            .field("config", &self.config)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

async fn json_response<T: DeserializeOwned>(url: &str, request: RequestBuilder) -> Result<T> {
    let response = api::check_status(url, request.send().await?).await?;
    Ok(response.json::<T>().await?)
}
