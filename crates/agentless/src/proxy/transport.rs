use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{InterceptedRequest, InterceptedResponse, InterceptingProxyFilter};
use crate::error::Result;

/// An HTTP client with the interception filter attached: every request is
/// passed through `on_request` before it is sent and every response
/// through `on_response` before it is returned.
#[derive(Clone)]
pub struct FilteredTransport {
    http: reqwest::Client,
    filter: Arc<InterceptingProxyFilter>,
}

impl FilteredTransport {
    pub fn new(http: reqwest::Client, filter: InterceptingProxyFilter) -> Self {
        Self {
            http,
            filter: Arc::new(filter),
        }
    }

    pub fn with_timeout(timeout: Duration, filter: InterceptingProxyFilter) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::new(http, filter))
    }

    /// Send `request` through the filter pair. Non-success statuses are
    /// returned as responses; only transport and filter failures are errors.
    pub async fn execute(&self, mut request: InterceptedRequest) -> Result<InterceptedResponse> {
        self.filter.on_request(&mut request).await?;

        let response = self
            .http
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .body(request.body.clone())
            .send()
            .await?;
        let mut intercepted = InterceptedResponse {
            status: response.status(),
            headers: response.headers().clone(),
            body: response.bytes().await?.to_vec(),
        };
        debug!(
            method = %request.method,
            url = %request.url,
            status = intercepted.status.as_u16(),
            "intercepted exchange"
        );

        self.filter.on_response(&request, &mut intercepted).await?;
        Ok(intercepted)
    }
}
