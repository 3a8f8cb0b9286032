//! [`GenaClient`] over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use url::Url;

use super::GenaClient;
use crate::error::TransportError;
use crate::gena::{GenaResponse, NotifyRequest, RenewRequest, SubscribeRequest, UnsubscribeRequest};

/// GENA client sending SUBSCRIBE, UNSUBSCRIBE and NOTIFY with reqwest.
#[derive(Debug, Clone)]
pub struct HttpGenaClient {
    client: reqwest::Client,
}

impl HttpGenaClient {
    /// Client with a 10 second request timeout.
    pub fn new() -> Result<Self, TransportError> {
        Self::with_timeout(Duration::from_secs(10))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::InvalidRequest(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    async fn send(
        &self,
        method: &[u8],
        url: &Url,
        headers: Vec<(&'static str, String)>,
        body: Option<String>,
    ) -> Result<GenaResponse, TransportError> {
        let method = Method::from_bytes(method)
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        let mut request = self.client.request(method.clone(), url.clone());
        if let Some(host) = host_header(url) {
            request = request.header("HOST", host);
        }
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| {
            tracing::debug!(%method, %url, error = %e, "GENA request got no response");
            TransportError::NoResponse(e.to_string())
        })?;

        let mut gena = GenaResponse::new(response.status().as_u16());
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                gena = gena.with_header(name.as_str(), value);
            }
        }
        let body = response.text().await.unwrap_or_default();
        tracing::trace!(%method, %url, status = gena.status, "GENA response received");
        Ok(gena.with_body(body))
    }
}

fn host_header(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

#[async_trait]
impl GenaClient for HttpGenaClient {
    async fn subscribe(&self, request: &SubscribeRequest) -> Result<GenaResponse, TransportError> {
        self.send(b"SUBSCRIBE", &request.url, request.headers(), None)
            .await
    }

    async fn renew(&self, request: &RenewRequest) -> Result<GenaResponse, TransportError> {
        self.send(b"SUBSCRIBE", &request.url, request.headers(), None)
            .await
    }

    async fn unsubscribe(
        &self,
        request: &UnsubscribeRequest,
    ) -> Result<GenaResponse, TransportError> {
        self.send(b"UNSUBSCRIBE", &request.url, request.headers(), None)
            .await
    }

    async fn notify(&self, request: &NotifyRequest) -> Result<GenaResponse, TransportError> {
        self.send(
            b"NOTIFY",
            &request.url,
            request.headers(),
            Some(request.body.clone()),
        )
        .await
    }
}
