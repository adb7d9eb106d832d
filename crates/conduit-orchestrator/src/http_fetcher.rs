//! HTTP implementation of the Fetcher capability

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::time::Duration;
use tracing::{debug, instrument};

use conduit_core::{ConduitError, ConduitResult, DataKind, FailureClass, Fetcher, Payload, WriteRequest};

/// Fetcher backed by a JSON HTTP API
///
/// Reads are `GET {base}/{kind}/{entity}`, writes are `POST {base}/{operation}`
/// with the request as the JSON body.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    base_url: Url,
    client: Client,
}

impl HttpFetcher {
    /// Create a fetcher for `base_url` with a per-request timeout
    pub fn new(base_url: &str, timeout: Duration) -> ConduitResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ConduitError::Configuration(format!("Invalid upstream URL {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ConduitError::Configuration(format!(
                "Upstream URL {} cannot carry a path",
                base_url
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConduitError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { base_url, client })
    }

    /// Base URL every request is built from
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url_for(&self, segments: &[&str]) -> ConduitResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ConduitError::Configuration(format!("Upstream URL {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn map_http_error(error: reqwest::Error) -> ConduitError {
        if error.is_timeout() {
            ConduitError::upstream_with_class(FailureClass::Timeout, format!("Request timeout: {}", error))
        } else if error.is_connect() {
            ConduitError::upstream_with_class(FailureClass::Network, format!("Connection error: {}", error))
        } else {
            ConduitError::upstream(format!("HTTP error: {}", error))
        }
    }

    async fn read_response(response: reqwest::Response) -> ConduitResult<Payload> {
        let status = response.status();
        if status.is_success() {
            return response.json::<Payload>().await.map_err(|e| {
                ConduitError::upstream_with_class(
                    FailureClass::Application,
                    format!("Failed to parse response: {}", e),
                )
            });
        }

        let body = response.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, body)
        };

        let class = match status {
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
                FailureClass::ServiceUnavailable
            }
            _ => FailureClass::Application,
        };
        Err(ConduitError::upstream_with_class(class, message))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self, kind), fields(kind = %kind))]
    async fn fetch(&self, entity: &str, kind: &DataKind) -> ConduitResult<Payload> {
        let url = self.url_for(&[kind.as_str(), entity])?;
        debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(Self::map_http_error)?;
        Self::read_response(response).await
    }

    #[instrument(skip(self, request), fields(operation = %request.operation))]
    async fn write(&self, request: &WriteRequest) -> ConduitResult<Payload> {
        let url = self.url_for(&[request.operation.as_str()])?;
        debug!("POST {} for {}", url, request.target);

        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(Self::map_http_error)?;
        Self::read_response(response).await
    }
}
