//! HTTP transport boundary for image fetching
//!
//! [`Transport`] is the seam between the download task and the network:
//! implementations turn a [`FetchRequest`] into a byte stream. The default
//! [`HttpTransport`] is reqwest-backed; tests substitute scripted
//! transports through the same trait.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::StatusCode;
use reqwest::header::{CACHE_CONTROL, HeaderMap, PRAGMA};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Error, Result};

/// A single fetch to perform
#[derive(Clone, Debug)]
pub struct FetchRequest {
    /// The URL to fetch
    pub url: Url,
    /// Headers to send (already filtered by the downloader)
    pub headers: HeaderMap,
    /// Timeout covering the whole fetch
    pub timeout: Duration,
    /// HTTP Basic credentials, if configured
    pub credentials: Option<(String, Option<String>)>,
    /// Honor intermediary HTTP caches instead of bypassing them
    pub use_protocol_cache: bool,
    /// Accept untrusted TLS certificates
    pub allow_insecure_tls: bool,
    /// Send and store cookies
    pub handle_cookies: bool,
}

/// The transport's answer to a [`FetchRequest`]
pub struct FetchResponse {
    /// Expected payload size, when the transport knows it up front
    pub total_bytes: Option<u64>,
    /// The transport-level cache revalidated the resource as unchanged
    /// (HTTP 304); `body` is empty
    pub not_modified: bool,
    /// The payload, streamed as it arrives
    pub body: BoxStream<'static, Result<Bytes>>,
}

/// Performs network fetches on behalf of download tasks
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start the fetch and return the response byte stream.
    ///
    /// Implementations should observe `cancel` while connecting and may
    /// return [`Error::Cancelled`] once it fires; the download task also
    /// watches the token while draining the body.
    async fn fetch(&self, request: FetchRequest, cancel: CancellationToken)
    -> Result<FetchResponse>;

    /// Whether the transport honors cooperative cancellation.
    ///
    /// When false, an abandoned fetch is allowed to run to completion
    /// silently instead of being aborted.
    fn supports_cancellation(&self) -> bool {
        true
    }
}

/// reqwest-backed [`Transport`]
///
/// One shared client serves default requests; a specialized client is built
/// only when a request asks for non-default TLS or cookie behavior.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with a default client.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn client_for(&self, request: &FetchRequest) -> Result<reqwest::Client> {
        if !request.allow_insecure_tls && !request.handle_cookies {
            return Ok(self.client.clone());
        }
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(request.allow_insecure_tls)
            .cookie_store(request.handle_cookies)
            .build()?;
        Ok(client)
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        request: FetchRequest,
        cancel: CancellationToken,
    ) -> Result<FetchResponse> {
        let client = self.client_for(&request)?;

        let mut builder = client
            .get(request.url.clone())
            .headers(request.headers.clone())
            .timeout(request.timeout);

        if !request.use_protocol_cache {
            builder = builder
                .header(CACHE_CONTROL, "no-store")
                .header(PRAGMA, "no-cache");
        }

        if let Some((username, password)) = &request.credentials {
            builder = builder.basic_auth(username, password.as_deref());
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = builder.send() => result?,
        };

        if response.status() == StatusCode::NOT_MODIFIED {
            tracing::debug!(url = %request.url, "server revalidated resource as unchanged");
            return Ok(FetchResponse {
                total_bytes: None,
                not_modified: true,
                body: futures::stream::empty().boxed(),
            });
        }

        let response = response.error_for_status()?;
        let total_bytes = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::from))
            .boxed();

        Ok(FetchResponse {
            total_bytes,
            not_modified: false,
            body,
        })
    }
}
