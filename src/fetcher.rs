use std::time::Duration;

use reqwest::{header, Client};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{SyncConfig, RELAY_URL_PLACEHOLDER};

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const FEED_ACCEPT: &str =
    "application/rss+xml, application/atom+xml, application/xml, text/xml;q=0.9, */*;q=0.8";
/// Root element markers that identify a feed document.
const FEED_MARKERS: [&str; 3] = ["<rss", "<feed", "<rdf:rdf"];

/// Why a single fetch attempt failed.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Empty response body")]
    EmptyBody,
    #[error("Response too large")]
    ResponseTooLarge,
    #[error("Relay returned non-feed content")]
    NotAFeed,
}

/// Every transport failed for `url`; `last_error` is from the final attempt.
#[derive(Debug, Error)]
#[error("Failed to fetch {url}: {last_error}")]
pub struct FetchFailure {
    pub url: String,
    pub last_error: FetchError,
}

/// One way of reaching a feed URL.
#[derive(Debug, Clone, PartialEq)]
pub enum Transport {
    Direct,
    /// URL template; `{url}` is replaced by the percent-encoded feed URL
    Relay(String),
}

impl Transport {
    pub fn request_url(&self, url: &str) -> String {
        match self {
            Transport::Direct => url.to_string(),
            Transport::Relay(template) => {
                template.replace(RELAY_URL_PLACEHOLDER, &urlencoding::encode(url))
            }
        }
    }

    fn is_relay(&self) -> bool {
        matches!(self, Transport::Relay(_))
    }
}

/// Raw upstream response returned by the diagnostic passthrough.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

/// Direct fetch followed by the configured relays, in order, until one
/// returns an acceptable body.
pub struct FetchStrategy {
    client: Client,
    transports: Vec<Transport>,
}

impl FetchStrategy {
    pub fn new(user_agent: &str, relays: &[String]) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        let transports = std::iter::once(Transport::Direct)
            .chain(relays.iter().cloned().map(Transport::Relay))
            .collect();

        Ok(Self { client, transports })
    }

    pub fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        Self::new(&config.user_agent, &config.relays)
    }

    pub fn transports(&self) -> &[Transport] {
        &self.transports
    }

    pub async fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, FetchFailure> {
        let mut last_error = None;

        for transport in &self.transports {
            match self.attempt(transport, url, timeout).await {
                Ok(body) => {
                    debug!(url = %url, transport = ?transport, bytes = body.len(), "Fetched feed");
                    return Ok(body);
                }
                Err(e) => {
                    warn!(url = %url, transport = ?transport, error = %e, "Fetch attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(FetchFailure {
            url: url.to_string(),
            last_error: last_error.unwrap_or(FetchError::EmptyBody),
        })
    }

    async fn attempt(
        &self,
        transport: &Transport,
        url: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, FetchError> {
        let request_url = transport.request_url(url);
        let body = tokio::time::timeout(timeout, async {
            let response = self
                .client
                .get(&request_url)
                .header(header::ACCEPT, FEED_ACCEPT)
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(FetchError::HttpStatus(response.status().as_u16()));
            }
            if let Some(len) = response.content_length() {
                if len as usize > MAX_FEED_SIZE {
                    return Err(FetchError::ResponseTooLarge);
                }
            }

            let bytes = response.bytes().await?;
            Ok::<_, FetchError>(bytes.to_vec())
        })
        .await
        .map_err(|_| FetchError::Timeout(timeout))??;

        if body.len() > MAX_FEED_SIZE {
            return Err(FetchError::ResponseTooLarge);
        }
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(FetchError::EmptyBody);
        }
        if transport.is_relay() && !looks_like_feed(&body) {
            return Err(FetchError::NotAFeed);
        }

        Ok(body)
    }

    /// Single direct request returning the upstream status and body as-is.
    pub async fn passthrough(&self, url: &str, timeout: Duration) -> Result<RawResponse, FetchError> {
        tokio::time::timeout(timeout, async {
            let response = self
                .client
                .get(url)
                .header(header::ACCEPT, FEED_ACCEPT)
                .send()
                .await?;
            let status = response.status().as_u16();
            let body = response.text().await?;
            Ok::<_, FetchError>(RawResponse { status, body })
        })
        .await
        .map_err(|_| FetchError::Timeout(timeout))?
    }
}

/// True if the body contains a feed root element marker.
pub fn looks_like_feed(body: &[u8]) -> bool {
    let text = String::from_utf8_lossy(body).to_ascii_lowercase();
    FEED_MARKERS.iter().any(|marker| text.contains(marker))
}
