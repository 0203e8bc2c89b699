//! This module provides the size-bounded HTTP fetch of third-party assets.

use bytes::{Bytes, BytesMut};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use url::Url;

use crate::config::{Config, ConfigError};
use crate::error::Error;

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 6.1; rv:31.0) Gecko/20100101 Firefox/31.0";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const CSS_CONTENT_TYPE: &str = "text/css";

/// A fetched asset, fully buffered.
#[derive(Debug, Clone)]
pub struct Asset {
    /// Final URL, after redirects.
    pub url: Url,
    pub content_type: String,
    pub body: Bytes,
}

impl Asset {
    #[inline]
    pub fn is_css(&self) -> bool {
        self.content_type.starts_with(CSS_CONTENT_TYPE)
    }
}

/// Asset downloader.
///
/// Fetches are single attempts with no retry, bounded in time by the client timeout and in memory by the size limit.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    size_limit: usize,
}

impl Downloader {
    /// Create a downloader sending a browser-like user agent and the configured extra headers.
    ///
    /// Certificates are not validated: assets are mirrored from arbitrary third parties, this is not a trust boundary.
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::with_capacity(config.request_headers.len());
        for (name, value) in &config.request_headers {
            let name = HeaderName::try_from(name.as_str()).map_err(|_| ConfigError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::try_from(value.as_str()).map_err(|_| ConfigError::InvalidHeader(name.as_str().to_owned()))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(config.fetch_timeout)
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            client,
            size_limit: config.size_limit,
        })
    }

    /// Fetch `url`, buffering at most `size_limit` bytes of its body.
    pub async fn fetch(&self, url: &str) -> Result<Asset, Error> {
        let mut resp = self.client.get(url).send().await?;

        let status = resp.status();
        if status.as_u16() >= 400 {
            // TODO: retry transport errors and 5xx statuses with a bounded backoff
            return Err(Error::HttpStatus(status));
        }

        let url = resp.url().clone();
        let content_type = content_type(resp.headers().get(CONTENT_TYPE), &url);

        let mut body = BytesMut::new();

        while let Some(chunk) = resp.chunk().await? {
            body.extend_from_slice(&chunk);

            if body.len() > self.size_limit {
                return Err(Error::SizeLimitExceeded { limit: self.size_limit });
            }
        }

        Ok(Asset {
            url,
            content_type,
            body: body.freeze(),
        })
    }
}

/// Resolve the content type of a response, preferring the declared one over the one inferred from the URL extension.
fn content_type(declared: Option<&HeaderValue>, url: &Url) -> String {
    declared
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| mime_guess::from_path(url.path()).first_raw())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_owned()
}
