//! Resolving submodel descriptor sources into parsed descriptors.

use crate::definition::SubmodelDescriptor;
use crate::Error;
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use url::Url;

pub const INLINE_SOURCE_URL: &str = "inline";

/// Turns a source string (inline JSON or a URL) into a descriptor.
#[async_trait]
pub trait DescriptorLoader: Send + Sync + fmt::Debug + 'static {
    async fn load(&self, source: &str) -> Result<SubmodelDescriptor, Error>;
}

#[derive(Debug, Clone)]
struct CachedText {
    text: String,
    fetched_at: Instant,
}

/// Loads inline JSON, `file://` URLs, plain paths and `http(s)://` URLs.
/// Fetched text is cached per URL for a fixed time-to-live.
#[derive(Debug)]
pub struct UrlDescriptorLoader {
    cache: DashMap<String, CachedText>,
    ttl: Duration,
    http: reqwest::Client,
}

impl UrlDescriptorLoader {
    pub fn new(ttl: Duration, accept_invalid_certs: bool) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| Error::Other(format!("Failed to build HTTP client: {}", e)))?;
        Ok(UrlDescriptorLoader {
            cache: DashMap::new(),
            ttl,
            http,
        })
    }

    async fn fetch_text(&self, url: &str) -> Result<String, Error> {
        if let Some(cached) = self.cache.get(url) {
            if cached.fetched_at.elapsed() <= self.ttl {
                log::trace!("Descriptor cache hit for {}", url);
                return Ok(cached.text.clone());
            }
        }
        let text = if url.starts_with("http://") || url.starts_with("https://") {
            self.fetch_http(url).await?
        } else {
            let path = file_path_of(url)?;
            tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::FileReadError {
                    path: path.display().to_string(),
                    details: e.to_string(),
                })?
        };
        self.cache.insert(
            url.to_string(),
            CachedText {
                text: text.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(text)
    }

    async fn fetch_http(&self, url: &str) -> Result<String, Error> {
        let http_error = |e: reqwest::Error| Error::HttpRequestError {
            url: url.to_string(),
            details: e.to_string(),
        };
        let response = self.http.get(url).send().await.map_err(http_error)?;
        let response = response.error_for_status().map_err(http_error)?;
        response.text().await.map_err(http_error)
    }
}

#[async_trait]
impl DescriptorLoader for UrlDescriptorLoader {
    async fn load(&self, source: &str) -> Result<SubmodelDescriptor, Error> {
        let trimmed = source.trim();
        if trimmed.starts_with('{') {
            return SubmodelDescriptor::parse(trimmed, INLINE_SOURCE_URL);
        }
        let text = self.fetch_text(trimmed).await?;
        SubmodelDescriptor::parse(&text, trimmed)
    }
}

/// `file://localhost/a/b`, `file:///a/b` and a bare path all map to a path.
/// Percent-encoded characters in a `file://` URL are decoded.
fn file_path_of(source: &str) -> Result<PathBuf, Error> {
    let parse_error = |details: &str| Error::UrlParseError {
        url: source.to_string(),
        details: details.to_string(),
    };
    if !source.contains("://") {
        return Ok(PathBuf::from(source));
    }
    let url = Url::parse(source).map_err(|e| parse_error(&e.to_string()))?;
    if url.scheme() != "file" {
        return Err(parse_error("unsupported scheme"));
    }
    if url.path() == "/" {
        return Err(parse_error("missing path"));
    }
    url.to_file_path()
        .map_err(|()| parse_error("not a local file path"))
}
