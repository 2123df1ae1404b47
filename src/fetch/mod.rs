mod client;
mod basic;
pub mod auth;

pub use client::HttpClient;
pub use basic::BasicClient;

use async_trait::async_trait;

use crate::error::FetchError;

/// Largest feed body accepted; NYCT feeds are well under a megabyte.
pub const MAX_FEED_BYTES: usize = 50 * 1024 * 1024;

/// Source of raw feed bytes.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, url: &str, params: &[(&str, &str)]) -> Result<Vec<u8>, FetchError>;
}

/// [`FeedFetcher`] over any [`HttpClient`] stack.
pub struct HttpFeedFetcher<C> {
    client: C,
}

impl<C: HttpClient> HttpFeedFetcher<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: HttpClient> FeedFetcher for HttpFeedFetcher<C> {
    async fn fetch(&self, url: &str, params: &[(&str, &str)]) -> Result<Vec<u8>, FetchError> {
        fetch_bytes(&self.client, url, params).await
    }
}

pub async fn fetch_bytes<C: HttpClient>(
    client: &C,
    url: &str,
    params: &[(&str, &str)],
) -> Result<Vec<u8>, FetchError> {
    let mut url: reqwest::Url = url
        .parse()
        .map_err(|e| FetchError::InvalidUrl(format!("{url}: {e}")))?;
    if !params.is_empty() {
        url.query_pairs_mut().extend_pairs(params);
    }
    let req = reqwest::Request::new(reqwest::Method::GET, url);

    let resp = client.execute(req).await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(FetchError::Status(status));
    }
    if let Some(len) = resp.content_length() {
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        if len > MAX_FEED_BYTES {
            return Err(FetchError::TooLarge { size: len, max: MAX_FEED_BYTES });
        }
    }

    let bytes = resp.bytes().await?;
    if bytes.len() > MAX_FEED_BYTES {
        return Err(FetchError::TooLarge { size: bytes.len(), max: MAX_FEED_BYTES });
    }
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records the URL of every request before handing it on.
    struct Recording {
        inner: BasicClient,
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HttpClient for Recording {
        async fn execute(&self, req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
            self.urls.lock().unwrap().push(req.url().to_string());
            self.inner.execute(req).await
        }
    }

    #[tokio::test]
    async fn test_params_are_appended_to_query() {
        let client = Recording { inner: BasicClient::new(), urls: Mutex::new(Vec::new()) };
        // Nothing listens on the discard port
        let result = fetch_bytes(&client, "http://127.0.0.1:9/feed?x=1", &[("feed_id", "26")]).await;
        assert!(matches!(result, Err(FetchError::Network(_))));
        assert_eq!(
            *client.urls.lock().unwrap(),
            vec!["http://127.0.0.1:9/feed?x=1&feed_id=26"]
        );
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let client = Recording { inner: BasicClient::new(), urls: Mutex::new(Vec::new()) };
        let result = fetch_bytes(&client, "not a url", &[]).await;
        assert!(matches!(result, Err(FetchError::InvalidUrl(_))));
        assert!(client.urls.lock().unwrap().is_empty());
    }
}
