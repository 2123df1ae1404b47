use crate::error::FetchError;
use crate::fetch::client::HttpClient;
use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};

/// An [`HttpClient`] wrapper that sends an API key as an HTTP header
/// (e.g. `x-api-key` for the current MTA endpoints).
///
/// The header is validated once at construction.
pub struct ApiKey<C> {
    inner: C,
    header_name: HeaderName,
    key: HeaderValue,
}

impl<C> ApiKey<C> {
    pub fn new(inner: C, header_name: &str, key: &str) -> Result<Self, FetchError> {
        let header_name = HeaderName::from_bytes(header_name.as_bytes())
            .map_err(|e| FetchError::InvalidAuth(format!("header name {header_name:?}: {e}")))?;
        let mut key = HeaderValue::from_str(key)
            .map_err(|e| FetchError::InvalidAuth(format!("header value: {e}")))?;
        key.set_sensitive(true);
        Ok(Self {
            inner,
            header_name,
            key,
        })
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for ApiKey<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        req.headers_mut()
            .insert(self.header_name.clone(), self.key.clone());
        self.inner.execute(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::BasicClient;

    #[test]
    fn test_rejects_invalid_header() {
        assert!(matches!(
            ApiKey::new(BasicClient::new(), "bad header", "k"),
            Err(FetchError::InvalidAuth(_))
        ));
        assert!(matches!(
            ApiKey::new(BasicClient::new(), "x-api-key", "line\nbreak"),
            Err(FetchError::InvalidAuth(_))
        ));
        assert!(ApiKey::new(BasicClient::new(), "x-api-key", "secret").is_ok());
    }
}
