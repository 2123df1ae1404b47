use async_trait::async_trait;
use reqwest::{Request, Response};

/// One hop of the fetch stack.
///
/// Auth wrappers implement this by editing the request and delegating to
/// their inner client, so `ApiKey<BasicClient>` and `UrlParam<BasicClient>`
/// are interchangeable behind [`super::HttpFeedFetcher`].
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}
