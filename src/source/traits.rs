use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Url;

/// Network transport for cache misses. Dropping the returned future must
/// abort the transfer.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch(&self, url: &Url, auth_token: Option<&str>) -> Result<Bytes>;
}
