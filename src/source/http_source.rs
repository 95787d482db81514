use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Url};
use tracing::{debug, warn};

use super::traits::RemoteSource;

/// Plain HTTP(S) GET transport. No retries and no timeouts beyond the
/// client's defaults.
#[derive(Clone)]
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Build a GET request, attaching a bearer credential when present.
    fn build_request(&self, url: &Url, auth_token: Option<&str>) -> RequestBuilder {
        let req = self.client.get(url.clone());
        match auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

impl Default for HttpSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    async fn fetch(&self, url: &Url, auth_token: Option<&str>) -> Result<Bytes> {
        let resp = self.build_request(url, auth_token).send().await?;

        let status = resp.status();
        debug!("http fetch status={} url={}", status.as_u16(), url);
        if status.as_u16() == 401 || status.as_u16() == 403 {
            warn!("http fetch auth rejected status={} url={}", status.as_u16(), url);
            return Err(anyhow!("auth_rejected: HTTP {}", status.as_u16()));
        }
        if !status.is_success() {
            warn!("http fetch failed status={} url={}", status.as_u16(), url);
            return Err(anyhow!("fetch failed: HTTP {}", status.as_u16()));
        }

        let bytes = resp.bytes().await?;
        Ok(bytes)
    }
}
