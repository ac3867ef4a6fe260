use std::time::Duration;

use async_trait::async_trait;
use enhancer_config::Lookup as LookupConfig;
use enhancer_contracts::ChannelId;
use enhancer_kernel::extract_title;
use reqwest::Client;
use tracing::{debug, warn};

/// Privileged-side lookup of a channel label.
#[async_trait]
pub trait Lookup: Send + Sync {
    async fn lookup(&self, key: &ChannelId) -> Option<String>;
}

/// Fetches the channel feed and reads its title. Every failure collapses to
/// `None`; the cause is only logged.
pub struct FeedClient {
    client: Client,
    endpoint: String,
    key_param: String,
}

impl FeedClient {
    pub fn new(cfg: &LookupConfig) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            endpoint: cfg.feed_endpoint.clone(),
            key_param: cfg.key_param.clone(),
        })
    }
}

#[async_trait]
impl Lookup for FeedClient {
    async fn lookup(&self, key: &ChannelId) -> Option<String> {
        debug!(key = %key, "fetching channel feed");
        let response = match self
            .client
            .get(&self.endpoint)
            .query(&[(self.key_param.as_str(), key.as_str())])
            .send()
            .await
        {
            Ok(v) => v,
            Err(err) => {
                warn!(key = %key, error = %err, "feed request failed");
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(
                key = %key,
                status = %response.status(),
                "feed request returned an error status"
            );
            return None;
        }

        let body = match response.text().await {
            Ok(v) => v,
            Err(err) => {
                warn!(key = %key, error = %err, "feed body could not be read");
                return None;
            }
        };
        let title = extract_title(&body);
        if title.is_none() {
            debug!(key = %key, "feed has no title");
        }
        title
    }
}
