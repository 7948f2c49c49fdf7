use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use super::client::{AnnounceClient, AnnounceRequest};
use super::error::TrackerError;
use super::response::{
    parse_announce_response, parse_scrape_response, scrape_url, AnnounceResponse, ScrapeFile,
};
use crate::config::TrackerConfig;

/// BEP-3 HTTP tracker client.
pub struct HttpTracker {
    client: Client,
    url: String,
}

impl HttpTracker {
    pub fn new(url: &str, config: &TrackerConfig) -> Result<Self, TrackerError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(TrackerError::InvalidUrl(url.to_string()));
        }

        let client = Client::builder()
            .timeout(config.http_timeout)
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    /// The full announce URL, query string included.
    pub fn announce_url(&self, request: &AnnounceRequest) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&key={:08X}&compact=0&numwant={}",
            self.url,
            separator,
            url_encode(&request.info_hash),
            url_encode(request.peer_id.as_bytes()),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
            request.key,
            request.numwant,
        );

        let event = request.event.as_str();
        if !event.is_empty() {
            url.push_str("&event=");
            url.push_str(event);
        }

        url
    }

    async fn get(&self, url: &str) -> Result<bytes::Bytes, TrackerError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                TrackerError::Timeout
            } else {
                TrackerError::Http(e)
            }
        })?;

        Ok(response.bytes().await?)
    }
}

#[async_trait]
impl AnnounceClient for HttpTracker {
    async fn open(url: &str, config: &TrackerConfig) -> Result<Self, TrackerError> {
        Self::new(url, config)
    }

    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        let body = self.get(&self.announce_url(request)).await?;
        let response = parse_announce_response(&body)?;

        if let Some(warning) = &response.warning_message {
            warn!(tracker = %self.url, "tracker warning: {}", warning);
        }
        debug!(
            tracker = %self.url,
            peers = response.peers.len(),
            interval = response.interval,
            "http announce ok"
        );
        Ok(response)
    }

    async fn scrape(&self, info_hash: &[u8; 20]) -> Result<ScrapeFile, TrackerError> {
        let base = scrape_url(&self.url)
            .ok_or_else(|| TrackerError::UnsupportedProtocol(format!("scrape for {}", self.url)))?;
        let separator = if base.contains('?') { '&' } else { '?' };
        let url = format!("{}{}info_hash={}", base, separator, url_encode(info_hash));

        let body = self.get(&url).await?;
        parse_scrape_response(&body)?
            .get(info_hash)
            .copied()
            .ok_or_else(|| TrackerError::InvalidResponse("info hash missing from scrape".into()))
    }

    fn url(&self) -> &str {
        &self.url
    }
}

pub(crate) fn url_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~' {
                format!("{}", b as char)
            } else {
                format!("%{:02X}", b)
            }
        })
        .collect()
}
