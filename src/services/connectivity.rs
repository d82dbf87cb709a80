//! Internet reachability probing
//!
//! A probe issues an HTTP GET against each of a rotated list of URLs.
//! Strict mode treats the first unreachable URL as a failure; lenient
//! mode fails only when every URL is unreachable. The supervisor uses a
//! fire-and-forget probe while an item plays and a blocking variant
//! before starting the relay.

use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_PAUSE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ConnectionProber {
    client: reqwest::Client,
    urls: Vec<String>,
    strict: bool,
}

impl ConnectionProber {
    pub fn new(urls: Vec<String>, strict: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            client,
            urls,
            strict,
        }
    }

    /// Whether any probe URLs are configured at all. With none, probes
    /// trivially succeed.
    pub fn has_urls(&self) -> bool {
        !self.urls.is_empty()
    }

    /// Minimum interval the supervisor must leave between probes.
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs((5 * self.urls.len() as u64).max(10))
    }

    /// Run one probe round over the URLs in random order. Returns
    /// `true` when the connection is considered up.
    pub async fn probe(&self) -> bool {
        if self.urls.is_empty() {
            return true;
        }

        let mut urls = self.urls.clone();
        urls.shuffle(&mut rand::rng());

        for url in &urls {
            match self.client.get(url).send().await {
                Ok(response) => {
                    debug!("Connection check OK: {url} ({})", response.status());
                    return true;
                }
                Err(e) => {
                    if self.strict {
                        warn!("Connection check failed (strict): {url}: {e}");
                        return false;
                    }
                    debug!("Connection check failed: {url}: {e}");
                }
            }
        }

        warn!("Connection check failed: all {} URLs unreachable", urls.len());
        false
    }

    /// Block until a probe succeeds, pausing between failed rounds.
    /// Used before starting the relay.
    pub async fn wait_until_online(&self) {
        loop {
            if self.probe().await {
                return;
            }
            info!(
                "Connection check failed; retrying in {} seconds",
                RETRY_PAUSE.as_secs()
            );
            tokio::time::sleep(RETRY_PAUSE).await;
        }
    }
}
