//! Rendered-page fallback for sources that block plain HTTP clients.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser session has not been acquired")]
    NotAcquired,
    #[error("renderer request for {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("renderer returned status {status} for {url}: {message}")]
    Api {
        url: String,
        status: u16,
        message: String,
    },
    #[error("page {url} not ready after {waited:?}")]
    NotReady { url: String, waited: Duration },
    #[error("renderer failed to start: {0}")]
    Start(String),
}

/// Driver boundary: render a URL and hand back the final HTML.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn start(&self) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn render(&self, url: &str) -> Result<String, BrowserError>;

    async fn shutdown(&self) -> Result<(), BrowserError> {
        Ok(())
    }
}

/// Browserless `/content` endpoint client.
#[derive(Debug, Clone)]
pub struct BrowserlessRenderer {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl BrowserlessRenderer {
    pub fn new(
        base_url: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, BrowserError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BrowserError::Start(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        })
    }
}

#[async_trait]
impl PageRenderer for BrowserlessRenderer {
    async fn render(&self, url: &str) -> Result<String, BrowserError> {
        let endpoint = format!("{}/content", self.base_url);
        let transport = |source| BrowserError::Transport {
            url: url.to_string(),
            source,
        };
        let mut request = self.client.post(&endpoint);
        if let Some(token) = &self.token {
            request = request.query(&[("token", token.as_str())]);
        }
        let resp = request
            .json(&serde_json::json!({ "url": url }))
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrowserError::Api {
                url: url.to_string(),
                status: status.as_u16(),
                message,
            });
        }
        resp.text().await.map_err(transport)
    }
}

#[derive(Debug, Clone)]
pub struct BrowserSessionConfig {
    pub challenge_delay: Duration,
    pub ready_min_bytes: usize,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for BrowserSessionConfig {
    fn default() -> Self {
        Self {
            challenge_delay: Duration::from_secs(10),
            ready_min_bytes: 1000,
            ready_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// One shared renderer session with explicit acquire/release.
pub struct BrowserSession {
    renderer: Arc<dyn PageRenderer>,
    config: BrowserSessionConfig,
    active: Mutex<bool>,
}

impl BrowserSession {
    pub fn new(renderer: Arc<dyn PageRenderer>, config: BrowserSessionConfig) -> Self {
        Self {
            renderer,
            config,
            active: Mutex::new(false),
        }
    }

    pub async fn is_active(&self) -> bool {
        *self.active.lock().await
    }

    pub async fn acquire(&self) -> Result<(), BrowserError> {
        let mut active = self.active.lock().await;
        if !*active {
            self.renderer.start().await?;
            *active = true;
            info!("browser session started");
        }
        Ok(())
    }

    pub async fn release(&self) -> Result<(), BrowserError> {
        let mut active = self.active.lock().await;
        if *active {
            *active = false;
            self.renderer.shutdown().await?;
            info!("browser session released");
        }
        Ok(())
    }

    /// Render `url`, sitting out a bot challenge once and polling until the page is ready.
    pub async fn render(&self, url: &str) -> Result<String, BrowserError> {
        if !self.is_active().await {
            return Err(BrowserError::NotAcquired);
        }

        let started = Instant::now();
        let deadline = started + self.config.ready_timeout;
        let mut html = self.renderer.render(url).await?;

        if html.to_ascii_lowercase().contains("cloudflare") {
            warn!(
                url,
                delay_secs = self.config.challenge_delay.as_secs(),
                "bot challenge detected, waiting"
            );
            tokio::time::sleep(self.config.challenge_delay).await;
            html = self.renderer.render(url).await?;
        }

        while html.len() <= self.config.ready_min_bytes {
            if Instant::now() >= deadline {
                return Err(BrowserError::NotReady {
                    url: url.to_string(),
                    waited: started.elapsed(),
                });
            }
            debug!(url, bytes = html.len(), "page not ready yet");
            tokio::time::sleep(self.config.poll_interval).await;
            html = self.renderer.render(url).await?;
        }
        Ok(html)
    }
}

impl std::fmt::Debug for BrowserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserSession")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
