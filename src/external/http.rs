//! Shared outbound HTTP client for source adapters
//!
//! All adapter traffic goes through [`FetchClient`]: retry with exponential
//! backoff, per-host cooldown after 403/429, the government-domain block and
//! the domain allow-list, and cooperative cancellation at the request
//! suspension point. Failures come back as [`SourceError`] values.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::sync::watch;

use crate::config::Config;
use crate::models::{error_kinds, SourceError};

/// Decoded response body.
#[derive(Debug, Clone)]
pub enum FetchedBody {
    Json(serde_json::Value),
    Text(String),
}

impl FetchedBody {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            FetchedBody::Json(value) => Some(value),
            FetchedBody::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FetchedBody::Text(text) => Some(text),
            FetchedBody::Json(_) => None,
        }
    }

    /// Body as a JSON value; text bodies are wrapped as `{"raw_text": ...}`.
    pub fn into_value(self) -> serde_json::Value {
        match self {
            FetchedBody::Json(value) => value,
            FetchedBody::Text(text) => serde_json::json!({ "raw_text": text }),
        }
    }
}

/// Per-request options.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub max_retries: u32,
    pub timeout_seconds: f64,
    pub require_allowlist: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            query: Vec::new(),
            headers: Vec::new(),
            max_retries: 3,
            timeout_seconds: 12.0,
            require_allowlist: false,
        }
    }
}

pub struct FetchClient {
    client: Client,
    user_agent: String,
    allowed_domains: Vec<String>,
    cooldowns: Mutex<HashMap<String, Instant>>,
}

impl FetchClient {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            user_agent: config.scraper_user_agent.clone(),
            allowed_domains: config.allowed_domains(),
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    pub fn host_of(url: &str) -> String {
        reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
            .unwrap_or_default()
    }

    /// Government-domain guard: any host matching the `*gov*` pattern.
    pub fn is_government_domain(url: &str) -> bool {
        let host = Self::host_of(url);
        !host.is_empty() && host.contains("gov")
    }

    pub fn domain_allowed(&self, url: &str) -> bool {
        let host = Self::host_of(url);
        if host.is_empty() || self.allowed_domains.is_empty() {
            return false;
        }
        self.allowed_domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")))
    }

    pub fn clear_cooldowns(&self) {
        if let Ok(mut cooldowns) = self.cooldowns.lock() {
            cooldowns.clear();
        }
    }

    fn cooldown_remaining(&self, host: &str) -> Option<Duration> {
        let cooldowns = self.cooldowns.lock().ok()?;
        let until = cooldowns.get(host)?;
        until.checked_duration_since(Instant::now())
    }

    fn set_cooldown(&self, host: &str, duration: Duration) {
        if host.is_empty() {
            return;
        }
        if let Ok(mut cooldowns) = self.cooldowns.lock() {
            let until = Instant::now() + duration;
            let entry = cooldowns.entry(host.to_string()).or_insert(until);
            if *entry < until {
                *entry = until;
            }
        }
    }

    /// GET with retries. Cancellation is observed while waiting on the
    /// cooldown, the request itself, and the retry backoff.
    pub async fn fetch_with_retry(
        &self,
        url: &str,
        opts: FetchOptions,
        cancel: &watch::Receiver<bool>,
    ) -> Result<FetchedBody, SourceError> {
        if Self::is_government_domain(url) {
            return Err(SourceError::with_message(
                error_kinds::DOMAIN_NOT_ALLOWED,
                "government_domain_blocked",
            )
            .with_url(url));
        }
        if opts.require_allowlist && !self.domain_allowed(url) {
            return Err(SourceError::of(error_kinds::DOMAIN_NOT_ALLOWED).with_url(url));
        }

        let host = Self::host_of(url);
        let attempts = opts.max_retries.max(1);

        for attempt in 0..attempts {
            if let Some(wait) = self.cooldown_remaining(&host) {
                let wait = wait.min(Duration::from_secs(60));
                if sleep_cancellable(wait, cancel).await {
                    return Err(SourceError::of(error_kinds::CANCELLED).with_url(url));
                }
            }

            let mut request = self
                .client
                .get(url)
                .timeout(Duration::from_secs_f64(opts.timeout_seconds.max(1.0)))
                .header("User-Agent", &self.user_agent)
                .header(
                    "Accept",
                    "text/html,application/xhtml+xml,application/json;q=0.9,*/*;q=0.8",
                );
            if !opts.query.is_empty() {
                request = request.query(&opts.query);
            }
            for (name, value) in &opts.headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let mut cancel_rx = cancel.clone();
            let mut cancel_closed = false;
            let send_fut = request.send();
            tokio::pin!(send_fut);
            let response = loop {
                tokio::select! {
                    changed = cancel_rx.wait_for(|c| *c), if !cancel_closed => {
                        match changed {
                            Ok(_) => {
                                return Err(
                                    SourceError::of(error_kinds::CANCELLED).with_url(url)
                                );
                            }
                            // Sender gone: nobody can cancel us anymore.
                            Err(_) => cancel_closed = true,
                        }
                    }
                    result = &mut send_fut => break result,
                }
            };

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(decode_body(resp).await);
                    }

                    let code = status.as_u16();
                    if code == 403 || code == 429 {
                        let base = if code == 429 { 6.0 } else { 1.5 };
                        let backoff = base + f64::from(1u32 << attempt.min(5)) * 0.5;
                        self.set_cooldown(&host, Duration::from_secs_f64(backoff));
                    }
                    if attempt + 1 == attempts {
                        return Err(SourceError::http_status(code, url));
                    }
                }
                Err(err) => {
                    self.set_cooldown(&host, Duration::from_secs(1));
                    if attempt + 1 == attempts {
                        let kind = if err.is_timeout() {
                            error_kinds::TIMEOUT
                        } else {
                            error_kinds::CONNECT_ERROR
                        };
                        return Err(
                            SourceError::with_message(kind, err.to_string()).with_url(url)
                        );
                    }
                }
            }

            let backoff = Duration::from_secs_f64(f64::from(1u32 << attempt.min(5)) + 0.25);
            if sleep_cancellable(backoff, cancel).await {
                return Err(SourceError::of(error_kinds::CANCELLED).with_url(url));
            }
        }

        Err(SourceError::of(error_kinds::CONNECT_ERROR).with_url(url))
    }
}

async fn decode_body(resp: reqwest::Response) -> FetchedBody {
    let is_json = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false);

    if is_json {
        match resp.json::<serde_json::Value>().await {
            Ok(value) => FetchedBody::Json(value),
            Err(_) => FetchedBody::Text(String::new()),
        }
    } else {
        let text = resp.text().await.unwrap_or_default();
        // Some endpoints serve JSON with a text content type.
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(value) if value.is_object() => FetchedBody::Json(value),
            _ => FetchedBody::Text(text),
        }
    }
}

/// Sleeps unless the cancel signal fires first. Returns true when cancelled.
pub async fn sleep_cancellable(duration: Duration, cancel: &watch::Receiver<bool>) -> bool {
    if *cancel.borrow() {
        return true;
    }
    let mut rx = cancel.clone();
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = rx.wait_for(|c| *c) => changed.is_ok(),
    }
}
