//! Webhook sink: POST run results to a URL with bounded retries.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use tracing::warn;

use crate::domain::ports::{RunSink, SinkError};
use crate::sinks::SinkPayload;

/// Delivers payloads as JSON over HTTP.
pub struct WebhookSink {
    url: String,
    method: Method,
    headers: BTreeMap<String, String>,
    retry_count: u32,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(
        url: String,
        method: String,
        headers: BTreeMap<String, String>,
        timeout_seconds: u64,
        retry_count: u32,
    ) -> Self {
        let method = method.parse().unwrap_or(Method::POST);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .unwrap_or_default();
        Self {
            url,
            method,
            headers,
            retry_count,
            client,
        }
    }

    async fn attempt(&self, payload: &SinkPayload) -> Result<(), reqwest::Error> {
        let mut request = self.client.request(self.method.clone(), &self.url).json(payload);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        request.send().await?.error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl RunSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, payload: &SinkPayload) -> Result<(), SinkError> {
        let attempts = 1 + self.retry_count;
        let mut last_err = None;
        for attempt in 0..attempts {
            match self.attempt(payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("webhook delivery attempt {} failed: {e}", attempt + 1);
                    last_err = Some(e);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        match last_err {
            Some(e) => Err(SinkError::Http(e)),
            None => Ok(()),
        }
    }
}
