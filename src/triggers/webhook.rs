//! Webhook trigger: fire on authenticated HTTP requests, rate limited.

use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Deserialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{Trigger, TriggerCallback, TriggerError, TriggerEvent};

/// Header carrying the shared secret.
pub const SECRET_HEADER: &str = "x-initrunner-secret";

#[derive(Debug, Deserialize)]
struct HookRequest {
    prompt: String,
    #[serde(default)]
    metadata: std::collections::HashMap<String, String>,
}

#[derive(Clone)]
struct HookState {
    secret: Arc<String>,
    limiter: Arc<DefaultDirectRateLimiter>,
    callback: TriggerCallback,
}

async fn handle_hook(
    State(state): State<HookState>,
    headers: HeaderMap,
    Json(request): Json<HookRequest>,
) -> StatusCode {
    let presented = headers
        .get(SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if presented != state.secret.as_str() {
        warn!("webhook request rejected: bad secret");
        return StatusCode::UNAUTHORIZED;
    }
    if state.limiter.check().is_err() {
        return StatusCode::TOO_MANY_REQUESTS;
    }

    let mut event = TriggerEvent::new("webhook", request.prompt);
    event.metadata = request.metadata;
    (state.callback)(event).await;
    StatusCode::ACCEPTED
}

/// Binds an HTTP port and fires an event per authenticated request.
pub struct WebhookTrigger {
    port: u16,
    path: String,
    secret: String,
    rate_limit_rpm: u32,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Port actually bound (differs from `port` when 0 was requested).
    bound_port: Mutex<Option<u16>>,
}

impl WebhookTrigger {
    pub fn new(port: u16, path: String, secret: String, rate_limit_rpm: u32) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            port,
            path,
            secret,
            rate_limit_rpm,
            stop_tx,
            task: Mutex::new(None),
            bound_port: Mutex::new(None),
        }
    }

    /// The port the listener bound to, once started.
    pub async fn bound_port(&self) -> Option<u16> {
        *self.bound_port.lock().await
    }
}

#[async_trait]
impl Trigger for WebhookTrigger {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    async fn start(&self, callback: TriggerCallback) -> Result<(), TriggerError> {
        let quota = Quota::per_minute(NonZeroU32::new(self.rate_limit_rpm.max(1)).expect("nonzero"));
        let state = HookState {
            secret: Arc::new(self.secret.clone()),
            limiter: Arc::new(RateLimiter::direct(quota)),
            callback,
        };
        let app = Router::new()
            .route(&self.path, post(handle_hook))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", self.port)).await?;
        let bound = listener.local_addr()?.port();
        *self.bound_port.lock().await = Some(bound);
        info!("webhook trigger listening on 127.0.0.1:{bound}{}", self.path);

        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            let shutdown = async move {
                let _ = stop_rx.changed().await;
            };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                warn!("webhook listener error: {e}");
            }
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.stop_tx.send_replace(true);
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }
}
