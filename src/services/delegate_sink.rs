//! Queue-based inter-service routing sink.
//!
//! Routes agent output into another service's inbox. Blocking backpressure:
//! if the downstream service is slow, `send` waits on the bounded push for
//! up to the configured timeout, then drops. `send` never fails upward; a
//! per-edge circuit breaker gates delivery attempts after consecutive
//! failures, and every outcome is recorded as a buffered audit event drained
//! to SQLite by a background flusher.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::audit::logger::AuditLogger;
use crate::domain::models::delegate::{
    parse_trace, DelegateEvent, MAX_DELEGATION_DEPTH, ORIGINAL_PROMPT_KEY, SOURCE_OUTPUT_KEY,
    TRACE_KEY,
};
use crate::domain::models::run::{DelegateAuditEvent, DelegateStatus};
use crate::domain::ports::{RunSink, SinkError};
use crate::services::inbox::{Inbox, PushOutcome};
use crate::sinks::SinkPayload;

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const FLUSH_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const AUDIT_BUFFER_MAX: usize = 10_000;
const PREVIEW_CHARS: usize = 200;

/// Circuit breaker state for one delegate edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Counters and breaker state, guarded by one lock.
struct EdgeState {
    consecutive_failures: u32,
    circuit: CircuitState,
    opened_at: Option<Instant>,
    dropped_count: u64,
    filtered_count: u64,
}

/// Options for constructing a [`DelegateSink`].
pub struct DelegateSinkOptions {
    pub timeout: Duration,
    pub audit: Option<Arc<AuditLogger>>,
    /// Consecutive failures to trip the breaker. `None` disables it.
    pub circuit_breaker_threshold: Option<u32>,
    pub circuit_breaker_reset: Duration,
}

impl Default for DelegateSinkOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            audit: None,
            circuit_breaker_threshold: None,
            circuit_breaker_reset: Duration::from_secs(60),
        }
    }
}

/// Routes agent output to another service's inbox queue.
pub struct DelegateSink {
    source_service: String,
    target_service: String,
    target_inbox: Arc<Inbox>,
    timeout: Duration,
    audit: Option<Arc<AuditLogger>>,
    cb_threshold: Option<u32>,
    cb_reset: Duration,
    state: Mutex<EdgeState>,
    audit_buffer: Mutex<VecDeque<DelegateAuditEvent>>,
    audit_overflow_count: AtomicU64,
    closed: AtomicBool,
    flush_stop: watch::Sender<bool>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl DelegateSink {
    pub fn new(
        source_service: impl Into<String>,
        target_service: impl Into<String>,
        target_inbox: Arc<Inbox>,
        options: DelegateSinkOptions,
    ) -> Arc<Self> {
        let (flush_stop, stop_rx) = watch::channel(false);
        let sink = Arc::new(Self {
            source_service: source_service.into(),
            target_service: target_service.into(),
            target_inbox,
            timeout: options.timeout,
            audit: options.audit,
            cb_threshold: options.circuit_breaker_threshold,
            cb_reset: options.circuit_breaker_reset,
            state: Mutex::new(EdgeState {
                consecutive_failures: 0,
                circuit: CircuitState::Closed,
                opened_at: None,
                dropped_count: 0,
                filtered_count: 0,
            }),
            audit_buffer: Mutex::new(VecDeque::new()),
            audit_overflow_count: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            flush_stop,
            flush_task: Mutex::new(None),
        });

        if sink.audit.is_some() {
            let worker = Arc::clone(&sink);
            let handle = tokio::spawn(async move {
                worker.flush_loop(stop_rx).await;
            });
            *sink.flush_task.lock().expect("flush task lock") = Some(handle);
        }
        sink
    }

    pub fn source_service(&self) -> &str {
        &self.source_service
    }

    pub fn target_service(&self) -> &str {
        &self.target_service
    }

    /// Messages dropped due to a full queue or open circuit.
    pub fn dropped_count(&self) -> u64 {
        self.state.lock().expect("edge state lock").dropped_count
    }

    /// Messages filtered because the upstream run failed.
    pub fn filtered_count(&self) -> u64 {
        self.state.lock().expect("edge state lock").filtered_count
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.state.lock().expect("edge state lock").circuit
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().expect("edge state lock").consecutive_failures
    }

    /// Audit events dropped due to buffer overflow.
    pub fn audit_overflow_count(&self) -> u64 {
        self.audit_overflow_count.load(Ordering::SeqCst)
    }

    /// Buffer an audit event for the background flusher. Never fails.
    async fn log_event(
        &self,
        status: DelegateStatus,
        source_run_id: &str,
        reason: Option<String>,
        trace: Option<String>,
        payload_preview: &str,
    ) {
        if self.audit.is_none() {
            return;
        }
        let overflowed = {
            let buffer = self.audit_buffer.lock().expect("audit buffer lock");
            buffer.len() >= AUDIT_BUFFER_MAX
        };
        if overflowed {
            let count = self.audit_overflow_count.fetch_add(1, Ordering::SeqCst) + 1;
            if count <= 5 || count % 100 == 0 {
                warn!(
                    "audit buffer full ({count} events dropped so far): {} -> {}",
                    self.source_service, self.target_service
                );
            }
            self.flush().await;
        }
        let event = DelegateAuditEvent {
            timestamp: Utc::now().to_rfc3339(),
            source_service: self.source_service.clone(),
            target_service: self.target_service.clone(),
            status: status.as_str().to_string(),
            source_run_id: source_run_id.to_string(),
            reason,
            trace,
            payload_preview: payload_preview.chars().take(PREVIEW_CHARS).collect(),
        };
        self.audit_buffer
            .lock()
            .expect("audit buffer lock")
            .push_back(event);
    }

    async fn flush_loop(&self, mut stop_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                () = tokio::time::sleep(FLUSH_INTERVAL) => self.flush().await,
            }
        }
    }

    /// Drain buffered audit events to the audit logger.
    pub async fn flush(&self) {
        let Some(audit) = &self.audit else { return };
        loop {
            let event = {
                let mut buffer = self.audit_buffer.lock().expect("audit buffer lock");
                buffer.pop_front()
            };
            match event {
                Some(event) => audit.log_delegate_event(&event).await,
                None => break,
            }
        }
    }

    /// Check the breaker, transitioning open -> half_open once the reset
    /// window has elapsed. Returns true when delivery may be attempted.
    fn check_circuit(state: &mut EdgeState, threshold: Option<u32>, reset: Duration) -> bool {
        if threshold.is_none() {
            return true;
        }
        match state.circuit {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if state.opened_at.is_some_and(|at| at.elapsed() >= reset) {
                    state.circuit = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self, state: &mut EdgeState) {
        if self.cb_threshold.is_none() {
            return;
        }
        let was_half_open = state.circuit == CircuitState::HalfOpen;
        state.consecutive_failures = 0;
        if was_half_open {
            state.circuit = CircuitState::Closed;
            state.opened_at = None;
            info!(
                "circuit closed: {} -> {} (probe succeeded)",
                self.source_service, self.target_service
            );
        }
    }

    fn record_failure(&self, state: &mut EdgeState) {
        let Some(threshold) = self.cb_threshold else { return };
        state.consecutive_failures += 1;
        if state.circuit == CircuitState::HalfOpen {
            state.circuit = CircuitState::Open;
            state.opened_at = Some(Instant::now());
            warn!(
                "circuit re-opened: {} -> {} (probe failed)",
                self.source_service, self.target_service
            );
        } else if state.consecutive_failures >= threshold {
            state.circuit = CircuitState::Open;
            state.opened_at = Some(Instant::now());
            warn!(
                "circuit open: {} -> {} ({} consecutive failures)",
                self.source_service, self.target_service, state.consecutive_failures
            );
        }
    }

    /// Enqueue agent output as a delegate event for the target service.
    pub async fn deliver(&self, payload: &SinkPayload) {
        // Failed upstream runs are filtered, never forwarded.
        if !payload.success {
            {
                let mut state = self.state.lock().expect("edge state lock");
                state.filtered_count += 1;
            }
            let trace = payload.trigger_metadata.get(TRACE_KEY).cloned();
            self.log_event(
                DelegateStatus::Filtered,
                &payload.run_id,
                payload.error.clone(),
                trace,
                &payload.output,
            )
            .await;
            return;
        }

        // Circuit gate. Open + not yet reset rejects without touching the queue.
        let allowed = {
            let mut state = self.state.lock().expect("edge state lock");
            let allowed = Self::check_circuit(&mut state, self.cb_threshold, self.cb_reset);
            if !allowed {
                state.dropped_count += 1;
            }
            allowed
        };
        if !allowed {
            warn!(
                "circuit open: {} -> {}, message rejected",
                self.source_service, self.target_service
            );
            self.log_event(
                DelegateStatus::CircuitOpen,
                &payload.run_id,
                Some("circuit_breaker_open".to_string()),
                None,
                &payload.output,
            )
            .await;
            return;
        }

        // Extend the trace with this hop.
        let mut trace = payload
            .trigger_metadata
            .get(TRACE_KEY)
            .map(|t| parse_trace(t))
            .unwrap_or_default();
        trace.push(self.source_service.clone());

        if trace.len() > MAX_DELEGATION_DEPTH {
            {
                let mut state = self.state.lock().expect("edge state lock");
                state.dropped_count += 1;
            }
            error!(
                "delegation depth exceeded ({}): {}. dropping message",
                trace.len(),
                trace.join(" -> ")
            );
            self.log_event(
                DelegateStatus::Dropped,
                &payload.run_id,
                Some(format!("delegation_depth_exceeded ({})", trace.len())),
                Some(trace.join(",")),
                &payload.output,
            )
            .await;
            return;
        }

        let trace_str = trace.join(",");
        let mut metadata = std::collections::HashMap::new();
        metadata.insert(TRACE_KEY.to_string(), trace_str.clone());
        metadata.insert(
            ORIGINAL_PROMPT_KEY.to_string(),
            payload
                .trigger_metadata
                .get(ORIGINAL_PROMPT_KEY)
                .cloned()
                .unwrap_or_else(|| payload.prompt.clone()),
        );
        metadata.insert(SOURCE_OUTPUT_KEY.to_string(), payload.output.clone());

        let event = DelegateEvent::new(
            self.source_service.clone(),
            self.target_service.clone(),
            payload.output.clone(),
            payload.run_id.clone(),
        )
        .with_metadata(metadata)
        .with_trace(trace);

        match self.target_inbox.push(event, self.timeout).await {
            PushOutcome::Delivered => {
                {
                    let mut state = self.state.lock().expect("edge state lock");
                    self.record_success(&mut state);
                }
                self.log_event(
                    DelegateStatus::Delivered,
                    &payload.run_id,
                    None,
                    Some(trace_str),
                    &payload.output,
                )
                .await;
            }
            PushOutcome::Full => {
                {
                    let mut state = self.state.lock().expect("edge state lock");
                    state.dropped_count += 1;
                    self.record_failure(&mut state);
                }
                warn!(
                    "queue full: {} -> {} (timeout={}s), message dropped",
                    self.source_service,
                    self.target_service,
                    self.timeout.as_secs()
                );
                let inbound_trace = payload.trigger_metadata.get(TRACE_KEY).cloned();
                self.log_event(
                    DelegateStatus::Dropped,
                    &payload.run_id,
                    Some("queue_full".to_string()),
                    inbound_trace,
                    &payload.output,
                )
                .await;
            }
            PushOutcome::Closed => {
                {
                    let mut state = self.state.lock().expect("edge state lock");
                    self.record_failure(&mut state);
                }
                error!(
                    "error routing {} -> {}: target inbox closed",
                    self.source_service, self.target_service
                );
                self.log_event(
                    DelegateStatus::Error,
                    &payload.run_id,
                    Some("target inbox closed".to_string()),
                    None,
                    &payload.output,
                )
                .await;
            }
        }
    }

    /// Stop the flusher and drain remaining audit events. Idempotent, safe
    /// from any task.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.flush_stop.send_replace(true);
        let handle = self.flush_task.lock().expect("flush task lock").take();
        if let Some(handle) = handle {
            if tokio::time::timeout(FLUSH_JOIN_TIMEOUT, handle).await.is_err() {
                warn!(
                    "audit flush task did not stop in time: {} -> {}",
                    self.source_service, self.target_service
                );
            }
        }
        self.flush().await;
        let overflow = self.audit_overflow_count.load(Ordering::SeqCst);
        if overflow > 0 {
            warn!(
                "audit buffer overflowed {overflow} time(s) during lifetime: {} -> {}",
                self.source_service, self.target_service
            );
        }
        debug!("delegate sink closed: {} -> {}", self.source_service, self.target_service);
    }
}

#[async_trait]
impl RunSink for DelegateSink {
    fn name(&self) -> &str {
        "delegate"
    }

    async fn send(&self, payload: &SinkPayload) -> Result<(), SinkError> {
        self.deliver(payload).await;
        Ok(())
    }
}
