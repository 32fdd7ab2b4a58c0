//! Cooperative per-thread sandbox around untrusted tool code.
//!
//! Tool shims (file open, socket connect, subprocess spawn, module import,
//! eval) call [`check`] before acting. Outside a [`SandboxScope`] every
//! check passes; inside one, the active policy decides. State lives in a
//! thread-local, so enforcement never bleeds between concurrent tool
//! invocations, and batched violations are flushed to the audit trail when
//! the outermost scope exits.

pub mod imports;
pub mod policy;

use std::cell::RefCell;
use std::marker::PhantomData;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::domain::models::role::{ToolSandboxConfig, ViolationAction};
use crate::domain::models::run::SecurityEvent;
use policy::{is_private_ip, write_allowed, ALWAYS_BLOCKED_MODULES};

/// Raised when sandboxed tool code violates policy in `raise` mode.
#[derive(Debug, Clone, Error)]
#[error("[{event}] {detail}")]
pub struct SandboxViolation {
    pub event: String,
    pub detail: String,
}

#[derive(Debug, Clone)]
struct Violation {
    event: String,
    detail: String,
}

#[derive(Default)]
struct SandboxState {
    enforcing: bool,
    depth: u32,
    config: Option<ToolSandboxConfig>,
    agent_name: String,
    violations: Vec<Violation>,
    bypassed: bool,
}

thread_local! {
    static STATE: RefCell<SandboxState> = RefCell::new(SandboxState::default());
}

static AUDIT_TX: Mutex<Option<UnboundedSender<SecurityEvent>>> = Mutex::new(None);

/// Install the channel violations are flushed to. Pass `None` to detach.
pub fn set_audit_channel(tx: Option<UnboundedSender<SecurityEvent>>) {
    *AUDIT_TX.lock().expect("audit channel lock") = tx;
}

/// A runtime event tool shims submit for policy checking.
#[derive(Debug)]
pub enum SandboxEvent<'a> {
    /// A file is being opened; `write` is true for any mutating mode.
    FileOpen { path: &'a Path, write: bool },
    /// An outbound socket connection to a resolved address.
    Connect { addr: IpAddr },
    /// A hostname about to be resolved.
    DnsResolve { host: &'a str },
    /// A subprocess about to be spawned.
    SubprocessSpawn { command: &'a str },
    /// A module import by tool code.
    ModuleImport { module: &'a str },
    /// Evaluation of a user-supplied code string.
    Eval,
    /// Compilation of a source unit identified by `filename`.
    Compile { filename: &'a str },
    /// A native library about to be loaded.
    NativeLibraryLoad { path: &'a str },
}

/// RAII activation of sandbox enforcement on the current thread.
///
/// Reentrant: nested scopes increment a depth counter, and only the
/// outermost exit flushes batched violations and turns enforcement off.
pub struct SandboxScope {
    prev_enforcing: bool,
    prev_config: Option<ToolSandboxConfig>,
    prev_agent: String,
    // Scopes are pinned to the thread whose state they mutate.
    _not_send: PhantomData<*const ()>,
}

impl SandboxScope {
    /// Activate enforcement with `config` for `agent_name`.
    pub fn enter(config: ToolSandboxConfig, agent_name: &str) -> Self {
        STATE.with(|cell| {
            let mut state = cell.borrow_mut();
            let prev_enforcing = state.enforcing;
            let prev_config = state.config.take();
            let prev_agent = std::mem::take(&mut state.agent_name);

            state.depth += 1;
            state.enforcing = true;
            state.config = Some(config);
            state.agent_name = agent_name.to_string();

            Self {
                prev_enforcing,
                prev_config,
                prev_agent,
                _not_send: PhantomData,
            }
        })
    }
}

impl Drop for SandboxScope {
    fn drop(&mut self) {
        let flushed: Option<(String, Vec<Violation>)> = STATE.with(|cell| {
            let mut state = cell.borrow_mut();
            state.depth -= 1;
            let flushed = if state.depth == 0 {
                state.enforcing = false;
                let agent = state.agent_name.clone();
                let violations = std::mem::take(&mut state.violations);
                (!violations.is_empty()).then_some((agent, violations))
            } else {
                state.enforcing = self.prev_enforcing;
                None
            };
            state.config = self.prev_config.take();
            state.agent_name = std::mem::take(&mut self.prev_agent);
            flushed
        });

        if let Some((agent, violations)) = flushed {
            let tx = AUDIT_TX.lock().expect("audit channel lock");
            if let Some(tx) = tx.as_ref() {
                for violation in violations {
                    let event = SecurityEvent::new(
                        "sandbox_violation",
                        agent.clone(),
                        format!("{}: {}", violation.event, violation.detail),
                    );
                    let _ = tx.send(event);
                }
            }
        }
    }
}

/// RAII suspension of enforcement for trusted framework operations
/// (loading sub-agents, internal bookkeeping). Restores prior state on drop.
pub struct FrameworkBypass {
    prev_bypassed: bool,
    prev_enforcing: bool,
    _not_send: PhantomData<*const ()>,
}

impl FrameworkBypass {
    pub fn enter() -> Self {
        STATE.with(|cell| {
            let mut state = cell.borrow_mut();
            let guard = Self {
                prev_bypassed: state.bypassed,
                prev_enforcing: state.enforcing,
                _not_send: PhantomData,
            };
            state.bypassed = true;
            state.enforcing = false;
            guard
        })
    }
}

impl Drop for FrameworkBypass {
    fn drop(&mut self) {
        STATE.with(|cell| {
            let mut state = cell.borrow_mut();
            state.bypassed = self.prev_bypassed;
            state.enforcing = self.prev_enforcing;
        });
    }
}

/// Whether enforcement is active on this thread.
pub fn enforcing() -> bool {
    STATE.with(|cell| cell.borrow().enforcing)
}

/// Current scope depth on this thread.
pub fn depth() -> u32 {
    STATE.with(|cell| cell.borrow().depth)
}

fn record_violation(
    state: &mut SandboxState,
    event: &str,
    detail: String,
) -> Result<(), SandboxViolation> {
    warn!(
        "sandbox violation [{event}] in {}: {detail}",
        state.agent_name
    );
    state.violations.push(Violation {
        event: event.to_string(),
        detail: detail.clone(),
    });

    let action = state
        .config
        .as_ref()
        .map(|config| config.sandbox_violation_action)
        .unwrap_or_default();
    if action == ViolationAction::Raise {
        return Err(SandboxViolation {
            event: event.to_string(),
            detail,
        });
    }
    Ok(())
}

/// Check a runtime event against the active policy. Outside a scope (or
/// under a framework bypass) every event passes.
pub fn check(event: &SandboxEvent<'_>) -> Result<(), SandboxViolation> {
    STATE.with(|cell| {
        let mut state = cell.borrow_mut();
        if !state.enforcing || state.bypassed {
            return Ok(());
        }
        let Some(config) = state.config.clone() else {
            return Ok(());
        };

        match event {
            SandboxEvent::FileOpen { path, write } => {
                if !write {
                    return Ok(());
                }
                if config.allowed_write_paths.is_empty() {
                    return record_violation(
                        &mut state,
                        "open",
                        format!("Write to '{}' blocked (no write paths configured)", path.display()),
                    );
                }
                if !write_allowed(path, &config.allowed_write_paths) {
                    return record_violation(
                        &mut state,
                        "open",
                        format!("Write to '{}' blocked (not in allowed_write_paths)", path.display()),
                    );
                }
                Ok(())
            }
            SandboxEvent::Connect { addr } => {
                if config.block_private_ips && is_private_ip(*addr) {
                    return record_violation(
                        &mut state,
                        "socket.connect",
                        format!("Connection to private IP {addr} blocked"),
                    );
                }
                Ok(())
            }
            SandboxEvent::DnsResolve { host } => {
                if !config.allowed_network_hosts.is_empty()
                    && !config.allowed_network_hosts.iter().any(|allowed| allowed == host)
                {
                    return record_violation(
                        &mut state,
                        "dns.resolve",
                        format!("DNS resolution for '{host}' blocked (not in allowlist)"),
                    );
                }
                Ok(())
            }
            SandboxEvent::SubprocessSpawn { command } => {
                if !config.allow_subprocess {
                    return record_violation(
                        &mut state,
                        "subprocess.spawn",
                        format!("Subprocess execution blocked: {command}"),
                    );
                }
                Ok(())
            }
            SandboxEvent::ModuleImport { module } => {
                let base = module.split('.').next().unwrap_or(module);
                if ALWAYS_BLOCKED_MODULES.contains(&base) {
                    return record_violation(
                        &mut state,
                        "import",
                        format!("Import of '{base}' blocked (threading not allowed in sandbox)"),
                    );
                }
                if config.blocked_custom_modules.iter().any(|blocked| blocked == base) {
                    return record_violation(
                        &mut state,
                        "import",
                        format!("Import of '{base}' blocked"),
                    );
                }
                Ok(())
            }
            SandboxEvent::Eval => {
                if !config.allow_eval_exec {
                    return record_violation(&mut state, "eval", "eval blocked".to_string());
                }
                Ok(())
            }
            SandboxEvent::Compile { filename } => {
                // Runtime-internal compile events carry bracketed names.
                if filename.starts_with('<') {
                    return Ok(());
                }
                if !config.allow_eval_exec {
                    return record_violation(
                        &mut state,
                        "compile",
                        format!("compile of '{filename}' blocked"),
                    );
                }
                Ok(())
            }
            SandboxEvent::NativeLibraryLoad { path } => record_violation(
                &mut state,
                "native.library.load",
                format!("Native library loading blocked in sandbox: {path}"),
            ),
        }
    })
}
