//! Systemd user unit integration for compose orchestrations.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::Utc;
use thiserror::Error;

/// Errors from systemd operations.
#[derive(Debug, Error)]
pub enum SystemdError {
    #[error("systemctl not found; systemd integration requires a Linux system with systemd")]
    SystemctlMissing,

    #[error("unit {unit_name} already exists at {unit_path}; use --force to overwrite")]
    UnitExists { unit_name: String, unit_path: PathBuf },

    #[error("unit {unit_name} not found at {unit_path}")]
    UnitMissing { unit_name: String, unit_path: PathBuf },

    #[error("systemctl command failed: {0}")]
    Systemctl(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Result of a unit install operation.
#[derive(Debug, Clone)]
pub struct UnitInfo {
    pub unit_name: String,
    pub unit_path: PathBuf,
    pub compose_name: String,
    pub compose_path: PathBuf,
}

const UNIT_TEMPLATE: &str = "\
# Managed by initrunner -- do not edit manually.
# Compose: {compose_name}
# Source:  {compose_path}
# Installed: {timestamp}

[Unit]
Description=InitRunner Compose: {compose_name}
After=network-online.target
Wants=network-online.target

[Service]
Type=simple
ExecStart={exec_start}
WorkingDirectory={working_dir}
Restart=on-failure
RestartSec=10

# Environment -- shell env vars (e.g. from .bashrc) are NOT inherited.
# Add secrets to the .env file or use --env-file during install.
EnvironmentFile=-{working_dir}/.env
EnvironmentFile=-{home}/.initrunner/.env
{extra_env_file}# Logging
StandardOutput=journal
StandardError=journal
SyslogIdentifier=initrunner-{sanitized_name}

# Shutdown
KillSignal=SIGTERM
TimeoutStopSec=30

# Security (user-level hardening)
NoNewPrivileges=true
PrivateTmp=true
ProtectSystem=strict
ProtectHome=read-only
ProtectKernelTunables=true
ProtectKernelModules=true
ProtectControlGroups=true
RestrictRealtime=true
RestrictSUIDSGID=true
LockPersonality=true
RestrictNamespaces=true
SystemCallArchitectures=native
ReadWritePaths={read_write_paths}

[Install]
WantedBy=default.target
";

const ENV_TEMPLATE: &str = "\
# Environment file for initrunner compose: {compose_name}
# Uncomment and fill in the values your agents need.
# This file is referenced by the systemd unit as EnvironmentFile.

# ANTHROPIC_API_KEY=
# OPENAI_API_KEY=
# OLLAMA_HOST=http://localhost:11434
";

fn unit_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config/systemd/user")
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
}

/// Quote a value for systemd ExecStart if it contains spaces or quotes.
fn escape_arg(value: &str) -> String {
    if !value.contains(' ') && !value.contains('"') && !value.contains('\\') {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Convert a compose name to a safe unit name component. When a unit with
/// the same name already exists for a different compose path, a short path
/// hash disambiguates.
pub fn sanitize_unit_name(compose_name: &str, compose_path: Option<&Path>) -> String {
    let mut sanitized = String::new();
    let mut last_dash = false;
    for c in compose_name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            sanitized.push(c);
            last_dash = false;
        } else if !last_dash {
            sanitized.push('-');
            last_dash = true;
        }
    }
    let mut sanitized = sanitized.trim_matches('-').to_string();
    if sanitized.is_empty() {
        sanitized = "unnamed".to_string();
    }

    if let Some(compose_path) = compose_path {
        let existing = unit_dir().join(format!("initrunner-{sanitized}.service"));
        if existing.exists() {
            if let Ok(content) = std::fs::read_to_string(&existing) {
                let work_dir = compose_path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                if !content.contains(&format!("WorkingDirectory={}", work_dir.display())) {
                    let mut hasher = DefaultHasher::new();
                    compose_path.hash(&mut hasher);
                    let digest = format!("{:04x}", hasher.finish() & 0xffff);
                    sanitized = format!("{sanitized}-{digest}");
                }
            }
        }
    }

    sanitized
}

/// Full unit name for a compose project.
pub fn unit_name_for(compose_name: &str) -> String {
    format!("initrunner-{}.service", sanitize_unit_name(compose_name, None))
}

fn check_systemd_available() -> Result<(), SystemdError> {
    let found = std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join("systemctl").is_file())
        })
        .unwrap_or(false);
    if found {
        Ok(())
    } else {
        Err(SystemdError::SystemctlMissing)
    }
}

/// Render a systemd unit file for the given compose project.
pub fn generate_unit_content(
    compose_name: &str,
    compose_path: &Path,
    executable: &str,
    env_file: Option<&Path>,
) -> String {
    let sanitized = sanitize_unit_name(compose_name, Some(compose_path));
    let working_dir = compose_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let home = home_dir();

    let exec_start = format!(
        "{} compose up {}",
        escape_arg(executable),
        escape_arg(&compose_path.to_string_lossy())
    );
    let read_write_paths = format!(
        "{} {}",
        escape_arg(&working_dir.to_string_lossy()),
        escape_arg(&home.join(".initrunner").to_string_lossy())
    );
    let extra_env_file = env_file
        .map(|path| format!("EnvironmentFile={}\n", path.display()))
        .unwrap_or_default();

    UNIT_TEMPLATE
        .replace("{compose_name}", compose_name)
        .replace("{compose_path}", &compose_path.to_string_lossy())
        .replace("{timestamp}", &Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .replace("{exec_start}", &exec_start)
        .replace("{working_dir}", &working_dir.to_string_lossy())
        .replace("{home}", &home.to_string_lossy())
        .replace("{sanitized_name}", &sanitized)
        .replace("{extra_env_file}", &extra_env_file)
        .replace("{read_write_paths}", &read_write_paths)
}

/// Placeholder .env content for a compose project.
pub fn generate_env_template(compose_name: &str) -> String {
    ENV_TEMPLATE.replace("{compose_name}", compose_name)
}

fn write_restricted(path: &Path, content: &str) -> Result<(), SystemdError> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

/// Write a systemd user unit file and reload the daemon. Fails if the unit
/// exists and `force` is false; with `force` the install is idempotent.
pub fn install_unit(
    compose_name: &str,
    compose_path: &Path,
    executable: &str,
    env_file: Option<&Path>,
    force: bool,
) -> Result<UnitInfo, SystemdError> {
    check_systemd_available()?;
    let sanitized = sanitize_unit_name(compose_name, Some(compose_path));
    let unit_name = format!("initrunner-{sanitized}.service");
    let unit_path = unit_dir().join(&unit_name);

    if unit_path.exists() && !force {
        return Err(SystemdError::UnitExists { unit_name, unit_path });
    }

    std::fs::create_dir_all(unit_dir())?;
    let content = generate_unit_content(compose_name, compose_path, executable, env_file);
    write_restricted(&unit_path, &content)?;

    systemctl(&["daemon-reload"], true, false)?;

    Ok(UnitInfo {
        unit_name,
        unit_path,
        compose_name: compose_name.to_string(),
        compose_path: compose_path.to_path_buf(),
    })
}

/// Stop, disable, and remove a unit file. Returns the removed path.
pub fn uninstall_unit(compose_name: &str) -> Result<PathBuf, SystemdError> {
    check_systemd_available()?;
    let unit_name = unit_name_for(compose_name);
    let unit_path = unit_dir().join(&unit_name);

    if !unit_path.exists() {
        return Err(SystemdError::UnitMissing { unit_name, unit_path });
    }

    // Best-effort stop and disable; the unit may not be running.
    let _ = systemctl(&["stop", &unit_name], false, false);
    let _ = systemctl(&["disable", &unit_name], false, false);

    std::fs::remove_file(&unit_path)?;
    systemctl(&["daemon-reload"], true, false)?;
    Ok(unit_path)
}

/// `systemctl status` output for a compose unit.
pub fn unit_status(compose_name: &str) -> Result<String, SystemdError> {
    check_systemd_available()?;
    let unit_name = unit_name_for(compose_name);
    // status exits non-zero for inactive units; capture regardless.
    let output = systemctl(&["status", &unit_name], false, true)?;
    Ok(output)
}

fn systemctl(args: &[&str], check: bool, capture: bool) -> Result<String, SystemdError> {
    let output = Command::new("systemctl")
        .arg("--user")
        .args(args)
        .output()
        .map_err(|e| SystemdError::Systemctl(format!("systemctl --user {}: {e}", args.join(" "))))?;

    if check && !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SystemdError::Systemctl(format!(
            "systemctl --user {} failed: {stderr}",
            args.join(" ")
        )));
    }
    Ok(if capture {
        String::from_utf8_lossy(&output.stdout).to_string()
    } else {
        String::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_replaces_and_collapses() {
        assert_eq!(sanitize_unit_name("My Compose!", None), "My-Compose");
        assert_eq!(sanitize_unit_name("a//b..c", None), "a-b-c");
        assert_eq!(sanitize_unit_name("--x--", None), "x");
        assert_eq!(sanitize_unit_name("***", None), "unnamed");
    }

    #[test]
    fn test_unit_name() {
        assert_eq!(unit_name_for("pipeline"), "initrunner-pipeline.service");
    }

    #[test]
    fn test_escape_arg() {
        assert_eq!(escape_arg("/plain/path"), "/plain/path");
        assert_eq!(escape_arg("/with space/x"), "\"/with space/x\"");
        assert_eq!(escape_arg("a\"b"), "\"a\\\"b\"");
    }

    #[test]
    fn test_unit_content_contains_hardening() {
        let content = generate_unit_content(
            "pipeline",
            Path::new("/srv/app/compose.yaml"),
            "/usr/local/bin/initrunner",
            None,
        );
        assert!(content.contains("ExecStart=/usr/local/bin/initrunner compose up /srv/app/compose.yaml"));
        assert!(content.contains("WorkingDirectory=/srv/app"));
        assert!(content.contains("ProtectSystem=strict"));
        assert!(content.contains("ProtectHome=read-only"));
        assert!(content.contains("NoNewPrivileges=true"));
        assert!(content.contains("PrivateTmp=true"));
        assert!(content.contains("KillSignal=SIGTERM"));
        assert!(content.contains("TimeoutStopSec=30"));
    }

    #[test]
    fn test_unit_content_extra_env_file() {
        let content = generate_unit_content(
            "pipeline",
            Path::new("/srv/app/compose.yaml"),
            "initrunner",
            Some(Path::new("/srv/app/prod.env")),
        );
        assert!(content.contains("EnvironmentFile=/srv/app/prod.env"));
    }

    #[test]
    fn test_env_template_mentions_compose() {
        let content = generate_env_template("pipeline");
        assert!(content.contains("pipeline"));
        assert!(content.contains("ANTHROPIC_API_KEY"));
    }
}
