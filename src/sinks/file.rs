//! File sink: append run results to a local file.

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::domain::ports::{RunSink, SinkError};
use crate::sinks::SinkPayload;

/// Output format for the file sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// One JSON object per line.
    Json,
    /// Human-readable one-liners.
    Text,
}

/// Appends each payload to a file created with owner-only permissions.
pub struct FileSink {
    path: PathBuf,
    format: FileFormat,
}

impl FileSink {
    pub fn new(path: PathBuf, format: &str) -> Self {
        let format = if format.eq_ignore_ascii_case("text") {
            FileFormat::Text
        } else {
            FileFormat::Json
        };
        Self { path, format }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut options = std::fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")
    }
}

#[async_trait]
impl RunSink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn send(&self, payload: &SinkPayload) -> Result<(), SinkError> {
        let line = match self.format {
            FileFormat::Json => serde_json::to_string(payload)
                .map_err(|e| SinkError::Other(e.to_string()))?,
            FileFormat::Text => {
                let status = if payload.success {
                    "OK".to_string()
                } else {
                    format!("ERROR: {}", payload.error.as_deref().unwrap_or("unknown"))
                };
                format!(
                    "[{}] {} | {} | {}",
                    payload.timestamp, payload.agent_name, status, payload.output
                )
            }
        };
        self.append_line(&line)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn payload(success: bool) -> SinkPayload {
        SinkPayload {
            agent_name: "worker".to_string(),
            run_id: "run-1".to_string(),
            prompt: "go".to_string(),
            output: "done".to_string(),
            success,
            error: (!success).then(|| "boom".to_string()),
            tokens_in: 0,
            tokens_out: 0,
            duration_ms: 0,
            model: "m".to_string(),
            provider: "p".to_string(),
            trigger_type: None,
            trigger_metadata: HashMap::new(),
            timestamp: "2026-08-01T00:00:00+00:00".to_string(),
        }
    }

    #[tokio::test]
    async fn test_json_lines_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/results.jsonl");
        let sink = FileSink::new(path.clone(), "json");

        sink.send(&payload(true)).await.unwrap();
        sink.send(&payload(false)).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["agent_name"], "worker");
    }

    #[tokio::test]
    async fn test_text_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.log");
        let sink = FileSink::new(path.clone(), "text");

        sink.send(&payload(false)).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("ERROR: boom"));
        assert!(text.contains("worker"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let sink = FileSink::new(path.clone(), "json");
        sink.send(&payload(true)).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
