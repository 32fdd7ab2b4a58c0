//! Audit record exporters: JSON and CSV.

use serde_json::{json, Value};

use crate::domain::models::run::AuditRecord;

/// Stable export column order.
pub const RECORD_FIELDS: &[&str] = &[
    "run_id",
    "agent_name",
    "timestamp",
    "user_prompt",
    "model",
    "provider",
    "output",
    "tokens_in",
    "tokens_out",
    "total_tokens",
    "tool_calls",
    "duration_ms",
    "success",
    "error",
    "trigger_type",
    "trigger_metadata",
];

fn record_to_value(record: &AuditRecord, parse_trigger_metadata: bool) -> Value {
    let trigger_metadata = match (&record.trigger_metadata, parse_trigger_metadata) {
        (Some(raw), true) => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone())),
        (Some(raw), false) => Value::String(raw.clone()),
        (None, _) => Value::Null,
    };
    json!({
        "run_id": record.run_id,
        "agent_name": record.agent_name,
        "timestamp": record.timestamp,
        "user_prompt": record.user_prompt,
        "model": record.model,
        "provider": record.provider,
        "output": record.output,
        "tokens_in": record.tokens_in,
        "tokens_out": record.tokens_out,
        "total_tokens": record.total_tokens,
        "tool_calls": record.tool_calls,
        "duration_ms": record.duration_ms,
        "success": record.success,
        "error": record.error,
        "trigger_type": record.trigger_type,
        "trigger_metadata": trigger_metadata,
    })
}

/// Render records as a pretty-printed JSON array. `trigger_metadata` is
/// deserialized into an object where it parses.
pub fn to_json(records: &[AuditRecord]) -> String {
    let values: Vec<Value> = records.iter().map(|r| record_to_value(r, true)).collect();
    serde_json::to_string_pretty(&values).unwrap_or_else(|_| "[]".to_string())
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Render records as CSV with the stable column order of [`RECORD_FIELDS`].
pub fn to_csv(records: &[AuditRecord]) -> String {
    let mut out = String::new();
    out.push_str(&RECORD_FIELDS.join(","));
    out.push('\n');

    for record in records {
        let fields = [
            record.run_id.clone(),
            record.agent_name.clone(),
            record.timestamp.clone(),
            record.user_prompt.clone(),
            record.model.clone(),
            record.provider.clone(),
            record.output.clone(),
            record.tokens_in.to_string(),
            record.tokens_out.to_string(),
            record.total_tokens.to_string(),
            record.tool_calls.to_string(),
            record.duration_ms.to_string(),
            record.success.to_string(),
            record.error.clone().unwrap_or_default(),
            record.trigger_type.clone().unwrap_or_default(),
            record.trigger_metadata.clone().unwrap_or_default(),
        ];
        let row: Vec<String> = fields.iter().map(|f| csv_escape(f)).collect();
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> AuditRecord {
        AuditRecord {
            run_id: "run-1".to_string(),
            agent_name: "worker".to_string(),
            timestamp: "2026-08-01T00:00:00+00:00".to_string(),
            user_prompt: "hello, \"world\"".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            provider: "anthropic".to_string(),
            output: "done".to_string(),
            tokens_in: 10,
            tokens_out: 20,
            total_tokens: 30,
            tool_calls: 2,
            duration_ms: 1500,
            success: true,
            error: None,
            trigger_type: Some("cron".to_string()),
            trigger_metadata: Some(r#"{"schedule":"0 0 9 * * * *"}"#.to_string()),
        }
    }

    #[test]
    fn test_json_parses_trigger_metadata() {
        let text = to_json(&[record()]);
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value[0]["trigger_metadata"]["schedule"], "0 0 9 * * * *");
        assert_eq!(value[0]["run_id"], "run-1");
    }

    #[test]
    fn test_json_empty() {
        assert_eq!(to_json(&[]), "[]");
    }

    #[test]
    fn test_csv_header_order() {
        let text = to_csv(&[record()]);
        let header = text.lines().next().unwrap();
        assert!(header.starts_with("run_id,agent_name,timestamp,"));
        assert!(header.ends_with("trigger_type,trigger_metadata"));
    }

    #[test]
    fn test_csv_escapes_quotes_and_commas() {
        let text = to_csv(&[record()]);
        let row = text.lines().nth(1).unwrap();
        assert!(row.contains("\"hello, \"\"world\"\"\""));
    }
}
