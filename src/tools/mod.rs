// src/tools/mod.rs
// Tool execution seam used by the FastPath. Concrete tool implementations
// live outside the execution core; the engine only needs this interface.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Executes one named tool with string parameters. `ctx_id` is unique per
/// invocation so downstream duplicate detection never collapses calls.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        tool: &str,
        params: &HashMap<String, String>,
        ctx_id: &str,
    ) -> anyhow::Result<Value>;
}

/// Registry-less executor for deployments without tool support; every
/// call fails, which the FastPath reports to the model as tool output.
pub struct NullToolExecutor;

#[async_trait]
impl ToolExecutor for NullToolExecutor {
    async fn execute(
        &self,
        tool: &str,
        _params: &HashMap<String, String>,
        _ctx_id: &str,
    ) -> anyhow::Result<Value> {
        anyhow::bail!("no tool registry configured (requested tool: {tool})")
    }
}

/// Format tool output for presentation to the model. `file.read` results
/// get a readable header; everything else is pretty-printed JSON.
pub fn format_tool_output(tool: &str, output: &Value) -> String {
    if tool == "file.read" {
        if let Some(object) = output.as_object() {
            if object.get("status").and_then(|v| v.as_str()) == Some("success") {
                if let Some(content) = object.get("content").and_then(|v| v.as_str()) {
                    let file_path = object
                        .get("file_path")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown");
                    let mut formatted = format!("File: {file_path}\n\n{content}");
                    if let Some(warnings) = object.get("warnings").and_then(|v| v.as_array()) {
                        if !warnings.is_empty() {
                            let joined: Vec<&str> =
                                warnings.iter().filter_map(|w| w.as_str()).collect();
                            formatted.push_str(&format!("\n\n[Warnings: {}]", joined.join("; ")));
                        }
                    }
                    return formatted;
                }
            }
        }
    }

    match output {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn file_read_output_is_humanized() {
        let output = json!({
            "status": "success",
            "file_path": "/tmp/a.txt",
            "content": "hello",
            "warnings": ["truncated"],
        });
        let formatted = format_tool_output("file.read", &output);
        assert!(formatted.starts_with("File: /tmp/a.txt"));
        assert!(formatted.contains("hello"));
        assert!(formatted.contains("[Warnings: truncated]"));
    }

    #[test]
    fn other_output_is_json() {
        let formatted = format_tool_output("web.search", &json!({"hits": 3}));
        assert!(formatted.contains("\"hits\": 3"));
    }
}
