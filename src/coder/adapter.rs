// src/coder/adapter.rs
// Converts the coder model's tagged stream into granular UI events and
// triggers streaming auto-execution for append-only file writes

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use super::patterns::{ExtractorEvent, PatternName, StreamingPatternExtractor};

const TOOL_OPEN: &str = "<TOOL>";
const TOOL_CLOSE: &str = "</TOOL>";
const REASON_OPEN: &str = "<REASON>";
const REASON_CLOSE: &str = "</REASON>";

static PARAM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<PARAM\s+name="([^"]+)">(.*?)</PARAM>"#).expect("param regex")
});
static PARAM_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<PARAM\s+name="([^"]+)">"#).expect("param open regex"));

pub type EventEmitter = Box<dyn FnMut(Value) + Send>;
pub type AutoExecCallback = Box<dyn FnMut(&str, &HashMap<String, String>, &str) + Send>;

const AUTO_EXECUTE_TOOLS: [&str; 2] = ["file.write", "file.edit"];

#[derive(Default)]
struct ToolState {
    index: usize,
    content_buffer: String,
    tool_name: Option<String>,
    fields_emitted: HashSet<&'static str>,
    params_emitted: HashSet<String>,
    collected_params: HashMap<String, String>,
    streaming_params: HashSet<String>,
    complete_params: HashSet<String>,
    last_sent_param_content: HashMap<String, String>,
    last_auto_exec_signature: Option<String>,
    complete: bool,
}

/// Adapter from block extraction to the event vocabulary the coder UI
/// renders: thoughts / agent_response / tool_call segments, each with
/// start/append/complete (and param-level) actions.
pub struct CoderStreamAdapter {
    iteration: u32,
    emit: EventEmitter,
    auto_exec: Option<AutoExecCallback>,
    extractor: Option<StreamingPatternExtractor>,

    thoughts_started: bool,
    thoughts_complete: bool,
    message_started: bool,
    message_complete: bool,

    tool_states: Vec<ToolState>,
}

impl CoderStreamAdapter {
    pub fn new(iteration: u32, emit: EventEmitter, auto_exec: Option<AutoExecCallback>) -> Self {
        Self {
            iteration,
            emit,
            auto_exec,
            extractor: Some(StreamingPatternExtractor::new()),
            thoughts_started: false,
            thoughts_complete: false,
            message_started: false,
            message_complete: false,
            tool_states: Vec::new(),
        }
    }

    /// Reasoning text arrives outside the pattern stream.
    pub fn handle_thoughts(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.thoughts_started {
            self.thoughts_started = true;
            let event = json!({"iteration": self.iteration, "segment": "thoughts", "action": "start"});
            (self.emit)(event);
        }
        let event = json!({
            "iteration": self.iteration,
            "segment": "thoughts",
            "action": "append",
            "text": text,
        });
        (self.emit)(event);
    }

    /// Answer text feeds the pattern extractor.
    pub fn feed_answer(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let Some(extractor) = self.extractor.as_mut() else {
            return;
        };
        let events = extractor.feed_chunk(text);
        for event in events {
            self.handle_extractor_event(event);
        }
    }

    /// Close the stream: flush dangling segments and emit completions.
    pub fn finalize(&mut self) {
        if let Some(extractor) = self.extractor.take() {
            let (_, malformed) = extractor.finalize();
            for (key, content) in malformed {
                let preview: String = content.chars().take(100).collect();
                warn!("Malformed pattern {}: {}...", key, preview);
            }
        }

        self.complete_thoughts();

        if self.message_started && !self.message_complete {
            self.message_complete = true;
            let event = json!({"iteration": self.iteration, "segment": "agent_response", "action": "complete"});
            (self.emit)(event);
        }

        for i in 0..self.tool_states.len() {
            if !self.tool_states[i].complete {
                self.tool_states[i].complete = true;
                let index = self.tool_states[i].index;
                let event = json!({
                    "iteration": self.iteration,
                    "segment": "tool_call",
                    "action": "complete",
                    "tool_index": index,
                });
                (self.emit)(event);
            }
        }
    }

    fn handle_extractor_event(&mut self, event: ExtractorEvent) {
        match event {
            ExtractorEvent::PatternStart { name } => self.on_pattern_start(name),
            ExtractorEvent::PatternContent { name, chunk } => self.on_pattern_content(name, &chunk),
            ExtractorEvent::PatternEnd { name, content } => self.on_pattern_end(name, &content),
        }
    }

    fn on_pattern_start(&mut self, name: PatternName) {
        match name {
            PatternName::Message => {
                if !self.message_started {
                    self.message_started = true;
                    let event = json!({"iteration": self.iteration, "segment": "agent_response", "action": "start"});
                    (self.emit)(event);
                    // The agent response follows the reasoning stream
                    self.complete_thoughts();
                }
            }
            PatternName::ToolCall => {
                let index = self.tool_states.len();
                self.tool_states.push(ToolState {
                    index,
                    ..Default::default()
                });
                let event = json!({
                    "iteration": self.iteration,
                    "segment": "tool_call",
                    "action": "start",
                    "tool_index": index,
                });
                (self.emit)(event);
            }
        }
    }

    fn on_pattern_content(&mut self, name: PatternName, chunk: &str) {
        match name {
            PatternName::Message => {
                let event = json!({
                    "iteration": self.iteration,
                    "segment": "agent_response",
                    "action": "append",
                    "text": chunk,
                });
                (self.emit)(event);
            }
            PatternName::ToolCall => {
                let Some(active) = self.tool_states.iter().rposition(|s| !s.complete) else {
                    return;
                };
                self.tool_states[active].content_buffer.push_str(chunk);
                self.process_tool_content(active, false);
            }
        }
    }

    fn on_pattern_end(&mut self, name: PatternName, content: &str) {
        match name {
            PatternName::Message => {
                if !self.message_complete {
                    self.message_complete = true;
                    let event = json!({"iteration": self.iteration, "segment": "agent_response", "action": "complete"});
                    (self.emit)(event);
                }
            }
            PatternName::ToolCall => {
                let Some(active) = self.tool_states.iter().rposition(|s| !s.complete) else {
                    return;
                };
                self.tool_states[active].content_buffer = content.to_string();
                self.process_tool_content(active, true);

                if !self.tool_states[active].complete {
                    self.tool_states[active].complete = true;
                    let index = self.tool_states[active].index;
                    let event = json!({
                        "iteration": self.iteration,
                        "segment": "tool_call",
                        "action": "complete",
                        "tool_index": index,
                    });
                    (self.emit)(event);
                    self.attempt_auto_exec(active, true);
                }
            }
        }
    }

    /// Parse TOOL / REASON / PARAM tags out of the accumulated tool-call
    /// body, emitting fields exactly once and params incrementally.
    fn process_tool_content(&mut self, active: usize, final_pass: bool) {
        let content = self.tool_states[active].content_buffer.clone();
        let iteration = self.iteration;

        if !self.tool_states[active].fields_emitted.contains("tool") {
            if let Some(tool) = extract_tag(&content, TOOL_OPEN, TOOL_CLOSE) {
                debug!("Tool name extracted: {}", tool);
                let index = self.tool_states[active].index;
                let event = json!({
                    "iteration": iteration,
                    "segment": "tool_call",
                    "action": "field",
                    "field": "tool",
                    "value": tool,
                    "tool_index": index,
                });
                (self.emit)(event);
                self.tool_states[active].fields_emitted.insert("tool");
                self.tool_states[active].tool_name = Some(tool);
            }
        }

        if !self.tool_states[active].fields_emitted.contains("reason") {
            if let Some(reason) = extract_tag(&content, REASON_OPEN, REASON_CLOSE) {
                let index = self.tool_states[active].index;
                let event = json!({
                    "iteration": iteration,
                    "segment": "tool_call",
                    "action": "field",
                    "field": "reason",
                    "value": reason,
                    "tool_index": index,
                });
                (self.emit)(event);
                self.tool_states[active].fields_emitted.insert("reason");
            }
        }

        self.process_params(active, &content, final_pass);
    }

    fn process_params(&mut self, active: usize, content: &str, _final_pass: bool) {
        let iteration = self.iteration;

        // A trailing open tag without its close is a still-streaming param
        if let Some(open) = PARAM_OPEN_RE
            .captures_iter(content)
            .last()
            .filter(|c| !content[c.get(0).unwrap().end()..].contains("</PARAM>"))
        {
            let param_name = open[1].to_string();
            let streaming_content = content[open.get(0).unwrap().end()..].to_string();
            let last_sent = self.tool_states[active]
                .last_sent_param_content
                .get(&param_name)
                .cloned()
                .unwrap_or_default();

            if streaming_content.len() > last_sent.len() {
                let index = self.tool_states[active].index;
                if streaming_content.starts_with(&last_sent) {
                    // Append-only growth: ship just the delta
                    let delta = streaming_content[last_sent.len()..].to_string();
                    let event = json!({
                        "iteration": iteration,
                        "segment": "tool_call",
                        "action": "param_delta",
                        "name": param_name,
                        "delta": delta,
                        "offset": last_sent.len(),
                        "tool_index": index,
                        "complete": false,
                    });
                    (self.emit)(event);
                } else {
                    let event = json!({
                        "iteration": iteration,
                        "segment": "tool_call",
                        "action": "param_update",
                        "name": param_name,
                        "value": streaming_content,
                        "tool_index": index,
                        "complete": false,
                    });
                    (self.emit)(event);
                }

                self.tool_states[active]
                    .last_sent_param_content
                    .insert(param_name.clone(), streaming_content.clone());
                self.tool_states[active]
                    .streaming_params
                    .insert(param_name.clone());
                self.tool_states[active]
                    .collected_params
                    .insert(param_name.clone(), streaming_content);

                if matches!(param_name.as_str(), "content" | "new_content" | "create_dirs") {
                    self.attempt_auto_exec(active, false);
                }
            }
        }

        // Completed params
        let matches: Vec<(String, String, String)> = PARAM_RE
            .captures_iter(content)
            .map(|c| (c[0].to_string(), c[1].trim().to_string(), c[2].trim().to_string()))
            .collect();
        for (raw, param_name, param_value) in matches {
            if self.tool_states[active].params_emitted.contains(&raw) {
                continue;
            }
            self.tool_states[active].params_emitted.insert(raw);
            self.tool_states[active].streaming_params.remove(&param_name);
            self.tool_states[active]
                .last_sent_param_content
                .remove(&param_name);

            let index = self.tool_states[active].index;
            let event = json!({
                "iteration": iteration,
                "segment": "tool_call",
                "action": "param",
                "name": param_name,
                "value": param_value,
                "tool_index": index,
                "complete": true,
            });
            (self.emit)(event);
            self.tool_states[active]
                .collected_params
                .insert(param_name.clone(), param_value);
            self.tool_states[active]
                .complete_params
                .insert(param_name.clone());

            if matches!(
                param_name.as_str(),
                "file_path" | "content" | "new_content" | "create_dirs"
            ) {
                self.attempt_auto_exec(active, false);
            }
        }
    }

    /// Fire the auto-exec callback for file.write (streaming) and
    /// file.edit (on completion), keyed by a content hash so identical
    /// snapshots never re-trigger.
    fn attempt_auto_exec(&mut self, active: usize, require_complete: bool) {
        if self.auto_exec.is_none() {
            return;
        }

        let state = &self.tool_states[active];
        let Some(tool_name) = state.tool_name.clone() else {
            return;
        };
        if !AUTO_EXECUTE_TOOLS.contains(&tool_name.as_str()) {
            return;
        }

        let is_streaming_tool = tool_name == "file.write";
        if !is_streaming_tool && !require_complete {
            return;
        }

        let params = state.collected_params.clone();
        if !params.contains_key("file_path")
            || state.streaming_params.contains("file_path")
            || !state.complete_params.contains("file_path")
        {
            return;
        }

        if tool_name == "file.write" {
            let Some(content_value) = params.get("content") else {
                return;
            };
            let signature = format!("{:x}", Sha256::digest(content_value.as_bytes()));
            if self.tool_states[active].last_auto_exec_signature.as_deref() == Some(&signature) {
                return;
            }
            self.tool_states[active].last_auto_exec_signature = Some(signature);
        }

        let call_id = format!(
            "auto_exec_iter{}_tool{}",
            self.iteration, self.tool_states[active].index
        );
        if let Some(auto_exec) = self.auto_exec.as_mut() {
            debug!(tool = %tool_name, call_id = %call_id, "Triggering auto-execution");
            auto_exec(&tool_name, &params, &call_id);
        }
    }

    fn complete_thoughts(&mut self) {
        if self.thoughts_started && !self.thoughts_complete {
            self.thoughts_complete = true;
            let event = json!({"iteration": self.iteration, "segment": "thoughts", "action": "complete"});
            (self.emit)(event);
        }
    }
}

fn extract_tag(content: &str, open: &str, close: &str) -> Option<String> {
    let start = content.find(open)? + open.len();
    let end = content[start..].find(close)? + start;
    Some(content[start..end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn collecting_adapter(auto_exec: Option<AutoExecCallback>) -> (CoderStreamAdapter, Arc<Mutex<Vec<Value>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let adapter = CoderStreamAdapter::new(
            1,
            Box::new(move |event| sink.lock().push(event)),
            auto_exec,
        );
        (adapter, events)
    }

    fn actions(events: &[Value]) -> Vec<(String, String)> {
        events
            .iter()
            .map(|e| {
                (
                    e["segment"].as_str().unwrap_or("").to_string(),
                    e["action"].as_str().unwrap_or("").to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn message_stream_emits_start_append_complete() {
        let (mut adapter, events) = collecting_adapter(None);
        adapter.feed_answer("<MESSAGE>Hello ");
        adapter.feed_answer("there</MESSAGE>");
        adapter.finalize();

        let recorded = events.lock();
        let seq = actions(&recorded);
        assert_eq!(seq[0], ("agent_response".into(), "start".into()));
        assert_eq!(seq.last().unwrap().1, "complete");
        let text: String = recorded
            .iter()
            .filter(|e| e["action"] == "append")
            .map(|e| e["text"].as_str().unwrap_or(""))
            .collect();
        assert_eq!(text, "Hello there");
    }

    #[test]
    fn streaming_param_emits_append_only_deltas() {
        let (mut adapter, events) = collecting_adapter(None);
        adapter.feed_answer(
            "<TOOL_CALL><TOOL>file.write</TOOL><PARAM name=\"file_path\">a.txt</PARAM><PARAM name=\"content\">line one\n",
        );
        adapter.feed_answer("line two\n");
        adapter.feed_answer("</PARAM></TOOL_CALL>");
        adapter.finalize();

        let recorded = events.lock();
        let deltas: Vec<&Value> = recorded
            .iter()
            .filter(|e| e["action"] == "param_delta")
            .collect();
        assert!(!deltas.is_empty(), "streaming content must produce deltas");
        assert_eq!(deltas[0]["offset"], 0);

        // The closing pass emits the completed param once
        let complete: Vec<&Value> = recorded
            .iter()
            .filter(|e| e["action"] == "param" && e["name"] == "content")
            .collect();
        assert_eq!(complete.len(), 1);
    }

    #[test]
    fn auto_exec_dedupes_identical_content() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let (mut adapter, _) = collecting_adapter(Some(Box::new(
            move |tool: &str, params: &HashMap<String, String>, _id: &str| {
                sink.lock()
                    .push((tool.to_string(), params.get("content").cloned()));
            },
        )));

        adapter.feed_answer(
            "<TOOL_CALL><TOOL>file.write</TOOL><PARAM name=\"file_path\">a.txt</PARAM><PARAM name=\"content\">same</PARAM></TOOL_CALL>",
        );
        adapter.finalize();

        let calls = fired.lock();
        assert_eq!(calls.len(), 1, "identical content must fire exactly once");
        assert_eq!(calls[0].0, "file.write");
    }

    #[test]
    fn thoughts_close_when_message_starts() {
        let (mut adapter, events) = collecting_adapter(None);
        adapter.handle_thoughts("considering...");
        adapter.feed_answer("<MESSAGE>answer</MESSAGE>");
        adapter.finalize();

        let recorded = events.lock();
        let seq = actions(&recorded);
        let thoughts_complete = seq
            .iter()
            .position(|(s, a)| s == "thoughts" && a == "complete")
            .expect("thoughts must complete");
        let response_start = seq
            .iter()
            .position(|(s, a)| s == "agent_response" && a == "start")
            .unwrap();
        assert!(response_start < thoughts_complete || response_start + 1 == thoughts_complete);
    }
}
