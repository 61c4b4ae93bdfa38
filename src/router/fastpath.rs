// src/router/fastpath.rs
// FastPath tool-call XML: <TOOL>name</TOOL> plus <PARAM name="k">v</PARAM>

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use tracing::warn;

static TOOL_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"<TOOL>\s*(.+?)\s*</TOOL>")
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .expect("tool regex")
});

static PARAM_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"<PARAM\s+name=["'](.+?)["']\s*>(.+?)</PARAM>"#)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .expect("param regex")
});

#[derive(Debug, Clone, PartialEq)]
pub struct FastPathCall {
    pub tool: String,
    pub params: HashMap<String, String>,
}

/// Parse the router's fastpath payload. Returns `None` when no `<TOOL>`
/// tag is present.
pub fn parse_fastpath_params(raw: &str) -> Option<FastPathCall> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let Some(tool_match) = TOOL_RE.captures(raw) else {
        warn!("FastPath payload without <TOOL> tag: {}", raw);
        return None;
    };
    let tool = tool_match[1].trim().to_string();

    let mut params = HashMap::new();
    for capture in PARAM_RE.captures_iter(raw) {
        params.insert(capture[1].trim().to_string(), capture[2].trim().to_string());
    }

    Some(FastPathCall { tool, params })
}

/// Wrap tool output and the original user query the way the model
/// expects to receive a pre-executed fastpath result.
pub fn wrap_fastpath_output(tool_output: &str, user_message: &str) -> String {
    format!(
        "[SYSTEM CALLED THE RELEVANT TOOL. ANSWER USER QUERY WITH THE FOLLOWING TOOL OUTPUT:]\n\n{tool_output}\n\n---\n\n[USER QUERY:]\n{user_message}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tool_and_params() {
        let call = parse_fastpath_params(
            "<TOOL>file.read</TOOL>\n<PARAM name=\"file_path\">/tmp/a.txt</PARAM>\n<PARAM name='limit'>10</PARAM>",
        )
        .expect("valid payload");
        assert_eq!(call.tool, "file.read");
        assert_eq!(call.params.get("file_path").map(String::as_str), Some("/tmp/a.txt"));
        assert_eq!(call.params.get("limit").map(String::as_str), Some("10"));
    }

    #[test]
    fn rejects_payload_without_tool_tag() {
        assert!(parse_fastpath_params("<PARAM name=\"x\">1</PARAM>").is_none());
        assert!(parse_fastpath_params("   ").is_none());
    }

    #[test]
    fn wrapped_output_keeps_query_last() {
        let wrapped = wrap_fastpath_output("file contents", "what does it say?");
        assert!(wrapped.starts_with("[SYSTEM CALLED THE RELEVANT TOOL"));
        assert!(wrapped.ends_with("[USER QUERY:]\nwhat does it say?"));
    }
}
