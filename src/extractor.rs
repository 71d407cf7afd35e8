//! Best-effort recovery of tool calls from plain-text model output.
//!
//! Some backends — or weaker models behind an otherwise tool-capable one —
//! emit tool invocations as inline markup rather than the native
//! `tool_calls` field. [`extract_tool_calls`] recognizes the handful of
//! shapes models commonly fall back to and turns them into real
//! [`ToolUseBlock`] values the agent loop can dispatch like any other.

use crate::types::ToolUseBlock;
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

struct Pattern {
    regex: &'static str,
    /// Index of the capture group holding the tool name.
    name_group: usize,
    /// Index of the capture group holding the raw argument text.
    args_group: usize,
}

const PATTERNS: &[Pattern] = &[
    Pattern {
        regex: r#"(?s)<invoke\s+name="([^"]+)">(.*?)</invoke>"#,
        name_group: 1,
        args_group: 2,
    },
    Pattern {
        regex: r#"(?s)<use_tool\s+name="([^"]+)">(.*?)</use_tool>"#,
        name_group: 1,
        args_group: 2,
    },
    Pattern {
        regex: r#"(?s)<tool_call\s+name="([^"]+)">(.*?)</tool_call>"#,
        name_group: 1,
        args_group: 2,
    },
    Pattern {
        regex: r#"(?s)<execute\s+name="([^"]+)">(.*?)</execute>"#,
        name_group: 1,
        args_group: 2,
    },
];

/// `<function>{"name":"X","arguments":ARGS}</function>` carries both name
/// and arguments inside one JSON body rather than name-as-attribute, so it's
/// handled separately from [`PATTERNS`].
const FUNCTION_TAG_REGEX: &str = r#"(?s)<function>\s*(\{.*?\})\s*</function>"#;

fn compiled_patterns() -> &'static Vec<Regex> {
    static CELL: OnceLock<Vec<Regex>> = OnceLock::new();
    CELL.get_or_init(|| {
        PATTERNS
            .iter()
            .map(|p| Regex::new(p.regex).expect("extractor pattern is valid regex"))
            .collect()
    })
}

fn function_tag_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| Regex::new(FUNCTION_TAG_REGEX).expect("function tag pattern is valid regex"))
}

fn fenced_block_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| {
        Regex::new(r"(?s)```(?:tool|xml|function)\s*\n.*?```").expect("fence pattern is valid regex")
    })
}

/// Removes fenced code blocks labelled `tool`, `xml`, or `function`, since
/// models sometimes wrap the markup a pattern below would otherwise match
/// inside an explanatory code fence rather than as a live invocation.
fn strip_fenced_blocks(text: &str) -> String {
    fenced_block_regex().replace_all(text, "").into_owned()
}

/// Parses `raw` as JSON; on failure, falls back to whitespace-separated
/// `k=v` pairs (values taken literally, unquoted).
fn parse_args(raw: &str) -> serde_json::Value {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return value;
    }

    let mut map = serde_json::Map::new();
    for pair in trimmed.split_whitespace() {
        if let Some((key, value)) = pair.split_once('=') {
            map.insert(
                key.to_string(),
                serde_json::Value::String(value.trim_matches('"').to_string()),
            );
        }
    }
    serde_json::Value::Object(map)
}

/// Synthesizes a stable-looking id distinct across calls within one
/// extraction pass. `seq` is the call's position in extraction order, since
/// `extract_tool_calls` has no wall-clock access available to it.
fn synthesize_id(name: &str, seq: usize) -> String {
    format!("call_{name}_{seq}")
}

/// Scans `text` for markup-shaped tool invocations, keeping only names that
/// appear in `known_tool_names`, and deduplicating repeated (name,
/// arguments) pairs.
///
/// Returns calls in the order they appear in `text`.
pub fn extract_tool_calls(text: &str, known_tool_names: &HashSet<String>) -> Vec<ToolUseBlock> {
    let cleaned = strip_fenced_blocks(text);
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut seq = 0usize;

    for (pattern, regex) in PATTERNS.iter().zip(compiled_patterns()) {
        for captures in regex.captures_iter(&cleaned) {
            let name = captures
                .get(pattern.name_group)
                .map(|m| m.as_str())
                .unwrap_or_default();
            if !known_tool_names.contains(name) {
                continue;
            }
            let raw_args = captures
                .get(pattern.args_group)
                .map(|m| m.as_str())
                .unwrap_or_default();
            let args = parse_args(raw_args);
            push_unique(&mut out, &mut seen, &mut seq, name, args);
        }
    }

    for captures in function_tag_regex().captures_iter(&cleaned) {
        let Some(body) = captures.get(1) else { continue };
        let Ok(parsed) = serde_json::from_str::<serde_json::Value>(body.as_str()) else {
            continue;
        };
        let Some(name) = parsed.get("name").and_then(|v| v.as_str()) else {
            continue;
        };
        if !known_tool_names.contains(name) {
            continue;
        }
        let args = parsed.get("arguments").cloned().unwrap_or(serde_json::json!({}));
        push_unique(&mut out, &mut seen, &mut seq, name, args);
    }

    out
}

fn push_unique(
    out: &mut Vec<ToolUseBlock>,
    seen: &mut HashSet<(String, Vec<u8>)>,
    seq: &mut usize,
    name: &str,
    args: serde_json::Value,
) {
    let arg_bytes = serde_json::to_vec(&args).unwrap_or_default();
    let key = (name.to_string(), arg_bytes);
    if !seen.insert(key) {
        return;
    }
    let id = synthesize_id(name, *seq);
    *seq += 1;
    out.push(ToolUseBlock::new(id, name.to_string(), args));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_extract_invoke_tag_with_json_args() {
        let text = r#"Let me check that. <invoke name="read_file">{"path": "a.txt"}</invoke>"#;
        let calls = extract_tool_calls(text, &known(&["read_file"]));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].input["path"], "a.txt");
    }

    #[test]
    fn test_extract_use_tool_tag_with_kv_args() {
        let text = r#"<use_tool name="grep">pattern=foo path=src</use_tool>"#;
        let calls = extract_tool_calls(text, &known(&["grep"]));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].input["pattern"], "foo");
        assert_eq!(calls[0].input["path"], "src");
    }

    #[test]
    fn test_extract_function_tag() {
        let text = r#"<function>{"name":"bash","arguments":{"command":"ls"}}</function>"#;
        let calls = extract_tool_calls(text, &known(&["bash"]));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "bash");
        assert_eq!(calls[0].input["command"], "ls");
    }

    #[test]
    fn test_unknown_tool_name_is_filtered() {
        let text = r#"<invoke name="delete_everything">{}</invoke>"#;
        let calls = extract_tool_calls(text, &known(&["read_file"]));
        assert!(calls.is_empty());
    }

    #[test]
    fn test_fenced_code_block_is_not_extracted() {
        let text = "```xml\n<invoke name=\"bash\">{\"command\":\"ls\"}</invoke>\n```";
        let calls = extract_tool_calls(text, &known(&["bash"]));
        assert!(calls.is_empty());
    }

    #[test]
    fn test_duplicate_calls_are_deduplicated() {
        let text = r#"<invoke name="read_file">{"path":"a.txt"}</invoke>
        <invoke name="read_file">{"path":"a.txt"}</invoke>"#;
        let calls = extract_tool_calls(text, &known(&["read_file"]));
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn test_distinct_arguments_are_not_deduplicated() {
        let text = r#"<invoke name="read_file">{"path":"a.txt"}</invoke>
        <invoke name="read_file">{"path":"b.txt"}</invoke>"#;
        let calls = extract_tool_calls(text, &known(&["read_file"]));
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn test_invalid_json_args_falls_back_to_kv_parsing() {
        let text = r#"<tool_call name="grep">pattern=TODO</tool_call>"#;
        let calls = extract_tool_calls(text, &known(&["grep"]));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].input["pattern"], "TODO");
    }
}
