use std::collections::HashSet;

use palaver_common::ToolCall;
use serde_json::Value;
use tracing::info;

/// Fallback extraction of tool calls from free-form assistant text.
///
/// Weak local models sometimes ignore the structured tool-call API and
/// print the call as raw JSON in their content, typically
/// `{"name": "...", "arguments": {...}}` (or `"parameters"`), often inside
/// a markdown fence. This scanner finds balanced-brace candidates with
/// string-state tracking, parses each strictly as JSON, and admits only
/// objects that name a tool in the active set. Anything that does not
/// fully parse is rejected.
pub fn salvage_tool_calls(content: &str, active_tools: &HashSet<String>) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let bytes = content.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        let Some(start) = find_byte(bytes, b'{', pos) else { break };
        match matching_brace(content, start) {
            Some(end) => {
                if let Some(call) = parse_candidate(&content[start..=end], active_tools) {
                    info!("salvaged tool call '{}' from assistant content", call.name);
                    calls.push(call);
                    pos = end + 1;
                } else {
                    // Not a tool call; skip past this opening brace and keep
                    // scanning (the object may contain a nested candidate).
                    pos = start + 1;
                }
            }
            None => {
                pos = start + 1;
            }
        }
    }

    calls
}

fn find_byte(haystack: &[u8], needle: u8, from: usize) -> Option<usize> {
    haystack[from..].iter().position(|&b| b == needle).map(|i| from + i)
}

/// Index of the `}` matching the `{` at `start`, honoring JSON string
/// literals and escapes.
fn matching_brace(content: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in content[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_candidate(candidate: &str, active_tools: &HashSet<String>) -> Option<ToolCall> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    let obj = value.as_object()?;

    let name = obj.get("name")?.as_str()?;
    if !active_tools.contains(name) {
        return None;
    }

    let arguments = obj
        .get("parameters")
        .or_else(|| obj.get("arguments"))?
        .as_object()?
        .clone();

    Some(ToolCall::new(name.to_string(), Value::Object(arguments)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn extracts_parameters_shape() {
        let calls = salvage_tool_calls(
            r#"{"name":"list_directory","parameters":{"path":"."}}"#,
            &active(&["list_directory"]),
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "list_directory");
        assert_eq!(calls[0].arguments["path"], ".");
        assert!(!calls[0].id.is_empty());
    }

    #[test]
    fn extracts_arguments_shape_inside_fence() {
        let content = "Sure, let me look:\n```json\n{\"name\": \"read_file\", \"arguments\": {\"path\": \"README.md\"}}\n```";
        let calls = salvage_tool_calls(content, &active(&["read_file"]));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["path"], "README.md");
    }

    #[test]
    fn rejects_unknown_tool_names() {
        let calls = salvage_tool_calls(
            r#"{"name":"rm_rf_slash","parameters":{}}"#,
            &active(&["read_file"]),
        );
        assert!(calls.is_empty());
    }

    #[test]
    fn rejects_missing_name_or_arguments() {
        let tools = active(&["read_file"]);
        assert!(salvage_tool_calls(r#"{"parameters":{"path":"x"}}"#, &tools).is_empty());
        assert!(salvage_tool_calls(r#"{"name":"read_file"}"#, &tools).is_empty());
        assert!(salvage_tool_calls(r#"{"name":"read_file","arguments":"not an object"}"#, &tools).is_empty());
    }

    #[test]
    fn rejects_unbalanced_or_invalid_json() {
        let tools = active(&["read_file"]);
        assert!(salvage_tool_calls(r#"{"name":"read_file","arguments":{"path":"x""#, &tools).is_empty());
        assert!(salvage_tool_calls(r#"{name: read_file}"#, &tools).is_empty());
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scanner() {
        let content = r#"{"name":"read_file","arguments":{"path":"weird{}name}.txt"}}"#;
        let calls = salvage_tool_calls(content, &active(&["read_file"]));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["path"], "weird{}name}.txt");
    }

    #[test]
    fn escaped_quotes_are_handled() {
        let content = r#"{"name":"read_file","arguments":{"path":"a\"b"}}"#;
        let calls = salvage_tool_calls(content, &active(&["read_file"]));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["path"], "a\"b");
    }

    #[test]
    fn multiple_calls_in_one_reply() {
        let content = concat!(
            "first: {\"name\":\"read_file\",\"arguments\":{\"path\":\"a\"}} ",
            "then {\"name\":\"list_directory\",\"arguments\":{\"path\":\".\"}}",
        );
        let calls = salvage_tool_calls(content, &active(&["read_file", "list_directory"]));
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[1].name, "list_directory");
    }

    #[test]
    fn plain_prose_with_braces_yields_nothing() {
        let calls = salvage_tool_calls(
            "In Rust, `struct Foo { bar: u8 }` defines a type.",
            &active(&["read_file"]),
        );
        assert!(calls.is_empty());
    }
}
