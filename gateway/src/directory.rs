//! Directory injector: the system message enumerating
//! `mcp__<server>__<tool>` names and the discover-then-call protocol, plus
//! the `get_tool_schema` meta-tool definition.
//!
//! `clojure-eval`, the second meta-tool of the upstream protocol, is a
//! host-language evaluation escape hatch. Per the design notes ("Runtime
//! evaluation tool"), a systems-language rewrite should omit it, gate it
//! behind an opt-in flag, or sandbox it; this implementation omits it
//! entirely rather than expose arbitrary code execution over the network
//! (see DESIGN.md).

use chat_protocol::{Message, ToolDefinition};
use serde_json::json;

pub fn namespaced(server: &str, tool: &str) -> String {
    format!("mcp__{server}__{tool}")
}

/// Split `mcp__<server>__<tool>` on the *last* `__`.
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix("mcp__")?;
    let idx = rest.rfind("__")?;
    Some((&rest[..idx], &rest[idx + 2..]))
}

pub fn meta_tool_defs() -> Vec<ToolDefinition> {
    vec![ToolDefinition::new(
        "get_tool_schema",
        "Discover the JSON-Schema parameters of a namespaced mcp__ tool before calling it.",
        json!({
            "type": "object",
            "properties": {
                "server": { "type": "string", "description": "The MCP server id, e.g. \"stripe\"." },
                "tool": { "type": "string", "description": "The tool name on that server." }
            },
            "required": ["server", "tool"]
        }),
    )]
}

/// Builds the directory system message listing each configured server's
/// (already allow-list-filtered) tool names. Returns `None` when no
/// servers are configured (injection is skipped entirely).
pub fn build_directory_message(servers: &[(String, Vec<String>)]) -> Option<Message> {
    if servers.is_empty() {
        return None;
    }

    let mut directory_lines = Vec::with_capacity(servers.len());
    for (server, tools) in servers {
        directory_lines.push(format!("- mcp__{server}: {}", tools.join(", ")));
    }

    let text = format!(
        "## Remote Capabilities (Injected)\nYou have access to namespaced tools (prefix: mcp__).\n\n### Remote Directory:\n{}\n\n### CALL PROTOCOL:\n1. IDENTIFY tool in the directory above.\n2. DISCOVER: Call get_tool_schema(server, tool) to get parameters.\n3. EXECUTE: Call mcp__<server>__<tool>(...) with the discovered parameters.\n\nDO NOT guess parameters for mcp__ tools. You MUST discover them first via get_tool_schema.",
        directory_lines.join("\n")
    );

    Some(Message::system(text))
}

/// Prepends the directory message to `messages` without touching any
/// existing system messages ("placed at the head of the
/// sequence").
pub fn inject(messages: &mut Vec<Message>, servers: &[(String, Vec<String>)]) {
    if let Some(directory) = build_directory_message(servers) {
        messages.insert(0, directory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_servers_skips_injection() {
        assert!(build_directory_message(&[]).is_none());
    }

    #[test]
    fn message_contains_call_protocol_and_tool_list() {
        let servers = vec![("stripe".to_string(), vec!["retrieve_customer".to_string(), "refund".to_string()])];
        let msg = build_directory_message(&servers).unwrap();
        let text = msg.content_text();
        assert!(text.contains("- mcp__stripe: retrieve_customer, refund"));
        assert!(text.contains("### CALL PROTOCOL:"));
        assert!(text.contains("get_tool_schema"));
    }

    #[test]
    fn inject_places_directory_first_without_removing_existing_system_messages() {
        let mut messages = vec![Message::system("existing system prompt")];
        inject(&mut messages, &[("s".to_string(), vec!["t".to_string()])]);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content_text().contains("Remote Capabilities"));
        assert_eq!(messages[1].content_text(), "existing system prompt");
    }

    #[test]
    fn split_namespaced_splits_on_last_double_underscore() {
        assert_eq!(
            split_namespaced("mcp__my_server__do__thing"),
            Some(("my_server__do", "thing"))
        );
        assert_eq!(split_namespaced("mcp__s__t"), Some(("s", "t")));
        assert_eq!(split_namespaced("not_mcp__s__t"), None);
    }

    #[test]
    fn meta_tools_expose_get_tool_schema_with_server_and_tool_params() {
        let tools = meta_tool_defs();
        let get_schema = tools.iter().find(|t| t.function.name == "get_tool_schema").unwrap();
        let props = get_schema.function.parameters["properties"].as_object().unwrap();
        assert!(props.contains_key("server"));
        assert!(props.contains_key("tool"));
    }
}
