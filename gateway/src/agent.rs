//! Agent loop and tool-call execution protocol.

use std::collections::HashMap;

use chat_protocol::{ChatCompletionRequest, ChatCompletionResponse, Choice, Message, ToolCall, ToolDefinition};
use futures::future::join_all;
use gateway_mcp::{ToolRegistry, ToolSchema};
use serde_json::{json, Value};

use crate::{
    directory::{meta_tool_defs, namespaced, split_namespaced},
    error::GatewayError,
    upstream::{prepare, UpstreamClient},
};

const MAX_ITERATIONS_MESSAGE: &str = "Maximum iterations reached. Here's what I found so far:";

/// Request-scoped agent state: the schemas discovered via `get_tool_schema`
/// during this request, keyed by namespaced name.
/// This accumulates across loop iterations — it is *not* reset per turn —
/// since the discover/call pattern spans turns.
#[derive(Debug, Default)]
pub struct AgentState {
    pub discovered: HashMap<String, ToolSchema>,
}

enum Classification<'a> {
    Meta,
    Mcp { server: &'a str, tool: &'a str },
    PassThrough,
}

fn classify(call: &ToolCall) -> Classification<'_> {
    match call.function.name.as_str() {
        "get_tool_schema" => Classification::Meta,
        name if name.starts_with("mcp__") => match split_namespaced(name) {
            Some((server, tool)) => Classification::Mcp { server, tool },
            None => Classification::PassThrough,
        },
        _ => Classification::PassThrough,
    }
}

#[allow(clippy::too_many_arguments)]
pub struct AgentLoop<'a> {
    pub registry: &'a ToolRegistry,
    pub upstream: &'a UpstreamClient,
    pub max_iterations: u32,
    pub caller_tools: Vec<ToolDefinition>,
    pub fallbacks: &'a [String],
    pub keep_fallbacks: bool,
    pub model_override: Option<&'a str>,
}

impl<'a> AgentLoop<'a> {
    /// Runs the multi-turn loop to completion: parse upstream response,
    /// dispatch tool calls, append results, re-invoke upstream, until the
    /// upstream returns a terminal message or `max_iterations` is reached.
    pub async fn run(
        &self,
        base_model: &str,
        mut messages: Vec<Message>,
    ) -> Result<ChatCompletionResponse, GatewayError> {
        let mut state = AgentState::default();
        let mut iteration: u32 = 0;
        let send_model = self.model_override.unwrap_or(base_model);

        loop {
            if iteration >= self.max_iterations {
                return Ok(max_iterations_response(base_model));
            }

            let mut tools_for_call = meta_tool_defs();
            tools_for_call.extend(state.discovered.values().map(schema_to_tool_def));
            tools_for_call.extend(self.caller_tools.clone());

            let mut payload = ChatCompletionRequest {
                model: base_model.to_string(),
                messages: messages.clone(),
                tools: None,
                stream: None,
                stream_options: None,
                fallbacks: None,
                extra: Default::default(),
            };
            prepare(
                &mut payload,
                tools_for_call,
                self.fallbacks,
                self.keep_fallbacks,
                self.model_override,
            );

            let response = self.upstream.call(&payload, send_model).await?;

            let Some(choice) = response.choices.first() else {
                return Ok(response);
            };
            let assistant_message = choice.message.clone();

            let tool_calls = match &assistant_message.tool_calls {
                Some(calls) if !calls.is_empty() => calls.clone(),
                _ => return Ok(response),
            };

            let classifications: Vec<_> = tool_calls.iter().map(classify).collect();
            let any_dispatchable = classifications
                .iter()
                .any(|c| !matches!(c, Classification::PassThrough));
            let any_pass_through = classifications
                .iter()
                .any(|c| matches!(c, Classification::PassThrough));

            // If nothing in this turn is ours to dispatch — or if any call
            // in it belongs to the caller's own tool ecosystem — we hand
            // the whole reply back untouched. A turn is only auto-executed
            // when every call in it is ours; mixing would otherwise strand
            // a pass-through tool_call without a paired tool message
            // (only the all-pass-through case is unambiguous; this
            // generalizes it to any-pass-through for protocol safety).
            if !any_dispatchable || any_pass_through {
                return Ok(response);
            }

            let results = join_all(
                tool_calls
                    .iter()
                    .map(|call| self.execute_one(call, &mut state)),
            )
            .await;

            messages.push(assistant_message);
            for (call, result) in tool_calls.iter().zip(results) {
                messages.push(Message::tool_result(
                    call.id.clone(),
                    call.function.name.clone(),
                    serde_json::to_string(&result).unwrap_or_default(),
                ));
            }

            iteration += 1;
        }
    }

    async fn execute_one(&self, call: &ToolCall, state: &mut AgentState) -> Value {
        match classify(call) {
            Classification::Meta => self.execute_get_tool_schema(call, state).await,
            Classification::Mcp { server, tool } => {
                self.execute_mcp_call(call, server, tool, state).await
            }
            Classification::PassThrough => unreachable!("pass-through calls are never dispatched"),
        }
    }

    async fn execute_get_tool_schema(&self, call: &ToolCall, state: &mut AgentState) -> Value {
        let args: Value = match serde_json::from_str(&call.function.arguments) {
            Ok(v) => v,
            Err(e) => return malformed_arguments(&e),
        };
        let (Some(server), Some(tool)) = (
            args.get("server").and_then(Value::as_str),
            args.get("tool").and_then(Value::as_str),
        ) else {
            return json!({ "error": "Malformed tool arguments JSON", "details": { "expected": ["server", "tool"] } });
        };

        match self.registry.get_schema(server, tool).await {
            Ok(mut schema) => {
                schema.name = namespaced(server, tool);
                let value = json!({
                    "name": schema.name,
                    "description": schema.description,
                    "inputSchema": schema.input_schema,
                });
                state.discovered.insert(schema.name.clone(), schema);
                value
            }
            Err(e) => json!({ "error": e.to_string() }),
        }
    }

    async fn execute_mcp_call(
        &self,
        call: &ToolCall,
        server: &str,
        tool: &str,
        state: &mut AgentState,
    ) -> Value {
        let args: Value = match serde_json::from_str(&call.function.arguments) {
            Ok(v) => v,
            Err(e) => return malformed_arguments(&e),
        };

        let full_name = namespaced(server, tool);
        let known = self.registry.server_config(server).is_some() && state.discovered.contains_key(&full_name);
        if !known {
            return json!({
                "error": format!(
                    "Protocol Violation: Parameters for '{full_name}' are unknown. You MUST call 'get_tool_schema' first to discover them."
                )
            });
        }

        match self.registry.call_tool(server, tool, args).await {
            Ok(value) => value,
            Err(e) => json!({ "error": e.to_string() }),
        }
    }
}

fn malformed_arguments(e: &serde_json::Error) -> Value {
    json!({ "error": "Malformed tool arguments JSON", "details": { "parse_error": e.to_string() } })
}

fn schema_to_tool_def(schema: &ToolSchema) -> ToolDefinition {
    ToolDefinition::new(schema.name.clone(), schema.description.clone(), schema.input_schema.clone())
}

fn max_iterations_response(model: &str) -> ChatCompletionResponse {
    let message = Message {
        role: "assistant".to_string(),
        content: Some(Value::String(MAX_ITERATIONS_MESSAGE.to_string())),
        tool_calls: None,
        tool_call_id: None,
        name: None,
    };
    ChatCompletionResponse {
        id: None,
        object: None,
        created: None,
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason: Some("length".to_string()),
        }],
        usage: None,
        extra_fields: None,
        extra: Default::default(),
    }
}
