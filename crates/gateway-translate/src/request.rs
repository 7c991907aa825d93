//! Outbound request translation: native Messages → chat-completion
//!
//! Flattens the native shape into the chat-completion schema:
//! - top-level `system` entries become leading system-role messages
//! - assistant `tool_use` blocks become `tool_calls` descriptors
//! - user `tool_result` blocks become tool-role messages keyed by call id
//! - tool input schemas are sanitized (`format: "uri"` stripped
//!   recursively — the upstream validator rejects it)
//!
//! Content blocks are decoded through a tagged union, one match arm
//! per kind. Kinds with no chat-completion equivalent are carried
//! through as serialized JSON so no turn is ever dropped.
//!
//! Model selection switches between a reasoning and a completion model
//! based on the request's thinking flag; a per-model token-limit
//! override may replace the caller-supplied `max_tokens`.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{Error, Result};

/// One native content block, decoded by its `type` tag.
///
/// Kinds the chat-completion schema cannot express land in `Other`,
/// which captures the block verbatim for opaque carry-through.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        content: Value,
    },
    #[serde(untagged)]
    Other(Value),
}

/// Target models and token-limit overrides for translation mode.
#[derive(Debug, Clone)]
pub struct TranslationConfig {
    /// Model used when the request carries a thinking/reasoning flag.
    pub reasoning_model: String,
    /// Model used for plain completion requests.
    pub completion_model: String,
    /// Optional replacement for the caller's `max_tokens`, keyed by
    /// target model name.
    pub max_tokens_overrides: HashMap<String, u64>,
}

/// Rewrite a native request body into chat-completion form.
pub fn translate_request(native: &Value, config: &TranslationConfig) -> Result<Value> {
    let mut messages = Vec::new();

    match native.get("system") {
        Some(Value::String(text)) => {
            messages.push(json!({"role": "system", "content": text}));
        }
        Some(Value::Array(blocks)) => {
            for block in blocks {
                let content = match ContentBlock::deserialize(block) {
                    Ok(ContentBlock::Text { text }) => text,
                    Ok(ContentBlock::Other(Value::String(text))) => text,
                    _ => block.to_string(),
                };
                messages.push(json!({"role": "system", "content": content}));
            }
        }
        _ => {}
    }

    let native_messages = native
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::MalformedRequest("missing messages array".into()))?;
    for message in native_messages {
        translate_message(message, &mut messages)?;
    }

    let wants_thinking = native
        .get("thinking")
        .is_some_and(|t| !t.is_null() && t.get("type").and_then(Value::as_str) != Some("disabled"));
    let model = if wants_thinking {
        &config.reasoning_model
    } else {
        &config.completion_model
    };

    let max_tokens = config
        .max_tokens_overrides
        .get(model)
        .copied()
        .or_else(|| native.get("max_tokens").and_then(Value::as_u64));

    let mut out = json!({
        "model": model,
        "messages": messages,
    });
    if let Some(limit) = max_tokens {
        out["max_tokens"] = json!(limit);
    }
    if let Some(tools) = native.get("tools").and_then(Value::as_array) {
        let translated: Vec<Value> = tools.iter().map(translate_tool).collect();
        out["tools"] = Value::Array(translated);
    }
    for field in ["temperature", "top_p", "stop_sequences"] {
        if let Some(value) = native.get(field) {
            let target = if field == "stop_sequences" { "stop" } else { field };
            out[target] = value.clone();
        }
    }
    if native.get("stream").and_then(Value::as_bool) == Some(true) {
        out["stream"] = json!(true);
        // Ask for the usage tail chunk so metering doesn't have to
        // fall back to estimation
        out["stream_options"] = json!({"include_usage": true});
    }

    debug!(model = %model, messages = messages_len(&out), "translated outbound request");
    Ok(out)
}

fn messages_len(body: &Value) -> usize {
    body.get("messages").and_then(Value::as_array).map_or(0, Vec::len)
}

/// Translate one native message, appending one or more chat-completion
/// messages.
///
/// A native assistant turn with tool_use blocks yields a single
/// assistant message carrying `tool_calls`; a user turn with
/// tool_result blocks yields one tool-role message per result.
fn translate_message(message: &Value, out: &mut Vec<Value>) -> Result<()> {
    let role = message
        .get("role")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MalformedRequest("message missing role".into()))?;

    let content = match message.get("content") {
        Some(Value::String(text)) => {
            out.push(json!({"role": role, "content": text}));
            return Ok(());
        }
        Some(Value::Array(blocks)) => blocks,
        _ => return Err(Error::MalformedRequest("message missing content".into())),
    };

    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls = Vec::new();
    let mut tool_results = Vec::new();

    for raw in content {
        let block = ContentBlock::deserialize(raw)
            .map_err(|e| Error::MalformedRequest(format!("undecodable content block: {e}")))?;
        match block {
            ContentBlock::Text { text } => {
                if !text.is_empty() {
                    text_parts.push(text);
                }
            }
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": serde_json::to_string(&input)?,
                    }
                }));
            }
            ContentBlock::ToolResult { tool_use_id, content } => {
                tool_results.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": stringify_result_content(&content),
                }));
            }
            // No chat-completion equivalent: carry the block through
            // verbatim so the turn survives with its content intact.
            ContentBlock::Other(value) => text_parts.push(value.to_string()),
        }
    }

    if !text_parts.is_empty() || !tool_calls.is_empty() {
        let mut msg = json!({"role": role, "content": text_parts.join("\n")});
        if !tool_calls.is_empty() {
            msg["tool_calls"] = Value::Array(tool_calls);
        }
        out.push(msg);
    }
    out.extend(tool_results);
    Ok(())
}

/// Flatten a tool_result's content (string or block list) to plain text.
fn stringify_result_content(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| match ContentBlock::deserialize(b) {
                Ok(ContentBlock::Text { text }) => Some(text),
                Ok(ContentBlock::Other(Value::String(text))) => Some(text),
                Ok(ContentBlock::Other(other)) => Some(other.to_string()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Map a native tool definition to a chat-completion function tool.
fn translate_tool(tool: &Value) -> Value {
    let mut parameters = tool
        .get("input_schema")
        .cloned()
        .unwrap_or_else(|| json!({"type": "object"}));
    sanitize_schema(&mut parameters);
    json!({
        "type": "function",
        "function": {
            "name": tool.get("name").cloned().unwrap_or_default(),
            "description": tool.get("description").cloned().unwrap_or_default(),
            "parameters": parameters,
        }
    })
}

/// Strip `format: "uri"` constraints from a JSON-schema tree in place.
fn sanitize_schema(schema: &mut Value) {
    match schema {
        Value::Object(map) => {
            if map.get("format").and_then(Value::as_str) == Some("uri") {
                map.remove("format");
            }
            for value in map.values_mut() {
                sanitize_schema(value);
            }
        }
        Value::Array(items) => {
            for item in items {
                sanitize_schema(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TranslationConfig {
        TranslationConfig {
            reasoning_model: "upstream-reasoner".into(),
            completion_model: "upstream-chat".into(),
            max_tokens_overrides: HashMap::new(),
        }
    }

    #[test]
    fn system_string_becomes_leading_system_message() {
        let native = json!({
            "model": "native-model",
            "system": "You are terse.",
            "messages": [{"role": "user", "content": "hi"}],
        });
        let out = translate_request(&native, &config()).unwrap();
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages[0], json!({"role": "system", "content": "You are terse."}));
        assert_eq!(messages[1], json!({"role": "user", "content": "hi"}));
    }

    #[test]
    fn system_block_list_becomes_multiple_system_messages() {
        let native = json!({
            "system": [
                {"type": "text", "text": "one"},
                {"type": "text", "text": "two"},
            ],
            "messages": [{"role": "user", "content": "hi"}],
        });
        let out = translate_request(&native, &config()).unwrap();
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages[0]["content"], "one");
        assert_eq!(messages[1]["content"], "two");
        assert_eq!(messages[2]["role"], "user");
    }

    #[test]
    fn thinking_flag_selects_reasoning_model() {
        let base = json!({"messages": [{"role": "user", "content": "hi"}]});
        let out = translate_request(&base, &config()).unwrap();
        assert_eq!(out["model"], "upstream-chat");

        let mut thinking = base.clone();
        thinking["thinking"] = json!({"type": "enabled", "budget_tokens": 2048});
        let out = translate_request(&thinking, &config()).unwrap();
        assert_eq!(out["model"], "upstream-reasoner");

        let mut disabled = base;
        disabled["thinking"] = json!({"type": "disabled"});
        let out = translate_request(&disabled, &config()).unwrap();
        assert_eq!(out["model"], "upstream-chat");
    }

    #[test]
    fn max_tokens_override_replaces_caller_limit() {
        let native = json!({
            "max_tokens": 1024,
            "messages": [{"role": "user", "content": "hi"}],
        });

        let mut cfg = config();
        let out = translate_request(&native, &cfg).unwrap();
        assert_eq!(out["max_tokens"], 1024);

        cfg.max_tokens_overrides.insert("upstream-chat".into(), 8192);
        let out = translate_request(&native, &cfg).unwrap();
        assert_eq!(out["max_tokens"], 8192);
    }

    #[test]
    fn tool_use_block_becomes_tool_call_descriptor() {
        let native = json!({
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "checking"},
                    {"type": "tool_use", "id": "call_1", "name": "get_weather",
                     "input": {"city": "Berlin"}},
                ]},
            ],
        });
        let out = translate_request(&native, &config()).unwrap();
        let assistant = &out["messages"][1];
        assert_eq!(assistant["role"], "assistant");
        assert_eq!(assistant["content"], "checking");
        let call = &assistant["tool_calls"][0];
        assert_eq!(call["id"], "call_1");
        assert_eq!(call["function"]["name"], "get_weather");
        let args: Value =
            serde_json::from_str(call["function"]["arguments"].as_str().unwrap()).unwrap();
        assert_eq!(args, json!({"city": "Berlin"}));
    }

    #[test]
    fn tool_result_block_becomes_tool_role_message() {
        let native = json!({
            "messages": [
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "call_1",
                     "content": [{"type": "text", "text": "12°C"}]},
                ]},
            ],
        });
        let out = translate_request(&native, &config()).unwrap();
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "tool");
        assert_eq!(messages[0]["tool_call_id"], "call_1");
        assert_eq!(messages[0]["content"], "12°C");
    }

    #[test]
    fn unknown_block_kind_is_preserved_opaquely() {
        let native = json!({
            "messages": [
                {"role": "user", "content": [
                    {"type": "image", "source": {"type": "base64",
                     "media_type": "image/png", "data": "iVBORw0KGgo"}},
                ]},
            ],
        });
        let out = translate_request(&native, &config()).unwrap();
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(
            messages.len(),
            1,
            "a turn of unrecognized blocks must still yield a message"
        );
        assert_eq!(messages[0]["role"], "user");

        // The block rides along verbatim as serialized JSON
        let content = messages[0]["content"].as_str().unwrap();
        let embedded: Value = serde_json::from_str(content).unwrap();
        assert_eq!(embedded["type"], "image");
        assert_eq!(embedded["source"]["data"], "iVBORw0KGgo");
    }

    #[test]
    fn unknown_block_rides_alongside_text() {
        let native = json!({
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "see attached"},
                    {"type": "document", "title": "q3.pdf"},
                ]},
            ],
        });
        let out = translate_request(&native, &config()).unwrap();
        let content = out["messages"][0]["content"].as_str().unwrap();
        assert!(content.starts_with("see attached\n"));
        assert!(content.contains("\"title\":\"q3.pdf\""));
    }

    #[test]
    fn tool_schema_format_uri_is_stripped_recursively() {
        let native = json!({
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{
                "name": "fetch",
                "description": "fetch a page",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "url": {"type": "string", "format": "uri"},
                        "links": {
                            "type": "array",
                            "items": {"type": "string", "format": "uri"},
                        },
                        "date": {"type": "string", "format": "date-time"},
                    },
                },
            }],
        });
        let out = translate_request(&native, &config()).unwrap();
        let params = &out["tools"][0]["function"]["parameters"];
        assert_eq!(params["properties"]["url"], json!({"type": "string"}));
        assert_eq!(params["properties"]["links"]["items"], json!({"type": "string"}));
        // Other formats are untouched
        assert_eq!(params["properties"]["date"]["format"], "date-time");
    }

    #[test]
    fn stream_flag_requests_usage_chunk() {
        let native = json!({
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}],
        });
        let out = translate_request(&native, &config()).unwrap();
        assert_eq!(out["stream"], true);
        assert_eq!(out["stream_options"]["include_usage"], true);
    }

    #[test]
    fn sampling_fields_are_carried_over() {
        let native = json!({
            "temperature": 0.2,
            "top_p": 0.9,
            "stop_sequences": ["END"],
            "messages": [{"role": "user", "content": "hi"}],
        });
        let out = translate_request(&native, &config()).unwrap();
        assert_eq!(out["temperature"], 0.2);
        assert_eq!(out["top_p"], 0.9);
        assert_eq!(out["stop"], json!(["END"]));
    }

    #[test]
    fn missing_messages_is_an_error() {
        let native = json!({"system": "hi"});
        assert!(matches!(
            translate_request(&native, &config()),
            Err(Error::MalformedRequest(_))
        ));
    }
}
