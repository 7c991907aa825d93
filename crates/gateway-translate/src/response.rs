//! Inbound response translation: chat-completion → native Messages
//!
//! Maps one buffered chat-completion response to one native message:
//! a text block plus one tool_use block per tool call, with arguments
//! JSON-parsed from the call's argument string. The upstream body is
//! decoded into typed records up front; anything that does not fit the
//! schema is a `MalformedUpstream` error. Usage counters are copied
//! from the upstream response or, when absent, estimated by
//! whitespace-token counting as a last resort.

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct UpstreamResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    choices: Vec<UpstreamChoice>,
    usage: Option<UpstreamUsage>,
}

#[derive(Debug, Deserialize)]
struct UpstreamChoice {
    message: UpstreamMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<UpstreamToolCall>,
}

#[derive(Debug, Deserialize)]
struct UpstreamToolCall {
    #[serde(default)]
    id: String,
    function: UpstreamFunction,
}

#[derive(Debug, Deserialize)]
struct UpstreamFunction {
    #[serde(default)]
    name: String,
    #[serde(default = "empty_arguments")]
    arguments: String,
}

fn empty_arguments() -> String {
    "{}".to_string()
}

#[derive(Debug, Deserialize)]
struct UpstreamUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Map an upstream `finish_reason` to the native stop-reason enumeration.
pub fn map_finish_reason(finish_reason: Option<&str>) -> &'static str {
    match finish_reason {
        Some("tool_calls") => "tool_use",
        Some("stop") => "end_turn",
        Some("length") => "max_tokens",
        _ => "end_turn",
    }
}

/// Crude token count used only when upstream omits usage entirely.
pub fn estimate_tokens(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// Rewrite a buffered chat-completion response into a native message.
///
/// `request_model` is echoed back as the native `model` field so the
/// caller sees the name it asked for, not the translated upstream name.
pub fn translate_response(upstream: &Value, request_model: &str) -> Result<Value> {
    let decoded = UpstreamResponse::deserialize(upstream)
        .map_err(|e| Error::MalformedUpstream(e.to_string()))?;
    let choice = decoded
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::MalformedUpstream("response has no choices".into()))?;

    let mut content = Vec::new();
    let text = choice.message.content.unwrap_or_default();
    if !text.is_empty() {
        content.push(json!({"type": "text", "text": text}));
    }

    for call in choice.message.tool_calls {
        let input: Value = serde_json::from_str(&call.function.arguments).unwrap_or_else(|e| {
            warn!(error = %e, "tool call arguments are not valid JSON, passing raw");
            json!({"_raw": call.function.arguments})
        });
        content.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.function.name,
            "input": input,
        }));
    }

    let stop_reason = map_finish_reason(choice.finish_reason.as_deref());

    let (input_tokens, output_tokens) = match decoded.usage {
        Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
        None => (0, estimate_tokens(&text)),
    };

    Ok(json!({
        "id": decoded.id,
        "type": "message",
        "role": "assistant",
        "model": request_model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
        },
    }))
}
