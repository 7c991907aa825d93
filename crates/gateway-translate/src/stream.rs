//! Streaming response translation: chat-completion deltas → native
//! event frames
//!
//! A `StreamTranslator` consumes the upstream byte stream (via the
//! incremental frame parser) and emits native protocol frames in order:
//! `message_start` + `ping` on the first chunk, `content_block_start` /
//! `content_block_delta` / `content_block_stop` per content block, then
//! `message_delta` (stop reason + output tokens) and `message_stop`.
//!
//! One block is open at a time. Tool-call argument fragments are
//! deduplicated against the accumulated argument string: some upstreams
//! resend the full argument prefix on every delta, so only the new
//! suffix is forwarded as `input_json_delta`.
//!
//! Frames that fail to parse are skipped with a warning; the stream
//! continues. If the upstream ends without a finish chunk, `finish`
//! closes the message with whatever state is known so the client never
//! hangs on a half-open stream.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use crate::response::{estimate_tokens, map_finish_reason};
use crate::sse::{Frame, FrameParser};

/// One upstream delta frame, decoded before translation. Every field
/// is optional: the usage tail chunk has no choices, later tool-call
/// deltas carry only argument fragments.
#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: u64,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

/// Currently open native content block.
enum OpenBlock {
    Text { index: usize },
    Tool { upstream_index: u64, index: usize },
}

/// Per-tool-call argument accumulation across deltas.
#[derive(Default)]
struct ToolArgs {
    accumulated: String,
}

/// Stateful chat-completion → native stream rewriter.
pub struct StreamTranslator {
    parser: FrameParser,
    request_model: String,
    started: bool,
    finished: bool,
    open: Option<OpenBlock>,
    next_index: usize,
    tool_args: HashMap<u64, ToolArgs>,
    text_accum: String,
    message_id: String,
    input_tokens: u64,
    output_tokens: Option<u64>,
    stop_reason: Option<&'static str>,
}

impl StreamTranslator {
    /// `request_model` is echoed in `message_start` so the client sees
    /// the model name it asked for.
    pub fn new(request_model: impl Into<String>) -> Self {
        Self {
            parser: FrameParser::new(),
            request_model: request_model.into(),
            started: false,
            finished: false,
            open: None,
            next_index: 0,
            tool_args: HashMap::new(),
            text_accum: String::new(),
            message_id: String::new(),
            input_tokens: 0,
            output_tokens: None,
            stop_reason: None,
        }
    }

    /// Feed one chunk of upstream bytes; returns rendered native frames.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        for frame in self.parser.feed(chunk) {
            match frame {
                Frame::Data(payload) => match serde_json::from_str::<ChatChunk>(&payload) {
                    Ok(parsed) => out.extend(self.handle_chunk(&parsed)),
                    Err(e) => {
                        warn!(error = %e, "skipping unparseable stream frame");
                    }
                },
                Frame::Done => out.extend(self.finish()),
            }
        }
        out
    }

    /// Close the message: stop any open block, emit `message_delta`
    /// and `message_stop`. Idempotent; also called when the upstream
    /// body ends without a `[DONE]` sentinel.
    pub fn finish(&mut self) -> Vec<String> {
        if self.finished || !self.started {
            self.finished = true;
            return Vec::new();
        }
        self.finished = true;

        let mut out = Vec::new();
        self.close_open_block(&mut out);

        let stop_reason = self.stop_reason.unwrap_or("end_turn");
        let output_tokens = self
            .output_tokens
            .unwrap_or_else(|| estimate_tokens(&self.text_accum));
        out.push(render(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": {"output_tokens": output_tokens},
            }),
        ));
        out.push(render("message_stop", &json!({"type": "message_stop"})));
        out
    }

    /// Total output tokens (reported or estimated); for metering.
    pub fn output_tokens(&self) -> u64 {
        self.output_tokens
            .unwrap_or_else(|| estimate_tokens(&self.text_accum))
    }

    /// Input tokens from the usage tail chunk, if one arrived.
    pub fn input_tokens(&self) -> u64 {
        self.input_tokens
    }

    /// Number of tool calls observed so far.
    pub fn tool_call_count(&self) -> u64 {
        self.tool_args.len() as u64
    }

    /// Text accumulated from deltas so far.
    pub fn accumulated_text(&self) -> &str {
        &self.text_accum
    }

    fn handle_chunk(&mut self, chunk: &ChatChunk) -> Vec<String> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }

        if !self.started {
            self.started = true;
            self.message_id = chunk.id.clone().unwrap_or_else(|| "msg_stream".to_string());
            out.push(render(
                "message_start",
                &json!({
                    "type": "message_start",
                    "message": {
                        "id": self.message_id.clone(),
                        "type": "message",
                        "role": "assistant",
                        "model": self.request_model.clone(),
                        "content": [],
                        "stop_reason": null,
                        "stop_sequence": null,
                        "usage": {"input_tokens": 0, "output_tokens": 0},
                    },
                }),
            ));
            out.push(render("ping", &json!({"type": "ping"})));
        }

        // Usage tail chunk (choices may be empty)
        if let Some(usage) = &chunk.usage {
            if let Some(n) = usage.prompt_tokens {
                self.input_tokens = n;
            }
            if let Some(n) = usage.completion_tokens {
                self.output_tokens = Some(n);
            }
        }

        let Some(choice) = chunk.choices.first() else {
            return out;
        };

        if let Some(delta) = &choice.delta {
            if let Some(text) = delta.content.as_deref()
                && !text.is_empty()
            {
                self.emit_text_delta(text, &mut out);
            }
            for call in &delta.tool_calls {
                self.emit_tool_delta(call, &mut out);
            }
        }

        if let Some(reason) = choice.finish_reason.as_deref() {
            self.stop_reason = Some(map_finish_reason(Some(reason)));
        }
        out
    }

    fn emit_text_delta(&mut self, text: &str, out: &mut Vec<String>) {
        if !matches!(self.open, Some(OpenBlock::Text { .. })) {
            self.close_open_block(out);
            let index = self.next_index;
            self.next_index += 1;
            self.open = Some(OpenBlock::Text { index });
            out.push(render(
                "content_block_start",
                &json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": {"type": "text", "text": ""},
                }),
            ));
        }
        let Some(OpenBlock::Text { index }) = &self.open else {
            return;
        };
        self.text_accum.push_str(text);
        out.push(render(
            "content_block_delta",
            &json!({
                "type": "content_block_delta",
                "index": index,
                "delta": {"type": "text_delta", "text": text},
            }),
        ));
    }

    fn emit_tool_delta(&mut self, call: &ToolCallDelta, out: &mut Vec<String>) {
        let upstream_index = call.index;

        let is_open = matches!(
            self.open,
            Some(OpenBlock::Tool { upstream_index: open_idx, .. }) if open_idx == upstream_index
        );
        if !is_open {
            self.close_open_block(out);
            let index = self.next_index;
            self.next_index += 1;
            self.open = Some(OpenBlock::Tool {
                upstream_index,
                index,
            });
            self.tool_args.entry(upstream_index).or_default();
            let id = call
                .id
                .clone()
                .unwrap_or_else(|| format!("toolu_{upstream_index}"));
            let name = call
                .function
                .as_ref()
                .and_then(|f| f.name.as_deref())
                .unwrap_or("");
            out.push(render(
                "content_block_start",
                &json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": {
                        "type": "tool_use",
                        "id": id,
                        "name": name,
                        "input": {},
                    },
                }),
            ));
        }

        let Some(fragment) = call.function.as_ref().and_then(|f| f.arguments.as_deref())
        else {
            return;
        };
        if fragment.is_empty() {
            return;
        }

        let Some(OpenBlock::Tool { index, .. }) = &self.open else {
            return;
        };
        let index = *index;
        let args = self.tool_args.entry(upstream_index).or_default();

        // Some upstreams resend the full accumulated argument string on
        // every delta; forward only the unseen suffix.
        let new_text = if fragment.starts_with(&args.accumulated) && !args.accumulated.is_empty() {
            let suffix = fragment[args.accumulated.len()..].to_string();
            args.accumulated = fragment.to_string();
            suffix
        } else {
            args.accumulated.push_str(fragment);
            fragment.to_string()
        };
        if new_text.is_empty() {
            return;
        }

        out.push(render(
            "content_block_delta",
            &json!({
                "type": "content_block_delta",
                "index": index,
                "delta": {"type": "input_json_delta", "partial_json": new_text},
            }),
        ));
    }

    fn close_open_block(&mut self, out: &mut Vec<String>) {
        let index = match self.open.take() {
            Some(OpenBlock::Text { index }) => index,
            Some(OpenBlock::Tool { index, .. }) => index,
            None => return,
        };
        out.push(render(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": index}),
        ));
    }
}

/// Render one native protocol frame.
fn render(event: &str, data: &Value) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(json: &str) -> Vec<u8> {
        format!("data: {json}\n\n").into_bytes()
    }

    fn event_types(frames: &[String]) -> Vec<String> {
        frames
            .iter()
            .map(|f| {
                f.lines()
                    .next()
                    .unwrap()
                    .strip_prefix("event: ")
                    .unwrap()
                    .to_string()
            })
            .collect()
    }

    fn data_json(frame: &str) -> Value {
        let data_line = frame
            .lines()
            .find_map(|l| l.strip_prefix("data: "))
            .unwrap();
        serde_json::from_str(data_line).unwrap()
    }

    #[test]
    fn text_stream_produces_full_event_sequence() {
        let mut tr = StreamTranslator::new("native-model");
        let mut out = Vec::new();
        out.extend(tr.feed(&frame(
            r#"{"id":"cmpl-1","choices":[{"delta":{"role":"assistant","content":"Hel"}}]}"#,
        )));
        out.extend(tr.feed(&frame(
            r#"{"id":"cmpl-1","choices":[{"delta":{"content":"lo"}}]}"#,
        )));
        out.extend(tr.feed(&frame(
            r#"{"id":"cmpl-1","choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":9,"completion_tokens":2}}"#,
        )));
        out.extend(tr.feed(b"data: [DONE]\n\n"));

        assert_eq!(
            event_types(&out),
            vec![
                "message_start",
                "ping",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        let start = data_json(&out[0]);
        assert_eq!(start["message"]["model"], "native-model");
        assert_eq!(start["message"]["id"], "cmpl-1");

        let delta = data_json(&out[3]);
        assert_eq!(delta["delta"]["text"], "Hel");

        let message_delta = data_json(&out[6]);
        assert_eq!(message_delta["delta"]["stop_reason"], "end_turn");
        assert_eq!(message_delta["usage"]["output_tokens"], 2);
        assert_eq!(tr.input_tokens(), 9);
    }

    #[test]
    fn argument_full_resend_emits_suffix_only() {
        let mut tr = StreamTranslator::new("m");
        let mut out = Vec::new();
        out.extend(tr.feed(&frame(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"f","arguments":"{\"a\":1"}}]}}]}"#,
        )));
        out.extend(tr.feed(&frame(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"a\":1,\"b\":2}"}}]}}]}"#,
        )));

        let deltas: Vec<Value> = out
            .iter()
            .filter(|f| f.starts_with("event: content_block_delta"))
            .map(|f| data_json(f))
            .collect();
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0]["delta"]["partial_json"], "{\"a\":1");
        assert_eq!(deltas[1]["delta"]["partial_json"], ",\"b\":2}");
    }

    #[test]
    fn incremental_argument_deltas_pass_through() {
        let mut tr = StreamTranslator::new("m");
        let mut out = Vec::new();
        out.extend(tr.feed(&frame(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c","function":{"name":"f","arguments":"{\"a\""}}]}}]}"#,
        )));
        out.extend(tr.feed(&frame(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":":1}"}}]}}]}"#,
        )));

        let deltas: Vec<Value> = out
            .iter()
            .filter(|f| f.starts_with("event: content_block_delta"))
            .map(|f| data_json(f))
            .collect();
        assert_eq!(deltas[0]["delta"]["partial_json"], "{\"a\"");
        assert_eq!(deltas[1]["delta"]["partial_json"], ":1}");
    }

    #[test]
    fn text_then_tool_calls_open_sequential_blocks() {
        let mut tr = StreamTranslator::new("m");
        let mut out = Vec::new();
        out.extend(tr.feed(&frame(
            r#"{"choices":[{"delta":{"content":"let me check"}}]}"#,
        )));
        out.extend(tr.feed(&frame(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"first","arguments":"{}"}}]}}]}"#,
        )));
        out.extend(tr.feed(&frame(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"c2","function":{"name":"second","arguments":"{}"}}]}}]}"#,
        )));
        out.extend(tr.feed(&frame(
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        )));
        out.extend(tr.finish());

        let starts: Vec<Value> = out
            .iter()
            .filter(|f| f.starts_with("event: content_block_start"))
            .map(|f| data_json(f))
            .collect();
        assert_eq!(starts.len(), 3);
        assert_eq!(starts[0]["content_block"]["type"], "text");
        assert_eq!(starts[0]["index"], 0);
        assert_eq!(starts[1]["content_block"]["name"], "first");
        assert_eq!(starts[1]["index"], 1);
        assert_eq!(starts[2]["content_block"]["name"], "second");
        assert_eq!(starts[2]["index"], 2);

        let stops = out
            .iter()
            .filter(|f| f.starts_with("event: content_block_stop"))
            .count();
        assert_eq!(stops, 3);

        let message_delta = data_json(
            out.iter()
                .find(|f| f.starts_with("event: message_delta"))
                .unwrap(),
        );
        assert_eq!(message_delta["delta"]["stop_reason"], "tool_use");
        assert_eq!(tr.tool_call_count(), 2);
    }

    #[test]
    fn output_identical_under_arbitrary_chunking() {
        let input = concat!(
            "data: {\"id\":\"c\",\"choices\":[{\"delta\":{\"content\":\"ab\"}}]}\n\n",
            "data: {\"id\":\"c\",\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"t\",\"function\":{\"name\":\"f\",\"arguments\":\"{}\"}}]}}]}\n\n",
            "data: {\"id\":\"c\",\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: [DONE]\n\n",
        )
        .as_bytes();

        let mut whole = StreamTranslator::new("m");
        let expected = whole.feed(input);

        for split in 0..input.len() {
            let mut tr = StreamTranslator::new("m");
            let mut got = tr.feed(&input[..split]);
            got.extend(tr.feed(&input[split..]));
            assert_eq!(got, expected, "split at {split}");
        }

        let mut bytewise = StreamTranslator::new("m");
        let mut got = Vec::new();
        for b in input.iter() {
            got.extend(bytewise.feed(std::slice::from_ref(b)));
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn malformed_frame_is_skipped_and_stream_continues() {
        let mut tr = StreamTranslator::new("m");
        let mut out = Vec::new();
        out.extend(tr.feed(&frame(r#"{"choices":[{"delta":{"content":"a"}}]}"#)));
        out.extend(tr.feed(b"data: {definitely not json\n\n"));
        out.extend(tr.feed(&frame(r#"{"choices":[{"delta":{"content":"b"}}]}"#)));

        let deltas = out
            .iter()
            .filter(|f| f.starts_with("event: content_block_delta"))
            .count();
        assert_eq!(deltas, 2);
    }

    #[test]
    fn finish_without_usage_estimates_output_tokens() {
        let mut tr = StreamTranslator::new("m");
        tr.feed(&frame(
            r#"{"choices":[{"delta":{"content":"three whole tokens"}}]}"#,
        ));
        // Upstream died without a finish chunk or [DONE]
        let out = tr.finish();
        let message_delta = data_json(
            out.iter()
                .find(|f| f.starts_with("event: message_delta"))
                .unwrap(),
        );
        assert_eq!(message_delta["usage"]["output_tokens"], 3);
        assert_eq!(message_delta["delta"]["stop_reason"], "end_turn");
    }

    #[test]
    fn finish_is_idempotent() {
        let mut tr = StreamTranslator::new("m");
        tr.feed(&frame(r#"{"choices":[{"delta":{"content":"x"}}]}"#));
        assert!(!tr.finish().is_empty());
        assert!(tr.finish().is_empty());
    }

    #[test]
    fn finish_before_any_chunk_emits_nothing() {
        let mut tr = StreamTranslator::new("m");
        assert!(tr.finish().is_empty());
    }
}
