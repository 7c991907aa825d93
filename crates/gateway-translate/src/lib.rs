//! Protocol translation between the gateway-native Messages schema and
//! the chat-completion schema
//!
//! Translation mode rewrites in both directions:
//! - outbound: native requests (system blocks, tool_use/tool_result
//!   content) flatten into chat-completion messages and tool-call
//!   descriptors ([`request`])
//! - inbound, buffered: one chat-completion response maps back to one
//!   native message ([`response`])
//! - inbound, streamed: chat-completion delta chunks are re-emitted as
//!   native event frames by a stateful translator ([`stream`]), fed by
//!   an incremental frame parser that tolerates arbitrary byte-level
//!   chunk boundaries ([`sse`])

pub mod error;
pub mod request;
pub mod response;
pub mod sse;
pub mod stream;

pub use error::{Error, Result};
pub use request::{TranslationConfig, translate_request};
pub use response::{estimate_tokens, map_finish_reason, translate_response};
pub use sse::{Frame, FrameParser};
pub use stream::StreamTranslator;
