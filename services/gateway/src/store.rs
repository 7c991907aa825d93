//! Storage and notification collaborators
//!
//! The gateway hands finished work to two external collaborators: a
//! request/response archive and a chat-notification sink. The core
//! never reads anything back from them, and their failures are logged
//! by the orchestrator but never surface to the client. Uses
//! `Pin<Box<dyn Future>>` return types for dyn-compatibility
//! (`Arc<dyn RequestStore>`).

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tracing::debug;

/// Errors from collaborator hand-offs. Always logged, never propagated
/// to the client-facing request.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

pub type Result<T> = std::result::Result<T, CollaboratorError>;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything the archive needs about a finished request.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub request_id: String,
    pub status: u16,
    /// Buffered body for non-streaming replies; streaming replies are
    /// archived as ordered chunks instead.
    pub body: Option<Value>,
    pub is_streaming: bool,
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_call_count: u64,
    pub error: Option<String>,
}

/// One finished exchange, offered to the notification sink. Credential
/// material arrives pre-masked; the raw value never crosses this
/// boundary.
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub masked_credential: String,
    pub domain: String,
    pub model: String,
    pub role: String,
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Archive for requests, responses, and ordered streaming chunks.
pub trait RequestStore: Send + Sync {
    fn store_request(
        &self,
        request_id: String,
        body: Value,
        classification: &'static str,
        is_streaming: bool,
    ) -> BoxFuture<'_, Result<()>>;

    /// Chunk indices are assigned by the orchestrator in arrival order,
    /// making partially-stored streams detectable after a disconnect.
    fn store_streaming_chunk(
        &self,
        request_id: String,
        index: u64,
        chunk: Vec<u8>,
    ) -> BoxFuture<'_, Result<()>>;

    fn store_response(&self, record: ResponseRecord) -> BoxFuture<'_, Result<()>>;
}

/// Notification sink. Delivery and message format are entirely the
/// collaborator's concern.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: NotificationEvent) -> BoxFuture<'_, Result<()>>;
}

/// Default archive: structured log lines only.
#[derive(Debug, Default)]
pub struct LogStore;

impl RequestStore for LogStore {
    fn store_request(
        &self,
        request_id: String,
        _body: Value,
        classification: &'static str,
        is_streaming: bool,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            debug!(request_id, classification, is_streaming, "archived request");
            Ok(())
        })
    }

    fn store_streaming_chunk(
        &self,
        request_id: String,
        index: u64,
        chunk: Vec<u8>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            debug!(request_id, index, bytes = chunk.len(), "archived chunk");
            Ok(())
        })
    }

    fn store_response(&self, record: ResponseRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            debug!(
                request_id = record.request_id,
                status = record.status,
                is_streaming = record.is_streaming,
                duration_ms = record.duration_ms,
                input_tokens = record.input_tokens,
                output_tokens = record.output_tokens,
                tool_calls = record.tool_call_count,
                "archived response"
            );
            Ok(())
        })
    }
}

/// Default notification sink: structured log lines only.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: NotificationEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            debug!(
                credential = event.masked_credential,
                domain = event.domain,
                model = event.model,
                role = event.role,
                input_tokens = event.input_tokens,
                output_tokens = event.output_tokens,
                "notification offered"
            );
            Ok(())
        })
    }
}
