//! Request classification
//!
//! Labels a decoded request body by counting system instructions: the
//! top-level `system` field (string counts as 1, array as its length)
//! plus messages whose role is "system". Exactly one combined system
//! instruction marks an evaluation-only request; more than one marks
//! full inference; zero is unknown. The rule lives only here — every
//! consumer reads the memoized result off the request, never re-counts.

use serde::Deserialize;
use serde_json::Value;

/// The fields classification reads, decoded up front. Shapes that do
/// not fit fall into the catch-all variants and count as zero.
#[derive(Debug, Default, Deserialize)]
struct ClassifiedFields {
    #[serde(default)]
    system: Option<SystemField>,
    #[serde(default)]
    messages: Option<MessagesField>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SystemField {
    Text(String),
    Entries(Vec<Value>),
    Other(Value),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessagesField {
    Entries(Vec<MessageEntry>),
    Other(Value),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageEntry {
    Role { role: String },
    Other(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    EvaluationOnly,
    Inference,
    Unknown,
}

impl RequestType {
    pub fn label(&self) -> &'static str {
        match self {
            RequestType::EvaluationOnly => "evaluation_only",
            RequestType::Inference => "inference",
            RequestType::Unknown => "unknown",
        }
    }
}

/// Classify a decoded request body. Pure function of the body.
pub fn classify(body: &Value) -> RequestType {
    let fields = ClassifiedFields::deserialize(body).unwrap_or_default();

    let mut count = match &fields.system {
        Some(SystemField::Text(_)) => 1,
        Some(SystemField::Entries(entries)) => entries.len(),
        Some(SystemField::Other(_)) | None => 0,
    };

    if let Some(MessagesField::Entries(entries)) = &fields.messages {
        count += entries
            .iter()
            .filter(|m| matches!(m, MessageEntry::Role { role } if role == "system"))
            .count();
    }

    match count {
        0 => RequestType::Unknown,
        1 => RequestType::EvaluationOnly,
        _ => RequestType::Inference,
    }
}
