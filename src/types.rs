//! Vendor-neutral session and message model shared by every engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Protocol family that produced a raw assistant payload.
///
/// Used to decide whether a cached [`RawEcho`] may be replayed verbatim when
/// a message is marshalled back as conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireFormat {
    ChatCompletions,
    Responses,
    GoogleGenerate,
    AnthropicMessages,
}

/// The vendor-shaped assistant payload exactly as parsed off the wire.
///
/// Some vendors embed opaque state in their responses (encrypted reasoning
/// content, thinking-block signatures) that cannot be reconstructed from the
/// normalized parts. Adaptors echo this payload back instead of rebuilding
/// the message whenever the tag matches their own wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEcho {
    pub format: WireFormat,
    pub payload: serde_json::Value,
}

/// A function call parsed out of a model response.
///
/// `id` is the vendor's call identifier when the vendor needs one to
/// correlate the eventual response (OpenAI, Anthropic); `None` for vendors
/// that correlate by name (Google).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub args: serde_json::Value,
}

/// The textual result of invoking a declared function, round-tripped to the
/// vendor as part of the next user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub text: String,
}

/// One typed segment of a user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UserPart {
    Text(String),
    FunctionResponse(FunctionResponse),
}

/// One typed segment of an AI message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AiPart {
    Text(String),
    FunctionCall(FunctionCall),
}

/// System/developer instructions, kept separate from the turn sequence
/// because every vendor wants them in a dedicated request field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeveloperMessage {
    pub parts: Vec<String>,
}

impl DeveloperMessage {
    pub fn text(&self) -> String {
        self.parts.join("\n")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub parts: Vec<UserPart>,
}

impl UserMessage {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![UserPart::Text(text.into())],
        }
    }
}

/// A parsed model turn: ordered text and function-call parts, plus the raw
/// vendor payload and usage the adaptor extracted alongside them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiMessage {
    pub parts: Vec<AiPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<RawEcho>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl AiMessage {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![AiPart::Text(text.into())],
            raw: None,
            usage: None,
        }
    }

    /// All text parts concatenated in emission order.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                AiPart::Text(t) => Some(t.as_str()),
                AiPart::FunctionCall(_) => None,
            })
            .collect()
    }

    pub fn function_calls(&self) -> impl Iterator<Item = &FunctionCall> {
        self.parts.iter().filter_map(|p| match p {
            AiPart::FunctionCall(c) => Some(c),
            AiPart::Text(_) => None,
        })
    }

    pub fn has_function_calls(&self) -> bool {
        self.function_calls().next().is_some()
    }

    /// The raw payload, if it was produced by the given wire format.
    pub fn raw_for(&self, format: WireFormat) -> Option<&serde_json::Value> {
        match &self.raw {
            Some(echo) if echo.format == format => Some(&echo.payload),
            _ => None,
        }
    }
}

/// One turn in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChatMessage {
    User(UserMessage),
    Ai(AiMessage),
}

/// Mutable conversation history. The engine's stateful mode and the agent
/// loop both append to `messages` in place; the caller retains ownership and
/// the engine never keeps a private copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub developer: Option<DeveloperMessage>,
    pub messages: Vec<ChatMessage>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_developer(text: impl Into<String>) -> Self {
        Self {
            developer: Some(DeveloperMessage {
                parts: vec![text.into()],
            }),
            messages: Vec::new(),
        }
    }

    pub fn push_user_text(&mut self, text: impl Into<String>) {
        self.messages
            .push(ChatMessage::User(UserMessage::from_text(text)));
    }

    /// Appends one user turn carrying the results of dispatched function
    /// calls, in the order the calls appeared.
    pub fn push_function_responses(&mut self, responses: Vec<FunctionResponse>) {
        self.messages.push(ChatMessage::User(UserMessage {
            parts: responses
                .into_iter()
                .map(UserPart::FunctionResponse)
                .collect(),
        }));
    }

    pub fn push_ai(&mut self, message: AiMessage) {
        self.messages.push(ChatMessage::Ai(message));
    }

    pub fn last_ai(&self) -> Option<&AiMessage> {
        self.messages.iter().rev().find_map(|m| match m {
            ChatMessage::Ai(ai) => Some(ai),
            ChatMessage::User(_) => None,
        })
    }

    /// Rough input-token estimate used only for throttle pre-reservation
    /// (bytes/4 plus a small per-message overhead). Vendors report the
    /// authoritative count after the call.
    pub fn estimate_tokens(&self) -> u64 {
        let mut bytes = 0usize;
        if let Some(dev) = &self.developer {
            bytes += dev.parts.iter().map(String::len).sum::<usize>();
        }
        for message in &self.messages {
            bytes += match message {
                ChatMessage::User(user) => user
                    .parts
                    .iter()
                    .map(|p| match p {
                        UserPart::Text(t) => t.len(),
                        UserPart::FunctionResponse(r) => r.name.len() + r.text.len(),
                    })
                    .sum::<usize>(),
                ChatMessage::Ai(ai) => ai
                    .parts
                    .iter()
                    .map(|p| match p {
                        AiPart::Text(t) => t.len(),
                        AiPart::FunctionCall(c) => c.name.len() + c.args.to_string().len(),
                    })
                    .sum::<usize>(),
            };
        }
        (bytes / 4 + self.messages.len() * 4) as u64
    }
}

/// Normalized per-call token usage.
///
/// `prompt_tokens` is the full prompt size including cache hits;
/// `cached_tokens` is the cache-hit share of it. `thought_tokens` is nonzero
/// only for vendors that report thinking tokens outside `completion_tokens`
/// (billed at the output rate). `billed` is a vendor-computed cost that
/// overrides the price formula when present (OpenRouter).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub cached_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub thought_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billed: Option<f64>,
}

impl Usage {
    pub fn zero() -> Self {
        Self::default()
    }

    /// Tokens that count against the output budget.
    pub fn output_total(&self) -> u32 {
        self.completion_tokens + self.thought_tokens
    }
}

/// Classified failure taxonomy. Classification decides retry behavior in the
/// engine driver; errors travel inside `anyhow::Error` and are recovered by
/// downcast.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The vendor returned a structurally or semantically invalid response:
    /// malformed function-call JSON, schema-violating arguments, missing
    /// choices, abnormal finish reason, token-limit truncation, unknown
    /// content-part shape, tool-choice policy violation.
    #[error("Invalid model response: {0}")]
    ResponseInvalid(String),

    /// Connection-level fault, premature stream termination, or a 429/5xx
    /// status from the vendor.
    #[error("Network error: {0}")]
    Network(String),

    /// The per-attempt deadline elapsed.
    #[error("Inference timed out after {0:?}")]
    Timeout(Duration),

    /// The caller's cancellation signal fired.
    #[error("Inference aborted by caller")]
    Aborted,

    /// HTTP 401/403 — wrong or missing credentials. Never retried.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// HTTP 400 — the request itself was rejected. Never retried.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Token-budget bookkeeping invariant violated (a single reservation
    /// larger than the whole budget). Never retried.
    #[error("Throttle overflow: {0}")]
    Throttle(String),

    /// All attempts failed; carries the last classified cause.
    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl EngineError {
    /// Whether the engine driver may spend a retry on this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::ResponseInvalid(_) | EngineError::Network(_) | EngineError::Timeout(_)
        )
    }
}
