//! Anthropic Messages adaptor: typed SSE event stream with index-checked
//! content-block accumulation. Thinking blocks survive through the raw
//! echo but never enter the normalized message.

use crate::config::EndpointSpec;
use crate::context::InferenceContext;
use crate::engine::{EngineOptions, Provider};
use crate::sse::{self, SseLineBuffer};
use crate::tools::ToolChoice;
use crate::types::{
    AiMessage, AiPart, ChatMessage, EngineError, FunctionCall, RawEcho, Session, Usage,
    UserMessage, UserPart, WireFormat,
};
use crate::utils;
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// The protocol rejects requests without `max_tokens`; deployments tune it
/// through the endpoint's custom options.
const DEFAULT_MAX_TOKENS: u32 = 8192;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageStartBody },
    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        index: usize,
        content_block: BlockStart,
    },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: usize, delta: BlockDelta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: usize },
    #[serde(rename = "message_delta")]
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "error")]
    Error { error: StreamError },
}

#[derive(Debug, Deserialize)]
struct MessageStartBody {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlockStart {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum BlockDelta {
    #[serde(rename = "text_delta")]
    Text { text: String },
    #[serde(rename = "thinking_delta")]
    Thinking { thinking: String },
    #[serde(rename = "signature_delta")]
    Signature { signature: String },
    #[serde(rename = "input_json_delta")]
    InputJson { partial_json: String },
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    #[serde(default)]
    cache_creation_input_tokens: u32,
    #[serde(default)]
    cache_read_input_tokens: u32,
}

pub struct AnthropicClient {
    client: Client,
    options: Arc<EngineOptions>,
}

impl AnthropicClient {
    pub fn new(options: Arc<EngineOptions>) -> Result<Self> {
        let client = utils::http_client(&options.endpoint)?;
        Ok(Self { client, options })
    }

    fn build_request(&self, session: &Session) -> Result<Value> {
        let endpoint = &self.options.endpoint;
        let (tools, tool_choice) = self.marshal_tools();
        let mut request = json!({
            "model": endpoint.model,
            "max_tokens": DEFAULT_MAX_TOKENS,
            "stream": true,
            "messages": marshal_messages(session),
        });
        if let Some(developer) = &session.developer {
            // A cache marker on the system block lets repeated calls hit
            // the vendor's prompt cache.
            request["system"] = json!([{
                "type": "text",
                "text": developer.text(),
                "cache_control": {"type": "ephemeral"},
            }]);
        }
        if let Some(tools) = tools {
            request["tools"] = tools;
        }
        if let Some(tool_choice) = tool_choice {
            request["tool_choice"] = tool_choice;
        }
        Ok(utils::apply_custom(request, endpoint))
    }

    fn marshal_tools(&self) -> (Option<Value>, Option<Value>) {
        let options = &self.options;
        let tools: Vec<Value> = options
            .declarations
            .iter()
            .filter(|(name, _)| options.tool_choice.offers(name))
            .map(|(name, declaration)| {
                let mut tool = serde_json::Map::new();
                tool.insert("name".to_string(), json!(name));
                if let Some(description) = &declaration.description {
                    tool.insert("description".to_string(), json!(description));
                }
                tool.insert("input_schema".to_string(), declaration.parameters.clone());
                Value::Object(tool)
            })
            .collect();
        if tools.is_empty() {
            return (None, None);
        }

        let choice = match &options.tool_choice {
            ToolChoice::None => json!({"type": "none"}),
            ToolChoice::Auto => json!({"type": "auto"}),
            ToolChoice::Required => json!({"type": "any"}),
            ToolChoice::Allow(_) => match options.tool_choice.sole_allowed() {
                Some(name) => json!({"type": "tool", "name": name}),
                // Multi-entry allow-lists have no native shape here; the
                // subset filter above already restricts what is offered.
                None => json!({"type": "auto"}),
            },
        };
        (Some(json!(tools)), Some(choice))
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let endpoint = &self.options.endpoint;
        self.client
            .post(format!("{}/messages", endpoint.base()))
            .header("x-api-key", &endpoint.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("accept", "text/event-stream")
            .json(body)
            .send()
            .await
            .map_err(|e| EngineError::Network(e.to_string()).into())
    }
}

#[async_trait]
impl Provider for AnthropicClient {
    async fn fetch(&self, ctx: &InferenceContext, session: &Session) -> Result<AiMessage> {
        let body = self.build_request(session)?;
        debug!(endpoint = %self.options.endpoint.name, "Sending messages request");
        ctx.log_message(&body);

        let response = self.send(&body).await?;
        let response = utils::check_response_error(response).await?;

        let mut accumulator = StreamAccumulator::default();
        let mut lines = SseLineBuffer::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| EngineError::Network(e.to_string()))?;
            for line in lines.push(&chunk)? {
                accumulator.handle_line(ctx, &line)?;
            }
        }
        if let Some(line) = lines.finish()? {
            accumulator.handle_line(ctx, &line)?;
        }
        accumulator.finish()
    }

    fn endpoint(&self) -> &EndpointSpec {
        &self.options.endpoint
    }
}

fn marshal_messages(session: &Session) -> Vec<Value> {
    session
        .messages
        .iter()
        .map(|message| match message {
            ChatMessage::User(user) => marshal_user(user),
            ChatMessage::Ai(ai) => marshal_assistant(ai),
        })
        .collect()
}

fn marshal_user(user: &UserMessage) -> Value {
    // Tool results must lead the content array on this protocol.
    let mut content = Vec::new();
    for part in &user.parts {
        if let UserPart::FunctionResponse(response) = part {
            content.push(json!({
                "type": "tool_result",
                "tool_use_id": response.id.clone().unwrap_or_else(|| response.name.clone()),
                "content": response.text,
            }));
        }
    }
    for part in &user.parts {
        if let UserPart::Text(text) = part {
            content.push(json!({"type": "text", "text": text}));
        }
    }
    json!({"role": "user", "content": content})
}

fn marshal_assistant(message: &AiMessage) -> Value {
    let content = match message.raw_for(WireFormat::AnthropicMessages) {
        Some(raw) => raw.clone(),
        None => assistant_blocks(message),
    };
    json!({"role": "assistant", "content": content})
}

/// Reconstructs the content-block array of an assistant turn from
/// normalized parts; used when no raw payload from this protocol is
/// available to echo.
fn assistant_blocks(message: &AiMessage) -> Value {
    let blocks: Vec<Value> = message
        .parts
        .iter()
        .map(|part| match part {
            AiPart::Text(text) => json!({"type": "text", "text": text}),
            AiPart::FunctionCall(call) => json!({
                "type": "tool_use",
                "id": call.id.clone().unwrap_or_else(|| call.name.clone()),
                "name": call.name,
                "input": call.args,
            }),
        })
        .collect();
    json!(blocks)
}

fn check_stop_reason(reason: Option<&str>) -> Result<()> {
    match reason {
        Some("end_turn") | Some("tool_use") => Ok(()),
        Some("max_tokens") => Err(EngineError::ResponseInvalid(
            "Response truncated: token limit reached".to_string(),
        )
        .into()),
        Some(other) => {
            Err(EngineError::ResponseInvalid(format!("Abnormal stop reason '{other}'")).into())
        }
        None => Err(EngineError::ResponseInvalid("Missing stop reason".to_string()).into()),
    }
}

fn normalize_usage(usage: AnthropicUsage) -> Usage {
    Usage {
        // input_tokens excludes cache traffic on this protocol; the
        // normalized prompt count covers the whole prompt.
        prompt_tokens: usage.input_tokens
            + usage.cache_creation_input_tokens
            + usage.cache_read_input_tokens,
        cached_tokens: usage.cache_read_input_tokens,
        completion_tokens: usage.output_tokens,
        thought_tokens: 0,
        billed: None,
    }
}

/// Folds typed stream events into one logical response. Blocks open,
/// extend, and close strictly in index order; any event for a block other
/// than the one currently open is a protocol violation.
#[derive(Default)]
struct StreamAccumulator {
    blocks: Vec<BlockBuilder>,
    stop_reason: Option<String>,
    usage: Option<AnthropicUsage>,
}

struct BlockBuilder {
    kind: BlockKind,
    closed: bool,
}

enum BlockKind {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        signature: String,
    },
    Redacted {
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: String,
    },
}

impl StreamAccumulator {
    fn handle_line(&mut self, ctx: &InferenceContext, line: &str) -> Result<()> {
        let Some(data) = sse::data_payload(line) else {
            return Ok(());
        };
        let event: StreamEvent = serde_json::from_str(data)
            .map_err(|e| EngineError::ResponseInvalid(format!("Unparseable stream event: {e}")))?;

        match event {
            StreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.merge_usage(usage);
                }
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => self.open_block(index, content_block)?,
            StreamEvent::ContentBlockDelta { index, delta } => {
                self.apply_delta(ctx, index, delta)?
            }
            StreamEvent::ContentBlockStop { index } => {
                self.current_block(index)?.closed = true;
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    self.stop_reason = Some(reason);
                }
                if let Some(usage) = usage {
                    self.merge_usage(usage);
                }
            }
            StreamEvent::MessageStop | StreamEvent::Ping => {}
            StreamEvent::Error { error } => {
                let detail = format!("{}: {}", error.error_type, error.message);
                return Err(match error.error_type.as_str() {
                    "overloaded_error" => EngineError::Network(detail),
                    _ => EngineError::ResponseInvalid(format!("Stream error: {detail}")),
                }
                .into());
            }
        }
        Ok(())
    }

    fn open_block(&mut self, index: usize, block: BlockStart) -> Result<()> {
        if index != self.blocks.len() {
            return Err(EngineError::ResponseInvalid(format!(
                "Block start index {index} does not match expected {}",
                self.blocks.len()
            ))
            .into());
        }
        let kind = match block.block_type.as_str() {
            "text" => BlockKind::Text {
                text: block.text.unwrap_or_default(),
            },
            "thinking" => BlockKind::Thinking {
                thinking: block.thinking.unwrap_or_default(),
                signature: block.signature.unwrap_or_default(),
            },
            // Arrives complete in the start event; no deltas follow.
            "redacted_thinking" => BlockKind::Redacted {
                data: block.data.unwrap_or_default(),
            },
            "tool_use" => match (block.id, block.name) {
                (Some(id), Some(name)) => BlockKind::ToolUse {
                    id,
                    name,
                    input: String::new(),
                },
                _ => {
                    return Err(EngineError::ResponseInvalid(
                        "Tool-use block without id or name".to_string(),
                    )
                    .into())
                }
            },
            other => {
                return Err(EngineError::ResponseInvalid(format!(
                    "Unknown content block type '{other}'"
                ))
                .into())
            }
        };
        self.blocks.push(BlockBuilder {
            kind,
            closed: false,
        });
        Ok(())
    }

    fn current_block(&mut self, index: usize) -> Result<&mut BlockBuilder> {
        if self.blocks.len() != index + 1 {
            return Err(EngineError::ResponseInvalid(format!(
                "Event for unopened block index {index}"
            ))
            .into());
        }
        let builder = &mut self.blocks[index];
        if builder.closed {
            return Err(EngineError::ResponseInvalid(format!(
                "Event for closed block index {index}"
            ))
            .into());
        }
        Ok(builder)
    }

    fn apply_delta(&mut self, ctx: &InferenceContext, index: usize, delta: BlockDelta) -> Result<()> {
        let builder = self.current_block(index)?;
        match (&mut builder.kind, delta) {
            (BlockKind::Text { text }, BlockDelta::Text { text: chunk }) => {
                ctx.log_inference(&chunk);
                text.push_str(&chunk);
            }
            (BlockKind::Thinking { thinking, .. }, BlockDelta::Thinking { thinking: chunk }) => {
                ctx.log_reasoning(&chunk);
                thinking.push_str(&chunk);
            }
            (BlockKind::Thinking { signature, .. }, BlockDelta::Signature { signature: chunk }) => {
                signature.push_str(&chunk);
            }
            (BlockKind::ToolUse { input, .. }, BlockDelta::InputJson { partial_json }) => {
                input.push_str(&partial_json);
            }
            _ => {
                return Err(EngineError::ResponseInvalid(format!(
                    "Delta type does not match block {index}"
                ))
                .into())
            }
        }
        Ok(())
    }

    fn merge_usage(&mut self, incoming: AnthropicUsage) {
        let usage = self.usage.get_or_insert_with(AnthropicUsage::default);
        // Token counts only grow over the life of a stream.
        usage.input_tokens = usage.input_tokens.max(incoming.input_tokens);
        usage.output_tokens = usage.output_tokens.max(incoming.output_tokens);
        usage.cache_creation_input_tokens = usage
            .cache_creation_input_tokens
            .max(incoming.cache_creation_input_tokens);
        usage.cache_read_input_tokens = usage
            .cache_read_input_tokens
            .max(incoming.cache_read_input_tokens);
    }

    fn finish(self) -> Result<AiMessage> {
        if self.blocks.last().is_some_and(|block| !block.closed) {
            return Err(
                EngineError::ResponseInvalid("Stream ended inside a content block".to_string())
                    .into(),
            );
        }
        check_stop_reason(self.stop_reason.as_deref())?;

        let mut parts = Vec::new();
        let mut raw_blocks = Vec::new();
        for block in self.blocks {
            match block.kind {
                BlockKind::Text { text } => {
                    if !text.is_empty() {
                        parts.push(AiPart::Text(text.clone()));
                    }
                    raw_blocks.push(json!({"type": "text", "text": text}));
                }
                BlockKind::Thinking {
                    thinking,
                    signature,
                } => {
                    raw_blocks.push(json!({
                        "type": "thinking",
                        "thinking": thinking,
                        "signature": signature,
                    }));
                }
                BlockKind::Redacted { data } => {
                    raw_blocks.push(json!({"type": "redacted_thinking", "data": data}));
                }
                BlockKind::ToolUse { id, name, input } => {
                    let args = utils::parse_arguments(&name, &input)?;
                    raw_blocks.push(json!({
                        "type": "tool_use",
                        "id": id,
                        "name": name,
                        "input": args,
                    }));
                    parts.push(AiPart::FunctionCall(FunctionCall {
                        id: Some(id),
                        name,
                        args,
                    }));
                }
            }
        }

        Ok(AiMessage {
            parts,
            raw: Some(RawEcho {
                format: WireFormat::AnthropicMessages,
                payload: Value::Array(raw_blocks),
            }),
            usage: self.usage.map(normalize_usage),
        })
    }
}
