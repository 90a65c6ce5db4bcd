//! OpenAI Chat Completions adaptor: monolithic JSON and SSE streaming
//! variants, plus the customization seam OpenAI-compatible wrappers
//! (OpenRouter, DashScope) build on.

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
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Hook points for endpoints that speak the Chat Completions protocol with
/// small deviations. The stock client uses [`StockOpenAI`].
pub trait RequestCustomizer: Send + Sync {
    /// Adjusts the assembled body after standard marshalling and
    /// custom-options merging; wrapper invariants get the last word.
    fn customize_request(&self, _request: &mut Value) {}

    /// Additional request headers beyond authorization.
    fn extra_headers(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    fn url(&self, base: &str) -> String {
        format!("{base}/chat/completions")
    }
}

/// The stock protocol: no adjustments.
pub struct StockOpenAI;

impl RequestCustomizer for StockOpenAI {}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAIToolCall>>,
    /// Qwen/DeepSeek dialect.
    #[serde(default)]
    reasoning_content: Option<String>,
    /// OpenRouter dialect.
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIToolCall {
    id: String,
    function: OpenAIFunction,
}

#[derive(Debug, Deserialize)]
struct OpenAIFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
    /// OpenRouter's pre-computed dollar cost, present with `usage.include`.
    #[serde(default)]
    cost: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAIToolCallDelta>>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAIFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAIFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

pub struct OpenAIClient {
    client: Client,
    options: Arc<EngineOptions>,
    streaming: bool,
    customizer: Box<dyn RequestCustomizer>,
}

impl OpenAIClient {
    pub fn new(options: Arc<EngineOptions>, streaming: bool) -> Result<Self> {
        Self::with_customizer(options, streaming, Box::new(StockOpenAI))
    }

    pub fn with_customizer(
        options: Arc<EngineOptions>,
        streaming: bool,
        customizer: Box<dyn RequestCustomizer>,
    ) -> Result<Self> {
        let client = utils::http_client(&options.endpoint)?;
        Ok(Self {
            client,
            options,
            streaming,
            customizer,
        })
    }

    fn build_request(&self, session: &Session) -> Result<Value> {
        let endpoint = &self.options.endpoint;
        let (tools, tool_choice) = self.marshal_tools();
        let request = OpenAIRequest {
            model: endpoint.model.clone(),
            messages: self.marshal_messages(session),
            stream: self.streaming.then_some(true),
            stream_options: self.streaming.then(|| StreamOptions {
                include_usage: true,
            }),
            tools,
            tool_choice,
        };
        let mut body = utils::apply_custom(serde_json::to_value(request)?, endpoint);
        self.customizer.customize_request(&mut body);
        Ok(body)
    }

    fn marshal_messages(&self, session: &Session) -> Vec<Value> {
        let mut messages = Vec::new();
        if let Some(developer) = &session.developer {
            messages.push(json!({"role": "system", "content": developer.text()}));
        }
        for message in &session.messages {
            match message {
                ChatMessage::User(user) => marshal_user(user, &mut messages),
                ChatMessage::Ai(ai) => messages.push(marshal_assistant(ai)),
            }
        }
        messages
    }

    fn marshal_tools(&self) -> (Option<Vec<Value>>, Option<Value>) {
        let options = &self.options;
        let tools: Vec<Value> = options
            .declarations
            .iter()
            .filter(|(name, _)| options.tool_choice.offers(name))
            .map(|(name, declaration)| {
                let mut function = serde_json::Map::new();
                function.insert("name".to_string(), json!(name));
                if let Some(description) = &declaration.description {
                    function.insert("description".to_string(), json!(description));
                }
                function.insert("parameters".to_string(), declaration.parameters.clone());
                json!({"type": "function", "function": function})
            })
            .collect();
        if tools.is_empty() {
            return (None, None);
        }

        let choice = match &options.tool_choice {
            ToolChoice::None => json!("none"),
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Required => json!("required"),
            ToolChoice::Allow(_) => match options.tool_choice.sole_allowed() {
                Some(name) => json!({"type": "function", "function": {"name": name}}),
                // Multi-entry allow-lists have no native shape here; the
                // subset filter above already restricts what is offered.
                None => json!("auto"),
            },
        };
        (Some(tools), Some(choice))
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let endpoint = &self.options.endpoint;
        let mut request = self
            .client
            .post(self.customizer.url(endpoint.base()))
            .bearer_auth(&endpoint.api_key)
            .json(body);
        for (key, value) in self.customizer.extra_headers() {
            request = request.header(key, value);
        }
        request
            .send()
            .await
            .map_err(|e| EngineError::Network(e.to_string()).into())
    }

    async fn fetch_monolithic(&self, ctx: &InferenceContext, body: &Value) -> Result<AiMessage> {
        let response = self.send(body).await?;
        let response = utils::check_response_error(response).await?;
        let text = response
            .text()
            .await
            .map_err(|e| EngineError::Network(e.to_string()))?;
        let body: Value = serde_json::from_str(&text)
            .map_err(|e| EngineError::ResponseInvalid(format!("Invalid JSON: {e}")))?;
        ctx.log_message(&body);
        parse_response(ctx, body)
    }

    async fn fetch_streaming(&self, ctx: &InferenceContext, body: &Value) -> Result<AiMessage> {
        let response = self.send(body).await?;
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
}

#[async_trait]
impl Provider for OpenAIClient {
    async fn fetch(&self, ctx: &InferenceContext, session: &Session) -> Result<AiMessage> {
        let body = self.build_request(session)?;
        debug!(
            endpoint = %self.options.endpoint.name,
            streaming = self.streaming,
            "Sending chat completion request"
        );
        ctx.log_message(&body);
        if self.streaming {
            self.fetch_streaming(ctx, &body).await
        } else {
            self.fetch_monolithic(ctx, &body).await
        }
    }

    fn endpoint(&self) -> &EndpointSpec {
        &self.options.endpoint
    }
}

fn marshal_user(user: &UserMessage, messages: &mut Vec<Value>) {
    let mut text = String::new();
    for part in &user.parts {
        match part {
            UserPart::Text(t) => {
                if !text.is_empty() {
                    text.push_str("\n\n");
                }
                text.push_str(t);
            }
            UserPart::FunctionResponse(response) => {
                // Function results go out as dedicated `tool` turns; any text
                // gathered so far becomes its own user turn first to keep
                // part order.
                if !text.is_empty() {
                    messages.push(json!({
                        "role": "user",
                        "content": std::mem::take(&mut text)
                    }));
                }
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": response.id.clone().unwrap_or_else(|| response.name.clone()),
                    "content": response.text,
                }));
            }
        }
    }
    if !text.is_empty() {
        messages.push(json!({"role": "user", "content": text}));
    }
}

fn marshal_assistant(message: &AiMessage) -> Value {
    match message.raw_for(WireFormat::ChatCompletions) {
        Some(raw) => raw.clone(),
        None => assistant_payload(message),
    }
}

/// Reconstructs the wire shape of an assistant turn from normalized parts;
/// used when no raw payload from this protocol is available to echo.
fn assistant_payload(message: &AiMessage) -> Value {
    let mut payload = json!({"role": "assistant", "content": message.text()});
    let calls: Vec<Value> = message
        .function_calls()
        .map(|call| {
            json!({
                "id": call.id.clone().unwrap_or_else(|| call.name.clone()),
                "type": "function",
                "function": {"name": call.name, "arguments": call.args.to_string()},
            })
        })
        .collect();
    if !calls.is_empty() {
        payload["tool_calls"] = json!(calls);
    }
    payload
}

fn parse_response(ctx: &InferenceContext, body: Value) -> Result<AiMessage> {
    let response: OpenAIResponse = serde_json::from_value(body.clone())
        .map_err(|e| EngineError::ResponseInvalid(format!("Unexpected response shape: {e}")))?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::ResponseInvalid("No choices in response".to_string()))?;
    check_finish_reason(choice.finish_reason.as_deref())?;

    let message = choice.message;
    if let Some(reasoning) = message
        .reasoning_content
        .as_deref()
        .or(message.reasoning.as_deref())
    {
        ctx.log_reasoning(reasoning);
    }

    let mut parts = Vec::new();
    if let Some(text) = content_text(&message.content)? {
        if !text.is_empty() {
            ctx.log_inference(&text);
            parts.push(AiPart::Text(text));
        }
    }
    for call in message.tool_calls.unwrap_or_default() {
        let args = utils::parse_arguments(&call.function.name, &call.function.arguments)?;
        parts.push(AiPart::FunctionCall(FunctionCall {
            id: Some(call.id),
            name: call.function.name,
            args,
        }));
    }

    Ok(AiMessage {
        parts,
        raw: body.pointer("/choices/0/message").map(|payload| RawEcho {
            format: WireFormat::ChatCompletions,
            payload: payload.clone(),
        }),
        usage: response.usage.map(normalize_usage),
    })
}

fn content_text(content: &Option<Value>) -> Result<Option<String>> {
    match content {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(Value::Array(blocks)) => {
            let mut text = String::new();
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => text
                        .push_str(block.get("text").and_then(Value::as_str).unwrap_or_default()),
                    other => {
                        return Err(EngineError::ResponseInvalid(format!(
                            "Unknown content part '{}'",
                            other.unwrap_or("?")
                        ))
                        .into())
                    }
                }
            }
            Ok(Some(text))
        }
        Some(other) => {
            Err(EngineError::ResponseInvalid(format!("Unexpected content shape: {other}")).into())
        }
    }
}

fn check_finish_reason(reason: Option<&str>) -> Result<()> {
    match reason {
        Some("stop") | Some("tool_calls") => Ok(()),
        Some("length") => Err(EngineError::ResponseInvalid(
            "Response truncated: token limit reached".to_string(),
        )
        .into()),
        Some(other) => {
            Err(EngineError::ResponseInvalid(format!("Abnormal finish reason '{other}'")).into())
        }
        None => Err(EngineError::ResponseInvalid("Missing finish reason".to_string()).into()),
    }
}

fn normalize_usage(usage: OpenAIUsage) -> Usage {
    Usage {
        prompt_tokens: usage.prompt_tokens,
        cached_tokens: usage.prompt_tokens_details.map_or(0, |d| d.cached_tokens),
        completion_tokens: usage.completion_tokens,
        thought_tokens: 0,
        billed: usage.cost,
    }
}

/// Folds SSE deltas into one logical response. Tool-call deltas merge by
/// index: the first delta for an index establishes id and name, later ones
/// append to the arguments string, which is parsed once at the end.
#[derive(Default)]
struct StreamAccumulator {
    text: String,
    tool_calls: Vec<ToolCallBuilder>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Default)]
struct ToolCallBuilder {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl StreamAccumulator {
    fn handle_line(&mut self, ctx: &InferenceContext, line: &str) -> Result<()> {
        let Some(data) = sse::data_payload(line) else {
            return Ok(());
        };
        if data == "[DONE]" {
            return Ok(());
        }
        let chunk: OpenAIStreamChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Skipping unparseable stream event: {e}");
                return Ok(());
            }
        };

        if let Some(usage) = chunk.usage {
            self.usage = Some(normalize_usage(usage));
        }
        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(());
        };
        if let Some(reason) = choice.finish_reason {
            self.finish_reason = Some(reason);
        }

        let delta = choice.delta;
        if let Some(reasoning) = delta
            .reasoning_content
            .as_deref()
            .or(delta.reasoning.as_deref())
        {
            ctx.log_reasoning(reasoning);
        }
        if let Some(content) = delta.content {
            if !content.is_empty() {
                ctx.log_inference(&content);
                self.text.push_str(&content);
            }
        }
        for call in delta.tool_calls.unwrap_or_default() {
            self.merge_tool_call(call)?;
        }
        Ok(())
    }

    fn merge_tool_call(&mut self, delta: OpenAIToolCallDelta) -> Result<()> {
        let index = delta.index;
        if index > self.tool_calls.len() {
            return Err(EngineError::ResponseInvalid(format!(
                "Tool-call delta for unopened index {index}"
            ))
            .into());
        }
        if index == self.tool_calls.len() {
            self.tool_calls.push(ToolCallBuilder::default());
        }

        let builder = &mut self.tool_calls[index];
        if let Some(id) = delta.id {
            builder.id.get_or_insert(id);
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                builder.name.get_or_insert(name);
            }
            if let Some(arguments) = function.arguments {
                builder.arguments.push_str(&arguments);
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<AiMessage> {
        check_finish_reason(self.finish_reason.as_deref())?;

        let mut parts = Vec::new();
        if !self.text.is_empty() {
            parts.push(AiPart::Text(self.text));
        }
        for builder in self.tool_calls {
            let name = builder.name.ok_or_else(|| {
                EngineError::ResponseInvalid("Tool-call stream without a function name".to_string())
            })?;
            let args = utils::parse_arguments(&name, &builder.arguments)?;
            parts.push(AiPart::FunctionCall(FunctionCall {
                id: builder.id,
                name,
                args,
            }));
        }

        let mut message = AiMessage {
            parts,
            raw: None,
            usage: self.usage,
        };
        // An accumulated stream has no verbatim payload; echo the
        // reconstruction so history replays stay byte-stable.
        message.raw = Some(RawEcho {
            format: WireFormat::ChatCompletions,
            payload: assistant_payload(&message),
        });
        Ok(message)
    }
}
