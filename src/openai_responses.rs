//! OpenAI Responses adaptor: the item-based protocol. Requests run with
//! `store: false` and ask for encrypted reasoning content, so conversation
//! replay stays stateless even against ZDR deployments — reasoning items
//! ride along in the raw echo.

use crate::config::EndpointSpec;
use crate::context::InferenceContext;
use crate::engine::{EngineOptions, Provider};
use crate::tools::ToolChoice;
use crate::types::{
    AiMessage, AiPart, ChatMessage, EngineError, FunctionCall, RawEcho, Session, Usage,
    UserMessage, UserPart, WireFormat,
};
use crate::utils;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Serialize)]
struct ResponsesRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
    input: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    store: bool,
    include: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ResponsesResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    incomplete_details: Option<IncompleteDetails>,
    #[serde(default)]
    output: Vec<OutputItem>,
    #[serde(default)]
    usage: Option<ResponsesUsage>,
}

#[derive(Debug, Deserialize)]
struct IncompleteDetails {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputItem {
    Message {
        #[serde(default)]
        content: Vec<OutputContent>,
    },
    Reasoning {
        #[serde(default)]
        summary: Vec<TextItem>,
        #[serde(default)]
        content: Vec<TextItem>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputContent {
    OutputText { text: String },
}

/// Summary and reasoning entries both reduce to a text payload here; the
/// full item (with its type tags and encrypted content) survives in the
/// raw echo.
#[derive(Debug, Deserialize)]
struct TextItem {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ResponsesUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    #[serde(default)]
    input_tokens_details: Option<InputTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct InputTokensDetails {
    #[serde(default)]
    cached_tokens: u32,
}

pub struct OpenAIResponsesClient {
    client: Client,
    options: Arc<EngineOptions>,
}

impl OpenAIResponsesClient {
    pub fn new(options: Arc<EngineOptions>) -> Result<Self> {
        let client = utils::http_client(&options.endpoint)?;
        Ok(Self { client, options })
    }

    fn build_request(&self, session: &Session) -> Result<Value> {
        let endpoint = &self.options.endpoint;
        let (tools, tool_choice) = self.marshal_tools();
        let request = ResponsesRequest {
            model: endpoint.model.clone(),
            instructions: session.developer.as_ref().map(|dev| dev.text()),
            input: marshal_input(session),
            tools,
            tool_choice,
            store: false,
            include: vec!["reasoning.encrypted_content".to_string()],
        };
        Ok(utils::apply_custom(
            serde_json::to_value(request)?,
            endpoint,
        ))
    }

    fn marshal_tools(&self) -> (Option<Vec<Value>>, Option<Value>) {
        let options = &self.options;
        // Tool entries are flat on this protocol, not nested under
        // "function" as in Chat Completions.
        let tools: Vec<Value> = options
            .declarations
            .iter()
            .filter(|(name, _)| options.tool_choice.offers(name))
            .map(|(name, declaration)| {
                let mut tool = serde_json::Map::new();
                tool.insert("type".to_string(), json!("function"));
                tool.insert("name".to_string(), json!(name));
                if let Some(description) = &declaration.description {
                    tool.insert("description".to_string(), json!(description));
                }
                tool.insert("parameters".to_string(), declaration.parameters.clone());
                Value::Object(tool)
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
                Some(name) => json!({"type": "function", "name": name}),
                None => json!("auto"),
            },
        };
        (Some(tools), Some(choice))
    }
}

#[async_trait]
impl Provider for OpenAIResponsesClient {
    async fn fetch(&self, ctx: &InferenceContext, session: &Session) -> Result<AiMessage> {
        let body = self.build_request(session)?;
        debug!(endpoint = %self.options.endpoint.name, "Sending responses request");
        ctx.log_message(&body);

        let response = self
            .client
            .post(format!("{}/responses", self.options.endpoint.base()))
            .bearer_auth(&self.options.endpoint.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Network(e.to_string()))?;
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

    fn endpoint(&self) -> &EndpointSpec {
        &self.options.endpoint
    }
}

fn marshal_input(session: &Session) -> Vec<Value> {
    let mut items = Vec::new();
    for message in &session.messages {
        match message {
            ChatMessage::User(user) => marshal_user(user, &mut items),
            ChatMessage::Ai(ai) => marshal_assistant(ai, &mut items),
        }
    }
    items
}

fn marshal_user(user: &UserMessage, items: &mut Vec<Value>) {
    let mut content = Vec::new();
    for part in &user.parts {
        match part {
            UserPart::Text(text) => content.push(json!({"type": "input_text", "text": text})),
            UserPart::FunctionResponse(response) => {
                // Function outputs are top-level items; flush gathered text
                // first to keep part order.
                if !content.is_empty() {
                    items.push(user_message(std::mem::take(&mut content)));
                }
                items.push(json!({
                    "type": "function_call_output",
                    "call_id": response.id.clone().unwrap_or_else(|| response.name.clone()),
                    "output": response.text,
                }));
            }
        }
    }
    if !content.is_empty() {
        items.push(user_message(content));
    }
}

fn user_message(content: Vec<Value>) -> Value {
    json!({"type": "message", "role": "user", "content": content})
}

/// Echoes the previously parsed output items verbatim when they came from
/// this protocol — the only way encrypted reasoning items survive replay.
/// Reconstructs message and function-call items otherwise.
fn marshal_assistant(message: &AiMessage, items: &mut Vec<Value>) {
    if let Some(Value::Array(raw_items)) = message.raw_for(WireFormat::Responses) {
        items.extend(raw_items.iter().cloned());
        return;
    }
    let text = message.text();
    if !text.is_empty() {
        items.push(json!({
            "type": "message",
            "role": "assistant",
            "content": [{"type": "output_text", "text": text}],
        }));
    }
    for call in message.function_calls() {
        items.push(json!({
            "type": "function_call",
            "call_id": call.id.clone().unwrap_or_else(|| call.name.clone()),
            "name": call.name,
            "arguments": call.args.to_string(),
        }));
    }
}

fn parse_response(ctx: &InferenceContext, body: Value) -> Result<AiMessage> {
    let response: ResponsesResponse = serde_json::from_value(body.clone())
        .map_err(|e| EngineError::ResponseInvalid(format!("Unexpected response shape: {e}")))?;
    check_status(
        response.status.as_deref(),
        response.incomplete_details.as_ref(),
    )?;

    let mut parts = Vec::new();
    for item in response.output {
        match item {
            OutputItem::Message { content } => {
                let mut text = String::new();
                for OutputContent::OutputText { text: segment } in content {
                    text.push_str(&segment);
                }
                if !text.is_empty() {
                    ctx.log_inference(&text);
                    parts.push(AiPart::Text(text));
                }
            }
            OutputItem::Reasoning { summary, content } => {
                for entry in summary.iter().chain(content.iter()) {
                    if !entry.text.is_empty() {
                        ctx.log_reasoning(&entry.text);
                    }
                }
            }
            OutputItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                let args = utils::parse_arguments(&name, &arguments)?;
                parts.push(AiPart::FunctionCall(FunctionCall {
                    id: Some(call_id),
                    name,
                    args,
                }));
            }
        }
    }

    Ok(AiMessage {
        parts,
        raw: body.get("output").map(|output| RawEcho {
            format: WireFormat::Responses,
            payload: output.clone(),
        }),
        usage: response.usage.map(normalize_usage),
    })
}

fn check_status(status: Option<&str>, details: Option<&IncompleteDetails>) -> Result<()> {
    match status {
        Some("completed") => Ok(()),
        Some("incomplete") => {
            let reason = details
                .and_then(|d| d.reason.as_deref())
                .unwrap_or("unspecified");
            if reason == "max_output_tokens" {
                Err(EngineError::ResponseInvalid(
                    "Response truncated: token limit reached".to_string(),
                )
                .into())
            } else {
                Err(
                    EngineError::ResponseInvalid(format!("Response incomplete: {reason}"))
                        .into(),
                )
            }
        }
        Some(other) => {
            Err(EngineError::ResponseInvalid(format!("Abnormal response status '{other}'")).into())
        }
        None => Err(EngineError::ResponseInvalid("Missing response status".to_string()).into()),
    }
}

fn normalize_usage(usage: ResponsesUsage) -> Usage {
    Usage {
        prompt_tokens: usage.input_tokens,
        cached_tokens: usage.input_tokens_details.map_or(0, |d| d.cached_tokens),
        completion_tokens: usage.output_tokens,
        // Reasoning tokens are already inside output_tokens here.
        thought_tokens: 0,
        billed: None,
    }
}
