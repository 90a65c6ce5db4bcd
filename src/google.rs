//! Google Generative Language adaptor: monolithic `generateContent` REST
//! protocol with the vendor's schema dialect and thought-part handling.

use crate::config::EndpointSpec;
use crate::context::InferenceContext;
use crate::engine::{EngineOptions, Provider};
use crate::tools::ToolChoice;
use crate::types::{
    AiMessage, AiPart, ChatMessage, EngineError, FunctionCall, RawEcho, Session, Usage, UserPart,
    WireFormat,
};
use crate::utils;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GoogleRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Value>,
    contents: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleResponse {
    #[serde(default)]
    candidates: Vec<GoogleCandidate>,
    usage_metadata: Option<GoogleUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleCandidate {
    content: Option<GoogleContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleContent {
    #[serde(default)]
    parts: Vec<GooglePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GooglePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: Option<bool>,
    #[serde(default)]
    function_call: Option<GoogleFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct GoogleFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    cached_content_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    /// Thinking is billed separately from candidate tokens, at the output
    /// rate.
    #[serde(default)]
    thoughts_token_count: u32,
}

pub struct GoogleClient {
    client: Client,
    options: Arc<EngineOptions>,
}

impl GoogleClient {
    pub fn new(options: Arc<EngineOptions>) -> Result<Self> {
        let client = utils::http_client(&options.endpoint)?;
        Ok(Self { client, options })
    }

    fn url(&self) -> String {
        let endpoint = &self.options.endpoint;
        format!(
            "{}/models/{}:generateContent",
            endpoint.base(),
            endpoint.model
        )
    }

    fn build_request(&self, session: &Session) -> Result<Value> {
        let (tools, tool_config) = self.marshal_declarations();
        let request = GoogleRequest {
            system_instruction: session
                .developer
                .as_ref()
                .map(|dev| json!({"parts": [{"text": dev.text()}]})),
            contents: marshal_contents(session),
            tools,
            tool_config,
        };
        Ok(utils::apply_custom(
            serde_json::to_value(request)?,
            &self.options.endpoint,
        ))
    }

    fn marshal_declarations(&self) -> (Option<Vec<Value>>, Option<Value>) {
        let options = &self.options;
        let declarations: Vec<Value> = options
            .declarations
            .iter()
            .filter(|(name, _)| options.tool_choice.offers(name))
            .map(|(name, declaration)| {
                let mut function = serde_json::Map::new();
                function.insert("name".to_string(), json!(name));
                if let Some(description) = &declaration.description {
                    function.insert("description".to_string(), json!(description));
                }
                function.insert(
                    "parameters".to_string(),
                    reencode_schema(&declaration.parameters),
                );
                Value::Object(function)
            })
            .collect();
        if declarations.is_empty() {
            return (None, None);
        }

        let config = match &options.tool_choice {
            ToolChoice::None => json!({"mode": "NONE"}),
            ToolChoice::Auto => json!({"mode": "AUTO"}),
            ToolChoice::Required => json!({"mode": "ANY"}),
            ToolChoice::Allow(names) => json!({
                "mode": "ANY",
                "allowedFunctionNames": names.iter().collect::<Vec<_>>(),
            }),
        };
        (
            Some(vec![json!({"functionDeclarations": declarations})]),
            Some(json!({"functionCallingConfig": config})),
        )
    }
}

#[async_trait]
impl Provider for GoogleClient {
    async fn fetch(&self, ctx: &InferenceContext, session: &Session) -> Result<AiMessage> {
        let body = self.build_request(session)?;
        debug!(endpoint = %self.options.endpoint.name, "Sending generateContent request");
        ctx.log_message(&body);

        let response = self
            .client
            .post(self.url())
            .query(&[("key", &self.options.endpoint.api_key)])
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

fn marshal_contents(session: &Session) -> Vec<Value> {
    let mut contents = Vec::new();
    for message in &session.messages {
        match message {
            ChatMessage::User(user) => {
                let parts: Vec<Value> = user
                    .parts
                    .iter()
                    .map(|part| match part {
                        UserPart::Text(text) => json!({"text": text}),
                        // No call ids on this protocol; the vendor correlates
                        // responses by name and order.
                        UserPart::FunctionResponse(response) => json!({
                            "functionResponse": {
                                "name": response.name,
                                "response": {"result": response.text},
                            }
                        }),
                    })
                    .collect();
                contents.push(json!({"role": "user", "parts": parts}));
            }
            ChatMessage::Ai(ai) => contents.push(marshal_model_turn(ai)),
        }
    }
    contents
}

fn marshal_model_turn(message: &AiMessage) -> Value {
    if let Some(raw) = message.raw_for(WireFormat::GoogleGenerate) {
        return raw.clone();
    }
    let parts: Vec<Value> = message
        .parts
        .iter()
        .map(|part| match part {
            AiPart::Text(text) => json!({"text": text}),
            AiPart::FunctionCall(call) => json!({
                "functionCall": {"name": call.name, "args": call.args}
            }),
        })
        .collect();
    json!({"role": "model", "parts": parts})
}

/// Re-encodes a declaration schema into the vendor's dialect: `type` values
/// become upper-case enum constants, `additionalProperties` and `$schema`
/// are stripped recursively (the API rejects them).
fn reencode_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, value) in map {
                if key == "additionalProperties" || key == "$schema" {
                    continue;
                }
                if key == "type" {
                    match value {
                        Value::String(t) => {
                            out.insert(key.clone(), json!(t.to_ascii_uppercase()));
                            continue;
                        }
                        Value::Array(types) => {
                            let upper: Vec<Value> = types
                                .iter()
                                .map(|t| match t.as_str() {
                                    Some(t) => json!(t.to_ascii_uppercase()),
                                    None => t.clone(),
                                })
                                .collect();
                            out.insert(key.clone(), Value::Array(upper));
                            continue;
                        }
                        _ => {}
                    }
                }
                out.insert(key.clone(), reencode_schema(value));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(reencode_schema).collect()),
        other => other.clone(),
    }
}

fn parse_response(ctx: &InferenceContext, body: Value) -> Result<AiMessage> {
    let response: GoogleResponse = serde_json::from_value(body.clone())
        .map_err(|e| EngineError::ResponseInvalid(format!("Unexpected response shape: {e}")))?;
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::ResponseInvalid("No candidates in response".to_string()))?;
    check_finish_reason(candidate.finish_reason.as_deref())?;
    let content = candidate
        .content
        .ok_or_else(|| EngineError::ResponseInvalid("Candidate without content".to_string()))?;

    let mut parts = Vec::new();
    for part in content.parts {
        if part.thought == Some(true) {
            if let Some(text) = &part.text {
                ctx.log_reasoning(text);
            }
            continue;
        }
        if let Some(call) = part.function_call {
            let args = if call.args.is_null() {
                json!({})
            } else {
                call.args
            };
            parts.push(AiPart::FunctionCall(FunctionCall {
                id: None,
                name: call.name,
                args,
            }));
        } else if let Some(text) = part.text {
            if !text.is_empty() {
                ctx.log_inference(&text);
                parts.push(AiPart::Text(text));
            }
        } else {
            return Err(
                EngineError::ResponseInvalid("Unknown response part shape".to_string()).into(),
            );
        }
    }

    Ok(AiMessage {
        parts,
        raw: body.pointer("/candidates/0/content").map(|payload| RawEcho {
            format: WireFormat::GoogleGenerate,
            payload: payload.clone(),
        }),
        usage: response.usage_metadata.map(|u| Usage {
            prompt_tokens: u.prompt_token_count,
            cached_tokens: u.cached_content_token_count,
            completion_tokens: u.candidates_token_count,
            thought_tokens: u.thoughts_token_count,
            billed: None,
        }),
    })
}

fn check_finish_reason(reason: Option<&str>) -> Result<()> {
    match reason {
        Some("STOP") => Ok(()),
        Some("MAX_TOKENS") => Err(EngineError::ResponseInvalid(
            "Response truncated: token limit reached".to_string(),
        )
        .into()),
        Some(other) => {
            Err(EngineError::ResponseInvalid(format!("Abnormal finish reason '{other}'")).into())
        }
        None => Err(EngineError::ResponseInvalid("Missing finish reason".to_string()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiType;
    use crate::context::InferenceLogger;
    use crate::tools::{DeclarationMap, FunctionDeclaration};
    use crate::types::FunctionResponse;
    use std::sync::Mutex;

    fn client_with(declarations: DeclarationMap, tool_choice: ToolChoice) -> GoogleClient {
        let endpoint = EndpointSpec::new(
            ApiType::Google,
            "gemini",
            DEFAULT_BASE_URL,
            "key",
            "gemini-2.5-flash",
        );
        GoogleClient::new(Arc::new(EngineOptions::new(
            endpoint,
            declarations,
            tool_choice,
        )))
        .unwrap()
    }

    fn weather_declarations() -> DeclarationMap {
        let mut map = DeclarationMap::new();
        map.insert(
            "get_weather".to_string(),
            FunctionDeclaration::new(
                "Current weather",
                json!({
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "properties": {
                        "location": {"type": "string"},
                        "days": {"type": ["integer", "null"]}
                    },
                    "additionalProperties": false
                }),
            ),
        );
        map
    }

    #[test]
    fn schema_reencoding_uppercases_and_strips() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "tags": {"type": "array", "items": {"type": "string"}},
                "count": {"type": ["integer", "null"]}
            }
        });
        assert_eq!(
            reencode_schema(&schema),
            json!({
                "type": "OBJECT",
                "properties": {
                    "tags": {"type": "ARRAY", "items": {"type": "STRING"}},
                    "count": {"type": ["INTEGER", "NULL"]}
                }
            })
        );
    }

    #[test]
    fn url_names_the_model() {
        let client = client_with(DeclarationMap::new(), ToolChoice::Auto);
        assert_eq!(
            client.url(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }

    #[test]
    fn marshals_roles_and_function_parts() {
        let mut session = Session::with_developer("Be helpful.");
        session.push_user_text("Weather in Berlin?");
        session.push_ai(AiMessage {
            parts: vec![AiPart::FunctionCall(FunctionCall {
                id: None,
                name: "get_weather".to_string(),
                args: json!({"location": "Berlin"}),
            })],
            raw: None,
            usage: None,
        });
        session.push_function_responses(vec![FunctionResponse {
            id: None,
            name: "get_weather".to_string(),
            text: "Sunny".to_string(),
        }]);

        let client = client_with(DeclarationMap::new(), ToolChoice::Auto);
        let body = client.build_request(&session).unwrap();

        assert_eq!(
            body["systemInstruction"],
            json!({"parts": [{"text": "Be helpful."}]})
        );
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(
            contents[1]["parts"][0]["functionCall"]["name"],
            "get_weather"
        );
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"],
            json!({"name": "get_weather", "response": {"result": "Sunny"}})
        );
    }

    #[test]
    fn matching_raw_content_is_echoed() {
        let raw = json!({
            "role": "model",
            "parts": [
                {"text": "thinking...", "thought": true, "thoughtSignature": "sig"},
                {"text": "Done."}
            ]
        });
        let mut message = AiMessage::from_text("Done.");
        message.raw = Some(RawEcho {
            format: WireFormat::GoogleGenerate,
            payload: raw.clone(),
        });
        assert_eq!(marshal_model_turn(&message), raw);

        message.raw = Some(RawEcho {
            format: WireFormat::ChatCompletions,
            payload: raw,
        });
        let rebuilt = marshal_model_turn(&message);
        assert_eq!(rebuilt, json!({"role": "model", "parts": [{"text": "Done."}]}));
    }

    #[test]
    fn tool_config_modes() {
        let (tools, config) =
            client_with(weather_declarations(), ToolChoice::Auto).marshal_declarations();
        let tools = tools.unwrap();
        assert_eq!(
            tools[0]["functionDeclarations"][0]["parameters"]["type"],
            "OBJECT"
        );
        assert_eq!(
            config.unwrap()["functionCallingConfig"],
            json!({"mode": "AUTO"})
        );

        let (_, config) =
            client_with(weather_declarations(), ToolChoice::Required).marshal_declarations();
        assert_eq!(
            config.unwrap()["functionCallingConfig"],
            json!({"mode": "ANY"})
        );

        let (_, config) = client_with(
            weather_declarations(),
            ToolChoice::allow(["get_weather"]),
        )
        .marshal_declarations();
        assert_eq!(
            config.unwrap()["functionCallingConfig"],
            json!({"mode": "ANY", "allowedFunctionNames": ["get_weather"]})
        );

        let (tools, config) =
            client_with(weather_declarations(), ToolChoice::None).marshal_declarations();
        assert!(tools.is_none());
        assert!(config.is_none());
    }

    #[test]
    fn parses_response_with_thought_parts() {
        #[derive(Default)]
        struct Recorder {
            reasoning: Mutex<String>,
        }
        impl InferenceLogger for Recorder {
            fn reasoning(&self, text: &str) {
                self.reasoning.lock().unwrap().push_str(text);
            }
        }

        let body = json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "I should check the weather.", "thought": true},
                        {"text": "Let me look that up."},
                        {"functionCall": {"name": "get_weather", "args": {"location": "Berlin"}}}
                    ]
                },
                "finishReason": "STOP"
            }],
            "usageMetadata": {
                "promptTokenCount": 1000,
                "cachedContentTokenCount": 400,
                "candidatesTokenCount": 100,
                "thoughtsTokenCount": 50
            }
        });

        let recorder = Arc::new(Recorder::default());
        let ctx = InferenceContext::with_logger(recorder.clone());
        let message = parse_response(&ctx, body).unwrap();

        // Thought parts feed the reasoning channel but not the message.
        assert_eq!(message.text(), "Let me look that up.");
        assert_eq!(
            recorder.reasoning.lock().unwrap().as_str(),
            "I should check the weather."
        );

        let call = message.function_calls().next().unwrap();
        assert!(call.id.is_none());
        assert_eq!(call.args, json!({"location": "Berlin"}));

        let usage = message.usage.unwrap();
        assert_eq!(usage.thought_tokens, 50);
        assert_eq!(usage.output_total(), 150);

        // The raw content (thought part included) survives for echoing.
        let raw = message.raw.unwrap();
        assert_eq!(raw.format, WireFormat::GoogleGenerate);
        assert_eq!(raw.payload["parts"][0]["thought"], json!(true));
    }

    #[test]
    fn null_args_normalize_to_empty_object() {
        let body = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"functionCall": {"name": "ping"}}]},
                "finishReason": "STOP"
            }]
        });
        let message = parse_response(&InferenceContext::new(), body).unwrap();
        assert_eq!(message.function_calls().next().unwrap().args, json!({}));
    }

    #[test]
    fn finish_reason_policing() {
        fn body_with(reason: &str) -> Value {
            json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "x"}]},
                    "finishReason": reason
                }]
            })
        }

        let err = parse_response(&InferenceContext::new(), body_with("MAX_TOKENS"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("truncated"), "{err}");

        let err = parse_response(&InferenceContext::new(), body_with("SAFETY"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("Abnormal finish reason"), "{err}");

        let err = parse_response(&InferenceContext::new(), json!({"candidates": []}))
            .unwrap_err()
            .to_string();
        assert!(err.contains("No candidates"), "{err}");
    }
}
