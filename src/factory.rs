//! Engine construction: maps an endpoint's `ApiType` onto the concrete
//! vendor adaptor and wires up the shared options bundle.

use crate::anthropic::AnthropicClient;
use crate::config::{ApiType, EndpointSpec};
use crate::engine::{Engine, EngineOptions, Provider};
use crate::google::GoogleClient;
use crate::openai::OpenAIClient;
use crate::openai_responses::OpenAIResponsesClient;
use crate::openrouter::OpenRouterClient;
use crate::qwen::QwenClient;
use crate::throttle::Throttle;
use crate::tools::{self, DeclarationMap, ToolChoice};
use anyhow::Result;
use std::sync::Arc;

/// The adaptor's well-known API root, substituted when an endpoint leaves
/// `base_url` empty.
pub fn default_base_url(api_type: ApiType) -> &'static str {
    match api_type {
        ApiType::OpenAI | ApiType::OpenAIStream => crate::openai::DEFAULT_BASE_URL,
        ApiType::OpenAIResponses => crate::openai_responses::DEFAULT_BASE_URL,
        ApiType::Google => crate::google::DEFAULT_BASE_URL,
        ApiType::Anthropic => crate::anthropic::DEFAULT_BASE_URL,
        ApiType::OpenRouter | ApiType::OpenRouterStream => crate::openrouter::DEFAULT_BASE_URL,
        ApiType::Qwen | ApiType::QwenStream => crate::qwen::DEFAULT_BASE_URL,
    }
}

/// Builds an engine bound to one endpoint, with a fresh throttle sized from
/// the endpoint's rpm/tpm limits. Configuration problems — a malformed
/// declaration schema, a bad proxy URL — fail here rather than on the
/// first inference call.
pub fn create_engine(
    endpoint: EndpointSpec,
    declarations: DeclarationMap,
    tool_choice: ToolChoice,
) -> Result<Engine> {
    tools::check_declarations(&declarations)?;
    let endpoint = with_default_base_url(endpoint);
    assemble(EngineOptions::new(endpoint, declarations, tool_choice))
}

/// Like [`create_engine`], but with an injected throttle. Engines calling
/// the same (base URL, model) pair must share one throttle, or the vendor's
/// limits are not enforced jointly.
pub fn create_engine_with_throttle(
    endpoint: EndpointSpec,
    declarations: DeclarationMap,
    tool_choice: ToolChoice,
    throttle: Arc<Throttle>,
) -> Result<Engine> {
    tools::check_declarations(&declarations)?;
    let endpoint = with_default_base_url(endpoint);
    assemble(EngineOptions::new(endpoint, declarations, tool_choice).with_throttle(throttle))
}

fn with_default_base_url(mut endpoint: EndpointSpec) -> EndpointSpec {
    if endpoint.base_url.is_empty() {
        endpoint.base_url = default_base_url(endpoint.api_type).to_string();
    }
    endpoint
}

fn assemble(options: EngineOptions) -> Result<Engine> {
    let options = Arc::new(options);
    let provider = build_provider(options.clone())?;
    Ok(Engine::from_parts(options, provider))
}

fn build_provider(options: Arc<EngineOptions>) -> Result<Box<dyn Provider>> {
    let provider: Box<dyn Provider> = match options.endpoint.api_type {
        ApiType::OpenAI => Box::new(OpenAIClient::new(options, false)?),
        ApiType::OpenAIStream => Box::new(OpenAIClient::new(options, true)?),
        ApiType::OpenAIResponses => Box::new(OpenAIResponsesClient::new(options)?),
        ApiType::Google => Box::new(GoogleClient::new(options)?),
        ApiType::Anthropic => Box::new(AnthropicClient::new(options)?),
        ApiType::OpenRouter => Box::new(OpenRouterClient::new(options, false)?),
        ApiType::OpenRouterStream => Box::new(OpenRouterClient::new(options, true)?),
        ApiType::Qwen => Box::new(QwenClient::new(options, false)?),
        ApiType::QwenStream => Box::new(QwenClient::new(options, true)?),
    };
    Ok(provider)
}
