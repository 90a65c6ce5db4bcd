//! Endpoint configuration consumed at engine construction. Loading and
//! validating config files is the host's job; this crate only defines the
//! shape it consumes.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Selects which vendor protocol adaptor an engine speaks. Monolithic and
/// streaming variants of the same wire protocol are separate entries because
/// deployments choose them per endpoint.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiType {
    OpenAI,
    OpenAIStream,
    OpenAIResponses,
    Google,
    Anthropic,
    OpenRouter,
    OpenRouterStream,
    Qwen,
    QwenStream,
}

/// One vendor endpoint binding. Immutable once an engine is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// Logical endpoint id, used in logs and error messages.
    pub name: String,
    /// Empty means the adaptor's well-known default URL.
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    pub api_type: ApiType,
    /// Currency per million prompt tokens.
    #[serde(default)]
    pub input_price: f64,
    /// Currency per million completion (and thinking) tokens.
    #[serde(default)]
    pub output_price: f64,
    /// Currency per million cache-read tokens. Defaults to `input_price`
    /// (no cache discount).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_price: Option<f64>,
    /// Requests per minute; unset disables request pacing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpm: Option<u32>,
    /// Tokens per minute; unset disables token budgeting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tpm: Option<u32>,
    /// Per-attempt deadline in seconds; unset means no deadline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Upstream HTTP proxy applied to all calls of this endpoint. Explicit
    /// config — engine code never reads the process environment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    /// Vendor-specific request extensions, deep-merged into every wire
    /// request body (objects merge, scalars and arrays replace).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom: Option<serde_json::Value>,
}

impl EndpointSpec {
    pub fn new(
        api_type: ApiType,
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            api_type,
            input_price: 0.0,
            output_price: 0.0,
            cached_price: None,
            rpm: None,
            tpm: None,
            timeout: None,
            proxy: None,
            custom: None,
        }
    }

    /// Base URL without a trailing slash, ready for path concatenation.
    pub fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// Looks up one key inside `custom` without consuming it.
    pub fn custom_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.custom.as_ref()?.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_minimal_spec() {
        let spec: EndpointSpec = serde_json::from_value(json!({
            "name": "main",
            "base_url": "https://api.openai.com/v1/",
            "api_key": "sk-test",
            "model": "gpt-4.1",
            "api_type": "OpenAI"
        }))
        .unwrap();
        assert_eq!(spec.api_type, ApiType::OpenAI);
        assert_eq!(spec.base(), "https://api.openai.com/v1");
        assert_eq!(spec.input_price, 0.0);
        assert!(spec.rpm.is_none());
    }

    #[test]
    fn unknown_api_type_fails_to_parse() {
        let result = serde_json::from_value::<EndpointSpec>(json!({
            "name": "main",
            "base_url": "https://example.com",
            "model": "m",
            "api_type": "FrontierCo"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn custom_value_lookup() {
        let mut spec = EndpointSpec::new(ApiType::Qwen, "q", "https://x", "k", "qwen-max");
        assert!(spec.custom_value("enable_thinking").is_none());
        spec.custom = Some(json!({"enable_thinking": true}));
        assert_eq!(
            spec.custom_value("enable_thinking"),
            Some(&json!(true))
        );
    }
}
