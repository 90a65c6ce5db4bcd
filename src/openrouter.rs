//! OpenRouter adaptor: Chat Completions plus usage-based billing and a
//! workaround for the upstream chunked-body bug.

use crate::config::EndpointSpec;
use crate::context::InferenceContext;
use crate::engine::{EngineOptions, Provider};
use crate::openai::{OpenAIClient, RequestCustomizer};
use crate::types::{AiMessage, EngineError, Session};
use crate::utils;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Custom-options key holding the dollar-to-accounting-currency rate.
/// Adaptor configuration, not a wire parameter; stripped before the
/// remaining custom options merge into requests.
const EXCHANGE_RATE_KEY: &str = "exchange_rate";

struct OpenRouterCustomizer;

impl RequestCustomizer for OpenRouterCustomizer {
    fn customize_request(&self, request: &mut Value) {
        // Opt into the usage block that carries the pre-computed cost.
        *request = utils::merge_json(request.take(), json!({"usage": {"include": true}}));
    }
}

pub struct OpenRouterClient {
    inner: OpenAIClient,
    endpoint: EndpointSpec,
    exchange_rate: f64,
}

impl OpenRouterClient {
    pub fn new(options: Arc<EngineOptions>, streaming: bool) -> Result<Self> {
        let endpoint = options.endpoint.clone();
        let (exchange_rate, stripped) = split_exchange_rate(&endpoint)?;
        let inner_options = Arc::new(EngineOptions {
            endpoint: stripped,
            declarations: options.declarations.clone(),
            tool_choice: options.tool_choice.clone(),
            throttle: options.throttle.clone(),
        });
        let inner = OpenAIClient::with_customizer(
            inner_options,
            streaming,
            Box::new(OpenRouterCustomizer),
        )?;
        Ok(Self {
            inner,
            endpoint,
            exchange_rate,
        })
    }
}

#[async_trait]
impl Provider for OpenRouterClient {
    async fn fetch(&self, ctx: &InferenceContext, session: &Session) -> Result<AiMessage> {
        let mut message = match self.inner.fetch(ctx, session).await {
            Ok(message) => message,
            Err(error) => return Err(reclassify_terminated(error)),
        };
        apply_exchange_rate(&mut message, self.exchange_rate);
        Ok(message)
    }

    fn endpoint(&self) -> &EndpointSpec {
        &self.endpoint
    }
}

/// Pulls `exchange_rate` out of the endpoint's custom options, leaving the
/// rest for request merging. Missing means 1.0 (cost already in the
/// accounting currency).
fn split_exchange_rate(endpoint: &EndpointSpec) -> Result<(f64, EndpointSpec)> {
    let mut stripped = endpoint.clone();
    let mut rate = 1.0;
    if let Some(Value::Object(custom)) = &mut stripped.custom {
        if let Some(value) = custom.remove(EXCHANGE_RATE_KEY) {
            rate = value.as_f64().ok_or_else(|| {
                anyhow!(
                    "Endpoint '{}': {EXCHANGE_RATE_KEY} must be a number, got {value}",
                    endpoint.name
                )
            })?;
        }
        if custom.is_empty() {
            stripped.custom = None;
        }
    }
    Ok((rate, stripped))
}

/// The vendor reports `usage.cost` in dollars; convert it into the
/// accounting currency the price sheet uses.
fn apply_exchange_rate(message: &mut AiMessage, rate: f64) {
    if let Some(usage) = &mut message.usage {
        if let Some(billed) = &mut usage.billed {
            *billed *= rate;
        }
    }
}

/// OpenRouter sporadically kills streamed chunked bodies with an error whose
/// message contains "terminated" (known upstream bug). Upgrade exactly that
/// case to a retryable network fault; all other non-transient errors pass
/// through untouched.
fn reclassify_terminated(error: anyhow::Error) -> anyhow::Error {
    let transient = error
        .downcast_ref::<EngineError>()
        .is_some_and(EngineError::is_transient);
    if !transient && format!("{error:#}").contains("terminated") {
        warn!("Treating upstream 'terminated' failure as retryable: {error:#}");
        return EngineError::Network(format!("{error:#}")).into();
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiType;
    use crate::types::Usage;

    fn endpoint_with_custom(custom: Option<Value>) -> EndpointSpec {
        let mut endpoint = EndpointSpec::new(
            ApiType::OpenRouter,
            "router",
            "https://openrouter.ai/api/v1",
            "sk-or",
            "anthropic/claude-sonnet-4",
        );
        endpoint.custom = custom;
        endpoint
    }

    #[test]
    fn exchange_rate_is_stripped_from_custom_options() {
        let endpoint = endpoint_with_custom(Some(json!({
            "exchange_rate": 7.2,
            "reasoning": {"effort": "high"}
        })));
        let (rate, stripped) = split_exchange_rate(&endpoint).unwrap();
        assert_eq!(rate, 7.2);
        assert_eq!(stripped.custom, Some(json!({"reasoning": {"effort": "high"}})));

        // A custom block holding only the rate disappears entirely.
        let endpoint = endpoint_with_custom(Some(json!({"exchange_rate": 7.2})));
        let (_, stripped) = split_exchange_rate(&endpoint).unwrap();
        assert!(stripped.custom.is_none());

        let (rate, _) = split_exchange_rate(&endpoint_with_custom(None)).unwrap();
        assert_eq!(rate, 1.0);
    }

    #[test]
    fn non_numeric_exchange_rate_is_a_construction_error() {
        let endpoint = endpoint_with_custom(Some(json!({"exchange_rate": "7.2"})));
        let err = split_exchange_rate(&endpoint).unwrap_err();
        assert!(err.to_string().contains("must be a number"), "{err}");
    }

    #[test]
    fn billed_cost_is_converted() {
        let mut message = AiMessage::from_text("ok");
        message.usage = Some(Usage {
            billed: Some(0.5),
            ..Usage::zero()
        });
        apply_exchange_rate(&mut message, 7.2);
        let billed = message.usage.unwrap().billed.unwrap();
        assert!((billed - 3.6).abs() < 1e-12, "{billed}");

        // No usage, no conversion to do.
        let mut message = AiMessage::from_text("ok");
        apply_exchange_rate(&mut message, 7.2);
        assert!(message.usage.is_none());
    }

    #[test]
    fn terminated_errors_become_retryable() {
        let error = reclassify_terminated(anyhow!("error reading a body from connection: terminated"));
        match error.downcast_ref::<EngineError>() {
            Some(EngineError::Network(msg)) => assert!(msg.contains("terminated"), "{msg}"),
            other => panic!("expected Network, got {other:?}"),
        }
    }

    #[test]
    fn other_fatal_errors_pass_through() {
        let error = reclassify_terminated(EngineError::Authentication("bad key".into()).into());
        assert!(matches!(
            error.downcast_ref::<EngineError>(),
            Some(EngineError::Authentication(_))
        ));

        // Already-transient errors are left exactly as classified.
        let error = reclassify_terminated(EngineError::Network("connection reset".into()).into());
        match error.downcast_ref::<EngineError>() {
            Some(EngineError::Network(msg)) => assert_eq!(msg, "connection reset"),
            other => panic!("expected Network, got {other:?}"),
        }
    }

    #[test]
    fn usage_include_is_merged_into_requests() {
        let mut request = json!({"model": "m", "messages": []});
        OpenRouterCustomizer.customize_request(&mut request);
        assert_eq!(request["usage"], json!({"include": true}));
        assert_eq!(request["model"], "m");
    }
}
