//! Aliyun DashScope (Qwen) adaptor: Chat Completions against the
//! compatible-mode endpoint, with the thinking-mode switch handled.

use crate::config::EndpointSpec;
use crate::context::InferenceContext;
use crate::engine::{EngineOptions, Provider};
use crate::openai::{OpenAIClient, RequestCustomizer};
use crate::types::{AiMessage, Session};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub const DEFAULT_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

const ENABLE_THINKING_KEY: &str = "enable_thinking";

struct QwenCustomizer {
    streaming: bool,
}

impl RequestCustomizer for QwenCustomizer {
    fn customize_request(&self, request: &mut Value) {
        // DashScope rejects `enable_thinking` on monolithic calls; the
        // switch only exists for streaming, so drop it from merged custom
        // options rather than failing the whole request.
        if !self.streaming {
            if let Some(body) = request.as_object_mut() {
                body.remove(ENABLE_THINKING_KEY);
            }
        }
    }
}

/// Thin wrapper: DashScope speaks stock Chat Completions (including the
/// `reasoning_content` dialect, which the inner client already surfaces as
/// trace-only reasoning).
pub struct QwenClient {
    inner: OpenAIClient,
}

impl QwenClient {
    pub fn new(options: Arc<EngineOptions>, streaming: bool) -> Result<Self> {
        let inner = OpenAIClient::with_customizer(
            options,
            streaming,
            Box::new(QwenCustomizer { streaming }),
        )?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl Provider for QwenClient {
    async fn fetch(&self, ctx: &InferenceContext, session: &Session) -> Result<AiMessage> {
        self.inner.fetch(ctx, session).await
    }

    fn endpoint(&self) -> &EndpointSpec {
        self.inner.endpoint()
    }
}
