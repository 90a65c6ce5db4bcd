//! The generic engine: one retry/timeout/throttle driver wrapped around a
//! vendor-specific fetch.

use crate::config::EndpointSpec;
use crate::context::InferenceContext;
use crate::throttle::Throttle;
use crate::tools::{self, DeclarationMap, ToolChoice};
use crate::types::{AiMessage, EngineError, Session, Usage};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Extra attempts spent on transient failures after the first try.
pub const RETRY_LIMIT: u32 = 3;

/// One vendor protocol implementation.
///
/// `fetch` performs a single un-retried round trip: marshal the session,
/// send it, parse the vendor response into a normalized message. Retries,
/// throttling, deadlines, and post-parse validation all belong to the
/// [`Engine`] driver, so implementations stay a pure wire concern.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn fetch(&self, ctx: &InferenceContext, session: &Session) -> Result<AiMessage>;

    fn endpoint(&self) -> &EndpointSpec;
}

/// Everything an engine (and its provider) is constructed from.
///
/// The throttle defaults to a fresh one built from the endpoint's rpm/tpm;
/// call sites running several engines against the same (base_url, model)
/// pair must inject one shared instance via [`EngineOptions::with_throttle`],
/// otherwise the limits are not enforced jointly.
#[derive(Debug)]
pub struct EngineOptions {
    pub endpoint: EndpointSpec,
    pub declarations: DeclarationMap,
    pub tool_choice: ToolChoice,
    pub throttle: Arc<Throttle>,
}

impl EngineOptions {
    pub fn new(
        endpoint: EndpointSpec,
        declarations: DeclarationMap,
        tool_choice: ToolChoice,
    ) -> Self {
        let throttle = Arc::new(Throttle::new(endpoint.rpm, endpoint.tpm));
        Self {
            endpoint,
            declarations,
            tool_choice,
            throttle,
        }
    }

    pub fn with_throttle(mut self, throttle: Arc<Throttle>) -> Self {
        self.throttle = throttle;
        self
    }
}

/// A vendor+model binding ready for inference calls. Cheap to share across
/// tasks (`&self` methods only); conversation state lives in the caller's
/// [`Session`].
pub struct Engine {
    options: Arc<EngineOptions>,
    provider: Box<dyn Provider>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub(crate) fn from_parts(options: Arc<EngineOptions>, provider: Box<dyn Provider>) -> Self {
        Self { options, provider }
    }

    pub fn endpoint(&self) -> &EndpointSpec {
        &self.options.endpoint
    }

    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.options.throttle
    }

    /// One logical inference call. Transient failures (invalid response,
    /// network fault, timeout) are retried up to [`RETRY_LIMIT`] extra
    /// times with no delay of their own — the throttle's spacing is the
    /// implicit backoff. The session is not mutated.
    pub async fn stateless(
        &self,
        ctx: &InferenceContext,
        session: &Session,
    ) -> Result<AiMessage> {
        let mut attempt = 1u32;
        loop {
            if ctx.is_cancelled() {
                return Err(EngineError::Aborted.into());
            }

            match self.attempt(ctx, session).await {
                Ok(message) => return Ok(message),
                Err(error) => {
                    // The user signal wins over whatever else went wrong,
                    // including a timeout that fired in the same race.
                    let aborted = matches!(
                        error.downcast_ref::<EngineError>(),
                        Some(EngineError::Aborted)
                    );
                    if aborted || ctx.is_cancelled() {
                        return Err(EngineError::Aborted.into());
                    }

                    let transient = error
                        .downcast_ref::<EngineError>()
                        .is_some_and(EngineError::is_transient);
                    if !transient {
                        return Err(error);
                    }
                    if attempt > RETRY_LIMIT {
                        return Err(EngineError::RetryExhausted {
                            attempts: attempt,
                            source: error.into(),
                        }
                        .into());
                    }

                    warn!(
                        endpoint = %self.options.endpoint.name,
                        attempt,
                        "Transient inference failure, retrying: {error:#}"
                    );
                    attempt += 1;
                }
            }
        }
    }

    /// [`Self::stateless`] plus appending the result to the session.
    pub async fn stateful(
        &self,
        ctx: &InferenceContext,
        session: &mut Session,
    ) -> Result<AiMessage> {
        let message = self.stateless(ctx, session).await?;
        session.push_ai(message.clone());
        Ok(message)
    }

    async fn attempt(&self, ctx: &InferenceContext, session: &Session) -> Result<AiMessage> {
        let options = &self.options;

        options.throttle.requests(ctx).await?;
        options
            .throttle
            .input_tokens(session.estimate_tokens(), ctx)
            .await?;

        let message = self.fetch_with_deadline(ctx, session).await?;

        tools::validate_response(&options.declarations, &options.tool_choice, &message)?;

        if let Some(usage) = &message.usage {
            options
                .throttle
                .output_tokens(usage.output_total() as u64)
                .await;
            let cost = call_cost(usage, &options.endpoint);
            debug!(
                endpoint = %options.endpoint.name,
                prompt_tokens = usage.prompt_tokens,
                cached_tokens = usage.cached_tokens,
                completion_tokens = usage.completion_tokens,
                cost,
                "Inference call complete"
            );
            ctx.log_cost(cost);
        }

        Ok(message)
    }

    async fn fetch_with_deadline(
        &self,
        ctx: &InferenceContext,
        session: &Session,
    ) -> Result<AiMessage> {
        let fetch = self.provider.fetch(ctx, session);
        match self.options.endpoint.timeout {
            Some(secs) => {
                let deadline = Duration::from_secs(secs);
                tokio::select! {
                    biased;
                    _ = ctx.signal.cancelled() => Err(EngineError::Aborted.into()),
                    result = fetch => result,
                    _ = tokio::time::sleep(deadline) => Err(EngineError::Timeout(deadline).into()),
                }
            }
            None => tokio::select! {
                biased;
                _ = ctx.signal.cancelled() => Err(EngineError::Aborted.into()),
                result = fetch => result,
            },
        }
    }
}

/// Cost of one completed call in the accounting currency. A vendor-supplied
/// `billed` amount overrides the price formula.
pub fn call_cost(usage: &Usage, endpoint: &EndpointSpec) -> f64 {
    if let Some(billed) = usage.billed {
        return billed;
    }
    let cached = usage.cached_tokens.min(usage.prompt_tokens);
    let miss = usage.prompt_tokens - cached;
    let cached_price = endpoint.cached_price.unwrap_or(endpoint.input_price);
    endpoint.input_price * miss as f64 / 1e6
        + cached_price * cached as f64 / 1e6
        + endpoint.output_price * usage.output_total() as f64 / 1e6
}
