//! Per-call context: cancellation signal, logger hooks, and the cooperative
//! pause gate honored during rate-limit incidents.

use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Host-facing observability sink. Every method has a no-op default; hosts
/// implement only the channels they care about. All calls are best-effort —
/// absence of a logger never changes engine behavior.
pub trait InferenceLogger: Send + Sync {
    /// Streamed human-readable response text, in arrival order.
    fn inference(&self, _text: &str) {}

    /// Streamed reasoning/thinking content. Observability only; reasoning is
    /// never part of the normalized message or replayed as history.
    fn reasoning(&self, _text: &str) {}

    /// Structured request/response payloads, for replay and debugging.
    fn message(&self, _payload: &serde_json::Value) {}

    /// Incremental cost of one completed call, in the accounting currency.
    /// Aggregation across a workflow is the host's job.
    fn cost(&self, _amount: f64) {}
}

/// Context passed into every engine call.
///
/// `signal` is the caller's cancellation token; firing it aborts the call
/// (and any retry loop) immediately. `pause_gate`, when present, is a
/// workflow-wide lock whose write side an external rate-limit-incident
/// handler takes to pause all outbound traffic; the throttle takes the read
/// side before reserving a request slot.
#[derive(Clone, Default)]
pub struct InferenceContext {
    pub signal: CancellationToken,
    pub logger: Option<Arc<dyn InferenceLogger>>,
    pub pause_gate: Option<Arc<RwLock<()>>>,
}

impl InferenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_logger(logger: Arc<dyn InferenceLogger>) -> Self {
        Self {
            logger: Some(logger),
            ..Self::default()
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    pub fn log_inference(&self, text: &str) {
        if let Some(logger) = &self.logger {
            logger.inference(text);
        }
    }

    pub fn log_reasoning(&self, text: &str) {
        tracing::trace!(reasoning = text);
        if let Some(logger) = &self.logger {
            logger.reasoning(text);
        }
    }

    pub fn log_message(&self, payload: &serde_json::Value) {
        if let Some(logger) = &self.logger {
            logger.message(payload);
        }
    }

    pub fn log_cost(&self, amount: f64) {
        if let Some(logger) = &self.logger {
            logger.cost(amount);
        }
    }
}
