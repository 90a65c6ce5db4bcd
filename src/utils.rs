//! Shared HTTP plumbing and request-body helpers used by every adaptor.

use crate::config::EndpointSpec;
use crate::types::EngineError;
use anyhow::{Context, Result};
use reqwest::{Response, StatusCode};
use serde_json::Value;

/// Builds the per-engine HTTP client, applying the endpoint's proxy.
/// Failures here are construction-time config errors.
pub fn http_client(spec: &EndpointSpec) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(proxy) = &spec.proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .with_context(|| format!("Invalid proxy URL '{proxy}' for endpoint '{}'", spec.name))?;
        builder = builder.proxy(proxy);
    }
    builder.build().context("Failed to build HTTP client")
}

/// Maps non-success statuses onto the error taxonomy before any parsing.
/// 429 and 5xx are network-class (retryable); 401/403/400 are fatal.
/// Returns the response untouched when the status is a success.
pub async fn check_response_error(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .map_err(|e| EngineError::Network(e.to_string()))?;

    let error = match status {
        StatusCode::TOO_MANY_REQUESTS => {
            EngineError::Network(format!("Rate limited (429): {body}"))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => EngineError::Authentication(body),
        StatusCode::BAD_REQUEST => EngineError::InvalidRequest(body),
        status if status.is_server_error() => {
            EngineError::Network(format!("Server error ({status}): {body}"))
        }
        status => EngineError::InvalidRequest(format!("Status {status}: {body}")),
    };

    Err(error.into())
}

/// Recursively merges `overlay` into `base`: objects merge key-wise with
/// overlay values winning, everything else is replaced by the overlay.
pub fn merge_json(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

/// Deep-merges the endpoint's custom request extensions into an assembled
/// wire body. No-op without custom options.
pub fn apply_custom(body: Value, spec: &EndpointSpec) -> Value {
    match &spec.custom {
        Some(custom) => merge_json(body, custom.clone()),
        None => body,
    }
}

/// Parses a vendor-supplied argument string into JSON. Vendors send an
/// empty string for zero-argument calls.
pub fn parse_arguments(name: &str, arguments: &str) -> Result<Value> {
    if arguments.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(arguments).map_err(|e| {
        EngineError::ResponseInvalid(format!("Invalid JSON in arguments of '{name}': {e}")).into()
    })
}
