//! Function/tool declarations and the tool-choice policy.

use crate::schema;
use crate::types::{AiMessage, EngineError};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One callable function offered to the model: an optional description plus
/// the JSON-schema its arguments must conform to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

impl FunctionDeclaration {
    pub fn new(description: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            description: Some(description.into()),
            parameters,
        }
    }
}

/// Name-keyed declaration map. Ordered so marshalled tool lists are stable
/// across calls, which keeps prompt caches warm.
pub type DeclarationMap = BTreeMap<String, FunctionDeclaration>;

/// Checks every declaration's parameter schema once, at engine
/// construction, so malformed declarations fail fast.
pub fn check_declarations(declarations: &DeclarationMap) -> Result<()> {
    for (name, declaration) in declarations {
        schema::check_schema(&declaration.parameters)
            .map_err(|e| anyhow::anyhow!("declaration '{name}': {e}"))?;
    }
    Ok(())
}

/// Policy on whether/which declared functions the model may call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum ToolChoice {
    /// The model must not call functions.
    None,
    /// The model decides freely.
    #[default]
    Auto,
    /// The model must call at least one function.
    Required,
    /// The model may only call the named functions.
    Allow(BTreeSet<String>),
}

impl ToolChoice {
    pub fn allow<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Allow(names.into_iter().map(Into::into).collect())
    }

    /// The single allowed name, when the allow-list has exactly one entry.
    /// Vendors without a native allow-list concept degrade this case to
    /// their "forced tool" request shape.
    pub fn sole_allowed(&self) -> Option<&str> {
        match self {
            Self::Allow(names) if names.len() == 1 => names.iter().next().map(String::as_str),
            _ => None,
        }
    }

    /// Whether a declaration should be marshalled into the request at all.
    /// Multi-entry allow-lists are emulated on vendors without native
    /// support by offering only the allowed subset.
    pub fn offers(&self, name: &str) -> bool {
        match self {
            Self::None => false,
            Self::Auto | Self::Required => true,
            Self::Allow(names) => names.contains(name),
        }
    }
}

/// Validates every function call in a parsed response against the
/// declaration map, then checks the tool-choice post-condition. Violations
/// are `ResponseInvalid` — the expected trigger for a retry, since the model
/// may reissue a compliant response on the next attempt.
pub fn validate_response(
    declarations: &DeclarationMap,
    choice: &ToolChoice,
    message: &AiMessage,
) -> Result<()> {
    let calls: Vec<_> = message.function_calls().collect();

    for call in &calls {
        let declaration = declarations.get(&call.name).ok_or_else(|| {
            EngineError::ResponseInvalid(format!("Unknown function call '{}'", call.name))
        })?;
        schema::validate(&declaration.parameters, &call.args).map_err(|e| {
            EngineError::ResponseInvalid(format!(
                "Function call '{}' not conforming to schema: {e}",
                call.name
            ))
        })?;
    }

    match choice {
        ToolChoice::Auto => {}
        ToolChoice::None => {
            if !calls.is_empty() {
                return Err(EngineError::ResponseInvalid(format!(
                    "Function calls present with tool choice 'none' ({} calls)",
                    calls.len()
                ))
                .into());
            }
        }
        ToolChoice::Required => {
            if calls.is_empty() {
                return Err(EngineError::ResponseInvalid(
                    "No function call in response despite tool choice 'required'".to_string(),
                )
                .into());
            }
        }
        ToolChoice::Allow(names) => {
            for call in &calls {
                if !names.contains(&call.name) {
                    return Err(EngineError::ResponseInvalid(format!(
                        "Function call '{}' outside the allowed set",
                        call.name
                    ))
                    .into());
                }
            }
        }
    }

    Ok(())
}
