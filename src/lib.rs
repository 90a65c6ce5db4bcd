//! Vendor API adaptors behind one inference interface.
//!
//! This crate implements:
//! - A vendor-neutral session/message model with typed function calls
//! - Adaptors for OpenAI Chat Completions (monolithic and streaming), the
//!   OpenAI Responses API, Google Generative Language, Anthropic Messages,
//!   OpenRouter, and Aliyun DashScope (Qwen)
//! - A generic driver handling retries, deadlines, cancellation, and
//!   post-parse validation uniformly across vendors
//! - Client-side request pacing and token budgeting per endpoint
//! - Cost accounting reported through caller-supplied logger hooks


mod sse;
mod utils;

pub mod anthropic;
pub mod config;
pub mod context;
pub mod display;
pub mod engine;
pub mod factory;
pub mod google;
pub mod openai;
pub mod openai_responses;
pub mod openrouter;
pub mod qwen;
pub mod schema;
pub mod throttle;
pub mod tools;
pub mod types;

pub use config::{ApiType, EndpointSpec};
pub use context::{InferenceContext, InferenceLogger};
pub use engine::{Engine, EngineOptions, Provider};
pub use factory::{create_engine, create_engine_with_throttle};
pub use throttle::Throttle;
pub use tools::{DeclarationMap, FunctionDeclaration, ToolChoice};
pub use types::*;
