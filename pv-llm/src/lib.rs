//! Streaming chat client for OpenAI-compatible endpoints.
//!
//! Pure HTTP client with no knowledge of channels or scheduling.

mod client;
mod error;
mod openai;
mod types;

pub use client::{DEFAULT_API_BASE_URL, LlmClient};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, Role, StreamChunk, Usage};
