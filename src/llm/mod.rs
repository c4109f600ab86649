//! LLM gateway.
//!
//! Stateless: every completion carries its whole context. The driver never
//! replays conversation history; cross-iteration learning travels as prose
//! inside the single user message.

mod anthropic;
mod gateway;
mod types;

pub use anthropic::AnthropicGateway;
pub use gateway::{LlmError, LlmGateway};
pub use types::{
    CompletionRequest, CompletionResponse, ContentBlock, Message, MessageContent, Role, StopReason,
    StreamEvent, TokenUsage, ToolCall, ToolSchema,
};
