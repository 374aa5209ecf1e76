//! Provider-agnostic core types for the chorus LLM client.
//!
//! This crate is the leaf of the workspace: the prompt IR ([`ModelMessage`],
//! [`ContentPart`]), the streaming event model ([`StreamEvent`]), tool types,
//! request configuration, the error taxonomy, and the cancellation token.
//! It never touches the network.

pub mod cancel;
pub mod capability;
pub mod config;
pub mod error;
pub mod message;
pub mod stream;
pub mod tool;

// Re-exports for convenience.
pub use cancel::CancellationToken;
pub use capability::CapabilityKind;
pub use config::{LlmConfig, ResponseFormat, StructuredOutputFormat};
pub use error::{LlmError, Result, Warning};
pub use message::{ContentPart, MediaSource, MessageBuilder, ModelMessage, Role, ToolCall, ToolPayload, ToolResult};
pub use stream::{BoxStream, ChatResponse, EventStream, StreamEvent, Usage};
pub use tool::{ExecutableTool, FunctionTool, ProviderTool, ToolChoice, ToolChoiceMode};
