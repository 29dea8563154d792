//! Public types for the Thrifty API.

mod message;
mod request;
mod response;

pub use message::{ContentBlock, Message, MessageContent, Role};
pub use request::{CompletionRequest, SystemPrompt};
pub use response::{CompletionResponse, Provenance, Served, StopReason, Usage};
