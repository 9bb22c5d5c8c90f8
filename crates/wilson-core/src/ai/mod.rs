//! Model communication: message types, the SSE stream decoder, and the
//! streaming backend seam.

pub mod backend;
pub mod sse;
pub mod types;

pub use backend::{Backend, BackendError, HttpBackend};
pub use sse::{SseDecoder, StreamEvent};
pub use types::{
    CacheControl, ChatMessage, ContentBlock, Conversation, Role, ToolCall, ToolCallStatus,
    ToolRequest, Usage,
};
