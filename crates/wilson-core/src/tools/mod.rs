//! Tool runtime: registry, permission policy, dispatcher, and the built-in
//! protocol tools.

pub mod ask_user;
pub mod dispatcher;
pub mod interact;
pub mod permissions;
pub mod processes;
pub mod registry;
pub mod shell;
pub mod todo;
pub mod truncation;

pub use dispatcher::{ExecutedCall, ToolDispatcher};
pub use interact::{Interaction, NonInteractive};
pub use permissions::{PermissionPolicy, PermissionRule};
pub use registry::{
    parse_params, validate_input, Tool, ToolContext, ToolOutput, ToolOutputChunk, ToolRegistry,
};
pub use todo::{TodoItem, TodoList, TodoStatus};
