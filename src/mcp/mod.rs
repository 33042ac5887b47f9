pub mod connection;
pub mod invoke;

// Re-export public types and functions for external use
pub use connection::{
    ConnectionManager, McpCache, McpClient, ServerDescriptor, ToolDefinition, ToolMap,
    TransportKind,
};
pub use invoke::{InvocationStatus, InvocationWrapper, McpInvoker};
