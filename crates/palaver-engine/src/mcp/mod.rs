mod client;
mod registry;

pub use client::{HostState, ToolHostClient};
pub use registry::{McpTool, Tool, ToolRegistry};
