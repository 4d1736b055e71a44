//! MCP（Model Context Protocol）工具服务
//!
//! - **transport**: JSON-RPC over stdio
//! - **server**: 子进程服务的启动、握手、工具调用
//! - **pool**: 进程级共享的服务组，随配置变化整组重启
//! - **testing**: 进程内的服务实现（测试用）

mod errors;
mod pool;
mod server;
pub mod testing;
mod transport;
mod types;

pub use errors::McpError;
pub use pool::McpPoolManager;
pub use server::{expand_env, ServerLauncher, StdioLauncher, StdioToolServer, ToolServer};
pub use transport::StdioTransport;
pub use types::{CallToolResult, McpTool, ServerState};
