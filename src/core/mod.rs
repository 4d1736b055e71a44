//! 核心层：错误类型、会话监管、优雅关闭

pub mod error;
pub mod session_supervisor;
pub mod shutdown;

pub use error::{AgentError, ChatError};
pub use session_supervisor::SessionSupervisor;
pub use shutdown::{
    McpPoolCleanup, RepositoryCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason,
};
