//! 可观测性：tracing 订阅器初始化

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 默认日志级别指令（可被 RUST_LOG 覆盖）
pub const DEFAULT_DIRECTIVE: &str = "mcp_chat=info";

/// 初始化全局订阅器；`debug` 为 true 时默认级别提升为 debug。重复调用无副作用。
pub fn init(debug: bool) {
    let default = if debug { "mcp_chat=debug" } else { DEFAULT_DIRECTIVE };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}
