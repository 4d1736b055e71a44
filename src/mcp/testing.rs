//! 进程内的 ToolServer / ServerLauncher 实现，供单元测试与集成测试使用

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use super::errors::McpError;
use super::server::{ServerLauncher, ToolServer};
use super::types::McpTool;
use crate::settings::McpServerConfig;

type Handler = Box<dyn Fn(&str, &Value) -> Result<String, McpError> + Send + Sync>;

/// 固定工具列表的服务；默认处理函数返回 `"{tool}: {args}"`
pub struct StaticToolServer {
    name: String,
    tools: Vec<McpTool>,
    handler: Handler,
    running: AtomicBool,
    calls: Mutex<Vec<(String, Value)>>,
}

impl StaticToolServer {
    pub fn new(name: &str, tool_names: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            tools: tool_names
                .iter()
                .map(|t| McpTool::new(*t, format!("{} (from {})", t, name)))
                .collect(),
            handler: Box::new(|tool, args| Ok(format!("{}: {}", tool, args))),
            running: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &Value) -> Result<String, McpError> + Send + Sync + 'static,
    {
        self.handler = Box::new(handler);
        self
    }

    /// 已收到的调用 (tool, args)
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ToolServer for StaticToolServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<McpTool>, McpError> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, tool: &str, args: Value) -> Result<String, McpError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(McpError::ServerStopped {
                server: self.name.clone(),
            });
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((tool.to_string(), args.clone()));
        }
        (self.handler)(tool, &args)
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// 按配置创建 StaticToolServer：`args` 即工具名；可指定某些服务名启动失败
#[derive(Default)]
pub struct StaticLauncher {
    failing: Mutex<HashSet<String>>,
    launched: Mutex<Vec<Arc<StaticToolServer>>>,
    launch_count: AtomicUsize,
}

impl StaticLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, name: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(name.to_string());
        }
    }

    pub fn succeed_on(&self, name: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.remove(name);
        }
    }

    /// 启动尝试次数（含失败）
    pub fn launch_count(&self) -> usize {
        self.launch_count.load(Ordering::SeqCst)
    }

    /// 成功启动过的服务（含已停止的）
    pub fn launched(&self) -> Vec<Arc<StaticToolServer>> {
        self.launched.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ServerLauncher for StaticLauncher {
    async fn launch(&self, name: &str, config: &McpServerConfig) -> Result<Arc<dyn ToolServer>, McpError> {
        self.launch_count.fetch_add(1, Ordering::SeqCst);
        let should_fail = self.failing.lock().map(|f| f.contains(name)).unwrap_or(false);
        if should_fail {
            return Err(McpError::SpawnFailed {
                server: name.to_string(),
                reason: "launch refused".into(),
            });
        }

        let tool_names: Vec<&str> = config.args.iter().map(String::as_str).collect();
        let server = Arc::new(StaticToolServer::new(name, &tool_names));
        if let Ok(mut launched) = self.launched.lock() {
            launched.push(server.clone());
        }
        Ok(server)
    }
}
