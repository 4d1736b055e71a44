//! MCP 工具服务：子进程启动、initialize 握手、工具调用、关闭
//!
//! `ToolServer` 是 Agent 执行拿到的服务句柄；`ServerLauncher` 负责按配置创建它，
//! 进程池通过 launcher 启动服务组（测试中可换成进程内实现）。

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::transport::StdioTransport;
use super::types::{CallToolResult, ListToolsResult, McpTool};
use crate::settings::McpServerConfig;

const PROTOCOL_VERSION: &str = "2024-11-05";
const STDERR_TAIL_LINES: usize = 20;

/// 一个可调用工具的服务
#[async_trait]
pub trait ToolServer: Send + Sync {
    fn name(&self) -> &str;

    /// 服务提供的工具
    async fn list_tools(&self) -> Result<Vec<McpTool>, McpError>;

    /// 调用工具，返回文本结果
    async fn call_tool(&self, tool: &str, args: serde_json::Value) -> Result<String, McpError>;

    /// 进程是否存活
    async fn is_running(&self) -> bool;

    async fn shutdown(&self);
}

/// 按配置创建工具服务
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn launch(&self, name: &str, config: &McpServerConfig) -> Result<Arc<dyn ToolServer>, McpError>;
}

/// 以子进程方式启动 MCP 服务
pub struct StdioLauncher {
    init_timeout: Duration,
    tool_timeout: Duration,
}

impl StdioLauncher {
    pub fn new(init_timeout: Duration, tool_timeout: Duration) -> Self {
        Self {
            init_timeout,
            tool_timeout,
        }
    }
}

impl Default for StdioLauncher {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(120))
    }
}

#[async_trait]
impl ServerLauncher for StdioLauncher {
    async fn launch(&self, name: &str, config: &McpServerConfig) -> Result<Arc<dyn ToolServer>, McpError> {
        let server = StdioToolServer::spawn(name, config, self.init_timeout, self.tool_timeout).await?;
        Ok(Arc::new(server))
    }
}

/// 子进程 MCP 服务
pub struct StdioToolServer {
    name: String,
    child: Mutex<Child>,
    transport: StdioTransport,
    tools: Vec<McpTool>,
    tool_timeout: Duration,
    stopped: AtomicBool,
}

impl StdioToolServer {
    /// 启动进程并完成握手（initialize → notifications/initialized → tools/list）
    pub async fn spawn(
        name: &str,
        config: &McpServerConfig,
        init_timeout: Duration,
        tool_timeout: Duration,
    ) -> Result<Self, McpError> {
        let args: Vec<String> = config.args.iter().map(|a| expand_env(a)).collect();

        let mut cmd = Command::new(&config.command);
        cmd.args(&args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            server: name.to_string(),
            reason: format!("{} {:?}: {}", config.command, args, e),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::SpawnFailed {
            server: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::SpawnFailed {
            server: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr_tail = child.stderr.take().map(|stderr| drain_stderr(name, stderr));

        let transport = StdioTransport::new(name, stdin, stdout);

        let tools = match tokio::time::timeout(init_timeout, handshake(&transport)).await {
            Ok(Ok(tools)) => tools,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(McpError::InitFailed {
                    server: name.to_string(),
                    reason: format!("{}{}", e, stderr_suffix(stderr_tail.as_ref()).await),
                });
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(McpError::InitFailed {
                    server: name.to_string(),
                    reason: format!(
                        "initialization timed out after {}s{}",
                        init_timeout.as_secs(),
                        stderr_suffix(stderr_tail.as_ref()).await
                    ),
                });
            }
        };

        tracing::info!(server = name, tools = tools.len(), "MCP server started");

        Ok(Self {
            name: name.to_string(),
            child: Mutex::new(child),
            transport,
            tools,
            tool_timeout,
            stopped: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ToolServer for StdioToolServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<McpTool>, McpError> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, tool: &str, args: serde_json::Value) -> Result<String, McpError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(McpError::ServerStopped {
                server: self.name.clone(),
            });
        }

        let params = serde_json::json!({ "name": tool, "arguments": args });
        let result = tokio::time::timeout(self.tool_timeout, self.transport.request("tools/call", Some(params)))
            .await
            .map_err(|_| McpError::Timeout {
                server: self.name.clone(),
                timeout_secs: self.tool_timeout.as_secs(),
            })??;

        let result: CallToolResult = serde_json::from_value(result).map_err(|e| McpError::ToolFailed {
            tool: tool.to_string(),
            message: format!("malformed tools/call result: {e}"),
        })?;

        let text = result.to_text();
        if result.is_error {
            return Err(McpError::ToolFailed {
                tool: tool.to_string(),
                message: text,
            });
        }
        Ok(text)
    }

    async fn is_running(&self) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        matches!(self.child.lock().await.try_wait(), Ok(None))
    }

    async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            tracing::warn!(server = %self.name, "Failed to kill MCP server: {}", e);
        }
        tracing::info!(server = %self.name, "MCP server stopped");
    }
}

async fn handshake(transport: &StdioTransport) -> Result<Vec<McpTool>, McpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": { "name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION") },
    });
    transport.request("initialize", Some(params)).await?;
    transport.notify("notifications/initialized", None).await?;

    let result = transport.request("tools/list", None).await?;
    let listed: ListToolsResult = serde_json::from_value(result).map_err(|e| McpError::ServerError {
        code: -32603,
        message: format!("failed to parse tools/list response: {e}"),
        data: None,
    })?;
    Ok(listed.tools)
}

type StderrTail = Arc<std::sync::Mutex<VecDeque<String>>>;

/// 持续读取 stderr 写入 debug 日志，保留最后几行用于启动失败时的错误信息
fn drain_stderr(name: &str, stderr: ChildStderr) -> StderrTail {
    let tail: StderrTail = Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
    let sink = tail.clone();
    let server = name.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %server, "stderr: {}", line);
            if let Ok(mut tail) = sink.lock() {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    });
    tail
}

async fn stderr_suffix(tail: Option<&StderrTail>) -> String {
    // 给 stderr 读取任务一点时间拿到退出前的输出
    tokio::time::sleep(Duration::from_millis(100)).await;
    let lines: Vec<String> = tail
        .and_then(|t| t.lock().ok().map(|t| t.iter().cloned().collect()))
        .unwrap_or_default();
    if lines.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", lines.join(" / "))
    }
}

static ENV_VAR_RE: OnceLock<Regex> = OnceLock::new();

/// 展开参数中的 `$VAR` / `${VAR}`；未定义的变量保持原样
pub fn expand_env(arg: &str) -> String {
    let re = ENV_VAR_RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap());
    re.replace_all(arg, |caps: &regex::Captures| {
        let var = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()).unwrap_or_default();
        std::env::var(var).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env() {
        std::env::set_var("MCP_CHAT_TEST_HOME", "/home/tester");
        assert_eq!(expand_env("$MCP_CHAT_TEST_HOME/docs"), "/home/tester/docs");
        assert_eq!(expand_env("${MCP_CHAT_TEST_HOME}x"), "/home/testerx");
        assert_eq!(expand_env("$MCP_CHAT_TEST_UNSET_VAR"), "$MCP_CHAT_TEST_UNSET_VAR");
        assert_eq!(expand_env("plain"), "plain");
    }

    #[tokio::test]
    async fn test_spawn_missing_command_fails() {
        let config = McpServerConfig::new("mcp-chat-definitely-missing-binary", vec![]);
        let result = StdioToolServer::spawn("missing", &config, Duration::from_secs(1), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(McpError::SpawnFailed { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_non_mcp_process_fails_init() {
        // cat 回显请求本身，永远不会产生匹配的响应
        let config = McpServerConfig::new("cat", vec![]);
        let result = StdioToolServer::spawn("cat", &config, Duration::from_millis(300), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(McpError::InitFailed { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_handshake_and_call_with_scripted_server() {
        // 用 sh 模拟一个最小的 MCP 服务：按顺序应答 initialize / tools/list / tools/call
        let script = r#"
read line; echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}'
read line
read line; echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"Echo text"}]}}'
read line; echo '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"pong"}]}}'
read line; echo '{"jsonrpc":"2.0","id":4,"result":{"content":[{"type":"text","text":"bad input"}],"isError":true}}'
sleep 5
"#;
        let config = McpServerConfig::new("sh", vec!["-c".into(), script.into()]);
        let server = StdioToolServer::spawn("scripted", &config, Duration::from_secs(5), Duration::from_secs(5))
            .await
            .unwrap();

        let tools = server.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
        assert!(server.is_running().await);

        let out = server.call_tool("echo", serde_json::json!({"text": "ping"})).await.unwrap();
        assert_eq!(out, "pong");

        let err = server.call_tool("echo", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::ToolFailed { ref message, .. } if message == "bad input"));

        server.shutdown().await;
        assert!(!server.is_running().await);
        assert!(matches!(
            server.call_tool("echo", serde_json::json!({})).await,
            Err(McpError::ServerStopped { .. })
        ));
    }
}
