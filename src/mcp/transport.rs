//! JSON-RPC over stdio 传输层
//!
//! 每行一个 JSON 对象。同一服务上的请求串行：写请求与读到匹配 id 的响应在同一把锁内完成，
//! 并发调用不会读走彼此的响应。无法解析为响应的行（服务端通知、日志输出）被跳过。

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::types::{JsonRpcRequest, JsonRpcResponse};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

struct Io {
    writer: BoxedWriter,
    reader: BoxedReader,
}

pub struct StdioTransport {
    server_name: String,
    io: Mutex<Io>,
    next_id: AtomicU64,
}

impl StdioTransport {
    pub fn new<W, R>(server_name: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            server_name: server_name.to_string(),
            io: Mutex::new(Io {
                writer: Box::new(writer),
                reader: BufReader::new(Box::new(reader)),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// 发送请求并等待匹配 id 的响应，返回 result 字段
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);
        let line = serde_json::to_string(&req).map_err(|e| self.transport_error(format!("failed to serialize request: {e}")))?;

        let mut io = self.io.lock().await;
        self.write_line(&mut io.writer, line).await?;

        let mut line_buf = String::new();
        loop {
            line_buf.clear();
            let bytes_read = io
                .reader
                .read_line(&mut line_buf)
                .await
                .map_err(|e| self.transport_error(format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                return Err(self.transport_error("server stdout closed (process may have exited)".into()));
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == id => return extract_result(resp),
                Ok(resp) => {
                    tracing::debug!(server = %self.server_name, "Skipping response for request {}", resp.id);
                }
                Err(_) => {
                    tracing::trace!(server = %self.server_name, "Skipping non-response line: {}", trimmed);
                }
            }
        }
    }

    /// 发送通知（无响应）
    pub async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), McpError> {
        let mut notification = serde_json::json!({ "jsonrpc": "2.0", "method": method });
        if let Some(params) = params {
            notification["params"] = params;
        }
        let line = notification.to_string();

        let mut io = self.io.lock().await;
        self.write_line(&mut io.writer, line).await
    }

    async fn write_line(&self, writer: &mut BoxedWriter, mut line: String) -> Result<(), McpError> {
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }
}

/// 从响应中取出 result，error 转为 McpError
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: -32603,
        message: "response missing both result and error".into(),
        data: None,
    })
}
