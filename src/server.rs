//! MCP server over stdio.

use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::protocol::{
    error_codes, McpRequest, McpResponse, ServerCapabilities, ServerInfo, ToolCallParams, ToolCapabilities,
    PROTOCOL_VERSION,
};
use crate::runtime::AgentRuntime;
use crate::tools::ToolRegistry;

/// Workflow MCP server.
pub struct WorkflowMcpServer {
    /// Tool registry.
    registry: ToolRegistry,
    /// Server info.
    server_info: ServerInfo,
    /// Whether the client sent `notifications/initialized`.
    initialized: bool,
}

impl WorkflowMcpServer {
    pub fn new(runtime: Arc<AgentRuntime>) -> Self {
        Self {
            registry: ToolRegistry::new(runtime),
            server_info: ServerInfo::default(),
            initialized: false,
        }
    }

    /// Serve newline-delimited JSON-RPC on stdin/stdout until EOF.
    pub async fn run_stdio(&mut self) -> Result<()> {
        info!("Starting workflow MCP server on stdio");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            debug!("Received: {}", line);

            let Some(response) = self.handle_message(&line).await else {
                continue;
            };
            let mut response_json = serde_json::to_string(&response)?;
            debug!("Sending: {}", response_json);

            response_json.push('\n');
            stdout.write_all(response_json.as_bytes()).await?;
            stdout.flush().await?;
        }

        info!("stdin closed, shutting down");
        Ok(())
    }

    /// Handle one message. Notifications produce no response.
    pub async fn handle_message(&mut self, message: &str) -> Option<McpResponse> {
        let request: McpRequest = match serde_json::from_str(message) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse request: {}", e);
                return Some(McpResponse::error(None, error_codes::PARSE_ERROR, e.to_string()));
            }
        };

        if request.is_notification() {
            self.handle_notification(&request);
            return None;
        }

        Some(match request.method.as_str() {
            "initialize" => self.handle_initialize(&request),
            "tools/list" => self.handle_tools_list(&request),
            "tools/call" => self.handle_tools_call(&request).await,
            "ping" => McpResponse::success(request.id.clone(), json!({})),
            _ => McpResponse::error(
                request.id,
                error_codes::METHOD_NOT_FOUND,
                format!("unknown method: {}", request.method),
            ),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn handle_notification(&mut self, request: &McpRequest) {
        match request.method.as_str() {
            "notifications/initialized" | "initialized" => {
                self.initialized = true;
                info!("MCP session initialized");
            }
            other => debug!("Ignoring notification {}", other),
        }
    }

    fn handle_initialize(&mut self, request: &McpRequest) -> McpResponse {
        info!("Initializing MCP server");

        let capabilities = ServerCapabilities {
            tools: Some(ToolCapabilities { list_changed: false }),
        };

        McpResponse::success(
            request.id.clone(),
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": capabilities,
                "serverInfo": self.server_info
            }),
        )
    }

    fn handle_tools_list(&self, request: &McpRequest) -> McpResponse {
        McpResponse::success(request.id.clone(), json!({ "tools": self.registry.definitions() }))
    }

    async fn handle_tools_call(&self, request: &McpRequest) -> McpResponse {
        let params: ToolCallParams = match serde_json::from_value(request.params.clone()) {
            Ok(params) => params,
            Err(e) => {
                return McpResponse::error(
                    request.id.clone(),
                    error_codes::INVALID_PARAMS,
                    format!("invalid tools/call params: {}", e),
                );
            }
        };
        let arguments = if params.arguments.is_null() {
            json!({})
        } else {
            params.arguments
        };

        info!(tool = %params.name, "Calling tool");

        let outcome = self
            .registry
            .execute(&params.name, arguments)
            .await
            .and_then(|result| serde_json::to_value(result).map_err(Error::from));
        match outcome {
            Ok(result) => McpResponse::success(request.id.clone(), result),
            Err(e) => {
                error!(tool = %params.name, "Tool execution failed: {}", e);
                let code = match e {
                    Error::InvalidParams(_) => error_codes::INVALID_PARAMS,
                    _ => error_codes::INTERNAL_ERROR,
                };
                McpResponse::error(request.id.clone(), code, e.to_string())
            }
        }
    }
}
