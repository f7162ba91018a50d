//! Concrete agent backends: local commands and tools on stdio MCP servers.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::{McpRequest, McpResponse, ServerInfo, ToolCallResult, PROTOCOL_VERSION};
use crate::registry::Agent;
use crate::secrets::Credentials;

/// Runs a program per call: input on stdin, answer on stdout.
///
/// Credentials are exported to the child as upper-cased environment
/// variables (`api_key` becomes `API_KEY`).
#[derive(Debug, Clone)]
pub struct CommandAgent {
    id: String,
    description: String,
    program: String,
    args: Vec<String>,
}

impl CommandAgent {
    pub fn new(id: &str, description: &str, program: &str, args: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            program: program.to_string(),
            args,
        }
    }

    fn invocation_error(&self, message: impl Into<String>) -> Error {
        Error::Invocation {
            target: self.id.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Agent for CommandAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, input: &str, credentials: &Credentials) -> Result<String> {
        debug!(agent_id = %self.id, program = %self.program, "Spawning command agent");

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in credentials.iter() {
            command.env(key.to_uppercase(), value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| self.invocation_error(format!("cannot spawn `{}`: {}", self.program, e)))?;

        // Feed stdin while draining stdout, or a child that streams its
        // answer stalls once both pipe buffers fill.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(input.as_bytes()).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        if let Err(e) = fed {
            // The child may exit without reading its input.
            debug!(agent_id = %self.id, "stdin write failed: {}", e);
        }
        let output = output?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.invocation_error(format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}

/// Calls one tool on an MCP server started per invocation over stdio.
///
/// The input string is passed as the tool argument named `argument`;
/// the text content of the result becomes the output.
#[derive(Debug, Clone)]
pub struct McpToolAgent {
    id: String,
    description: String,
    command: String,
    args: Vec<String>,
    tool: String,
    argument: String,
}

impl McpToolAgent {
    pub fn new(id: &str, description: &str, command: &str, tool: &str) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            tool: tool.to_string(),
            argument: "input".to_string(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_argument(mut self, argument: &str) -> Self {
        self.argument = argument.to_string();
        self
    }

    fn protocol_error(&self, message: impl Into<String>) -> Error {
        Error::Invocation {
            target: self.id.clone(),
            message: message.into(),
        }
    }

    fn spawn(&self, credentials: &Credentials) -> Result<Child> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in credentials.iter() {
            command.env(key.to_uppercase(), value);
        }
        command
            .spawn()
            .map_err(|e| self.protocol_error(format!("cannot spawn `{}`: {}", self.command, e)))
    }

    async fn call(&self, input: &str, credentials: &Credentials) -> Result<ToolCallResult> {
        let mut child = self.spawn(credentials)?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.protocol_error("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.protocol_error("child stdout unavailable"))?;
        let mut lines = BufReader::new(stdout).lines();

        send(
            &mut stdin,
            &McpRequest::new(
                1,
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": ServerInfo::default(),
                }),
            ),
        )
        .await?;
        self.await_response(&mut lines, 1).await?;

        send(&mut stdin, &McpRequest::notification("notifications/initialized")).await?;
        let mut arguments = serde_json::Map::new();
        arguments.insert(self.argument.clone(), json!(input));
        send(
            &mut stdin,
            &McpRequest::new(2, "tools/call", json!({ "name": self.tool, "arguments": arguments })),
        )
        .await?;
        let result = self.await_response(&mut lines, 2).await?;

        drop(stdin);
        let _ = child.kill().await;

        Ok(serde_json::from_value(result)?)
    }

    /// Read lines until the response to `id` arrives, skipping server
    /// notifications and log noise.
    async fn await_response<R>(&self, lines: &mut tokio::io::Lines<R>, id: u64) -> Result<Value>
    where
        R: tokio::io::AsyncBufRead + Unpin,
    {
        while let Some(line) = lines.next_line().await? {
            let Ok(response) = serde_json::from_str::<McpResponse>(&line) else {
                continue;
            };
            if response.id != Some(json!(id)) {
                continue;
            }
            if let Some(error) = response.error {
                return Err(self.protocol_error(format!("{} ({})", error.message, error.code)));
            }
            return Ok(response.result.unwrap_or(Value::Null));
        }
        Err(self.protocol_error("server closed stdout before responding"))
    }
}

async fn send(stdin: &mut ChildStdin, request: &McpRequest) -> Result<()> {
    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

#[async_trait]
impl Agent for McpToolAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, input: &str, credentials: &Credentials) -> Result<String> {
        debug!(agent_id = %self.id, tool = %self.tool, "Calling MCP tool");
        let result = self.call(input, credentials).await?;
        if result.is_error {
            return Err(self.protocol_error(result.text()));
        }
        Ok(result.text())
    }
}
