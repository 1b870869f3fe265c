//! Spawned-subprocess transport.
//!
//! The provider's MCP server runs as a child process speaking
//! newline-delimited JSON-RPC on stdin/stdout. stderr is forwarded to the
//! log. When stdout reaches EOF the connection reports `Closed` through its
//! hooks so the supervisor can react.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opsmux_core::{Error, PromptDescriptor, ResourceDescriptor, Result, ToolDescriptor};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{McpConnection, PromptArguments, TransportHooks};
use crate::rpc::RpcClient;

/// Grace period for the child to exit after its stdin is closed.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Child process plus the tasks pumping its pipes.
struct RunningChild {
    child: Child,
    tasks: Vec<JoinHandle<()>>,
}

/// MCP session over a child process's stdio.
pub struct StdioConnection {
    provider: String,
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: Option<String>,
    rpc: Arc<RpcClient>,
    running: Mutex<Option<RunningChild>>,
}

impl StdioConnection {
    pub fn new(
        provider: &str,
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        cwd: Option<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            provider: provider.to_string(),
            command,
            args,
            env,
            cwd,
            rpc: Arc::new(RpcClient::new(provider, request_timeout)),
            running: Mutex::new(None),
        }
    }

    fn spawn_child(&self) -> Result<Child> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        cmd.spawn().map_err(|e| {
            Error::transport(format!(
                "failed to spawn '{}' for provider {}: {}",
                self.command, self.provider, e
            ))
        })
    }
}

#[async_trait]
impl McpConnection for StdioConnection {
    async fn connect(&self, hooks: TransportHooks) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let mut child = self.spawn_child()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::transport("failed to capture child stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::transport("failed to capture child stdout"))?;
        let stderr = child.stderr.take();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        self.rpc.attach(out_tx);

        let mut tasks = Vec::new();

        let writer_hooks = hooks.clone();
        let mut stdin = stdin;
        tasks.push(tokio::spawn(async move {
            while let Some(mut line) = out_rx.recv().await {
                line.push('\n');
                let written = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = written {
                    writer_hooks.error(format!("failed to write to provider stdin: {}", e));
                    break;
                }
            }
        }));

        let rpc = self.rpc.clone();
        let provider = self.provider.clone();
        tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let reason = loop {
                match lines.next_line().await {
                    Ok(Some(line)) => rpc.handle_incoming(&line),
                    Ok(None) => break "provider process closed its stdout".to_string(),
                    Err(e) => break format!("failed to read provider stdout: {}", e),
                }
            };
            debug!(provider = %provider, reason = %reason, "stdio reader finished");
            rpc.detach(&reason);
            hooks.closed(reason);
        }));

        if let Some(stderr) = stderr {
            let provider = self.provider.clone();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(provider = %provider, "stderr: {}", line);
                }
            }));
        }

        if let Err(e) = self.rpc.initialize().await {
            for task in &tasks {
                task.abort();
            }
            self.rpc.detach("initialization failed");
            let _ = child.kill().await;
            return Err(e);
        }

        info!(provider = %self.provider, command = %self.command, "stdio provider connected");
        *running = Some(RunningChild { child, tasks });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let Some(mut running) = self.running.lock().await.take() else {
            return Ok(());
        };

        // Reader first so the deliberate shutdown is not reported as a crash.
        for task in &running.tasks {
            task.abort();
        }
        self.rpc.detach("connection closed");

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, running.child.wait()).await {
            Ok(Ok(status)) => debug!(provider = %self.provider, %status, "provider exited"),
            _ => {
                warn!(provider = %self.provider, "provider did not exit in time, killing");
                running.child.kill().await?;
            }
        }
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        self.rpc.list_tools().await
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>> {
        self.rpc.list_resources().await
    }

    async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>> {
        self.rpc.list_prompts().await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        self.rpc.call_tool(name, arguments).await
    }

    async fn read_resource(&self, uri: &str) -> Result<Value> {
        self.rpc.read_resource(uri).await
    }

    async fn get_prompt(&self, name: &str, arguments: Option<PromptArguments>) -> Result<Value> {
        self.rpc.get_prompt(name, arguments).await
    }
}
