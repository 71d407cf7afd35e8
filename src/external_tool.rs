//! JSON-RPC-over-stdio client and manager for external (MCP-style) tool
//! servers.
//!
//! An [`ExternalToolClient`] owns one subprocess and speaks line-delimited
//! JSON-RPC over its stdin/stdout. [`ExternalToolManager`] loads a config
//! naming zero or more such servers, starts each one, and registers the
//! tools it advertises under a mangled name so a server's `search` tool
//! never collides with another server's tool of the same name.

use crate::tools::Tool;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};

/// Environment variable name fragments that mark a variable as sensitive.
/// Any inherited variable whose upper-cased name contains one of these is
/// dropped before spawning an external tool server.
const SENSITIVE_NAME_FRAGMENTS: &[&str] = &[
    "_TOKEN",
    "_KEY",
    "_SECRET",
    "_PASSWORD",
    "_PRIVATE",
    "_AUTH",
    "CREDENTIAL",
    "API_",
];

const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Builds the environment an external tool server is spawned with: the
/// current process's environment, sensitive variables stripped, with
/// `extra` layered on top.
fn sanitized_environment(extra: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars()
        .filter(|(k, _)| {
            let upper = k.to_uppercase();
            !SENSITIVE_NAME_FRAGMENTS.iter().any(|frag| upper.contains(frag))
        })
        .collect();
    env.extend(extra.clone());
    env
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Spawned,
    Initialised,
    Ready,
    Terminated,
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// One running external tool server reached over JSON-RPC/stdio.
pub struct ExternalToolClient {
    name: String,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<tokio::process::ChildStdin>>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>,
    next_id: AtomicU64,
    state: Mutex<ClientState>,
}

impl ExternalToolClient {
    /// Spawns `command args...` with a sanitized environment and starts the
    /// background reader that demultiplexes replies by request id.
    pub async fn start(
        name: impl Into<String>,
        command: &str,
        args: &[String],
        extra_env: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .env_clear()
            .envs(sanitized_environment(extra_env));

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::tool(format!("failed to spawn external tool server: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::tool("external tool server has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::tool("external tool server has no stdout"))?;

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&line) else {
                            continue;
                        };
                        let Some(id) = response.id else {
                            // Unsolicited notification; currently discarded.
                            continue;
                        };
                        if let Some(sender) = reader_pending.lock().await.remove(&id) {
                            let _ = sender.send(response);
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        });

        Ok(Self {
            name: name.into(),
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            pending,
            next_id: AtomicU64::new(1),
            state: Mutex::new(ClientState::Spawned),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        {
            let mut stdin_guard = self.stdin.lock().await;
            let stdin = stdin_guard
                .as_mut()
                .ok_or_else(|| Error::tool("external tool client stdin closed"))?;
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| Error::tool(format!("failed to write to external tool server: {e}")))?;
        }

        let response = tokio::time::timeout(INITIALIZE_TIMEOUT, rx)
            .await
            .map_err(|_| Error::timeout())?
            .map_err(|_| Error::tool("external tool server reply channel closed"))?;

        if let Some(err) = response.error {
            return Err(Error::tool(format!(
                "external tool server '{}' error {}: {}",
                self.name, err.code, err.message
            )));
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Runs the `initialize` capability handshake. Must be called before
    /// [`ExternalToolClient::list_tools`] or [`ExternalToolClient::call_tool`].
    pub async fn initialize(&self) -> Result<()> {
        *self.state.lock().await = ClientState::Spawned;
        self.call("initialize", serde_json::json!({})).await?;
        *self.state.lock().await = ClientState::Initialised;
        Ok(())
    }

    /// Lists the tools this server advertises.
    pub async fn list_tools(&self) -> Result<Vec<ExternalToolSchema>> {
        let result = self.call("tools/list", serde_json::json!({})).await?;
        let schemas: Vec<ExternalToolSchema> = serde_json::from_value(
            result.get("tools").cloned().unwrap_or(Value::Array(vec![])),
        )?;
        *self.state.lock().await = ClientState::Ready;
        Ok(schemas)
    }

    /// Invokes `tool_name` with `arguments` and returns its result payload.
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<Value> {
        self.call(
            "tools/call",
            serde_json::json!({ "name": tool_name, "arguments": arguments }),
        )
        .await
    }

    /// Closes stdin, waits briefly for a clean exit, then kills the process
    /// if it hasn't exited.
    pub async fn stop(&self) -> Result<()> {
        self.stdin.lock().await.take();

        let mut child_guard = self.child.lock().await;
        if let Some(child) = child_guard.as_mut() {
            match tokio::time::timeout(STOP_GRACE_PERIOD, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.kill().await;
                }
            }
        }
        *child_guard = None;
        *self.state.lock().await = ClientState::Terminated;
        Ok(())
    }
}

/// A tool advertised by an external server's `tools/list` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

/// Config for one external tool server, as read from the manager's config
/// file.
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Top-level shape of the manager's config file: a map of server name to
/// its launch configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ExternalToolsConfig {
    #[serde(default)]
    pub servers: HashMap<String, ExternalServerConfig>,
}

/// Loads, starts, and indexes every configured external tool server.
pub struct ExternalToolManager {
    clients: HashMap<String, Arc<ExternalToolClient>>,
}

impl ExternalToolManager {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
        }
    }

    /// Reads a project-local config if present, else a user-global one.
    /// Returns an empty config (no servers) if neither exists.
    pub fn load_config(project_path: &Path, user_global_path: &Path) -> Result<ExternalToolsConfig> {
        for candidate in [project_path, user_global_path] {
            if candidate.exists() {
                let data = std::fs::read_to_string(candidate)
                    .map_err(|e| Error::config(format!("failed to read external tools config: {e}")))?;
                return serde_json::from_str(&data)
                    .map_err(|e| Error::config(format!("failed to parse external tools config: {e}")));
            }
        }
        Ok(ExternalToolsConfig::default())
    }

    /// Starts every server in `config`, runs its handshake, and registers
    /// its tools into the returned vector under the mangled name
    /// `ext_<server>_<tool>`.
    pub async fn start_all(&mut self, config: &ExternalToolsConfig) -> Result<Vec<Tool>> {
        let mut tools = Vec::new();

        for (server_name, server_config) in &config.servers {
            let client = Arc::new(
                ExternalToolClient::start(
                    server_name.clone(),
                    &server_config.command,
                    &server_config.args,
                    &server_config.env,
                )
                .await?,
            );
            client.initialize().await?;
            let schemas = client.list_tools().await?;

            for schema in schemas {
                let mangled_name = format!("ext_{server_name}_{}", schema.name);
                let client_for_handler = client.clone();
                let upstream_name = schema.name.clone();
                tools.push(Tool::new(
                    mangled_name,
                    schema.description.clone(),
                    schema.input_schema.clone(),
                    move |args| {
                        let client = client_for_handler.clone();
                        let upstream_name = upstream_name.clone();
                        async move { client.call_tool(&upstream_name, args).await }
                    },
                ));
            }

            self.clients.insert(server_name.clone(), client);
        }

        Ok(tools)
    }

    /// Stops every running server.
    pub async fn stop_all(&mut self) -> Result<()> {
        for client in self.clients.values() {
            client.stop().await?;
        }
        self.clients.clear();
        Ok(())
    }
}

impl Default for ExternalToolManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitized_environment_drops_sensitive_vars() {
        let extra = HashMap::new();
        unsafe {
            std::env::set_var("TEST_EXTERNAL_TOOL_API_KEY", "secret");
            std::env::set_var("TEST_EXTERNAL_TOOL_SAFE_VAR", "ok");
        }
        let env = sanitized_environment(&extra);
        assert!(!env.contains_key("TEST_EXTERNAL_TOOL_API_KEY"));
        assert_eq!(env.get("TEST_EXTERNAL_TOOL_SAFE_VAR").map(String::as_str), Some("ok"));
        unsafe {
            std::env::remove_var("TEST_EXTERNAL_TOOL_API_KEY");
            std::env::remove_var("TEST_EXTERNAL_TOOL_SAFE_VAR");
        }
    }

    #[test]
    fn test_sanitized_environment_drops_each_fragment() {
        let extra = HashMap::new();
        unsafe {
            std::env::set_var("SOME_TOKEN", "x");
            std::env::set_var("SOME_SECRET", "x");
            std::env::set_var("SOME_PASSWORD", "x");
            std::env::set_var("SOME_PRIVATE_THING", "x");
            std::env::set_var("SOME_AUTH_HEADER", "x");
            std::env::set_var("MY_CREDENTIAL", "x");
            std::env::set_var("API_BASE", "x");
        }
        let env = sanitized_environment(&extra);
        for key in [
            "SOME_TOKEN",
            "SOME_SECRET",
            "SOME_PASSWORD",
            "SOME_PRIVATE_THING",
            "SOME_AUTH_HEADER",
            "MY_CREDENTIAL",
            "API_BASE",
        ] {
            assert!(!env.contains_key(key), "{key} should have been stripped");
            unsafe {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_extra_env_overrides_inherited() {
        let mut extra = HashMap::new();
        extra.insert("PATH".to_string(), "/custom/bin".to_string());
        let env = sanitized_environment(&extra);
        assert_eq!(env.get("PATH").map(String::as_str), Some("/custom/bin"));
    }

    #[test]
    fn test_load_config_missing_files_returns_empty() {
        let missing_a = Path::new("/nonexistent/a.json");
        let missing_b = Path::new("/nonexistent/b.json");
        let config = ExternalToolManager::load_config(missing_a, missing_b).unwrap();
        assert!(config.servers.is_empty());
    }
}
