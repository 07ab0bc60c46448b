//! Tool server byte streams.
//!
//! A [`ToolServer`] knows how to produce a [`Connection`]: a buffered reader
//! and a writer carrying newline-delimited JSON. Three backends are provided:
//! a local subprocess over stdio, a docker container driven through the
//! `docker` CLI, and an in-process handler over an in-memory pipe.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use conductor_core::config::{ServerConfig, ServerKind};
use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::framing::{write_message, FrameReader};
use crate::lifecycle::{Scope, ScopeEnd};
use crate::protocol::Message;

/// A bidirectional byte stream to one tool server.
pub struct Connection {
    pub reader: Box<dyn AsyncBufRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl Connection {
    pub fn new(
        reader: impl AsyncBufRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// Something that can open a byte stream to a tool server.
///
/// `scope` is the connection scope: the implementation ends it when the
/// stream's backing resource goes away, and releases that resource when the
/// scope is cancelled from above.
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// Name used in logs and the roster.
    fn name(&self) -> &str;

    /// Open the byte stream.
    async fn open(&self, scope: Scope) -> Result<Connection, TransportError>;
}

/// Build the backend described by a server config entry.
pub fn from_config(config: &ServerConfig) -> Result<Box<dyn ToolServer>, TransportError> {
    match config.kind {
        ServerKind::Process => {
            let command = config.command.as_deref().ok_or_else(|| {
                TransportError::InvalidConfig(format!("server '{}' has no command", config.name))
            })?;
            let mut server = ProcessServer::new(&config.name, command)
                .with_args(config.args.clone())
                .with_env(config.env.clone());
            for name in &config.forward_env {
                if let Ok(value) = std::env::var(name) {
                    server.env.insert(name.clone(), value);
                }
            }
            if let Some(dir) = &config.working_dir {
                server = server.with_working_dir(dir.clone());
            }
            Ok(Box::new(server))
        }
        ServerKind::Container => {
            let target = match (&config.container_name, &config.image) {
                (Some(existing), _) => ContainerTarget::Existing(existing.clone()),
                (None, Some(image)) => ContainerTarget::Image(image.clone()),
                (None, None) => {
                    return Err(TransportError::InvalidConfig(format!(
                        "server '{}' has neither image nor container_name",
                        config.name
                    )))
                }
            };
            Ok(Box::new(ContainerServer {
                name: config.name.clone(),
                target,
                args: config.args.clone(),
                env: config.env.clone(),
                forward_env: config.forward_env.clone(),
            }))
        }
    }
}

// ============================================================================
// Subprocess
// ============================================================================

/// A tool server run as a child process speaking over stdin/stdout.
#[derive(Debug, Clone)]
pub struct ProcessServer {
    name: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl ProcessServer {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[async_trait]
impl ToolServer for ProcessServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self, scope: Scope) -> Result<Connection, TransportError> {
        debug!(
            server = %self.name,
            command = %self.command,
            args = ?self.args,
            "Spawning tool server process"
        );

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(TransportError::SpawnFailed)?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::SpawnFailed(std::io::Error::other("Failed to capture stdin"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::SpawnFailed(std::io::Error::other("Failed to capture stdout"))
        })?;

        info!(server = %self.name, pid = ?child.id(), "Tool server process spawned");
        tokio::spawn(supervise_child(self.name.clone(), child, scope));

        Ok(Connection::new(BufReader::new(stdout), stdin))
    }
}

/// End `scope` when the child exits; stop the child when `scope` ends first.
async fn supervise_child(name: String, mut child: Child, scope: Scope) {
    tokio::select! {
        status = child.wait() => {
            let end = match status {
                Ok(status) if status.success() => ScopeEnd::Closed,
                Ok(status) => ScopeEnd::failed(TransportError::Exited(status)),
                Err(e) => ScopeEnd::failed(TransportError::WaitFailed(e)),
            };
            info!(server = %name, cause = %end, "Tool server process exited");
            scope.cancel_with(end);
        }
        _ = scope.cancelled() => {
            if let Err(e) = terminate(&mut child).await {
                warn!(server = %name, error = %e, "Failed to stop tool server process");
            }
        }
    }
}

async fn terminate(child: &mut Child) -> Result<(), TransportError> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    debug!(pid, "Sending SIGTERM to tool server");

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

        tokio::select! {
            _ = child.wait() => {
                debug!(pid, "Tool server exited gracefully");
                Ok(())
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(2)) => {
                warn!(pid, "Tool server did not exit gracefully, killing");
                child.kill().await.map_err(TransportError::TerminateFailed)
            }
        }
    }

    #[cfg(not(unix))]
    {
        child.kill().await.map_err(TransportError::TerminateFailed)
    }
}

// ============================================================================
// Docker container
// ============================================================================

/// Which container a [`ContainerServer`] talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerTarget {
    /// Run a fresh container from this image.
    Image(String),
    /// Attach to an existing, named container.
    Existing(String),
}

/// A tool server running in a docker container, attached over stdio.
#[derive(Debug, Clone)]
pub struct ContainerServer {
    name: String,
    target: ContainerTarget,
    args: Vec<String>,
    env: HashMap<String, String>,
    forward_env: Vec<String>,
}

impl ContainerServer {
    /// Run `image` in a new container.
    pub fn image(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: ContainerTarget::Image(image.into()),
            args: Vec::new(),
            env: HashMap::new(),
            forward_env: Vec::new(),
        }
    }

    /// Attach to the existing container `container`.
    pub fn existing(name: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: ContainerTarget::Existing(container.into()),
            args: Vec::new(),
            env: HashMap::new(),
            forward_env: Vec::new(),
        }
    }

    /// Forward these host variables into the container when they are set.
    pub fn with_forward_env(mut self, names: Vec<String>) -> Self {
        self.forward_env = names;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// The `docker` invocation for this server.
    pub fn docker_args(&self) -> Vec<String> {
        match &self.target {
            ContainerTarget::Existing(container) => {
                vec!["start".to_string(), "-ai".to_string(), container.clone()]
            }
            ContainerTarget::Image(image) => {
                let mut args = vec![
                    "run".to_string(),
                    "-i".to_string(),
                    "--rm".to_string(),
                    "--name".to_string(),
                    container_name(image),
                ];

                let mut env: Vec<(&String, &String)> = self.env.iter().collect();
                env.sort();
                for (key, value) in env {
                    args.push("-e".to_string());
                    args.push(format!("{}={}", key, value));
                }
                for name in &self.forward_env {
                    if std::env::var_os(name).is_some() {
                        args.push("-e".to_string());
                        args.push(name.clone());
                    }
                }

                args.push(image.clone());
                args.extend(self.args.iter().cloned());
                args
            }
        }
    }
}

#[async_trait]
impl ToolServer for ContainerServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self, scope: Scope) -> Result<Connection, TransportError> {
        let process = ProcessServer::new(&self.name, "docker").with_args(self.docker_args());
        process.open(scope).await
    }
}

/// Default container name for an image: `mcp-<image>` with every character
/// outside `[A-Za-z0-9_.-]` replaced by `.`.
pub fn container_name(image: &str) -> String {
    static INVALID: OnceLock<Option<Regex>> = OnceLock::new();
    let raw = format!("mcp-{}", image);
    match INVALID.get_or_init(|| Regex::new(r"[^a-zA-Z0-9_.-]").ok()) {
        Some(re) => re.replace_all(&raw, ".").into_owned(),
        None => raw,
    }
}

// ============================================================================
// In-process
// ============================================================================

type Handler = dyn Fn(Message) -> Option<Message> + Send + Sync;

/// A tool server implemented by a closure, reached over an in-memory pipe.
///
/// Every inbound line is decoded and passed to the handler; a returned message
/// is written back as one line.
#[derive(Clone)]
pub struct InProcessServer {
    name: String,
    handler: Arc<Handler>,
    line_prefix: String,
}

impl InProcessServer {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Message) -> Option<Message> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            line_prefix: String::new(),
        }
    }

    /// Emit `prefix` in front of every reply line, as chatty servers do.
    pub fn with_line_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.line_prefix = prefix.into();
        self
    }

    /// Start serving and return the client end of the pipe.
    pub fn connect(&self, scope: Scope) -> Connection {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        tokio::spawn(serve(
            self.name.clone(),
            self.handler.clone(),
            self.line_prefix.clone(),
            BufReader::new(server_read),
            server_write,
            scope,
        ));

        Connection::new(BufReader::new(client_read), client_write)
    }
}

#[async_trait]
impl ToolServer for InProcessServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self, scope: Scope) -> Result<Connection, TransportError> {
        Ok(self.connect(scope))
    }
}

async fn serve<R, W>(
    name: String,
    handler: Arc<Handler>,
    prefix: String,
    reader: R,
    mut writer: W,
    scope: Scope,
) where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let mut frames = FrameReader::new(reader);
    loop {
        let next = tokio::select! {
            _ = scope.cancelled() => break,
            next = frames.next_message() => next,
        };
        let message = match next {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(e) => {
                warn!(server = %name, error = %e, "In-process server got a bad line");
                continue;
            }
        };
        let Some(reply) = handler(message) else {
            continue;
        };
        if !prefix.is_empty() && writer.write_all(prefix.as_bytes()).await.is_err() {
            break;
        }
        if write_message(&mut writer, &reply).await.is_err() {
            break;
        }
    }
    debug!(server = %name, "In-process server stopped");
}
