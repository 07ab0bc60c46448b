//! Lifecycle supervision for tool server connections.
//!
//! Every tool server runs under three nested [`Scope`]s:
//!
//! ```text
//! root ── service ── connection ── protocol
//! ```
//!
//! The connection scope covers the byte stream (a subprocess, a container, an
//! in-process pipe). The protocol scope covers the reader and router tasks.
//! Ending a scope ends everything below it. Upward propagation is explicit: a
//! watcher task cancels the root only when the connection or protocol scope
//! ends with [`ScopeEnd::Failed`]. Orderly endings stay local to the server.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::McpClient;
use crate::error::McpError;
use crate::rpc::{Listeners, RpcClient, RpcConfig};
use crate::transport::ToolServer;

/// Why a scope ended.
#[derive(Debug, Clone)]
pub enum ScopeEnd {
    /// Deliberate shutdown.
    Planned,
    /// The peer went away cleanly (EOF, exit status 0).
    Closed,
    /// Something broke.
    Failed(Arc<dyn std::error::Error + Send + Sync>),
}

impl ScopeEnd {
    /// Wrap an error as a failure cause.
    pub fn failed(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Failed(Arc::new(error))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for ScopeEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Planned => f.write_str("planned shutdown"),
            Self::Closed => f.write_str("closed"),
            Self::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

struct ScopeInner {
    token: CancellationToken,
    cause: OnceLock<ScopeEnd>,
    parent: Option<Arc<ScopeInner>>,
}

impl ScopeInner {
    fn cause(&self) -> Option<ScopeEnd> {
        if !self.token.is_cancelled() {
            return None;
        }
        self.cause
            .get()
            .cloned()
            .or_else(|| self.parent.as_ref().and_then(|p| p.cause()))
            .or(Some(ScopeEnd::Planned))
    }
}

/// A cancellation scope that remembers why it ended.
///
/// Cloning yields another handle to the same scope. A child scope ends when
/// its parent ends and reports the parent's cause unless it recorded its own
/// first.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    /// Create a root scope.
    pub fn root() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                token: CancellationToken::new(),
                cause: OnceLock::new(),
                parent: None,
            }),
        }
    }

    /// Create a scope nested inside this one.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                token: self.inner.token.child_token(),
                cause: OnceLock::new(),
                parent: Some(self.inner.clone()),
            }),
        }
    }

    /// End the scope with `cause`. The first recorded cause wins.
    pub fn cancel_with(&self, cause: ScopeEnd) {
        if !self.inner.token.is_cancelled() {
            let _ = self.inner.cause.set(cause);
        }
        self.inner.token.cancel();
    }

    /// End the scope as a planned shutdown.
    pub fn cancel(&self) {
        self.cancel_with(ScopeEnd::Planned);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// The end cause, or `None` while the scope is live.
    pub fn cause(&self) -> Option<ScopeEnd> {
        self.inner.cause()
    }

    /// Wait until the scope ends.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// Wait until the scope ends and return why.
    pub async fn ended(&self) -> ScopeEnd {
        self.inner.token.cancelled().await;
        self.cause().unwrap_or(ScopeEnd::Planned)
    }

    /// The underlying token, for APIs that take one.
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("cancelled", &self.is_cancelled())
            .field("cause", &self.cause())
            .finish()
    }
}

/// A running tool server: its handshake client and the scopes it lives in.
pub struct ServerHandle {
    name: String,
    client: McpClient,
    listeners: Listeners,
    service: Scope,
    connection: Scope,
    protocol: Scope,
    watcher: JoinHandle<()>,
}

impl ServerHandle {
    /// Open `server` under `root`, start its protocol client and run the
    /// handshake.
    ///
    /// On handshake failure the server's service scope is ended and the error
    /// is returned; the root is only cancelled if the connection itself
    /// failed.
    pub async fn start(
        server: &dyn ToolServer,
        config: RpcConfig,
        root: &Scope,
    ) -> Result<Self, McpError> {
        let name = server.name().to_string();
        let service = root.child();
        let connection = service.child();

        let stream = match server.open(connection.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                service.cancel();
                return Err(e.into());
            }
        };

        let protocol = connection.child();
        let (rpc, listeners) = RpcClient::start(stream, config, protocol.clone());

        // Until the handshake succeeds, any ending stays inside this server.
        let client = match McpClient::initialize(rpc).await {
            Ok(client) => client,
            Err(e) => {
                if let Some(cause) = protocol.cause() {
                    warn!(server = %name, cause = %cause, "Tool server ended during handshake");
                }
                service.cancel();
                return Err(e);
            }
        };

        let watcher = tokio::spawn(watch(
            name.clone(),
            root.clone(),
            connection.clone(),
            protocol.clone(),
        ));
        info!(server = %name, tools = client.tools().len(), "Tool server ready");
        Ok(Self {
            name,
            client,
            listeners,
            service,
            connection,
            protocol,
            watcher,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The handshake client.
    pub fn client(&self) -> &McpClient {
        &self.client
    }

    /// Take the receiver for a configured notification method.
    pub fn take_listener(&mut self, method: &str) -> Option<tokio::sync::mpsc::Receiver<crate::Message>> {
        self.listeners.remove(method)
    }

    pub fn service_scope(&self) -> &Scope {
        &self.service
    }

    pub fn connection_scope(&self) -> &Scope {
        &self.connection
    }

    pub fn protocol_scope(&self) -> &Scope {
        &self.protocol
    }

    /// Whether the protocol client can still carry requests.
    pub fn is_live(&self) -> bool {
        !self.protocol.is_cancelled()
    }

    /// End the server with a planned shutdown and wait for the watcher.
    pub async fn shutdown(self) {
        self.service.cancel();
        let _ = self.watcher.await;
    }
}

/// Propagate failures of one server's connection or protocol scope to the
/// root. Returns once both scopes have ended or the root has.
async fn watch(name: String, root: Scope, connection: Scope, protocol: Scope) {
    let watch_one = |scope: Scope, layer: &'static str| {
        let root = root.clone();
        let name = name.clone();
        async move {
            tokio::select! {
                end = scope.ended() => {
                    if end.is_failure() {
                        error!(server = %name, layer, cause = %end, "Tool server failed");
                        root.cancel_with(end);
                    } else {
                        info!(server = %name, layer, cause = %end, "Tool server scope ended");
                    }
                }
                _ = root.cancelled() => {}
            }
        }
    };

    tokio::join!(
        watch_one(connection, "connection"),
        watch_one(protocol, "protocol")
    );
}
