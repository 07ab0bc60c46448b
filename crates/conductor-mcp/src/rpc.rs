//! JSON-RPC protocol client.
//!
//! [`RpcClient`] writes framed requests through one shared writer and waits
//! for the router to hand back the response carrying the same id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use conductor_core::config::{MalformedLinePolicy, RpcSettings};
use serde_json::Value;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RpcError;
use crate::framing::{run_reader, write_message};
use crate::lifecycle::{Scope, ScopeEnd};
use crate::protocol::{Message, RequestId};
use crate::router::RouterHandle;
use crate::transport::Connection;

/// Receivers for the configured notification methods, keyed by method.
pub type Listeners = HashMap<String, mpsc::Receiver<Message>>;

/// Protocol client settings.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Deadline for each request, measured from the call.
    pub request_timeout: Duration,
    /// Notification methods delivered to listeners. Fixed for the client's life.
    pub notification_routes: Vec<String>,
    /// Capacity of each listener channel.
    pub notification_buffer: usize,
    /// What to do with a line that is not a valid message.
    pub malformed_lines: MalformedLinePolicy,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self::from(&RpcSettings::default())
    }
}

impl From<&RpcSettings> for RpcConfig {
    fn from(settings: &RpcSettings) -> Self {
        Self {
            request_timeout: settings.request_timeout(),
            notification_routes: settings.notification_routes.clone(),
            notification_buffer: settings.notification_buffer.max(1),
            malformed_lines: settings.malformed_lines,
        }
    }
}

impl RpcConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_route(mut self, method: impl Into<String>) -> Self {
        self.notification_routes.push(method.into());
        self
    }

    pub fn with_malformed_lines(mut self, policy: MalformedLinePolicy) -> Self {
        self.malformed_lines = policy;
        self
    }
}

/// Request/response client over one connection.
pub struct RpcClient {
    writer: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
    router: RouterHandle,
    scope: Scope,
    timeout: Duration,
}

impl RpcClient {
    /// Start the router and reader tasks for `connection` under `scope` (the
    /// protocol scope) and return the client together with the listener
    /// receivers for the configured notification methods.
    pub fn start(connection: Connection, config: RpcConfig, scope: Scope) -> (Self, Listeners) {
        let mut routes = HashMap::new();
        let mut listeners = HashMap::new();
        for method in &config.notification_routes {
            let (tx, rx) = mpsc::channel(config.notification_buffer.max(1));
            routes.insert(method.clone(), tx);
            listeners.insert(method.clone(), rx);
        }

        let (router, _task) = RouterHandle::spawn(routes, scope.clone());
        tokio::spawn(run_reader(
            connection.reader,
            router.clone(),
            scope.clone(),
            config.malformed_lines,
        ));

        let client = Self {
            writer: Arc::new(Mutex::new(connection.writer)),
            router,
            scope,
            timeout: config.request_timeout,
        };
        (client, listeners)
    }

    /// Send a request and wait for its response.
    ///
    /// Error responses come back as `Ok(message)`; only transport-level
    /// failures are `Err`. The pending entry is removed on every path,
    /// including when the returned future is dropped.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Message, RpcError> {
        let id = RequestId::String(Uuid::new_v4().to_string());
        let request = Message::request(id.clone(), method, params);
        debug!(id = %id, method = %method, "Sending request");

        let _pending = PendingGuard {
            router: &self.router,
            id: id.clone(),
        };
        let outcome = tokio::select! {
            result = self.exchange(id.clone(), request) => result,
            _ = tokio::time::sleep(self.timeout) => Err(RpcError::Timeout(self.timeout)),
            cause = self.scope.ended() => Err(RpcError::Cancelled(cause)),
        };

        match &outcome {
            Ok(_) => debug!(id = %id, method = %method, "Received response"),
            Err(e) => debug!(id = %id, method = %method, error = %e, "Request failed"),
        }
        outcome
    }

    /// Send a request without params.
    pub async fn action_call(&self, method: &str) -> Result<Message, RpcError> {
        self.call(method, None).await
    }

    /// Send a notification. Only the write can fail.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        debug!(method = %method, "Sending notification");
        self.write(Message::notification(method, params)).await
    }

    /// Number of requests currently awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.router.pending_count().await
    }

    /// The protocol scope this client runs under.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    async fn exchange(&self, id: RequestId, request: Message) -> Result<Message, RpcError> {
        let response = self.router.register(id).await?;
        self.write(request).await?;
        match response.await {
            Ok(message) => Ok(message),
            Err(_) => Err(match self.scope.cause() {
                Some(cause) => RpcError::Cancelled(cause),
                None => RpcError::ConnectionClosed,
            }),
        }
    }

    /// Write one message on its own task, so a caller that gives up
    /// mid-write never leaves half a line on the stream.
    ///
    /// A failed write ends the protocol scope: the stream is unusable.
    async fn write(&self, message: Message) -> Result<(), RpcError> {
        let writer = self.writer.clone();
        let scope = self.scope.clone();
        let task = tokio::spawn(async move {
            let mut writer = writer.lock().await;
            write_message(&mut **writer, &message).await.map_err(|e| {
                warn!(error = %e, "Write to tool server failed");
                scope.cancel_with(ScopeEnd::failed(std::io::Error::new(e.kind(), e.to_string())));
                RpcError::Write(e)
            })
        });
        task.await
            .unwrap_or_else(|e| Err(RpcError::Write(std::io::Error::other(e))))
    }
}

/// Removes a pending registration when the call ends, however it ends.
struct PendingGuard<'a> {
    router: &'a RouterHandle,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.router.deregister(self.id.clone());
    }
}
