//! Correlation of inbound messages with waiting requests and listeners.
//!
//! One actor task owns both registries: pending requests keyed by id, and
//! notification routes keyed by method. Everything else talks to it through a
//! [`RouterHandle`], so there are no shared maps and no locks.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::lifecycle::Scope;
use crate::protocol::{Message, RequestId};

enum Command {
    Register {
        id: RequestId,
        reply: oneshot::Sender<Message>,
        ack: oneshot::Sender<Result<(), RpcError>>,
    },
    Deregister {
        id: RequestId,
    },
    Inbound(Message),
    PendingCount(oneshot::Sender<usize>),
}

/// Cloneable handle to the router actor.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl RouterHandle {
    /// Spawn the router actor. It stops when `scope` ends or every handle is
    /// dropped; pending waiters then observe a closed channel.
    pub fn spawn(routes: HashMap<String, mpsc::Sender<Message>>, scope: Scope) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Router {
            pending: HashMap::new(),
            routes,
            scope,
        };
        let task = tokio::spawn(router.run(rx));
        (Self { tx }, task)
    }

    /// Register a pending request and return the receiver its response will
    /// be delivered on.
    pub async fn register(&self, id: RequestId) -> Result<oneshot::Receiver<Message>, RpcError> {
        let (reply, rx) = oneshot::channel();
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(Command::Register { id, reply, ack })
            .map_err(|_| RpcError::ConnectionClosed)?;
        ack_rx.await.map_err(|_| RpcError::ConnectionClosed)??;
        Ok(rx)
    }

    /// Remove a pending request. Unknown ids are ignored.
    pub fn deregister(&self, id: RequestId) {
        let _ = self.tx.send(Command::Deregister { id });
    }

    /// Hand an inbound message to the router. Returns `false` once the actor
    /// has stopped.
    pub fn inbound(&self, message: Message) -> bool {
        self.tx.send(Command::Inbound(message)).is_ok()
    }

    /// Number of requests currently awaiting a response.
    pub async fn pending_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::PendingCount(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

struct Router {
    pending: HashMap<RequestId, oneshot::Sender<Message>>,
    routes: HashMap<String, mpsc::Sender<Message>>,
    scope: Scope,
}

impl Router {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let command = tokio::select! {
                biased;
                _ = self.scope.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            match command {
                Command::Register { id, reply, ack } => {
                    let result = if self.pending.contains_key(&id) {
                        Err(RpcError::DuplicateId(id.to_string()))
                    } else {
                        self.pending.insert(id, reply);
                        Ok(())
                    };
                    let _ = ack.send(result);
                }
                Command::Deregister { id } => {
                    self.pending.remove(&id);
                }
                Command::Inbound(message) => {
                    if !self.dispatch(message).await {
                        break;
                    }
                }
                Command::PendingCount(reply) => {
                    let _ = reply.send(self.pending.len());
                }
            }
        }

        if !self.pending.is_empty() {
            debug!(pending = self.pending.len(), "Router stopping with requests outstanding");
        }
    }

    /// Deliver one message. Returns `false` if the scope ended while waiting
    /// on a full notification channel.
    async fn dispatch(&mut self, message: Message) -> bool {
        let routed = message
            .method
            .as_ref()
            .is_some_and(|m| self.routes.contains_key(m));

        if let Some(waiter) = message.id.as_ref().and_then(|id| self.pending.remove(id)) {
            let copy = routed.then(|| message.clone());
            if waiter.send(message).is_err() {
                debug!("Response arrived after its caller gave up");
            }
            return match copy {
                Some(copy) => self.notify(copy).await,
                None => true,
            };
        }

        if routed {
            return self.notify(message).await;
        }

        debug!(
            id = ?message.id,
            method = ?message.method,
            "Dropping unrouted message"
        );
        true
    }

    async fn notify(&mut self, message: Message) -> bool {
        let Some(route) = message.method.as_ref().and_then(|m| self.routes.get(m)) else {
            return true;
        };
        let route = route.clone();
        tokio::select! {
            sent = route.send(message) => {
                if sent.is_err() {
                    warn!("Notification listener dropped its receiver");
                }
                true
            }
            _ = self.scope.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spawn(routes: &[&str], buffer: usize) -> (RouterHandle, HashMap<String, mpsc::Receiver<Message>>, Scope) {
        let scope = Scope::root();
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for method in routes {
            let (tx, rx) = mpsc::channel(buffer);
            senders.insert(method.to_string(), tx);
            receivers.insert(method.to_string(), rx);
        }
        let (handle, _task) = RouterHandle::spawn(senders, scope.clone());
        (handle, receivers, scope)
    }

    #[tokio::test]
    async fn test_response_goes_to_registered_waiter() {
        let (router, _, _scope) = spawn(&[], 1);
        let rx = router.register(RequestId::from("a")).await.unwrap();
        assert_eq!(router.pending_count().await, 1);

        router.inbound(Message::response("a", json!("ok")));
        let msg = rx.await.unwrap();
        assert_eq!(msg.result, Some(json!("ok")));
        assert_eq!(router.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let (router, _, _scope) = spawn(&[], 1);
        let _rx = router.register(RequestId::from("a")).await.unwrap();
        let err = router.register(RequestId::from("a")).await.unwrap_err();
        assert!(matches!(err, RpcError::DuplicateId(ref id) if id == "a"));
        assert_eq!(router.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_notification_routed_by_method() {
        let (router, mut listeners, _scope) = spawn(&["notifications/progress"], 4);
        router
            .inbound(Message::notification("notifications/progress", Some(json!({"p": 1}))));
        router.inbound(Message::notification("notifications/other", None));

        let mut rx = listeners.remove("notifications/progress").unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.params, Some(json!({"p": 1})));
        assert_eq!(router.pending_count().await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deregister_removes_entry() {
        let (router, _, _scope) = spawn(&[], 1);
        let rx = router.register(RequestId::from(7i64)).await.unwrap();
        router.deregister(RequestId::from(7i64));
        assert_eq!(router.pending_count().await, 0);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_scope_end_wakes_waiters() {
        let (router, _, scope) = spawn(&[], 1);
        let rx = router.register(RequestId::from("x")).await.unwrap();
        scope.cancel();
        assert!(rx.await.is_err());
        assert!(matches!(
            router.register(RequestId::from("y")).await,
            Err(RpcError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_full_listener_blocks_until_scope_ends() {
        let (router, _listeners, scope) = spawn(&["tick"], 1);
        router.inbound(Message::notification("tick", None));
        router.inbound(Message::notification("tick", None));
        // The actor is now parked on the full channel; ending the scope frees it.
        scope.cancel();
        assert_eq!(router.pending_count().await, 0);
    }
}
