//! SSH message dispatcher.
//!
//! Routes incoming messages that the transport does not handle itself:
//!
//! 1. a task waiting for that message type gets the payload
//! 2. otherwise the handler registered for the type is invoked
//! 3. otherwise the transport answers with SSH_MSG_UNIMPLEMENTED
//!
//! Handlers are registered in named scopes (`"ssh-connection"`,
//! `"ssh-userauth"`, ...) so a sub-protocol can add and remove all of its
//! message types at once.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tidewire_platform::{TidewireError, TidewireResult};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::message::MessageType;
use super::transport::Transport;

/// Receives messages of the types it was registered for.
///
/// Handlers run on the connection's receive task, so they see messages in
/// arrival order. A handler may send, but must not wait for another
/// incoming message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one message. `payload` starts with the message type byte.
    ///
    /// # Errors
    ///
    /// An error makes the transport disconnect with PROTOCOL_ERROR.
    async fn handle(&self, transport: &Transport, payload: &[u8]) -> TidewireResult<()>;

    /// Called once when the transport has closed.
    async fn on_transport_closed(&self) {}
}

type WaiterResult = TidewireResult<Vec<u8>>;

struct WaiterSlot {
    id: u64,
    types: Vec<u8>,
    tx: Mutex<Option<oneshot::Sender<WaiterResult>>>,
}

impl WaiterSlot {
    fn is_stale(&self) -> bool {
        lock(&self.tx).as_ref().map_or(true, |tx| tx.is_closed())
    }
}

/// A pending wait for one of a set of message types.
///
/// Created by [`Transport::expect`]; register it before sending the
/// request whose answer it waits for.
#[derive(Debug)]
pub struct Waiter {
    rx: oneshot::Receiver<WaiterResult>,
}

impl Waiter {
    /// Waits for the message.
    ///
    /// # Errors
    ///
    /// Returns [`TidewireError::ConnectionLost`] (or the disconnect that
    /// ended the connection) if the transport closes first.
    pub async fn recv(self) -> TidewireResult<Vec<u8>> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(TidewireError::ConnectionLost(
                "Transport dropped the waiter".to_string(),
            )),
        }
    }
}

struct Scope {
    types: Vec<u8>,
    handler: Arc<dyn MessageHandler>,
}

/// Waiter table and handler registry for one transport.
#[derive(Default)]
pub struct Dispatcher {
    next_waiter: AtomicU64,
    waiters: Mutex<HashMap<u8, Arc<WaiterSlot>>>,
    scopes: Mutex<HashMap<String, Scope>>,
    closed: Mutex<Option<String>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let waiting: Vec<u8> = lock(&self.waiters).keys().copied().collect();
        let scopes: Vec<String> = lock(&self.scopes).keys().cloned().collect();
        f.debug_struct("Dispatcher")
            .field("waiting", &waiting)
            .field("scopes", &scopes)
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn type_name(msg_type: u8) -> String {
    MessageType::from_u8(msg_type)
        .map(|t| t.name().to_string())
        .unwrap_or_else(|| msg_type.to_string())
}

impl Dispatcher {
    /// Creates an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for the first message of any of `types`.
    ///
    /// # Errors
    ///
    /// - [`TidewireError::WaiterConflict`] if another live waiter exists
    ///   for one of the types
    /// - [`TidewireError::ConnectionLost`] if the transport already closed
    pub fn expect(&self, types: &[u8]) -> TidewireResult<Waiter> {
        if let Some(reason) = lock(&self.closed).clone() {
            return Err(TidewireError::ConnectionLost(reason));
        }

        let mut waiters = lock(&self.waiters);
        for t in types {
            if let Some(existing) = waiters.get(t) {
                if !existing.is_stale() {
                    return Err(TidewireError::WaiterConflict(format!(
                        "Already waiting for {}",
                        type_name(*t)
                    )));
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(WaiterSlot {
            id: self.next_waiter.fetch_add(1, Ordering::Relaxed),
            types: types.to_vec(),
            tx: Mutex::new(Some(tx)),
        });
        for t in types {
            waiters.insert(*t, slot.clone());
        }
        trace!(types = ?types, "Registered waiter");
        Ok(Waiter { rx })
    }

    /// Hands `payload` to the waiter for its type. Returns the payload back
    /// if nobody was waiting.
    pub fn deliver(&self, payload: Vec<u8>) -> Option<Vec<u8>> {
        let Some(&msg_type) = payload.first() else {
            return Some(payload);
        };

        let slot = {
            let mut waiters = lock(&self.waiters);
            let Some(slot) = waiters.remove(&msg_type) else {
                return Some(payload);
            };
            for t in &slot.types {
                if waiters.get(t).is_some_and(|s| s.id == slot.id) {
                    waiters.remove(t);
                }
            }
            slot
        };

        let Some(tx) = lock(&slot.tx).take() else {
            return Some(payload);
        };
        match tx.send(Ok(payload)) {
            Ok(()) => {
                trace!(msg_type = %type_name(msg_type), "Delivered to waiter");
                None
            }
            Err(result) => result.ok(),
        }
    }

    /// Registers `handler` for `types` under `scope`, replacing any earlier
    /// registration of the same scope.
    ///
    /// # Errors
    ///
    /// Returns [`TidewireError::Config`] if another scope already handles
    /// one of the types.
    pub fn register_handlers(
        &self,
        scope: &str,
        types: &[u8],
        handler: Arc<dyn MessageHandler>,
    ) -> TidewireResult<()> {
        let mut scopes = lock(&self.scopes);
        for (name, existing) in scopes.iter() {
            if name == scope {
                continue;
            }
            if let Some(t) = types.iter().find(|t| existing.types.contains(t)) {
                return Err(TidewireError::Config(format!(
                    "{} is already handled by scope {}",
                    type_name(*t),
                    name
                )));
            }
        }
        scopes.insert(
            scope.to_string(),
            Scope {
                types: types.to_vec(),
                handler,
            },
        );
        debug!(scope, types = ?types, "Registered handlers");
        Ok(())
    }

    /// Removes every handler of `scope`.
    pub fn unregister_handlers(&self, scope: &str) {
        if lock(&self.scopes).remove(scope).is_some() {
            debug!(scope, "Unregistered handlers");
        }
    }

    /// Returns the handler registered for `msg_type`.
    pub fn handler_for(&self, msg_type: u8) -> Option<Arc<dyn MessageHandler>> {
        lock(&self.scopes)
            .values()
            .find(|s| s.types.contains(&msg_type))
            .map(|s| s.handler.clone())
    }

    /// Fails every waiter with `ConnectionLost(reason)`, refuses new ones,
    /// and returns the handlers to notify.
    pub fn close(&self, reason: &str) -> Vec<Arc<dyn MessageHandler>> {
        *lock(&self.closed) = Some(reason.to_string());

        let slots: Vec<Arc<WaiterSlot>> = lock(&self.waiters).drain().map(|(_, s)| s).collect();
        for slot in slots {
            if let Some(tx) = lock(&slot.tx).take() {
                let _ = tx.send(Err(TidewireError::ConnectionLost(reason.to_string())));
            }
        }

        lock(&self.scopes)
            .drain()
            .map(|(_, scope)| scope.handler)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    #[async_trait]
    impl MessageHandler for Nop {
        async fn handle(&self, _transport: &Transport, _payload: &[u8]) -> TidewireResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_waiter_receives_payload() {
        let d = Dispatcher::new();
        let waiter = d.expect(&[6]).unwrap();
        assert!(d.deliver(vec![6, 1, 2]).is_none());
        assert_eq!(waiter.recv().await.unwrap(), vec![6, 1, 2]);
    }

    #[test]
    fn test_second_waiter_conflicts() {
        let d = Dispatcher::new();
        let _first = d.expect(&[51, 52]).unwrap();
        let err = d.expect(&[52]).unwrap_err();
        assert!(matches!(err, TidewireError::WaiterConflict(_)));
    }

    #[test]
    fn test_dropped_waiter_can_be_replaced() {
        let d = Dispatcher::new();
        drop(d.expect(&[6]).unwrap());
        assert!(d.expect(&[6]).is_ok());
    }

    #[tokio::test]
    async fn test_multi_type_waiter_is_removed_from_all_types() {
        let d = Dispatcher::new();
        let waiter = d.expect(&[51, 52, 60]).unwrap();
        assert!(d.deliver(vec![52]).is_none());
        assert_eq!(waiter.recv().await.unwrap(), vec![52]);
        // Nobody is waiting for 51 any more.
        assert_eq!(d.deliver(vec![51]), Some(vec![51]));
    }

    #[test]
    fn test_deliver_without_waiter() {
        let d = Dispatcher::new();
        assert_eq!(d.deliver(vec![94, 0]), Some(vec![94, 0]));
    }

    #[test]
    fn test_handler_registration() {
        let d = Dispatcher::new();
        d.register_handlers("ssh-connection", &[90, 94], Arc::new(Nop))
            .unwrap();
        assert!(d.handler_for(94).is_some());
        assert!(d.handler_for(50).is_none());

        let err = d
            .register_handlers("other", &[94], Arc::new(Nop))
            .unwrap_err();
        assert!(matches!(err, TidewireError::Config(_)));

        d.unregister_handlers("ssh-connection");
        assert!(d.handler_for(94).is_none());
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let d = Dispatcher::new();
        d.register_handlers("ssh-userauth", &[53], Arc::new(Nop)).unwrap();
        let waiter = d.expect(&[52]).unwrap();

        let handlers = d.close("peer went away");
        assert_eq!(handlers.len(), 1);
        assert!(matches!(
            waiter.recv().await,
            Err(TidewireError::ConnectionLost(_))
        ));
        assert!(matches!(
            d.expect(&[52]),
            Err(TidewireError::ConnectionLost(_))
        ));
    }
}
