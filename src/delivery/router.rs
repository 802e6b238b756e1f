//! Client router: client id → live delivery channel.

use std::collections::HashMap;

use tokio::sync::{RwLock, mpsc};
use tracing::debug;

use super::events::ServerEvent;
use crate::queue::ClientId;

/// Registry of connected clients. The single source of truth for
/// reachability.
#[derive(Default)]
pub struct ClientRouter {
    clients: RwLock<HashMap<ClientId, mpsc::UnboundedSender<ServerEvent>>>,
}

impl ClientRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. A second registration under the same id
    /// replaces the first.
    pub async fn register(&self, client_id: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.write().await.insert(client_id.to_string(), tx);
        debug!(client_id, "Client registered");
        rx
    }

    pub async fn unregister(&self, client_id: &str) {
        if self.clients.write().await.remove(client_id).is_some() {
            debug!(client_id, "Client unregistered");
        }
    }

    /// Registered and the connection is still reading.
    pub async fn is_reachable(&self, client_id: &str) -> bool {
        self.clients
            .read()
            .await
            .get(client_id)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Deliver to one client. `false` is a miss; misses are not retried.
    pub async fn deliver_to(&self, client_id: &str, event: ServerEvent) -> bool {
        let name = event.name();
        let delivered = match self.clients.read().await.get(client_id) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        };
        if !delivered {
            debug!(client_id, event = name, "Delivery miss");
        }
        delivered
    }

    /// Deliver to every connected client. Returns the number reached.
    pub async fn broadcast(&self, event: ServerEvent) -> usize {
        let clients = self.clients.read().await;
        clients
            .values()
            .filter(|tx| tx.send(event.clone()).is_ok())
            .count()
    }

    pub async fn connected(&self) -> usize {
        self.clients.read().await.len()
    }
}
