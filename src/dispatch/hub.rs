//! In-process connection registry.
//!
//! Each live connection owns the receiving half of a bounded channel; the hub
//! keeps the senders. Delivery never waits on a slow reader: a full queue is
//! reported as [`DeliveryError::Full`].

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use super::{DeliveryError, Message, MessageDispatcher};
use crate::context::CallContext;

const DEFAULT_CAPACITY: usize = 64;

pub struct ConnectionHub {
    connections: RwLock<HashMap<String, mpsc::Sender<Message>>>,
    capacity: usize,
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ConnectionHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Open a connection. Re-registering an id replaces the old channel.
    pub fn register(&self, connection_id: &str) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(self.capacity);
        if let Ok(mut conns) = self.connections.write() {
            conns.insert(connection_id.to_string(), tx);
        }
        debug!(connection_id, "connection registered");
        rx
    }

    pub fn unregister(&self, connection_id: &str) -> bool {
        self.connections
            .write()
            .map(|mut conns| conns.remove(connection_id).is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.connections.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sender(&self, connection_id: &str) -> Option<mpsc::Sender<Message>> {
        self.connections
            .read()
            .ok()
            .and_then(|conns| conns.get(connection_id).cloned())
    }
}

#[async_trait]
impl MessageDispatcher for ConnectionHub {
    async fn deliver(
        &self,
        _ctx: &CallContext,
        connection_id: &str,
        message: &Message,
    ) -> Result<(), DeliveryError> {
        let Some(tx) = self.sender(connection_id) else {
            return Err(DeliveryError::Gone(connection_id.to_string()));
        };
        match tx.try_send(message.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DeliveryError::Full(connection_id.to_string())),
            Err(TrySendError::Closed(_)) => {
                self.unregister(connection_id);
                Err(DeliveryError::Gone(connection_id.to_string()))
            }
        }
    }
}
