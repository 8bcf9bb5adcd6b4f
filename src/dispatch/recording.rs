//! Dispatcher that remembers what it was asked to deliver.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{DeliveryError, Message, MessageDispatcher};
use crate::context::CallContext;

/// Records successful deliveries. Connections marked gone fail; an optional
/// per-connection delay simulates slow peers.
#[derive(Default)]
pub struct RecordingDispatcher {
    delivered: Mutex<Vec<(String, Message)>>,
    attempts: Mutex<Vec<String>>,
    gone: HashSet<String>,
    delays: Vec<(String, Duration)>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gone(mut self, connection_id: &str) -> Self {
        self.gone.insert(connection_id.to_string());
        self
    }

    pub fn with_delay(mut self, connection_id: &str, delay: Duration) -> Self {
        self.delays.push((connection_id.to_string(), delay));
        self
    }

    pub fn delivered(&self) -> Vec<(String, Message)> {
        self.delivered.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn delivered_to(&self, connection_id: &str) -> Vec<Message> {
        self.delivered()
            .into_iter()
            .filter(|(c, _)| c == connection_id)
            .map(|(_, m)| m)
            .collect()
    }

    /// Every connection a delivery was attempted on, including failures.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut d) = self.delivered.lock() {
            d.clear();
        }
        if let Ok(mut a) = self.attempts.lock() {
            a.clear();
        }
    }
}

#[async_trait]
impl MessageDispatcher for RecordingDispatcher {
    async fn deliver(
        &self,
        ctx: &CallContext,
        connection_id: &str,
        message: &Message,
    ) -> Result<(), DeliveryError> {
        if let Ok(mut a) = self.attempts.lock() {
            a.push(connection_id.to_string());
        }
        if self.gone.contains(connection_id) {
            return Err(DeliveryError::Gone(connection_id.to_string()));
        }
        if let Some((_, delay)) = self.delays.iter().find(|(c, _)| c == connection_id) {
            ctx.run(tokio::time::sleep(*delay))
                .await
                .ok_or(DeliveryError::Timeout)?;
        }
        if let Ok(mut d) = self.delivered.lock() {
            d.push((connection_id.to_string(), message.clone()));
        }
        Ok(())
    }
}
