//! Delivery through a connection-management HTTP endpoint.
//!
//! `POST {endpoint}/@connections/{connection_id}` with the message as the JSON
//! body. A 410 means the connection no longer exists.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::{DeliveryError, Message, MessageDispatcher};
use crate::context::CallContext;

#[derive(Clone)]
pub struct HttpDispatcher {
    client: Client,
    endpoint: String,
}

impl HttpDispatcher {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(Client::new(), endpoint)
    }

    pub fn with_client(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn connection_url(&self, connection_id: &str) -> String {
        format!("{}/@connections/{}", self.endpoint, connection_id)
    }
}

#[async_trait]
impl MessageDispatcher for HttpDispatcher {
    async fn deliver(
        &self,
        ctx: &CallContext,
        connection_id: &str,
        message: &Message,
    ) -> Result<(), DeliveryError> {
        let url = self.connection_url(connection_id);
        let response = ctx
            .run(self.client.post(&url).json(message).send())
            .await
            .ok_or(DeliveryError::Timeout)?
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        match response.status() {
            StatusCode::GONE => Err(DeliveryError::Gone(connection_id.to_string())),
            status if status.is_success() => {
                debug!(connection_id, "message posted");
                Ok(())
            }
            status => Err(DeliveryError::Transport(format!(
                "{} returned {}",
                url, status
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_url() {
        let d = HttpDispatcher::new("https://ws.example.com/prod/");
        assert_eq!(
            d.connection_url("abc="),
            "https://ws.example.com/prod/@connections/abc="
        );
    }
}
