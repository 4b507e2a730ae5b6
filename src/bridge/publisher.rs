//! Outbound publishing with token attachment
//!
//! [`MessagePublisher`] turns an [`OutboundEvent`] into a [`Message`],
//! resolves its route and stamps the current token before handing it to the
//! broker. A stale-token rejection gets exactly one refresh-and-retry.

use crate::auth::TokenCache;
use crate::error::GatewayError;
use crate::protocol::{Message, OutboundEvent, RouteTable};
use crate::transport::{BrokerError, BrokerTransport};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub struct MessagePublisher<T: BrokerTransport> {
    transport: Arc<T>,
    tokens: Arc<TokenCache>,
    routes: Arc<RouteTable>,
    gateway_id: String,
}

impl<T: BrokerTransport> MessagePublisher<T> {
    pub fn new(
        transport: Arc<T>,
        tokens: Arc<TokenCache>,
        routes: Arc<RouteTable>,
        gateway_id: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            tokens,
            routes,
            gateway_id: gateway_id.into(),
        }
    }

    /// Gateway id used as the device id of gateway-wide events
    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    /// Publish an event on the route derived from its device id
    ///
    /// Resolves once the broker has acknowledged the message and returns its
    /// message id.
    pub async fn publish(&self, event: &OutboundEvent) -> Result<Uuid, GatewayError> {
        let device_id = event.device_id().unwrap_or(&self.gateway_id);
        let route = self
            .routes
            .resolve(event.route_key(), Some(device_id))
            .map_err(|e| GatewayError::Publish(e.to_string()))?;
        let payload = serde_json::to_value(event)
            .map_err(|e| GatewayError::Publish(format!("serialization error: {e}")))?;
        let message = Message::new(device_id, payload)
            .with_correlation_id(event.correlation_id().map(str::to_string));

        let token = self.tokens.current().await?;
        match self
            .transport
            .publish(&route, &message.stamped(&token.value))
            .await
        {
            Ok(()) => {
                debug!(topic = %route.topic, message_id = %message.id, "Event published");
                Ok(message.id)
            }
            Err(BrokerError::TokenRejected) => {
                warn!(
                    topic = %route.topic,
                    generation = token.generation,
                    "Broker rejected token, refreshing"
                );
                let fresh = self.tokens.refresh(Some(token.generation)).await?;
                self.transport
                    .publish(&route, &message.stamped(&fresh.value))
                    .await
                    .map_err(|e| {
                        if e == BrokerError::TokenRejected {
                            error!(topic = %route.topic, "Broker rejected refreshed token");
                        }
                        GatewayError::from(e)
                    })?;
                Ok(message.id)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use crate::config::RoutesSection;
    use crate::protocol::{DeviceRecord, TOKEN_HEADER};
    use crate::testing::mocks::{MockTransport, SequenceTokenProvider};

    fn publisher(transport: Arc<MockTransport>, tokens: Arc<TokenCache>) -> MessagePublisher<MockTransport> {
        MessagePublisher::new(
            transport,
            tokens,
            Arc::new(RouteTable::from_config(&RoutesSection::default())),
            "gw-1",
        )
    }

    #[tokio::test]
    async fn test_publish_stamps_token_in_header() {
        let transport = Arc::new(MockTransport::new());
        let tokens = Arc::new(TokenCache::new(Arc::new(
            StaticTokenProvider::new("tok").unwrap(),
        )));
        let publisher = publisher(transport.clone(), tokens);

        let event = OutboundEvent::DeviceAdded {
            device: DeviceRecord::new("d1"),
        };
        let id = publisher.publish(&event).await.unwrap();

        let frames = transport.published_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].topic, "fog/devices/d1/registered");
        assert_eq!(frames[0].header(TOKEN_HEADER), Some("tok"));
        assert_eq!(frames[0].message_id(), Some(id));

        let body: serde_json::Value = serde_json::from_slice(&frames[0].body).unwrap();
        assert_eq!(body["type"], "device_added");
        assert!(body.get("token").is_none());
    }

    #[tokio::test]
    async fn test_gateway_events_use_gateway_id() {
        let transport = Arc::new(MockTransport::new());
        let tokens = Arc::new(TokenCache::new(Arc::new(
            StaticTokenProvider::new("tok").unwrap(),
        )));
        let publisher = publisher(transport.clone(), tokens);

        publisher
            .publish(&OutboundEvent::Inventory { devices: vec![] })
            .await
            .unwrap();

        let frames = transport.published_frames();
        assert_eq!(frames[0].topic, "fog/cloud/inventory");
        assert_eq!(frames[0].header(crate::protocol::DEVICE_ID_HEADER), Some("gw-1"));
    }

    #[tokio::test]
    async fn test_stale_token_refreshed_once() {
        let transport = Arc::new(MockTransport::new());
        transport.reject_tokens(["old"]);
        let provider = Arc::new(SequenceTokenProvider::new(["old", "new"]));
        let tokens = Arc::new(TokenCache::new(provider.clone()));
        let publisher = publisher(transport.clone(), tokens.clone());

        let id = publisher
            .publish(&OutboundEvent::DeviceRemoved {
                device_id: "d1".into(),
            })
            .await
            .unwrap();

        let frames = transport.published_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header(TOKEN_HEADER), Some("new"));
        assert_eq!(frames[0].message_id(), Some(id));
        assert_eq!(tokens.refresh_count(), 2);
    }

    #[tokio::test]
    async fn test_second_rejection_surfaces_publish_error() {
        let transport = Arc::new(MockTransport::new());
        transport.reject_tokens(["old", "still-old", "never-used"]);
        let provider = Arc::new(SequenceTokenProvider::new(["old", "still-old", "never-used"]));
        let tokens = Arc::new(TokenCache::new(provider.clone()));
        let publisher = publisher(transport.clone(), tokens.clone());

        let result = publisher
            .publish(&OutboundEvent::DeviceRemoved {
                device_id: "d1".into(),
            })
            .await;

        assert!(matches!(result, Err(GatewayError::Publish(_))));
        assert_eq!(provider.fetch_count(), 2);
        assert_eq!(transport.publish_attempts(), 2);
        assert!(transport.published_frames().is_empty());
    }

    #[tokio::test]
    async fn test_backpressure_not_retried() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_next_publish(BrokerError::Backpressure { capacity: 4 });
        let tokens = Arc::new(TokenCache::new(Arc::new(
            StaticTokenProvider::new("tok").unwrap(),
        )));
        let publisher = publisher(transport.clone(), tokens.clone());

        let result = publisher
            .publish(&OutboundEvent::DeviceRemoved {
                device_id: "d1".into(),
            })
            .await;

        assert!(matches!(result, Err(GatewayError::Backpressure { capacity: 4 })));
        assert_eq!(tokens.refresh_count(), 1);
    }
}
