//! # Event Bus
//!
//! Publish API used by the rest of the application to notify admin consoles.
//!
//! ```text
//!  order service ──┐
//!  inbox service ──┼──► EventBus::publish ──► ConnectionRegistry::broadcast
//!  admin actions ──┘         (stamps timestamp,        (fan-out, purge)
//!                             wraps in Arc)
//! ```
//!
//! Fire-and-forget: publishing never fails and never waits for a client to
//! acknowledge. With no consoles connected the event is simply dropped.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use herald_core::{CacheKey, EventEnvelope, EventType};

use crate::registry::{BroadcastReport, ConnectionRegistry};

/// Cloneable publisher bound to one [`ConnectionRegistry`].
#[derive(Debug, Clone)]
pub struct EventBus {
    registry: Arc<ConnectionRegistry>,
}

impl EventBus {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        EventBus { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Builds an envelope stamped with the current time and broadcasts it.
    ///
    /// Returns once every registered connection has been attempted.
    pub async fn publish(
        &self,
        event_type: impl Into<EventType>,
        data: Option<Value>,
        message: Option<String>,
    ) -> BroadcastReport {
        let mut envelope = EventEnvelope::new(event_type);
        envelope.data = data;
        envelope.message = message;
        self.publish_envelope(envelope).await
    }

    /// Broadcasts an envelope built by the caller.
    pub async fn publish_envelope(&self, envelope: EventEnvelope) -> BroadcastReport {
        debug!(event_type = %envelope.event_type, "Publishing event");
        self.registry.broadcast(Arc::new(envelope)).await
    }

    // =========================================================================
    // Domain Events
    // =========================================================================

    pub async fn order_created(&self, order: Value) -> BroadcastReport {
        self.publish(
            EventType::NewOrder,
            Some(order),
            Some("New order received".into()),
        )
        .await
    }

    pub async fn order_updated(&self, order_id: &str, status: &str) -> BroadcastReport {
        self.publish(
            EventType::OrderUpdated,
            Some(json!({ "orderId": order_id, "status": status })),
            Some(format!("Order {} is now {}", order_id, status)),
        )
        .await
    }

    pub async fn message_received(&self, message: Value) -> BroadcastReport {
        self.publish(
            EventType::NewMessage,
            Some(message),
            Some("New message received".into()),
        )
        .await
    }

    pub async fn message_deleted(&self, message_id: &str) -> BroadcastReport {
        self.publish(
            EventType::MessageDeleted,
            Some(json!({ "messageId": message_id })),
            None,
        )
        .await
    }

    pub async fn conversation_created(&self, conversation: Value) -> BroadcastReport {
        self.publish(
            EventType::NewConversation,
            Some(conversation),
            Some("New conversation started".into()),
        )
        .await
    }

    pub async fn conversation_deleted(&self, conversation_id: &str) -> BroadcastReport {
        self.publish(
            EventType::ConversationDeleted,
            Some(json!({ "conversationId": conversation_id })),
            None,
        )
        .await
    }

    pub async fn stats_updated(&self, stats: Option<Value>) -> BroadcastReport {
        self.publish(EventType::StatsUpdated, stats, None).await
    }

    /// Tells every console that all cached views are stale.
    pub async fn system_update(&self, message: impl Into<String>) -> BroadcastReport {
        self.publish(EventType::SystemUpdate, None, Some(message.into()))
            .await
    }

    /// Generic change notice naming the cache keys to refetch.
    pub async fn data_updated(&self, keys: &[CacheKey]) -> BroadcastReport {
        let keys: Vec<&str> = keys.iter().map(CacheKey::as_str).collect();
        self.publish(EventType::DataUpdated, Some(json!({ "keys": keys })), None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::EventRouter;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(ConnectionRegistry::default()))
    }

    #[tokio::test]
    async fn test_publish_without_connections_is_silent() {
        let bus = bus();
        let report = bus.message_received(json!({ "from": "guest" })).await;
        assert_eq!(report.attempted(), 0);
        assert_eq!(bus.registry().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_builds_envelope() {
        let bus = bus();
        let (_handle, mut rx) = bus.registry().register("admin-a").unwrap();

        bus.publish("new_order", Some(json!({ "orderId": "o-7" })), Some("hi".into()))
            .await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, EventType::NewOrder);
        assert_eq!(received.data, Some(json!({ "orderId": "o-7" })));
        assert_eq!(received.message.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_the_other() {
        let bus = bus();
        let (_keep, mut keep_rx) = bus.registry().register("admin-a").unwrap();
        let (_lost, lost_rx) = bus.registry().register("admin-b").unwrap();
        drop(lost_rx);

        let report = bus.order_updated("o-1", "shipped").await;

        assert_eq!(report.delivered, 1);
        assert_eq!(bus.registry().connection_count(), 1);
        let received = keep_rx.recv().await.unwrap();
        assert_eq!(received.event_type, EventType::OrderUpdated);
        assert_eq!(received.data.as_ref().unwrap()["status"], "shipped");
    }

    #[tokio::test]
    async fn test_data_updated_routes_named_keys() {
        let bus = bus();
        let (_handle, mut rx) = bus.registry().register("admin-a").unwrap();

        bus.data_updated(&[CacheKey::Conversations, CacheKey::Orders])
            .await;

        let received = rx.recv().await.unwrap();
        let invalidation = EventRouter::new().route(&received);
        assert_eq!(
            invalidation.keys().collect::<Vec<_>>(),
            vec![CacheKey::Orders, CacheKey::Conversations]
        );
    }

    #[tokio::test]
    async fn test_envelopes_arrive_in_publish_order() {
        let bus = bus();
        let (_handle, mut rx) = bus.registry().register("admin-a").unwrap();

        bus.order_created(json!({ "orderId": "o-1" })).await;
        bus.stats_updated(None).await;
        bus.system_update("Catalog reindexed").await;

        assert_eq!(rx.recv().await.unwrap().event_type, EventType::NewOrder);
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::StatsUpdated);
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::SystemUpdate);
    }
}
