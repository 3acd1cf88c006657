//! # Event Envelope
//!
//! The unit of data carried on the admin push channel.
//!
//! ## Envelope Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         EventEnvelope                                   │
//! │                                                                         │
//! │  type       "new_order"                  discriminator (open-ended)    │
//! │  data       { "orderId": "..." }         optional, opaque to the bus   │
//! │  message    "New order #1042"            optional, advisory only       │
//! │  timestamp  "2025-03-01T12:00:00Z"       set by the publisher          │
//! │                                                                         │
//! │  JSON: {"type":"new_order","data":{..},"timestamp":"..."}              │
//! │  Absent `data` / `message` are omitted, not serialized as null.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Envelopes are immutable once published. The bus wraps each one in an
//! `Arc` and hands the same allocation to every receiver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

// =============================================================================
// Event Type
// =============================================================================

/// Discriminator for an [`EventEnvelope`].
///
/// The set is open: any tag the server sends that this build does not know
/// is preserved as [`EventType::Other`] so that newer servers never break
/// older consoles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    /// First frame on every admitted channel.
    Connected,
    /// Keep-alive frame written on the heartbeat interval.
    Heartbeat,
    NewOrder,
    OrderUpdated,
    NewMessage,
    NewConversation,
    MessageDeleted,
    ConversationDeleted,
    StatsUpdated,
    /// Broad change, every cached view is stale.
    SystemUpdate,
    /// Generic change; the payload may name the affected cache keys.
    DataUpdated,
    /// Any tag not known to this build.
    Other(String),
}

impl EventType {
    /// Returns the wire tag.
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Connected => "connected",
            EventType::Heartbeat => "heartbeat",
            EventType::NewOrder => "new_order",
            EventType::OrderUpdated => "order_updated",
            EventType::NewMessage => "new_message",
            EventType::NewConversation => "new_conversation",
            EventType::MessageDeleted => "message_deleted",
            EventType::ConversationDeleted => "conversation_deleted",
            EventType::StatsUpdated => "stats_updated",
            EventType::SystemUpdate => "system_update",
            EventType::DataUpdated => "data_updated",
            EventType::Other(tag) => tag,
        }
    }

    /// Returns true for channel-maintenance types that carry no data change.
    pub fn is_system(&self) -> bool {
        matches!(self, EventType::Connected | EventType::Heartbeat)
    }
}

impl From<&str> for EventType {
    fn from(tag: &str) -> Self {
        match tag {
            "connected" => EventType::Connected,
            "heartbeat" => EventType::Heartbeat,
            "new_order" => EventType::NewOrder,
            "order_updated" => EventType::OrderUpdated,
            "new_message" => EventType::NewMessage,
            "new_conversation" => EventType::NewConversation,
            "message_deleted" => EventType::MessageDeleted,
            "conversation_deleted" => EventType::ConversationDeleted,
            "stats_updated" => EventType::StatsUpdated,
            "system_update" => EventType::SystemUpdate,
            "data_updated" => EventType::DataUpdated,
            other => EventType::Other(other.to_string()),
        }
    }
}

impl From<String> for EventType {
    fn from(tag: String) -> Self {
        match EventType::from(tag.as_str()) {
            EventType::Other(_) => EventType::Other(tag),
            known => known,
        }
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        match event_type {
            EventType::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(EventType::from(s))
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Event Envelope
// =============================================================================

/// A single notification as it travels over the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct EventEnvelope {
    /// Event discriminator.
    #[serde(rename = "type")]
    #[ts(as = "String")]
    pub event_type: EventType,

    /// Type-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "unknown")]
    pub data: Option<Value>,

    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub message: Option<String>,

    /// Emission time (RFC 3339, UTC).
    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    /// Creates an envelope stamped with the current time.
    pub fn new(event_type: impl Into<EventType>) -> Self {
        Self::at(event_type, Utc::now())
    }

    /// Creates an envelope with an explicit timestamp.
    pub fn at(event_type: impl Into<EventType>, timestamp: DateTime<Utc>) -> Self {
        EventEnvelope {
            event_type: event_type.into(),
            data: None,
            message: None,
            timestamp,
        }
    }

    /// The greeting written immediately after admission.
    pub fn connected() -> Self {
        Self::new(EventType::Connected).with_message("Connected to admin event stream")
    }

    /// A keep-alive frame.
    pub fn heartbeat() -> Self {
        Self::new(EventType::Heartbeat)
    }

    /// Attaches a payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attaches a human-readable message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Serializes to the compact JSON used on the wire.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses an envelope from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
