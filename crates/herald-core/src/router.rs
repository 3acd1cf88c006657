//! # Event Router
//!
//! Maps each received event type to the client cache entries it makes stale.
//!
//! ## Routing Table
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Event Type ─► Cache Keys                            │
//! │                                                                         │
//! │  new_order, order_updated          orders, dashboard-stats,            │
//! │                                    recent-activity                      │
//! │  new_message, message_deleted      messages, dashboard-stats           │
//! │  new_conversation,                 conversations, dashboard-stats      │
//! │    conversation_deleted                                                 │
//! │  stats_updated                     dashboard-stats, recent-activity    │
//! │  system_update                     every key                           │
//! │  data_updated                      data.keys from the payload, else    │
//! │                                    dashboard-stats, recent-activity    │
//! │                                                                         │
//! │  connected, heartbeat, unknown     nothing                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The table is plain data. Supporting a new event type means adding a row
//! (or calling [`EventRouter::with_route`]); the transport and registry never
//! change.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::envelope::{EventEnvelope, EventType};

// =============================================================================
// Cache Keys
// =============================================================================

/// A client-side cache entry that can be invalidated and refetched.
///
/// The five well-known keys are the ones the default table routes to.
/// Publishers may name any other cache in a `data_updated` payload; those
/// are carried as [`CacheKey::Other`] so the console still refetches them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CacheKey {
    Orders,
    Messages,
    Conversations,
    DashboardStats,
    RecentActivity,
    /// A cache this build has no well-known key for.
    Other(String),
}

impl CacheKey {
    /// Every well-known key, used by `system_update`.
    pub const ALL: [CacheKey; 5] = [
        CacheKey::Orders,
        CacheKey::Messages,
        CacheKey::Conversations,
        CacheKey::DashboardStats,
        CacheKey::RecentActivity,
    ];

    /// Returns the key as it appears in payloads and query caches.
    pub fn as_str(&self) -> &str {
        match self {
            CacheKey::Orders => "orders",
            CacheKey::Messages => "messages",
            CacheKey::Conversations => "conversations",
            CacheKey::DashboardStats => "dashboard-stats",
            CacheKey::RecentActivity => "recent-activity",
            CacheKey::Other(name) => name,
        }
    }
}

impl From<&str> for CacheKey {
    fn from(name: &str) -> Self {
        match name {
            "orders" => CacheKey::Orders,
            "messages" => CacheKey::Messages,
            "conversations" => CacheKey::Conversations,
            "dashboard-stats" => CacheKey::DashboardStats,
            "recent-activity" => CacheKey::RecentActivity,
            other => CacheKey::Other(other.to_string()),
        }
    }
}

impl From<String> for CacheKey {
    fn from(name: String) -> Self {
        match CacheKey::from(name.as_str()) {
            CacheKey::Other(_) => CacheKey::Other(name),
            known => known,
        }
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        match key {
            CacheKey::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Routes
// =============================================================================

/// What a given event type invalidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// A fixed set of keys.
    Keys(&'static [CacheKey]),
    /// Every well-known key.
    All,
    /// Keys listed in `data.keys`, falling back to the given set when the
    /// payload names none.
    FromPayload { fallback: &'static [CacheKey] },
}

const ORDER_KEYS: &[CacheKey] = &[
    CacheKey::Orders,
    CacheKey::DashboardStats,
    CacheKey::RecentActivity,
];
const MESSAGE_KEYS: &[CacheKey] = &[CacheKey::Messages, CacheKey::DashboardStats];
const CONVERSATION_KEYS: &[CacheKey] = &[CacheKey::Conversations, CacheKey::DashboardStats];
const STATS_KEYS: &[CacheKey] = &[CacheKey::DashboardStats, CacheKey::RecentActivity];

/// The default routing table.
const ROUTES: &[(&str, Route)] = &[
    ("new_order", Route::Keys(ORDER_KEYS)),
    ("order_updated", Route::Keys(ORDER_KEYS)),
    ("new_message", Route::Keys(MESSAGE_KEYS)),
    ("message_deleted", Route::Keys(MESSAGE_KEYS)),
    ("new_conversation", Route::Keys(CONVERSATION_KEYS)),
    ("conversation_deleted", Route::Keys(CONVERSATION_KEYS)),
    ("stats_updated", Route::Keys(STATS_KEYS)),
    ("system_update", Route::All),
    ("data_updated", Route::FromPayload { fallback: STATS_KEYS }),
];

// =============================================================================
// Invalidation
// =============================================================================

/// The set of cache keys one event invalidates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invalidation {
    keys: BTreeSet<CacheKey>,
}

impl Invalidation {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Keys in a stable order.
    pub fn keys(&self) -> impl Iterator<Item = CacheKey> + '_ {
        self.keys.iter().cloned()
    }
}

impl FromIterator<CacheKey> for Invalidation {
    fn from_iter<I: IntoIterator<Item = CacheKey>>(iter: I) -> Self {
        Invalidation {
            keys: iter.into_iter().collect(),
        }
    }
}

// =============================================================================
// Event Router
// =============================================================================

/// Table-driven mapping from event type to cache invalidation.
#[derive(Debug, Clone)]
pub struct EventRouter {
    routes: HashMap<String, Route>,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    /// Creates a router loaded with the default table.
    pub fn new() -> Self {
        EventRouter {
            routes: ROUTES
                .iter()
                .map(|(tag, route)| (tag.to_string(), route.clone()))
                .collect(),
        }
    }

    /// Adds or replaces the route for an event type.
    pub fn with_route(mut self, event_type: impl Into<EventType>, route: Route) -> Self {
        self.routes.insert(event_type.into().to_string(), route);
        self
    }

    /// Returns the invalidation for an envelope. Misses yield an empty set.
    pub fn route(&self, envelope: &EventEnvelope) -> Invalidation {
        match self.routes.get(envelope.event_type.as_str()) {
            None => Invalidation::none(),
            Some(Route::Keys(keys)) => keys.iter().cloned().collect(),
            Some(Route::All) => CacheKey::ALL.into_iter().collect(),
            Some(Route::FromPayload { fallback }) => {
                let requested = payload_keys(envelope);
                if requested.is_empty() {
                    fallback.iter().cloned().collect()
                } else {
                    requested
                }
            }
        }
    }
}

/// Reads `data.keys` as a list of cache key names. Blank names are skipped.
fn payload_keys(envelope: &EventEnvelope) -> Invalidation {
    envelope
        .data
        .as_ref()
        .and_then(|data| data.get("keys"))
        .and_then(|keys| keys.as_array())
        .map(|keys| {
            keys.iter()
                .filter_map(|k| k.as_str())
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(CacheKey::from)
                .collect()
        })
        .unwrap_or_default()
}

// =============================================================================
// Cache Invalidator
// =============================================================================

/// The local cache the router's output is applied to.
///
/// Implemented by the console's query cache integration.
pub trait CacheInvalidator: Send + Sync {
    /// Marks the given keys stale and triggers a refetch.
    fn invalidate(&self, invalidation: &Invalidation);
}

/// Invalidator that records every call, in order.
#[derive(Debug, Default)]
pub struct RecordingInvalidator {
    calls: Mutex<Vec<Invalidation>>,
}

impl RecordingInvalidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all invalidations received so far.
    pub fn calls(&self) -> Vec<Invalidation> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

impl CacheInvalidator for RecordingInvalidator {
    fn invalidate(&self, invalidation: &Invalidation) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(invalidation.clone());
        }
    }
}
