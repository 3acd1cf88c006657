//! # herald-core: Pure Notification Types
//!
//! Shared data model for the admin notification channel. Everything in this
//! crate is deterministic and free of I/O so the server push transport and
//! the client connection manager agree on one definition of the wire.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Herald Architecture                              │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 apps/herald-server (binary)                     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 herald-bus (network layer)                      │   │
//! │  │   Registry ─► EventBus ─► PushStream ─► Hub    EventClient      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ herald-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌────────────┐   ┌────────────┐   ┌────────────────────┐      │   │
//! │  │   │  envelope  │   │   frame    │   │      router        │      │   │
//! │  │   │ EventType  │   │ data: ..\n\n│  │ type ─► cache keys │      │   │
//! │  │   └────────────┘   └────────────┘   └────────────────────┘      │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO TASKS • NO NETWORK                                │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`envelope`] - `EventEnvelope` and the open-ended `EventType`
//! - [`frame`] - `data: <json>\n\n` encoding and an incremental decoder
//! - [`router`] - Declarative event type to cache key mapping
//! - [`error`] - Decode error types
//!
//! ## Example Usage
//!
//! ```rust
//! use herald_core::envelope::{EventEnvelope, EventType};
//! use herald_core::router::{CacheKey, EventRouter};
//!
//! let envelope = EventEnvelope::new(EventType::NewOrder);
//! let invalidation = EventRouter::new().route(&envelope);
//!
//! assert!(invalidation.contains(&CacheKey::Orders));
//! assert!(invalidation.contains(&CacheKey::DashboardStats));
//! assert!(!invalidation.contains(&CacheKey::Messages));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod envelope;
pub mod error;
pub mod frame;
pub mod router;

// =============================================================================
// Re-exports
// =============================================================================

pub use envelope::{EventEnvelope, EventType};
pub use error::{CoreError, CoreResult};
pub use frame::{encode_frame, FrameDecoder};
pub use router::{CacheInvalidator, CacheKey, EventRouter, Invalidation, RecordingInvalidator};
