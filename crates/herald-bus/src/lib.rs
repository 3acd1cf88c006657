//! # herald-bus: Admin Notification Fan-out
//!
//! Server-side event bus and push endpoint, plus the console-side client
//! that keeps the push channel alive and routes events to cache
//! invalidations.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Notification Pipeline                             │
//! │                                                                         │
//! │  SERVER                                                                 │
//! │  ──────                                                                 │
//! │  ┌────────────────┐  ┌────────────────────┐  ┌──────────────────────┐  │
//! │  │   EventBus     │  │ ConnectionRegistry │  │    PushTransport     │  │
//! │  │                │  │                    │  │                      │  │
//! │  │ order_created  │─►│ DashMap of open    │─►│ connected greeting   │  │
//! │  │ message_recv'd │  │ channels, bounded  │  │ data: <json>\n\n     │  │
//! │  │ system_update  │  │ write deadline,    │  │ heartbeat every 120s │  │
//! │  │ ...            │  │ purge on failure   │  │                      │  │
//! │  └────────────────┘  └────────────────────┘  └──────────┬───────────┘  │
//! │                                                         │              │
//! │  ┌──────────────────────────────────────────────────────▼───────────┐  │
//! │  │  HubServer (Axum)   GET /admin/events  (AdmissionCheck first)    │  │
//! │  │                     POST /admin/events, GET /health              │  │
//! │  └──────────────────────────────────────────────────────┬───────────┘  │
//! │                                                         │ HTTP stream  │
//! │  CLIENT                                                 ▼              │
//! │  ──────                                                                 │
//! │  ┌────────────────┐  ┌────────────────────┐  ┌──────────────────────┐  │
//! │  │ HttpConnector  │─►│    EventClient     │─►│  EventRouter ─►      │  │
//! │  │ (reqwest)      │  │ ConnectionMachine  │  │  CacheInvalidator    │  │
//! │  └────────────────┘  └────────────────────┘  └──────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Server
//! - [`registry`] - Open channel tracking and broadcast
//! - [`bus`] - Publish API
//! - [`push`] - Event-stream response bodies
//! - [`admission`] - Session check before a channel opens
//! - [`hub`] - Axum server wiring it together
//!
//! ### Client
//! - [`machine`] - Pure reconnect state machine
//! - [`connector`] - Channel openers (HTTP)
//! - [`client`] - `EventClient` runtime
//!
//! ### Shared
//! - [`config`] - `HeraldConfig` (TOML + environment)
//! - [`error`] - `BusError`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use herald_bus::{HeraldConfig, HubServer, JwtAdmission};
//!
//! let config = HeraldConfig::load_or_default(None);
//! let admission = Arc::new(JwtAdmission::from_settings(&config.auth));
//! let hub = HubServer::new(&config, admission).start().await?;
//!
//! // Anywhere in the application
//! hub.bus().order_created(serde_json::json!({ "orderId": "o-1042" })).await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

// Shared
pub mod config;
pub mod error;

// Server
pub mod admission;
pub mod bus;
pub mod hub;
pub mod push;
pub mod registry;

// Client
pub mod client;
pub mod connector;
pub mod machine;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{AuthSettings, ClientSettings, HeraldConfig, PushSettings, ReconnectMode, ServerSettings};
pub use error::{BusError, BusResult};

pub use admission::{AdmissionCheck, AdmittedSession, JwtAdmission, SessionClaims};
pub use bus::EventBus;
pub use hub::{HubHandle, HubServer};
pub use push::PushTransport;
pub use registry::{BroadcastReport, ConnectionId, ConnectionInfo, ConnectionRegistry, RegistrationHandle};

pub use client::{ClientOptions, EventClient, EventClientHandle};
pub use connector::{ChannelConnector, ChannelStream, Credentials, HttpConnector};
pub use machine::{ClientStatus, ConnectionMachine, ConnectionState, ReconnectPolicy};
