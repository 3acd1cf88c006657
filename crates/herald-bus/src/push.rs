//! # Push Transport
//!
//! Turns a registered connection into a streaming HTTP response body.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          PushStream lifecycle                           │
//! │                                                                         │
//! │  admitted ──► register ──► data: {"type":"connected",..}\n\n            │
//! │                                │                                        │
//! │                 ┌──────────────┴──────────────┐                         │
//! │                 ▼                             ▼                         │
//! │        queue.recv()                 heartbeat tick (120s)               │
//! │        data: {envelope}\n\n         data: {"type":"heartbeat",..}\n\n   │
//! │                 │                             │                         │
//! │                 └──────────────┬──────────────┘                         │
//! │                                ▼                                        │
//! │   client aborts / write fails: body dropped ──► handle dropped          │
//! │                                                 ──► unregister          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{self, Stream};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use herald_core::{encode_frame, EventEnvelope};

use crate::error::BusResult;
use crate::registry::{ConnectionRegistry, RegistrationHandle};

/// Default interval between heartbeat frames.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(120);

// =============================================================================
// Push Transport
// =============================================================================

/// Opens push channels on a registry.
#[derive(Debug, Clone)]
pub struct PushTransport {
    registry: Arc<ConnectionRegistry>,
    heartbeat: Duration,
}

impl PushTransport {
    pub fn new(registry: Arc<ConnectionRegistry>, heartbeat: Duration) -> Self {
        PushTransport {
            registry,
            heartbeat,
        }
    }

    /// Registers a connection for an admitted session and returns its frame
    /// stream. The connection stays registered until the stream is dropped.
    pub fn open(
        &self,
        session_id: impl Into<String>,
    ) -> BusResult<impl Stream<Item = Result<String, Infallible>> + Send + 'static> {
        let (handle, queue) = self.registry.register(session_id)?;
        Ok(push_stream(handle, queue, self.heartbeat))
    }

    /// Opens a channel and wraps it in an event-stream response.
    pub fn respond(&self, session_id: impl Into<String>) -> BusResult<Response> {
        Ok(event_stream_response(self.open(session_id)?))
    }
}

/// Builds the streaming response with headers that keep proxies from
/// buffering or caching the channel.
pub fn event_stream_response<S>(frames: S) -> Response
where
    S: Stream<Item = Result<String, Infallible>> + Send + 'static,
{
    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (
                HeaderName::from_static("x-accel-buffering"),
                HeaderValue::from_static("no"),
            ),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}

// =============================================================================
// Push Stream
// =============================================================================

struct PushState {
    handle: RegistrationHandle,
    queue: mpsc::Receiver<Arc<EventEnvelope>>,
    heartbeat: Interval,
    greeting: Option<EventEnvelope>,
}

impl PushState {
    /// Next envelope to write, or None once the registry let go of us.
    async fn next_envelope(&mut self) -> Option<Arc<EventEnvelope>> {
        if let Some(greeting) = self.greeting.take() {
            return Some(Arc::new(greeting));
        }

        tokio::select! {
            queued = self.queue.recv() => {
                if queued.is_none() {
                    debug!(connection_id = %self.handle.id(), "Queue closed, ending push stream");
                }
                queued
            }
            _ = self.heartbeat.tick() => Some(Arc::new(EventEnvelope::heartbeat())),
        }
    }
}

fn push_stream(
    handle: RegistrationHandle,
    queue: mpsc::Receiver<Arc<EventEnvelope>>,
    heartbeat_every: Duration,
) -> impl Stream<Item = Result<String, Infallible>> + Send + 'static {
    let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let state = PushState {
        handle,
        queue,
        heartbeat,
        greeting: Some(EventEnvelope::connected()),
    };

    stream::unfold(state, |mut state| async move {
        loop {
            let envelope = state.next_envelope().await?;
            match encode_frame(&envelope) {
                Ok(frame) => return Some((Ok(frame), state)),
                Err(e) => warn!(
                    connection_id = %state.handle.id(),
                    event_type = %envelope.event_type,
                    error = %e,
                    "Dropping envelope that failed to encode"
                ),
            }
        }
    })
}
