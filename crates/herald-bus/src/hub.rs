//! # Admin Event Hub
//!
//! HTTP server exposing the admin push endpoint.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          HubServer (Axum)                               │
//! │                                                                         │
//! │  GET  /admin/events ──► AdmissionCheck ──┬── denied ──► 401 JSON        │
//! │                                          │                              │
//! │                                          └── admitted ──► PushTransport │
//! │                                                   │   (text/event-stream)│
//! │                                                   ▼                     │
//! │                                          ConnectionRegistry             │
//! │                                                   ▲                     │
//! │  POST /admin/events ──► AdmissionCheck ──► EventBus::publish ──► 202    │
//! │                                                                         │
//! │  GET  /health ──► {"status":"ok","connections":N}                       │
//! │                                                                         │
//! │  Shutdown: close every channel, stop accepting, drain in-flight.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::admission::AdmissionCheck;
use crate::bus::EventBus;
use crate::config::HeraldConfig;
use crate::error::{BusError, BusResult};
use crate::push::PushTransport;
use crate::registry::{BroadcastReport, ConnectionRegistry};

// =============================================================================
// Hub State
// =============================================================================

/// Shared state for the hub handlers.
pub struct HubState {
    bus: EventBus,
    transport: PushTransport,
    admission: Arc<dyn AdmissionCheck>,
}

// =============================================================================
// Hub Server
// =============================================================================

/// The HTTP server that owns the admin push endpoint.
pub struct HubServer {
    bind_address: String,
    events_path: String,
    state: Arc<HubState>,
}

/// Handle for controlling a running hub.
#[derive(Clone)]
pub struct HubHandle {
    bus: EventBus,
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    stopped_rx: watch::Receiver<bool>,
}

impl HubHandle {
    /// Publisher bound to this hub's registry.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the number of open push channels.
    pub fn connection_count(&self) -> usize {
        self.bus.registry().connection_count()
    }

    /// Closes every channel, stops the server and waits for it to finish.
    pub async fn shutdown(&self) -> BusResult<()> {
        // Full or closed both mean a stop is already under way.
        let _ = self.shutdown_tx.try_send(());

        let mut stopped = self.stopped_rx.clone();
        stopped
            .wait_for(|done| *done)
            .await
            .map(|_| ())
            .map_err(|_| BusError::ChannelError("Hub stop signal dropped".into()))
    }
}

impl HubServer {
    /// Creates a hub with a fresh registry sized from the config.
    pub fn new(config: &HeraldConfig, admission: Arc<dyn AdmissionCheck>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(
            config.push.write_timeout(),
            config.push.queue_capacity,
        ));
        let transport = PushTransport::new(Arc::clone(&registry), config.push.heartbeat_interval());

        HubServer {
            bind_address: config.server.bind_address(),
            events_path: config.server.events_path.clone(),
            state: Arc::new(HubState {
                bus: EventBus::new(registry),
                transport,
                admission,
            }),
        }
    }

    /// Publisher for this hub, available before it starts.
    pub fn bus(&self) -> EventBus {
        self.state.bus.clone()
    }

    fn router(&self) -> Router {
        Router::new()
            .route(
                &self.events_path,
                get(events_handler).post(publish_handler),
            )
            .route("/health", get(health_handler))
            .with_state(Arc::clone(&self.state))
    }

    /// Binds the listener, spawns the server and returns a handle.
    pub async fn start(self) -> BusResult<HubHandle> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (stopped_tx, stopped_rx) = watch::channel(false);

        let listener = TcpListener::bind(&self.bind_address)
            .await
            .map_err(|e| BusError::BindFailed {
                addr: self.bind_address.clone(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| BusError::BindFailed {
            addr: self.bind_address.clone(),
            reason: e.to_string(),
        })?;

        info!(addr = %local_addr, path = %self.events_path, "Hub server started");

        let app = self.router();
        let registry = Arc::clone(self.state.bus.registry());
        let handle = HubHandle {
            bus: self.state.bus.clone(),
            local_addr,
            shutdown_tx,
            stopped_rx,
        };

        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await;
                    let closed = registry.close_all();
                    info!(closed, "Hub server shutting down");
                })
                .await;

            if let Err(e) = served {
                warn!(error = %e, "Hub server exited with error");
            }
            let _ = stopped_tx.send(true);
        });

        Ok(handle)
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Operator publish body.
#[derive(Debug, Deserialize)]
struct PublishRequest {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

/// Health check endpoint.
async fn health_handler(State(state): State<Arc<HubState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.bus.registry().connection_count(),
    }))
}

/// Opens a push channel for an admitted session.
async fn events_handler(State(state): State<Arc<HubState>>, headers: HeaderMap) -> Response {
    match state.admission.admit(&headers) {
        Ok(session) => {
            info!(
                session_id = %session.session_id,
                user_id = %session.user_id,
                "Opening admin push channel"
            );
            state.transport.respond(session.session_id).unwrap_or_else(|e| {
                warn!(error = %e, "Push channel not opened");
                e.into_response()
            })
        }
        Err(e) => {
            warn!(error = %e, "Push channel refused");
            e.into_response()
        }
    }
}

/// Publishes an operator-supplied event to every open channel.
async fn publish_handler(
    State(state): State<Arc<HubState>>,
    headers: HeaderMap,
    Json(request): Json<PublishRequest>,
) -> Result<(StatusCode, Json<BroadcastReport>), BusError> {
    let session = state.admission.admit(&headers)?;

    let event_type = request.event_type.trim();
    if event_type.is_empty() {
        return Err(BusError::InvalidRequest("event type must not be empty".into()));
    }

    info!(
        user_id = %session.user_id,
        event_type = %event_type,
        "Operator publish"
    );
    let report = state
        .bus
        .publish(event_type, request.data, request.message)
        .await;

    Ok((StatusCode::ACCEPTED, Json(report)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{JwtAdmission, ADMIN_ROLE};
    use futures_util::StreamExt;
    use herald_core::{EventEnvelope, EventType, FrameDecoder};

    const SECRET: &str = "hub-test-secret";

    async fn start_hub() -> HubHandle {
        let mut config = HeraldConfig::default();
        config.server.bind_addr = "127.0.0.1".into();
        config.server.port = 0;
        config.auth.jwt_secret = SECRET.into();

        let admission = Arc::new(JwtAdmission::from_settings(&config.auth));
        HubServer::new(&config, admission).start().await.unwrap()
    }

    fn admin_token() -> String {
        JwtAdmission::new(SECRET, "admin_session", 3600)
            .issue("admin-1", ADMIN_ROLE)
            .unwrap()
    }

    fn url(hub: &HubHandle, path: &str) -> String {
        format!("http://{}{}", hub.local_addr(), path)
    }

    /// Reads from the response until the next envelope is decoded.
    async fn next_envelope<S>(body: &mut S, decoder: &mut FrameDecoder) -> EventEnvelope
    where
        S: futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
    {
        loop {
            let chunk = body.next().await.unwrap().unwrap();
            if let Some(parsed) = decoder.push(&chunk).into_iter().next() {
                return parsed.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_admitted_channel_receives_connected_then_events() {
        let hub = start_hub().await;
        let response = reqwest::Client::new()
            .get(url(&hub, "/admin/events"))
            .bearer_auth(admin_token())
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["content-type"], "text/event-stream");

        let mut body = Box::pin(response.bytes_stream());
        let mut decoder = FrameDecoder::new();
        let first = next_envelope(&mut body, &mut decoder).await;
        assert_eq!(first.event_type, EventType::Connected);
        assert_eq!(hub.connection_count(), 1);

        let report = hub.bus().order_created(json!({ "orderId": "o-42" })).await;
        assert_eq!(report.delivered, 1);

        let event = next_envelope(&mut body, &mut decoder).await;
        assert_eq!(event.event_type, EventType::NewOrder);
        assert_eq!(event.data.unwrap()["orderId"], "o-42");

        hub.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_channel_gets_401_and_no_frame() {
        let hub = start_hub().await;
        let response = reqwest::Client::new()
            .get(url(&hub, "/admin/events"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 401);
        let body: Value = serde_json::from_slice(&response.bytes().await.unwrap()).unwrap();
        assert!(body["message"].as_str().unwrap().contains("missing session"));
        assert_eq!(hub.connection_count(), 0);

        hub.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cookie_session_is_admitted() {
        let hub = start_hub().await;
        let response = reqwest::Client::new()
            .get(url(&hub, "/admin/events"))
            .header("cookie", format!("admin_session={}", admin_token()))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        hub.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_operator_publish_reaches_channel() {
        let hub = start_hub().await;
        let client = reqwest::Client::new();

        let stream = client
            .get(url(&hub, "/admin/events"))
            .bearer_auth(admin_token())
            .send()
            .await
            .unwrap();
        let mut body = Box::pin(stream.bytes_stream());
        let mut decoder = FrameDecoder::new();
        next_envelope(&mut body, &mut decoder).await;

        let response = client
            .post(url(&hub, "/admin/events"))
            .bearer_auth(admin_token())
            .header("content-type", "application/json")
            .body(r#"{"type":"system_update","message":"Maintenance finished"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 202);
        let report: Value = serde_json::from_slice(&response.bytes().await.unwrap()).unwrap();
        assert_eq!(report["delivered"], 1);

        let event = next_envelope(&mut body, &mut decoder).await;
        assert_eq!(event.event_type, EventType::SystemUpdate);
        assert_eq!(event.message.as_deref(), Some("Maintenance finished"));

        hub.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_operator_publish_requires_admission() {
        let hub = start_hub().await;
        let response = reqwest::Client::new()
            .post(url(&hub, "/admin/events"))
            .header("content-type", "application/json")
            .body(r#"{"type":"stats_updated"}"#)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 401);
        hub.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_reports_connections() {
        let hub = start_hub().await;
        let response = reqwest::Client::new()
            .get(url(&hub, "/health"))
            .send()
            .await
            .unwrap();

        let body: Value = serde_json::from_slice(&response.bytes().await.unwrap()).unwrap();
        assert_eq!(body, json!({ "status": "ok", "connections": 0 }));

        hub.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_refused_once_closing() {
        let hub = start_hub().await;
        let client = reqwest::Client::new();

        // Keep-alive connection accepted before the registry starts closing.
        let health = client.get(url(&hub, "/health")).send().await.unwrap();
        assert_eq!(health.status(), 200);

        hub.bus().registry().close_all();

        let response = client
            .get(url(&hub, "/admin/events"))
            .bearer_auth(admin_token())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 503);
        assert_eq!(hub.connection_count(), 0);

        hub.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_ends_open_channels() {
        let hub = start_hub().await;
        let response = reqwest::Client::new()
            .get(url(&hub, "/admin/events"))
            .bearer_auth(admin_token())
            .send()
            .await
            .unwrap();
        let mut body = Box::pin(response.bytes_stream());
        let mut decoder = FrameDecoder::new();
        next_envelope(&mut body, &mut decoder).await;

        hub.shutdown().await.unwrap();

        assert_eq!(hub.connection_count(), 0);
        while let Some(chunk) = body.next().await {
            if chunk.is_err() {
                break;
            }
        }
    }
}
