//! # Event Client
//!
//! Console-side connection manager: keeps one push channel open, recovers
//! from drops and turns incoming envelopes into cache invalidations.
//!
//! ## Runtime
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       EventClient (spawned task)                        │
//! │                                                                         │
//! │   EventClientHandle ──commands──┐                                       │
//! │   connect / disconnect / stop   │                                       │
//! │                                 ▼                                       │
//! │                      ┌────────────────────┐                             │
//! │   open future ──────►│   tokio::select!   │◄────── retry timer          │
//! │   channel bytes ────►│                    │◄────── idle timer           │
//! │                      └─────────┬──────────┘                             │
//! │                                │ Signal                                 │
//! │                                ▼                                        │
//! │                      ConnectionMachine ──► Commands (Open, Close, ...)  │
//! │                                                                         │
//! │   channel bytes ──► FrameDecoder ──► EventRouter ──► CacheInvalidator   │
//! │                                                                         │
//! │   status ──► watch::Sender<ClientStatus> ──► handle.subscribe()         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The loop only wakes for a command, a chunk from the channel, the open
//! future resolving, or a timer. Nothing polls.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, Sleep};
use tracing::{debug, info, warn};

use herald_core::{CacheInvalidator, CoreResult, EventEnvelope, EventRouter, FrameDecoder};

use crate::config::ClientSettings;
use crate::connector::{ChannelConnector, ChannelStream};
use crate::error::{BusError, BusResult};
use crate::machine::{ClientStatus, Command, ConnectionMachine, ReconnectPolicy, Signal};

/// Default silence after which an open channel is considered dead.
/// Comfortably above the server's 120s heartbeat.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

// =============================================================================
// Options
// =============================================================================

/// Behaviour of an [`EventClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub policy: ReconnectPolicy,
    pub router: EventRouter,
    /// Reconnect when nothing arrives for this long. `None` disables.
    pub idle_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            policy: ReconnectPolicy::default(),
            router: EventRouter::new(),
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }
}

impl ClientOptions {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        ClientOptions {
            policy: ReconnectPolicy::from_settings(settings),
            router: EventRouter::new(),
            idle_timeout: settings.idle_timeout(),
        }
    }
}

// =============================================================================
// Client Handle
// =============================================================================

enum ClientCommand {
    Connect,
    Disconnect { ack: oneshot::Sender<()> },
    Shutdown,
}

/// Handle for driving a running [`EventClient`].
#[derive(Clone)]
pub struct EventClientHandle {
    command_tx: mpsc::Sender<ClientCommand>,
    status_rx: watch::Receiver<ClientStatus>,
}

impl EventClientHandle {
    /// Opens the channel. No-op if one is open or opening.
    pub async fn connect(&self) -> BusResult<()> {
        self.command_tx
            .send(ClientCommand::Connect)
            .await
            .map_err(|_| BusError::ShuttingDown)
    }

    /// Closes the channel and cancels any pending retry.
    ///
    /// When this returns, no channel is open and no further transitions
    /// will happen until the next `connect()`.
    pub async fn disconnect(&self) -> BusResult<()> {
        let (ack, done) = oneshot::channel();
        self.command_tx
            .send(ClientCommand::Disconnect { ack })
            .await
            .map_err(|_| BusError::ShuttingDown)?;
        done.await
            .map_err(|_| BusError::ChannelError("Client stopped before acknowledging".into()))
    }

    /// Returns the current status.
    pub fn status(&self) -> ClientStatus {
        self.status_rx.borrow().clone()
    }

    /// Returns a receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<ClientStatus> {
        self.status_rx.clone()
    }

    /// Stops the client task.
    pub async fn shutdown(&self) -> BusResult<()> {
        self.command_tx
            .send(ClientCommand::Shutdown)
            .await
            .map_err(|_| BusError::ChannelError("Client already stopped".into()))
    }
}

// =============================================================================
// Channel I/O
// =============================================================================

type OpenFuture = Pin<Box<dyn Future<Output = BusResult<ChannelStream>> + Send>>;

/// Everything the machine's commands act on.
struct ChannelIo {
    opening: Option<OpenFuture>,
    channel: Option<ChannelStream>,
    decoder: FrameDecoder,
    retry: Option<Pin<Box<Sleep>>>,
    idle: Option<Pin<Box<Sleep>>>,
}

impl ChannelIo {
    fn new() -> Self {
        ChannelIo {
            opening: None,
            channel: None,
            decoder: FrameDecoder::new(),
            retry: None,
            idle: None,
        }
    }

    fn close(&mut self) {
        self.opening = None;
        self.channel = None;
        self.idle = None;
        self.decoder = FrameDecoder::new();
    }
}

async fn open_resolved(opening: &mut Option<OpenFuture>) -> BusResult<ChannelStream> {
    match opening {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn next_chunk(channel: &mut Option<ChannelStream>) -> Option<BusResult<Bytes>> {
    match channel {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// Event Client
// =============================================================================

/// Push channel manager for one console instance.
///
/// ## Usage
/// ```rust,ignore
/// let connector = HttpConnector::from_settings(&config.client, Credentials::bearer(token))?;
/// let client = EventClient::spawn(
///     Arc::new(connector),
///     Arc::new(query_cache),
///     ClientOptions::from_settings(&config.client),
/// );
///
/// client.connect().await?;
/// let mut status = client.subscribe();
/// while status.changed().await.is_ok() {
///     println!("push channel: {}", status.borrow().state);
/// }
/// ```
pub struct EventClient {
    connector: Arc<dyn ChannelConnector>,
    invalidator: Arc<dyn CacheInvalidator>,
    router: EventRouter,
    idle_timeout: Option<Duration>,
    machine: ConnectionMachine,
    command_rx: mpsc::Receiver<ClientCommand>,
    status_tx: watch::Sender<ClientStatus>,
}

impl EventClient {
    /// Spawns the client task and returns its handle. The client starts
    /// disconnected.
    pub fn spawn(
        connector: Arc<dyn ChannelConnector>,
        invalidator: Arc<dyn CacheInvalidator>,
        options: ClientOptions,
    ) -> EventClientHandle {
        if options.policy.is_uncapped() {
            warn!("Reconnect attempts are uncapped; the client will retry forever");
        }

        let (command_tx, command_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(ClientStatus::default());

        let client = EventClient {
            connector,
            invalidator,
            router: options.router,
            idle_timeout: options.idle_timeout,
            machine: ConnectionMachine::new(options.policy),
            command_rx,
            status_tx,
        };
        tokio::spawn(client.run());

        EventClientHandle {
            command_tx,
            status_rx,
        }
    }

    /// Main client loop.
    async fn run(mut self) {
        info!("Event client started");
        let mut io = ChannelIo::new();

        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(ClientCommand::Connect) => self.apply(Signal::Connect, &mut io),
                    Some(ClientCommand::Disconnect { ack }) => {
                        self.apply(Signal::Disconnect, &mut io);
                        let _ = ack.send(());
                    }
                    Some(ClientCommand::Shutdown) | None => {
                        self.apply(Signal::Disconnect, &mut io);
                        break;
                    }
                },

                opened = open_resolved(&mut io.opening) => {
                    io.opening = None;
                    match opened {
                        Ok(stream) => {
                            io.channel = Some(stream);
                            self.arm_idle(&mut io);
                            self.apply(Signal::Opened, &mut io);
                        }
                        Err(e) => self.channel_failed(e, &mut io),
                    }
                }

                chunk = next_chunk(&mut io.channel) => match chunk {
                    Some(Ok(bytes)) => {
                        self.arm_idle(&mut io);
                        self.on_bytes(&bytes, &mut io);
                    }
                    Some(Err(e)) => self.channel_failed(e, &mut io),
                    None => {
                        io.channel = None;
                        if let Some(trailing) = io.decoder.finish() {
                            self.on_decoded(trailing, &mut io);
                        }
                        self.channel_failed(
                            BusError::Disconnected("channel closed by server".into()),
                            &mut io,
                        );
                    }
                },

                _ = elapsed(&mut io.retry) => {
                    io.retry = None;
                    self.apply(Signal::RetryElapsed, &mut io);
                }

                _ = elapsed(&mut io.idle) => {
                    io.idle = None;
                    self.channel_failed(
                        BusError::Disconnected("no data within idle timeout".into()),
                        &mut io,
                    );
                }
            }
        }

        info!("Event client stopped");
    }

    /// Feeds a signal to the machine and carries out its commands.
    fn apply(&mut self, signal: Signal, io: &mut ChannelIo) {
        for command in self.machine.handle(signal) {
            match command {
                Command::Open => {
                    let connector = Arc::clone(&self.connector);
                    io.close();
                    io.opening = Some(Box::pin(async move { connector.open().await }));
                }
                Command::Close => io.close(),
                Command::ScheduleRetry(delay) => io.retry = Some(Box::pin(sleep(delay))),
                Command::CancelRetry => io.retry = None,
            }
        }

        let status = self.machine.status().clone();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn channel_failed(&mut self, error: BusError, io: &mut ChannelIo) {
        warn!(error = %error, retryable = error.is_retryable(), "Push channel failed");
        self.apply(
            Signal::ChannelError {
                reason: error.to_string(),
                retryable: error.is_retryable(),
            },
            io,
        );
    }

    fn arm_idle(&self, io: &mut ChannelIo) {
        io.idle = self.idle_timeout.map(|timeout| Box::pin(sleep(timeout)));
    }

    /// Decodes a chunk and routes every complete envelope, in wire order.
    fn on_bytes(&mut self, bytes: &[u8], io: &mut ChannelIo) {
        for decoded in io.decoder.push(bytes) {
            self.on_decoded(decoded, io);
        }
    }

    fn on_decoded(&mut self, decoded: CoreResult<EventEnvelope>, io: &mut ChannelIo) {
        match decoded {
            Ok(envelope) => self.on_envelope(envelope, io),
            Err(e) => warn!(error = %e, "Discarding malformed frame"),
        }
    }

    fn on_envelope(&mut self, envelope: EventEnvelope, io: &mut ChannelIo) {
        debug!(event_type = %envelope.event_type, "Envelope received");
        self.apply(Signal::Envelope(envelope.timestamp), io);

        let invalidation = self.router.route(&envelope);
        if !invalidation.is_empty() {
            self.invalidator.invalidate(&invalidation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::ConnectionState;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use herald_core::{encode_frame, CacheKey, EventType, RecordingInvalidator};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;
    use tokio_stream::wrappers::ReceiverStream;

    type FrameSender = mpsc::Sender<BusResult<Bytes>>;

    /// Connector that plays back a fixed sequence of outcomes, then refuses
    /// with a retryable error.
    #[derive(Default)]
    struct ScriptedConnector {
        opens: AtomicUsize,
        script: Mutex<VecDeque<BusResult<mpsc::Receiver<BusResult<Bytes>>>>>,
    }

    impl ScriptedConnector {
        fn channel(&self) -> FrameSender {
            let (tx, rx) = mpsc::channel(16);
            self.script.lock().unwrap().push_back(Ok(rx));
            tx
        }

        fn refuse(&self, error: BusError) {
            self.script.lock().unwrap().push_back(Err(error));
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChannelConnector for ScriptedConnector {
        async fn open(&self) -> BusResult<ChannelStream> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(rx)) => Ok(Box::pin(ReceiverStream::new(rx))),
                Some(Err(e)) => Err(e),
                None => Err(BusError::ConnectionFailed("connection refused".into())),
            }
        }
    }

    fn options(max_attempts: Option<u32>) -> ClientOptions {
        ClientOptions {
            policy: ReconnectPolicy::Fixed {
                interval: Duration::from_secs(1),
                max_attempts,
            },
            ..Default::default()
        }
    }

    fn spawn(
        connector: &Arc<ScriptedConnector>,
        options: ClientOptions,
    ) -> (EventClientHandle, Arc<RecordingInvalidator>) {
        let invalidator = Arc::new(RecordingInvalidator::new());
        let handle = EventClient::spawn(connector.clone(), invalidator.clone(), options);
        (handle, invalidator)
    }

    async fn wait_for(handle: &EventClientHandle, predicate: impl FnMut(&ClientStatus) -> bool) {
        handle.subscribe().wait_for(predicate).await.unwrap();
    }

    async fn send(tx: &FrameSender, envelope: &EventEnvelope) {
        let frame = encode_frame(envelope).unwrap();
        tx.send(Ok(Bytes::from(frame))).await.unwrap();
    }

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_only_data_events_reach_the_router() {
        let connector = Arc::new(ScriptedConnector::default());
        let tx = connector.channel();
        let (client, invalidator) = spawn(&connector, ClientOptions::default());

        client.connect().await.unwrap();
        send(&tx, &EventEnvelope::at(EventType::Connected, at(1))).await;
        send(&tx, &EventEnvelope::at(EventType::Heartbeat, at(2))).await;
        send(&tx, &EventEnvelope::at(EventType::NewOrder, at(3))).await;

        wait_for(&client, |s| s.last_event_timestamp == Some(at(3))).await;

        let calls = invalidator.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].keys().collect::<Vec<_>>(),
            vec![CacheKey::Orders, CacheKey::DashboardStats, CacheKey::RecentActivity]
        );
        assert!(client.status().is_connected());
    }

    #[tokio::test]
    async fn test_connect_while_connected_is_noop() {
        let connector = Arc::new(ScriptedConnector::default());
        let _tx = connector.channel();
        let (client, _) = spawn(&connector, ClientOptions::default());

        client.connect().await.unwrap();
        wait_for(&client, ClientStatus::is_connected).await;
        client.connect().await.unwrap();
        client.connect().await.unwrap();
        client.disconnect().await.unwrap();

        assert_eq!(connector.opens(), 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_discarded() {
        let connector = Arc::new(ScriptedConnector::default());
        let tx = connector.channel();
        let (client, invalidator) = spawn(&connector, ClientOptions::default());

        client.connect().await.unwrap();
        tx.send(Ok(Bytes::from_static(b"data: {not json\n\n")))
            .await
            .unwrap();
        send(&tx, &EventEnvelope::at(EventType::NewMessage, at(5))).await;

        wait_for(&client, |s| s.last_event_timestamp == Some(at(5))).await;
        assert_eq!(invalidator.calls().len(), 1);
        assert_eq!(client.status().state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_channel_drop() {
        let connector = Arc::new(ScriptedConnector::default());
        let first = connector.channel();
        let second = connector.channel();
        let (client, invalidator) = spawn(&connector, options(Some(10)));

        client.connect().await.unwrap();
        wait_for(&client, ClientStatus::is_connected).await;

        let dropped_at = Instant::now();
        drop(first);
        wait_for(&client, |s| s.state == ConnectionState::Reconnecting).await;
        assert_eq!(client.status().retry_count, 1);

        wait_for(&client, ClientStatus::is_connected).await;
        let elapsed = dropped_at.elapsed();
        assert!(elapsed >= Duration::from_secs(1), "reconnected early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "reconnected late: {:?}", elapsed);
        assert_eq!(connector.opens(), 2);
        assert_eq!(client.status().retry_count, 0);

        send(&second, &EventEnvelope::at(EventType::StatsUpdated, at(9))).await;
        wait_for(&client, |s| s.last_event_timestamp == Some(at(9))).await;
        assert_eq!(invalidator.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_lands_within_retry_bound() {
        let connector = Arc::new(ScriptedConnector::default());
        let first = connector.channel();
        connector.refuse(BusError::ConnectionFailed("connection refused".into()));
        connector.refuse(BusError::Timeout(10_000));
        let _last = connector.channel();
        let (client, _) = spawn(&connector, options(Some(10)));

        client.connect().await.unwrap();
        wait_for(&client, ClientStatus::is_connected).await;

        let dropped_at = Instant::now();
        drop(first);
        wait_for(&client, |s| s.retry_count == 3).await;
        wait_for(&client, ClientStatus::is_connected).await;

        // Three fixed one-second waits, one per failed or dropped attempt.
        let elapsed = dropped_at.elapsed();
        assert!(elapsed >= Duration::from_secs(3), "reconnected early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(4), "reconnected late: {:?}", elapsed);
        assert_eq!(connector.opens(), 4);
        assert_eq!(client.status().retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let connector = Arc::new(ScriptedConnector::default());
        let (client, _) = spawn(&connector, options(Some(2)));

        client.connect().await.unwrap();
        wait_for(&client, |s| s.exhausted).await;

        let status = client.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.last_error.is_some());
        // Initial attempt plus two retries.
        assert_eq!(connector.opens(), 3);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.opens(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_session_is_not_retried() {
        let connector = Arc::new(ScriptedConnector::default());
        connector.refuse(BusError::HttpStatus(401));
        let (client, _) = spawn(&connector, options(Some(10)));

        client.connect().await.unwrap();
        wait_for(&client, |s| s.last_error.is_some()).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        let status = client.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(!status.exhausted);
        assert_eq!(connector.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_retry() {
        let connector = Arc::new(ScriptedConnector::default());
        let (client, _) = spawn(&connector, options(Some(10)));

        client.connect().await.unwrap();
        wait_for(&client, |s| s.state == ConnectionState::Reconnecting).await;

        client.disconnect().await.unwrap();
        assert_eq!(client.status().state, ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.opens(), 1);
        assert_eq!(client.status().state, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_channel_is_recycled() {
        let connector = Arc::new(ScriptedConnector::default());
        let _quiet = connector.channel();
        let _next = connector.channel();
        let options = ClientOptions {
            idle_timeout: Some(Duration::from_secs(300)),
            ..options(Some(10))
        };
        let (client, _) = spawn(&connector, options);

        client.connect().await.unwrap();
        wait_for(&client, ClientStatus::is_connected).await;
        wait_for(&client, |s| s.state == ConnectionState::Reconnecting).await;
        wait_for(&client, ClientStatus::is_connected).await;

        assert_eq!(connector.opens(), 2);
    }

    #[tokio::test]
    async fn test_end_to_end_with_hub() {
        use crate::admission::{JwtAdmission, ADMIN_ROLE};
        use crate::config::HeraldConfig;
        use crate::connector::{Credentials, HttpConnector};
        use crate::hub::HubServer;

        let mut config = HeraldConfig::default();
        config.server.bind_addr = "127.0.0.1".into();
        config.server.port = 0;
        let admission = JwtAdmission::from_settings(&config.auth);
        let token = admission.issue("admin-1", ADMIN_ROLE).unwrap();
        let hub = HubServer::new(&config, Arc::new(admission)).start().await.unwrap();

        let url = format!("http://{}/admin/events", hub.local_addr());
        let connector =
            HttpConnector::new(&url, Credentials::bearer(token), Duration::from_secs(5)).unwrap();
        let invalidator = Arc::new(RecordingInvalidator::new());
        let client = EventClient::spawn(
            Arc::new(connector),
            invalidator.clone(),
            ClientOptions::default(),
        );

        client.connect().await.unwrap();
        wait_for(&client, |s| s.last_event_timestamp.is_some()).await;
        assert_eq!(hub.connection_count(), 1);

        hub.bus()
            .publish_envelope(EventEnvelope::at(EventType::NewConversation, at(42)))
            .await;
        wait_for(&client, |s| s.last_event_timestamp == Some(at(42))).await;

        let calls = invalidator.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains(&CacheKey::Conversations));

        client.disconnect().await.unwrap();
        client.shutdown().await.unwrap();
        hub.shutdown().await.unwrap();
    }
}
