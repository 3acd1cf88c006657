//! # Client Connection State Machine
//!
//! Pure reconnect logic for the console's push channel. No sockets, no
//! timers: the machine consumes [`Signal`]s and answers with [`Command`]s
//! that the [`EventClient`](crate::client::EventClient) runtime carries out.
//!
//! ## States
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Client Connection States                             │
//! │                                                                         │
//! │  ┌────────────┐    connect()    ┌────────────┐   opened /   ┌─────────┐ │
//! │  │Disconnected│ ──────────────► │ Connecting │ ───────────► │Connected│ │
//! │  └────────────┘                 └─────┬──────┘  first event └────┬────┘ │
//! │     ▲      ▲                          │  ▲                       │      │
//! │     │      │               error      │  │ retry timer           │      │
//! │     │      │                          ▼  │ or connect()          │      │
//! │     │      │  attempts exhausted ┌─────────────┐   error          │      │
//! │     │      └──────────────────── │Reconnecting │ ◄────────────────┘      │
//! │     │                            └─────────────┘                        │
//! │     │                                                                   │
//! │     └──── disconnect() from any state (cancels timer, closes channel)   │
//! │                                                                         │
//! │  RECONNECT POLICY                                                       │
//! │  ────────────────                                                       │
//! │  Fixed:        30s, 30s, 30s, ...           (default, 10 attempts)     │
//! │  Exponential:  1s, 2s, 4s, ... up to max                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use backoff::backoff::{Backoff, Constant};
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ClientSettings, ReconnectMode};

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

/// Default cap on consecutive reconnect attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

// =============================================================================
// Connection State
// =============================================================================

/// Connection state of the console's push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No channel and no pending retry.
    Disconnected,
    /// Channel open in flight.
    Connecting,
    /// Channel open and streaming.
    Connected,
    /// Waiting for the retry timer.
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Observable client status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientStatus {
    pub state: ConnectionState,
    /// Consecutive failed attempts since the last successful open.
    pub retry_count: u32,
    /// Delay of the pending retry, if one is scheduled.
    pub next_retry_delay: Option<Duration>,
    /// Timestamp of the last envelope received. Diagnostics only.
    pub last_event_timestamp: Option<DateTime<Utc>>,
    /// Set when the reconnect cap was reached. Cleared by `connect()`.
    pub exhausted: bool,
    /// Most recent channel error.
    pub last_error: Option<String>,
}

impl Default for ClientStatus {
    fn default() -> Self {
        ClientStatus {
            state: ConnectionState::Disconnected,
            retry_count: 0,
            next_retry_delay: None,
            last_event_timestamp: None,
            exhausted: false,
            last_error: None,
        }
    }
}

impl ClientStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

// =============================================================================
// Reconnect Policy
// =============================================================================

/// How long to wait between reconnect attempts, and how many to make.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectPolicy {
    Fixed {
        interval: Duration,
        max_attempts: Option<u32>,
    },
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
        max_attempts: Option<u32>,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed {
            interval: DEFAULT_RECONNECT_INTERVAL,
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
        }
    }
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        match settings.reconnect {
            ReconnectMode::Fixed => ReconnectPolicy::Fixed {
                interval: Duration::from_secs(settings.reconnect_interval_secs),
                max_attempts: settings.reconnect_cap(),
            },
            ReconnectMode::Exponential => ReconnectPolicy::Exponential {
                initial: Duration::from_millis(settings.initial_backoff_ms),
                max: Duration::from_secs(settings.max_backoff_secs),
                multiplier: 2.0,
                max_attempts: settings.reconnect_cap(),
            },
        }
    }

    pub fn max_attempts(&self) -> Option<u32> {
        match self {
            ReconnectPolicy::Fixed { max_attempts, .. }
            | ReconnectPolicy::Exponential { max_attempts, .. } => *max_attempts,
        }
    }

    /// True when the client would retry forever.
    pub fn is_uncapped(&self) -> bool {
        self.max_attempts().is_none()
    }

    /// Creates the delay generator for this policy.
    fn backoff(&self) -> Box<dyn Backoff + Send> {
        match self {
            ReconnectPolicy::Fixed { interval, .. } => Box::new(Constant::new(*interval)),
            ReconnectPolicy::Exponential {
                initial,
                max,
                multiplier,
                ..
            } => {
                let mut backoff = ExponentialBackoff {
                    initial_interval: *initial,
                    max_interval: *max,
                    multiplier: *multiplier,
                    randomization_factor: 0.0,
                    max_elapsed_time: None, // Capped by attempts, not time
                    ..Default::default()
                };
                backoff.reset();
                Box::new(backoff)
            }
        }
    }
}

// =============================================================================
// Signals and Commands
// =============================================================================

/// Inputs to the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// Caller asked for a channel.
    Connect,
    /// The channel opened.
    Opened,
    /// An envelope was decoded from the channel.
    Envelope(DateTime<Utc>),
    /// The channel failed or ended. Non-retryable errors do not reconnect.
    ChannelError { reason: String, retryable: bool },
    /// The retry timer fired.
    RetryElapsed,
    /// Caller asked to stop.
    Disconnect,
}

/// Side effects the runtime must perform, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start opening a channel.
    Open,
    /// Drop the open (or opening) channel.
    Close,
    /// Arm the retry timer.
    ScheduleRetry(Duration),
    /// Disarm the retry timer.
    CancelRetry,
}

// =============================================================================
// Connection Machine
// =============================================================================

/// Reconnect state machine for one logical channel.
pub struct ConnectionMachine {
    policy: ReconnectPolicy,
    backoff: Box<dyn Backoff + Send>,
    status: ClientStatus,
}

impl std::fmt::Debug for ConnectionMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMachine")
            .field("policy", &self.policy)
            .field("status", &self.status)
            .finish()
    }
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let backoff = policy.backoff();
        ConnectionMachine {
            policy,
            backoff,
            status: ClientStatus::default(),
        }
    }

    pub fn status(&self) -> &ClientStatus {
        &self.status
    }

    pub fn state(&self) -> ConnectionState {
        self.status.state
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Applies a signal and returns the commands to run.
    pub fn handle(&mut self, signal: Signal) -> Vec<Command> {
        use ConnectionState::*;

        let state = self.status.state;
        let commands = match (state, signal) {
            (Disconnected, Signal::Connect) => {
                self.status.exhausted = false;
                self.status.retry_count = 0;
                self.status.last_error = None;
                self.backoff.reset();
                self.status.state = Connecting;
                vec![Command::Open]
            }
            // One channel at most.
            (Connecting | Connected, Signal::Connect) => vec![],
            (Reconnecting, Signal::Connect) => {
                self.status.next_retry_delay = None;
                self.status.state = Connecting;
                vec![Command::CancelRetry, Command::Open]
            }

            (Connecting, Signal::Opened) => {
                self.mark_connected();
                vec![]
            }
            (Connecting, Signal::Envelope(timestamp)) => {
                self.mark_connected();
                self.status.last_event_timestamp = Some(timestamp);
                vec![]
            }
            (Connected, Signal::Envelope(timestamp)) => {
                self.status.last_event_timestamp = Some(timestamp);
                vec![]
            }

            (Connecting | Connected, Signal::ChannelError { reason, retryable }) => {
                self.status.last_error = Some(reason);
                if retryable {
                    self.schedule_retry()
                } else {
                    warn!(
                        error = ?self.status.last_error,
                        "Channel refused, not retrying"
                    );
                    self.reset_to_disconnected();
                    vec![Command::Close]
                }
            }

            (Reconnecting, Signal::RetryElapsed) => {
                self.status.next_retry_delay = None;
                self.status.state = Connecting;
                vec![Command::Open]
            }

            // `exhausted` survives; only a fresh connect clears it.
            (_, Signal::Disconnect) => {
                self.reset_to_disconnected();
                match state {
                    Disconnected => vec![],
                    Reconnecting => vec![Command::CancelRetry],
                    Connecting | Connected => vec![Command::Close],
                }
            }

            // Stale signals from a channel or timer that no longer exists.
            (state, signal) => {
                debug!(%state, ?signal, "Ignoring signal");
                vec![]
            }
        };

        if self.status.state != state {
            debug!(from = %state, to = %self.status.state, "Client state changed");
        }
        commands
    }

    fn mark_connected(&mut self) {
        if self.status.retry_count > 0 {
            info!(attempts = self.status.retry_count, "Push channel re-established");
        }
        self.status.state = ConnectionState::Connected;
        self.status.retry_count = 0;
        self.status.next_retry_delay = None;
        self.status.last_error = None;
        self.backoff.reset();
    }

    fn schedule_retry(&mut self) -> Vec<Command> {
        if let Some(max) = self.policy.max_attempts() {
            if self.status.retry_count >= max {
                warn!(max_attempts = max, "Reconnect attempts exhausted");
                self.reset_to_disconnected();
                self.status.exhausted = true;
                return vec![Command::Close];
            }
        }

        let Some(delay) = self.backoff.next_backoff() else {
            warn!("Backoff exhausted");
            self.reset_to_disconnected();
            self.status.exhausted = true;
            return vec![Command::Close];
        };

        self.status.retry_count += 1;
        self.status.next_retry_delay = Some(delay);
        self.status.state = ConnectionState::Reconnecting;
        info!(
            attempt = self.status.retry_count,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        vec![Command::Close, Command::ScheduleRetry(delay)]
    }

    fn reset_to_disconnected(&mut self) {
        self.status.state = ConnectionState::Disconnected;
        self.status.retry_count = 0;
        self.status.next_retry_delay = None;
    }
}
