//! Connection State Machine
//!
//! Lifecycle of one adapter connection:
//!
//! ```text
//! Closed -> Connecting -> Connected -> Closing -> Closed
//!                         Connected -> Error   -> Closed
//! ```
//!
//! Reconnection bookkeeping lives beside the state enum in
//! [`ReconnectState`]: the backoff delay and the manual-disconnect flag are
//! orthogonal to the lifecycle state.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Link closed
    Closed,
    /// Opening the port and initializing the adapter
    Connecting,
    /// CAN channel open and usable
    Connected,
    /// Unrecoverable failure on an open link
    Error,
    /// Closing the link
    Closing,
}

impl ConnectionState {
    /// Check if state allows traffic
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if state is a transitional state
    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Connecting | Self::Closing)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// State transition event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state
    pub from: ConnectionState,
    /// New state
    pub to: ConnectionState,
    /// Timestamp
    pub timestamp: DateTime<Local>,
    /// Reason for transition
    pub reason: Option<String>,
}

/// Rejected transition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition from {from} to {to}")]
pub struct InvalidTransition {
    /// Current state
    pub from: ConnectionState,
    /// Requested state
    pub to: ConnectionState,
}

/// Exponential backoff between automatic reconnection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// First delay, and the delay after any reset
    pub initial_delay: Duration,
    /// Upper bound for the delay
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    /// Delay following `current`: doubled, capped at the maximum
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_delay)
    }
}

/// Reconnection bookkeeping
#[derive(Debug, Clone)]
pub struct ReconnectState {
    policy: BackoffPolicy,
    delay: Duration,
    manual_disconnect: bool,
    attempts: u32,
}

impl ReconnectState {
    /// Create with the delay at its initial value
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            delay: policy.initial_delay,
            manual_disconnect: false,
            attempts: 0,
        }
    }

    /// Delay before the next automatic attempt
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Automatic attempts since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the operator asked for the link to stay down
    pub fn is_manually_disconnected(&self) -> bool {
        self.manual_disconnect
    }

    /// Record operator intent to stay disconnected
    pub fn set_manual_disconnect(&mut self) {
        self.manual_disconnect = true;
    }

    /// Clear the manual flag and reset the delay
    pub fn manual_connect(&mut self) {
        self.manual_disconnect = false;
        self.reset();
    }

    /// Back to the initial delay (manual connect or a fresh connection)
    pub fn reset(&mut self) {
        self.delay = self.policy.initial_delay;
        self.attempts = 0;
    }

    /// Record a failed automatic attempt and grow the delay
    pub fn record_failure(&mut self) -> Duration {
        self.attempts += 1;
        self.delay = self.policy.next_delay(self.delay);
        self.delay
    }

    /// Backoff policy
    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }
}

/// Connection state machine
pub struct ConnectionStateMachine {
    state: ConnectionState,
    history: Vec<StateTransition>,
    max_history: usize,
    last_transition: Option<Instant>,
    connected_at: Option<DateTime<Local>>,
    last_activity: Option<DateTime<Local>>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    /// Create a new state machine in `Closed`
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Closed,
            history: Vec::new(),
            max_history: 100,
            last_transition: None,
            connected_at: None,
            last_activity: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Get state history
    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// Get time in current state
    pub fn time_in_state(&self) -> Option<Duration> {
        self.last_transition.map(|t| t.elapsed())
    }

    /// When the current connection was established
    pub fn connected_at(&self) -> Option<DateTime<Local>> {
        self.connected_at
    }

    /// Last successful exchange on the link
    pub fn last_activity(&self) -> Option<DateTime<Local>> {
        self.last_activity
    }

    /// Record a successful exchange
    pub fn touch(&mut self) {
        self.last_activity = Some(Local::now());
    }

    /// Transition to a new state
    pub fn transition(
        &mut self,
        new_state: ConnectionState,
        reason: Option<&str>,
    ) -> Result<(), InvalidTransition> {
        if !self.is_valid_transition(new_state) {
            return Err(InvalidTransition {
                from: self.state,
                to: new_state,
            });
        }
        if new_state == self.state {
            return Ok(());
        }

        self.history.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Local::now(),
            reason: reason.map(String::from),
        });
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }

        self.state = new_state;
        self.last_transition = Some(Instant::now());

        match new_state {
            ConnectionState::Connected => {
                let now = Local::now();
                self.connected_at = Some(now);
                self.last_activity = Some(now);
            }
            ConnectionState::Closed => self.connected_at = None,
            _ => {}
        }

        Ok(())
    }

    /// Check if transition is valid
    fn is_valid_transition(&self, new_state: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self.state, new_state) {
            (Closed, Connecting) => true,

            (Connecting, Connected) => true,
            (Connecting, Closed) => true, // attempt failed

            (Connected, Closing) => true,
            (Connected, Error) => true,

            (Error, Closed) => true,
            (Error, Closing) => true,

            (Closing, Closed) => true,

            (a, b) if a == b => true,

            _ => false,
        }
    }
}
