//! Session state machine
//!
//! ```text
//! CONNECTING -> ACTIVE <-> DEGRADED -> LOST
//!      \           \_________________/^
//!       \_____________________________/
//! ```
//!
//! `LOST` is terminal. Every accepted transition is appended to the log.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::{self, Display};
use std::time::Duration;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    /// Transport is being opened and probed
    Connecting,
    /// Transport answered the last probe
    Active,
    /// A heartbeat or call failed; reconnection is in progress or pending
    Degraded,
    /// Reconnection was exhausted or the session was closed
    Lost,
}

impl SessionState {
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Active)
                | (Connecting, Lost)
                | (Active, Degraded)
                | (Active, Lost)
                | (Degraded, Active)
                | (Degraded, Lost)
        )
    }

    pub fn is_terminal(&self) -> bool {
        *self == SessionState::Lost
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "CONNECTING",
            SessionState::Active => "ACTIVE",
            SessionState::Degraded => "DEGRADED",
            SessionState::Lost => "LOST",
        };
        write!(f, "{}", name)
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Current state plus the transition log
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: SessionState,
    log: Vec<StateTransition>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: SessionState::Connecting,
            log: Vec::new(),
        }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Apply a transition; returns false (and changes nothing) if it is illegal
    pub fn transition(&mut self, to: SessionState, reason: &str) -> bool {
        if !self.state.can_transition_to(to) {
            return false;
        }
        self.log.push(StateTransition {
            from: self.state,
            to,
            reason: reason.to_string(),
            at: Utc::now(),
        });
        self.state = to;
        true
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.log
    }

    /// Number of logged transitions from `from` to `to`
    pub fn count(&self, from: SessionState, to: SessionState) -> usize {
        self.log
            .iter()
            .filter(|t| t.from == from && t.to == to)
            .count()
    }
}

/// Bounded exponential backoff for reconnection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Reconnect attempts before the session is marked lost
    pub max_attempts: u32,
    /// Delay before the first attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (0-based): base * 2^attempt, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Policy with tiny delays, for tests and simulations
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }
}
