//! Session and reconnect bookkeeping.
//!
//! The supervisor owns the state the event loop consults on every decision:
//! where we are in the connect lifecycle, how many attempts have been spent,
//! and which session id the next attempt should carry. It performs no I/O;
//! the event loop in `bridge` drives it and acts on its answers.

use std::time::{Duration, Instant};

use url::Url;
use uuid::Uuid;

use crate::config::BridgeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Init,
    Connecting,
    Ready,
    Backoff,
    /// The attempt budget is spent; waiting for client traffic to re-arm.
    Recovery,
    Closing,
}

/// What the event loop should do after a connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPlan {
    Backoff(Duration),
    Recovery,
}

/// Per-process session identity.
///
/// `original` is fixed at startup. `current` equals it for the first two
/// attempts after a drop and rotates to a fresh id from the third, in case
/// the server genuinely lost the session rather than just the connection.
#[derive(Debug, Clone)]
pub struct Session {
    current: String,
    original: String,
    pub endpoint: Option<Url>,
}

impl Session {
    fn new() -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            current: id.clone(),
            original: id,
            endpoint: None,
        }
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    pub fn original(&self) -> &str {
        &self.original
    }
}

pub struct Supervisor {
    config: BridgeConfig,
    state: SupervisorState,
    pub session: Session,
    reconnect_attempts: u32,
    consecutive_timeouts: u32,
    last_reconnect_attempt: Option<Instant>,
}

impl Supervisor {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            state: SupervisorState::Init,
            session: Session::new(),
            reconnect_attempts: 0,
            consecutive_timeouts: 0,
            last_reconnect_attempt: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SupervisorState::Ready
    }

    pub fn attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Start a connect attempt and pick its session id.
    pub fn begin_connect(&mut self, now: Instant) -> String {
        self.state = SupervisorState::Connecting;
        self.reconnect_attempts += 1;
        self.last_reconnect_attempt = Some(now);

        self.session.current = if self.reconnect_attempts >= 3 {
            Uuid::new_v4().to_string()
        } else {
            self.session.original.clone()
        };
        self.session.current.clone()
    }

    /// The endpoint URL is known; the session is live.
    pub fn mark_ready(&mut self, endpoint: Url) {
        self.state = SupervisorState::Ready;
        self.session.endpoint = Some(endpoint);
        self.reconnect_attempts = 0;
        self.consecutive_timeouts = 0;
    }

    pub fn clear_endpoint(&mut self) {
        self.session.endpoint = None;
    }

    /// Decide what follows a failed connection: another backoff round, or
    /// recovery once the attempt budget is spent.
    pub fn plan_reconnect(&mut self) -> ReconnectPlan {
        if self.reconnect_attempts >= self.config.max_reconnect_attempts {
            self.state = SupervisorState::Recovery;
            ReconnectPlan::Recovery
        } else {
            self.state = SupervisorState::Backoff;
            ReconnectPlan::Backoff(backoff_delay(
                self.config.base_reconnect_delay,
                self.config.max_reconnect_delay,
                self.reconnect_attempts,
            ))
        }
    }

    /// Count one client-observed request timeout. Returns true when the run
    /// reaches the threshold; the counter resets and the caller starts a
    /// single reconnect cycle.
    pub fn record_timeout(&mut self) -> bool {
        self.consecutive_timeouts += 1;
        if self.consecutive_timeouts >= self.config.max_consecutive_timeouts {
            self.consecutive_timeouts = 0;
            return true;
        }
        false
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// In recovery, client traffic may re-arm reconnection once the quiet
    /// period has passed.
    pub fn recovery_rearm_allowed(&self, now: Instant) -> bool {
        match self.last_reconnect_attempt {
            Some(at) => now.duration_since(at) > self.config.recovery_interval,
            None => true,
        }
    }

    pub fn reset_attempts(&mut self) {
        self.reconnect_attempts = 0;
    }

    pub fn set_closing(&mut self) {
        self.state = SupervisorState::Closing;
    }
}

/// Delay before reconnect attempt `attempt` (1-based):
/// `min(base * 1.5^(attempt-1), cap)`.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 1.5f64.powi(attempt.saturating_sub(1).min(64) as i32);
    let ms = (base.as_millis() as f64 * factor).round();
    if ms >= cap.as_millis() as f64 {
        cap
    } else {
        Duration::from_millis(ms as u64)
    }
}
