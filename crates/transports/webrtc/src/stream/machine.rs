//! Stream connection state machine
//!
//! [`StreamMachine`] performs no I/O. It is fed commands, peer state changes,
//! failures and the current time, and it queues [`StreamEffect`]s for its
//! driver to execute. The earliest pending deadline is exposed through
//! [`StreamMachine::poll_timeout`]; the driver calls
//! [`StreamMachine::handle_timeout`] once that instant has passed.
//!
//! Timers: `retry_at` (backoff), `grace_until` (disconnect grace) and
//! `attempt_deadline` (attempt timeout). Cancelling a timer means clearing it.

use super::ConnectionState;
use crate::config::ConnectionPolicy;
use crate::events::StreamEventKind;
use crate::media::PeerState;
use crate::Error;
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Work requested from the driver
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEffect {
    /// Acquire a credential, open signaling, create the media session and send the offer
    OpenResources { attempt: u32 },
    /// Release everything acquired for the current attempt
    CloseResources,
    /// Report an event upstream
    Emit(StreamEventKind),
}

/// State machine for one stream
#[derive(Debug)]
pub struct StreamMachine {
    key: String,
    policy: ConnectionPolicy,

    state: ConnectionState,
    attempt: u32,
    ever_connected: bool,
    enabled: bool,
    active: bool,
    holding: bool,
    last_error: Option<String>,

    retry_at: Option<Instant>,
    grace_until: Option<Instant>,
    attempt_deadline: Option<Instant>,

    effects: VecDeque<StreamEffect>,
}

impl StreamMachine {
    /// Create an idle, disabled machine
    pub fn new(key: impl Into<String>, policy: ConnectionPolicy, active: bool) -> Self {
        Self {
            key: key.into(),
            policy,
            state: ConnectionState::Idle,
            attempt: 0,
            ever_connected: false,
            enabled: false,
            active,
            holding: false,
            last_error: None,
            retry_at: None,
            grace_until: None,
            attempt_deadline: None,
            effects: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn ever_connected(&self) -> bool {
        self.ever_connected
    }

    /// Whether resources for an attempt are currently held
    pub fn is_holding_resources(&self) -> bool {
        self.holding
    }

    /// Enable the stream; starts attempt 1 when visible
    pub fn enable(&mut self, now: Instant) {
        if self.enabled {
            return;
        }
        self.enabled = true;

        if self.state == ConnectionState::Idle && self.active {
            self.attempt = 1;
            self.start_attempt(now);
        }
    }

    /// Disable the stream; idempotent
    pub fn disable(&mut self) {
        let was_idle = self.state == ConnectionState::Idle;
        if !self.enabled && was_idle && !self.holding {
            return;
        }

        self.enabled = false;
        self.cancel_timers();
        self.release();
        self.attempt = 0;

        if !was_idle {
            self.transition(ConnectionState::Idle);
        }
    }

    /// Manual reconnect with a fresh attempt budget
    pub fn reconnect(&mut self, now: Instant) {
        self.enabled = true;
        self.cancel_timers();
        self.release();
        self.attempt = 1;
        self.last_error = None;

        if self.active {
            self.start_attempt(now);
        } else if self.state != ConnectionState::Idle {
            // Suspended until visible again
            self.transition(ConnectionState::Idle);
        }
    }

    /// Visibility change
    ///
    /// Hiding a stream suspends it without touching the attempt counter;
    /// showing it again resumes the same attempt. Failed streams only
    /// remember the value.
    pub fn set_active(&mut self, active: bool, now: Instant) {
        if self.active == active {
            return;
        }
        self.active = active;

        if self.state == ConnectionState::Failed {
            return;
        }

        if !active {
            if self.state != ConnectionState::Idle {
                debug!("Suspending stream {} at attempt {}", self.key, self.attempt);
                self.cancel_timers();
                self.release();
                self.transition(ConnectionState::Idle);
            }
        } else if self.enabled && self.state == ConnectionState::Idle {
            debug!("Resuming stream {} at attempt {}", self.key, self.attempt);
            self.attempt = self.attempt.max(1);
            self.start_attempt(now);
        }
    }

    /// Attempt-level failure (signaling, negotiation, credential)
    ///
    /// Ignored unless an attempt is in flight or connected.
    pub fn on_failure(&mut self, error: &Error, now: Instant) {
        if !self.holding {
            debug!("Ignoring failure for {} in {}: {}", self.key, self.state, error);
            return;
        }

        if error.is_retryable() {
            self.fail(error.to_string(), now);
        } else {
            self.fail_permanently(error.to_string());
        }
    }

    /// Primitive-level peer state change
    pub fn on_peer_state(&mut self, peer: PeerState, now: Instant) {
        if !self.holding {
            return;
        }

        match peer {
            PeerState::Connected => {
                self.grace_until = None;
                if self.state == ConnectionState::Connecting {
                    self.attempt_deadline = None;
                    self.attempt = 0;
                    self.ever_connected = true;
                    self.last_error = None;
                    self.transition(ConnectionState::Connected);
                    self.effects
                        .push_back(StreamEffect::Emit(StreamEventKind::Connected));
                }
            }
            PeerState::Disconnected => {
                if self.grace_until.is_none() {
                    debug!(
                        "Peer for {} disconnected, waiting {}ms",
                        self.key, self.policy.disconnect_grace_ms
                    );
                    self.grace_until = Some(now + self.policy.disconnect_grace());
                }
            }
            PeerState::Failed | PeerState::Closed => {
                self.fail(Error::Connect(format!("peer connection {}", peer)).to_string(), now);
            }
            PeerState::New | PeerState::Connecting => {}
        }
    }

    /// Fire every timer due at `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.retry_at.is_some_and(|at| at <= now) {
            self.retry_at = None;
            if self.state == ConnectionState::Retrying {
                self.attempt += 1;
                self.start_attempt(now);
            }
            return;
        }

        if self.grace_until.is_some_and(|at| at <= now) {
            self.grace_until = None;
            self.fail(
                Error::Connect(format!(
                    "peer disconnected for more than {}ms",
                    self.policy.disconnect_grace_ms
                ))
                .to_string(),
                now,
            );
            return;
        }

        if self.attempt_deadline.is_some_and(|at| at <= now) {
            self.attempt_deadline = None;
            if self.state == ConnectionState::Connecting {
                self.fail(
                    Error::MediaTimeout(format!(
                        "not connected within {}ms",
                        self.policy.attempt_timeout_ms
                    ))
                    .to_string(),
                    now,
                );
            }
        }
    }

    /// Earliest pending deadline
    pub fn poll_timeout(&self) -> Option<Instant> {
        [self.retry_at, self.grace_until, self.attempt_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    /// Next queued effect
    pub fn poll_effect(&mut self) -> Option<StreamEffect> {
        self.effects.pop_front()
    }

    fn start_attempt(&mut self, now: Instant) {
        info!("Stream {} connecting (attempt {})", self.key, self.attempt);
        self.retry_at = None;
        self.grace_until = None;
        self.attempt_deadline = Some(now + self.policy.attempt_timeout());
        self.holding = true;
        self.transition(ConnectionState::Connecting);
        self.effects.push_back(StreamEffect::OpenResources {
            attempt: self.attempt,
        });
    }

    fn fail(&mut self, reason: String, now: Instant) {
        if !self.policy.should_retry(self.attempt) {
            self.fail_permanently(reason);
            return;
        }

        let delay = self.policy.backoff_delay(self.attempt, self.ever_connected);
        warn!(
            "Stream {} attempt {} failed: {}; retrying in {}ms",
            self.key,
            self.attempt,
            reason,
            delay.as_millis()
        );

        self.last_error = Some(reason);
        self.cancel_timers();
        self.release();
        self.retry_at = Some(now + delay);
        self.transition(ConnectionState::Retrying);
    }

    fn fail_permanently(&mut self, reason: String) {
        warn!("Stream {} failed after attempt {}: {}", self.key, self.attempt, reason);

        self.last_error = Some(reason.clone());
        self.cancel_timers();
        self.release();
        self.transition(ConnectionState::Failed);
        self.effects
            .push_back(StreamEffect::Emit(StreamEventKind::Failed { reason }));
    }

    fn release(&mut self) {
        if self.holding {
            self.holding = false;
            self.effects.push_back(StreamEffect::CloseResources);
        }
    }

    fn cancel_timers(&mut self) {
        self.retry_at = None;
        self.grace_until = None;
        self.attempt_deadline = None;
    }

    fn transition(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Stream {}: {} -> {}", self.key, self.state, state);
        }
        self.state = state;
        self.effects
            .push_back(StreamEffect::Emit(StreamEventKind::StateChanged {
                state,
                attempt: self.attempt,
                last_error: self.last_error.clone(),
            }));
    }
}
