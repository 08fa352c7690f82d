//! Connection admission across streams
//!
//! [`ConnectionScheduler`] decides which streams may run a handshake. It
//! performs no I/O: callers feed it requests, releases, state changes and
//! the current time, then drain [`SchedulerAction`]s with
//! [`ConnectionScheduler::poll_action`] and sleep until
//! [`ConnectionScheduler::poll_timeout`].
//!
//! Two modes are available:
//! - capped: a pool of `max_concurrent` slots with a FIFO wait queue,
//!   admissions spaced by `admission_spacing`
//! - gated: a single gate walked in configured order
//!
//! Promoted streams bypass both: they are enabled at once and their state
//! changes are not seen by the policy.

pub mod capped;
pub mod gated;

pub use capped::CappedScheduler;
pub use gated::GatedScheduler;

use crate::config::{SchedulerConfig, SchedulerMode};
use crate::stream::ConnectionState;
use crate::Result;
use std::collections::{HashSet, VecDeque};
use std::time::Instant;
use tracing::info;

/// Decision for the orchestrator to carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerAction {
    /// Create and enable the stream (or reconnect its parked instance)
    Enable(String),
    /// Disable and destroy the stream's instance
    Disable(String),
}

#[derive(Debug)]
enum Policy {
    Capped(CappedScheduler),
    Gated(GatedScheduler),
}

/// Admission policy over an ordered set of stream keys
#[derive(Debug)]
pub struct ConnectionScheduler {
    policy: Policy,
    promoted: HashSet<String>,
    actions: VecDeque<SchedulerAction>,
}

impl ConnectionScheduler {
    /// Create a scheduler; `order` is the enable order of all configured keys
    pub fn new(config: &SchedulerConfig, order: Vec<String>) -> Self {
        let policy = match config.mode {
            SchedulerMode::Capped => Policy::Capped(CappedScheduler::new(config)),
            SchedulerMode::Gated => Policy::Gated(GatedScheduler::new(order)),
        };

        Self {
            policy,
            promoted: HashSet::new(),
            actions: VecDeque::new(),
        }
    }

    pub fn mode(&self) -> SchedulerMode {
        match self.policy {
            Policy::Capped(_) => SchedulerMode::Capped,
            Policy::Gated(_) => SchedulerMode::Gated,
        }
    }

    /// Ask for admission of `key`
    ///
    /// # Errors
    ///
    /// `Error::ResourceExhausted` if the capped wait queue is full.
    pub fn request(&mut self, key: &str, now: Instant) -> Result<()> {
        if self.promoted.contains(key) {
            return Ok(());
        }

        match &mut self.policy {
            Policy::Capped(capped) => capped.request(key, now, &mut self.actions),
            Policy::Gated(gated) => {
                gated.request(key, &self.promoted, &mut self.actions);
                Ok(())
            }
        }
    }

    /// Give up admission of `key`, disabling it if it was enabled
    pub fn release(&mut self, key: &str, now: Instant) {
        if self.promoted.remove(key) {
            self.actions
                .push_back(SchedulerAction::Disable(key.to_string()));
            return;
        }

        match &mut self.policy {
            Policy::Capped(capped) => capped.release(key, now, &mut self.actions),
            Policy::Gated(gated) => gated.release(key, &self.promoted, &mut self.actions),
        }
    }

    /// Manual reconnect of `key`
    ///
    /// Returns true if the scheduler took over the reconnect (a Failed
    /// stream re-requesting a capped slot); the caller then waits for the
    /// Enable. Otherwise the caller reconnects the instance directly.
    pub fn reconnect(&mut self, key: &str, now: Instant) -> Result<bool> {
        if self.promoted.contains(key) {
            return Ok(false);
        }

        match &mut self.policy {
            Policy::Capped(capped) => capped.reconnect(key, now, &mut self.actions),
            Policy::Gated(_) => Ok(false),
        }
    }

    /// Feed a state change of a normally admitted stream
    pub fn on_state(&mut self, key: &str, state: ConnectionState, now: Instant) {
        if self.promoted.contains(key) {
            return;
        }

        match &mut self.policy {
            Policy::Capped(capped) => capped.on_state(key, state, now, &mut self.actions),
            Policy::Gated(gated) => gated.on_state(key, state, &self.promoted, &mut self.actions),
        }
    }

    /// Enable `key` at once, outside caps and ordering
    pub fn promote(&mut self, key: &str, now: Instant) {
        if !self.promoted.insert(key.to_string()) {
            return;
        }
        info!("Promoting {}", key);

        match &mut self.policy {
            Policy::Capped(capped) => capped.forget(key, now),
            Policy::Gated(gated) => gated.forget(key, &self.promoted, &mut self.actions),
        }

        self.actions
            .push_back(SchedulerAction::Enable(key.to_string()));
    }

    /// Undo a promotion: disable `key` and queue it behind everyone else
    pub fn demote(&mut self, key: &str, now: Instant) {
        if !self.promoted.remove(key) {
            return;
        }
        info!("Demoting {}", key);

        self.actions
            .push_back(SchedulerAction::Disable(key.to_string()));

        match &mut self.policy {
            Policy::Capped(capped) => capped.requeue(key, now),
            Policy::Gated(gated) => gated.requeue(key, &self.promoted, &mut self.actions),
        }
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        if let Policy::Capped(capped) = &mut self.policy {
            capped.handle_timeout(now, &mut self.actions);
        }
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        match &self.policy {
            Policy::Capped(capped) => capped.poll_timeout(),
            Policy::Gated(_) => None,
        }
    }

    pub fn poll_action(&mut self) -> Option<SchedulerAction> {
        self.actions.pop_front()
    }

    pub fn is_promoted(&self, key: &str) -> bool {
        self.promoted.contains(key)
    }

    /// Keys waiting for admission, front first
    pub fn queued(&self) -> Vec<String> {
        match &self.policy {
            Policy::Capped(capped) => capped.queued(),
            Policy::Gated(gated) => gated.queued(),
        }
    }

    /// Current gate holder (gated mode)
    pub fn gate_holder(&self) -> Option<&str> {
        match &self.policy {
            Policy::Capped(_) => None,
            Policy::Gated(gated) => gated.holder(),
        }
    }

    /// Slots in use (capped mode)
    pub fn slots_in_use(&self) -> usize {
        match &self.policy {
            Policy::Capped(capped) => capped.in_use(),
            Policy::Gated(gated) => usize::from(gated.holder().is_some()),
        }
    }
}
