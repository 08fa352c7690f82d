//! One-at-a-time waterfall admission
//!
//! A single gate is handed from stream to stream in configured order. The
//! holder keeps it until it reaches Connected or Failed, is released, is
//! promoted, or is suspended. Streams that already passed the gate and need
//! a new handshake wait on the re-entry queue, which is served before the
//! remaining configured order. At most one normally admitted stream is ever
//! in Connecting or Retrying.

use super::SchedulerAction;
use crate::stream::ConnectionState;
use std::collections::{HashSet, VecDeque};
use tracing::debug;

#[derive(Debug)]
pub struct GatedScheduler {
    order: Vec<String>,
    cursor: usize,
    holder: Option<String>,
    /// Requested keys
    wanted: HashSet<String>,
    /// Keys with an enabled instance admitted through the gate
    passed: HashSet<String>,
    reentry: VecDeque<String>,
}

impl GatedScheduler {
    pub fn new(order: Vec<String>) -> Self {
        Self {
            order,
            cursor: 0,
            holder: None,
            wanted: HashSet::new(),
            passed: HashSet::new(),
            reentry: VecDeque::new(),
        }
    }

    pub fn request(
        &mut self,
        key: &str,
        promoted: &HashSet<String>,
        out: &mut VecDeque<SchedulerAction>,
    ) {
        if !self.wanted.insert(key.to_string()) {
            return;
        }

        let behind_cursor = self
            .order
            .iter()
            .position(|k| k == key)
            .map_or(true, |idx| idx < self.cursor);

        if behind_cursor && !self.passed.contains(key) && !self.reentry.iter().any(|k| k == key) {
            self.reentry.push_back(key.to_string());
        }

        self.advance(promoted, out);
    }

    pub fn release(
        &mut self,
        key: &str,
        promoted: &HashSet<String>,
        out: &mut VecDeque<SchedulerAction>,
    ) {
        self.wanted.remove(key);
        self.reentry.retain(|k| k != key);

        if self.passed.remove(key) {
            out.push_back(SchedulerAction::Disable(key.to_string()));
        }
        if self.holder.as_deref() == Some(key) {
            self.holder = None;
            self.advance(promoted, out);
        }
    }

    pub fn on_state(
        &mut self,
        key: &str,
        state: ConnectionState,
        promoted: &HashSet<String>,
        out: &mut VecDeque<SchedulerAction>,
    ) {
        if self.holder.as_deref() == Some(key) {
            match state {
                ConnectionState::Connected | ConnectionState::Failed | ConnectionState::Idle => {
                    debug!("{} leaves the gate ({})", key, state);
                    self.holder = None;
                    self.advance(promoted, out);
                }
                ConnectionState::Connecting | ConnectionState::Retrying => {}
            }
            return;
        }

        if !self.passed.contains(key) || !state.is_in_progress() {
            return;
        }

        if self.holder.is_none() {
            debug!("{} re-entered {} and takes the free gate", key, state);
            self.holder = Some(key.to_string());
        } else {
            debug!("{} re-entered {} while the gate is busy, queued", key, state);
            self.passed.remove(key);
            out.push_back(SchedulerAction::Disable(key.to_string()));
            if !self.reentry.iter().any(|k| k == key) {
                self.reentry.push_back(key.to_string());
            }
        }
    }

    /// Drop all bookkeeping for a promoted key without emitting anything
    pub fn forget(
        &mut self,
        key: &str,
        promoted: &HashSet<String>,
        out: &mut VecDeque<SchedulerAction>,
    ) {
        self.reentry.retain(|k| k != key);
        self.passed.remove(key);
        if self.holder.as_deref() == Some(key) {
            self.holder = None;
            self.advance(promoted, out);
        }
    }

    /// Put a demoted key at the back of the re-entry queue
    pub fn requeue(
        &mut self,
        key: &str,
        promoted: &HashSet<String>,
        out: &mut VecDeque<SchedulerAction>,
    ) {
        self.wanted.insert(key.to_string());
        self.passed.remove(key);
        if !self.reentry.iter().any(|k| k == key) {
            self.reentry.push_back(key.to_string());
        }
        self.advance(promoted, out);
    }

    pub fn holder(&self) -> Option<&str> {
        self.holder.as_deref()
    }

    pub fn queued(&self) -> Vec<String> {
        self.reentry.iter().cloned().collect()
    }

    fn advance(&mut self, promoted: &HashSet<String>, out: &mut VecDeque<SchedulerAction>) {
        if self.holder.is_some() {
            return;
        }

        let Some(next) = self.next_candidate(promoted) else {
            debug!("Waterfall idle, nothing left to admit");
            return;
        };

        debug!("Gate passes to {}", next);
        self.passed.insert(next.clone());
        self.holder = Some(next.clone());
        out.push_back(SchedulerAction::Enable(next));
    }

    fn next_candidate(&mut self, promoted: &HashSet<String>) -> Option<String> {
        while let Some(key) = self.reentry.pop_front() {
            if self.wanted.contains(&key) && !promoted.contains(&key) && !self.passed.contains(&key)
            {
                return Some(key);
            }
        }

        while self.cursor < self.order.len() {
            let key = &self.order[self.cursor];
            self.cursor += 1;
            if self.wanted.contains(key) && !promoted.contains(key) && !self.passed.contains(key) {
                return Some(key.clone());
            }
        }

        None
    }
}
