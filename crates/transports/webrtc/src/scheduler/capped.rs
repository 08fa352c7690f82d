//! Bounded-concurrency admission
//!
//! At most `max_concurrent` streams hold a slot. A slot is claimed when it is
//! granted, even if the Enable itself is still delayed by the admission
//! spacing. Connected keeps the slot; Failed and release give it back.

use super::SchedulerAction;
use crate::config::SchedulerConfig;
use crate::stream::ConnectionState;
use crate::{Error, Result};
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, error};

#[derive(Debug)]
pub struct CappedScheduler {
    max_concurrent: usize,
    spacing: Duration,
    settle: Duration,
    max_queue_depth: Option<usize>,

    /// Keys holding a slot (enabled or about to be)
    slots: HashSet<String>,
    /// Granted but not yet enabled, in admission order
    scheduled: VecDeque<(Instant, String)>,
    /// Waiting for a slot
    queue: VecDeque<String>,
    /// Failed streams: still enabled, no slot
    parked: HashSet<String>,

    next_admit_at: Option<Instant>,
    settle_at: Option<Instant>,
}

impl CappedScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            spacing: config.admission_spacing(),
            settle: config.release_settle(),
            max_queue_depth: config.max_queue_depth,
            slots: HashSet::new(),
            scheduled: VecDeque::new(),
            queue: VecDeque::new(),
            parked: HashSet::new(),
            next_admit_at: None,
            settle_at: None,
        }
    }

    pub fn request(
        &mut self,
        key: &str,
        now: Instant,
        out: &mut VecDeque<SchedulerAction>,
    ) -> Result<()> {
        if self.slots.contains(key) || self.parked.contains(key) || self.queue.iter().any(|k| k == key)
        {
            return Ok(());
        }

        if self.slots.len() < self.max_concurrent {
            self.grant(key, now, out);
            return Ok(());
        }

        if let Some(depth) = self.max_queue_depth {
            if self.queue.len() >= depth {
                error!(
                    "Admission queue full ({} waiting), rejecting {}",
                    self.queue.len(),
                    key
                );
                return Err(Error::ResourceExhausted(format!(
                    "admission queue full ({} waiting)",
                    depth
                )));
            }
        }

        debug!("No free slot for {}, queued at position {}", key, self.queue.len() + 1);
        self.queue.push_back(key.to_string());
        Ok(())
    }

    /// Re-request a slot for a parked (Failed) stream
    ///
    /// Returns false if the stream is not parked.
    pub fn reconnect(
        &mut self,
        key: &str,
        now: Instant,
        out: &mut VecDeque<SchedulerAction>,
    ) -> Result<bool> {
        if !self.parked.remove(key) {
            return Ok(false);
        }
        if let Err(e) = self.request(key, now, out) {
            self.parked.insert(key.to_string());
            return Err(e);
        }
        Ok(true)
    }

    pub fn release(&mut self, key: &str, now: Instant, out: &mut VecDeque<SchedulerAction>) {
        self.queue.retain(|k| k != key);

        let was_scheduled = self.cancel_scheduled(key);
        let had_slot = self.slots.remove(key);
        let was_parked = self.parked.remove(key);

        if (had_slot && !was_scheduled) || was_parked {
            out.push_back(SchedulerAction::Disable(key.to_string()));
        }
        if had_slot {
            self.schedule_settle(now);
        }
    }

    pub fn on_state(
        &mut self,
        key: &str,
        state: ConnectionState,
        now: Instant,
        out: &mut VecDeque<SchedulerAction>,
    ) {
        if state == ConnectionState::Failed && self.slots.remove(key) {
            debug!("{} failed, releasing its slot", key);
            self.parked.insert(key.to_string());
            self.schedule_settle(now);
            return;
        }

        // A parked stream restarted behind our back (a reconnect that
        // overtook its own Failed report) must hold a slot or stop
        if state.is_in_progress() && self.parked.remove(key) {
            if self.slots.len() < self.max_concurrent {
                debug!("{} restarted while parked, reclaiming a slot", key);
                self.slots.insert(key.to_string());
            } else {
                debug!("{} restarted while parked and no slot is free, queued", key);
                out.push_back(SchedulerAction::Disable(key.to_string()));
                if !self.queue.iter().any(|k| k == key) {
                    self.queue.push_back(key.to_string());
                }
            }
        }
    }

    /// Drop all bookkeeping for a promoted key without emitting anything
    pub fn forget(&mut self, key: &str, now: Instant) {
        self.queue.retain(|k| k != key);
        self.cancel_scheduled(key);
        self.parked.remove(key);
        if self.slots.remove(key) {
            self.schedule_settle(now);
        }
    }

    /// Put a demoted key at the back of the wait queue
    pub fn requeue(&mut self, key: &str, now: Instant) {
        if !self.queue.iter().any(|k| k == key) {
            self.queue.push_back(key.to_string());
        }
        self.schedule_settle(now);
    }

    pub fn handle_timeout(&mut self, now: Instant, out: &mut VecDeque<SchedulerAction>) {
        while let Some((at, _)) = self.scheduled.front() {
            if *at > now {
                break;
            }
            if let Some((_, key)) = self.scheduled.pop_front() {
                out.push_back(SchedulerAction::Enable(key));
            }
        }

        if self.settle_at.is_some_and(|at| at <= now) {
            self.settle_at = None;
            while self.slots.len() < self.max_concurrent {
                let Some(key) = self.queue.pop_front() else {
                    break;
                };
                self.grant(&key, now, out);
            }
        }
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        let next_enable = self.scheduled.front().map(|(at, _)| *at);
        [next_enable, self.settle_at].into_iter().flatten().min()
    }

    pub fn in_use(&self) -> usize {
        self.slots.len()
    }

    pub fn queued(&self) -> Vec<String> {
        self.queue.iter().cloned().collect()
    }

    pub fn is_parked(&self, key: &str) -> bool {
        self.parked.contains(key)
    }

    fn grant(&mut self, key: &str, now: Instant, out: &mut VecDeque<SchedulerAction>) {
        self.slots.insert(key.to_string());

        let at = self.next_admit_at.map_or(now, |next| next.max(now));
        self.next_admit_at = Some(at + self.spacing);

        if at <= now {
            debug!("Slot granted to {} ({}/{})", key, self.slots.len(), self.max_concurrent);
            out.push_back(SchedulerAction::Enable(key.to_string()));
        } else {
            debug!(
                "Slot granted to {} ({}/{}), enabling in {}ms",
                key,
                self.slots.len(),
                self.max_concurrent,
                (at - now).as_millis()
            );
            self.scheduled.push_back((at, key.to_string()));
        }
    }

    fn cancel_scheduled(&mut self, key: &str) -> bool {
        let before = self.scheduled.len();
        self.scheduled.retain(|(_, k)| k != key);
        self.scheduled.len() != before
    }

    fn schedule_settle(&mut self, now: Instant) {
        let at = now + self.settle;
        self.settle_at = Some(self.settle_at.map_or(at, |existing| existing.min(at)));
    }
}
