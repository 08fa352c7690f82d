//! Test harness for orchestration tests
//!
//! Provides a scripted gateway standing in for signaling and media, plus an
//! event log that records what the orchestrator reports and when.

#![allow(dead_code)]

pub mod gateway;

pub use gateway::{Behavior, ScriptedGateway, LOCAL_CANDIDATE};

use camgrid_webrtc::{
    ConnectionState, OrchestratorConfig, OrchestratorEvent, SchedulerMode, StreamConfig,
};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const GATEWAY_URL: &str = "ws://gateway.test:1984/api/ws";

/// Upper bound for any single wait; virtual when the clock is paused
pub const WAIT: Duration = Duration::from_secs(300);

/// Initialize tracing for tests (call once per test)
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// Stream keys `cam1..=camN`
pub fn cams(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("cam{}", i)).collect()
}

/// Configuration for `keys` in the given mode
pub fn config(mode: SchedulerMode, keys: &[String]) -> OrchestratorConfig {
    let mut config = match mode {
        SchedulerMode::Gated => OrchestratorConfig::gated_preset(GATEWAY_URL),
        SchedulerMode::Capped => OrchestratorConfig::capped_preset(GATEWAY_URL, 4),
    };
    config.streams = keys
        .iter()
        .map(|key| StreamConfig::new(key.as_str(), key.to_uppercase()))
        .collect();
    config
}

/// Records orchestrator events with their arrival time
pub struct EventLog {
    rx: mpsc::UnboundedReceiver<OrchestratorEvent>,
    seen: Vec<(Instant, OrchestratorEvent)>,
}

impl EventLog {
    pub fn new(rx: mpsc::UnboundedReceiver<OrchestratorEvent>) -> Self {
        Self {
            rx,
            seen: Vec::new(),
        }
    }

    /// Read events until one matches `pred`, failing the test after `WAIT`
    pub async fn wait_for(
        &mut self,
        what: &str,
        pred: impl Fn(&OrchestratorEvent) -> bool,
    ) -> OrchestratorEvent {
        let deadline = Instant::now() + WAIT;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(event)) => {
                    self.seen.push((Instant::now(), event.clone()));
                    if pred(&event) {
                        return event;
                    }
                }
                Ok(None) => panic!("event stream ended while waiting for {}", what),
                Err(_) => panic!("timed out waiting for {}; seen: {:#?}", what, self.events()),
            }
        }
    }

    pub async fn wait_connected(&mut self, key: &str) {
        self.wait_for(&format!("{} connected", key), |e| {
            matches!(e, OrchestratorEvent::Connected { stream_key } if stream_key == key)
        })
        .await;
    }

    /// Wait for the terminal failure of `key` and return its reason
    pub async fn wait_failed(&mut self, key: &str) -> String {
        let event = self
            .wait_for(&format!("{} failed", key), |e| {
                matches!(e, OrchestratorEvent::Failed { stream_key, .. } if stream_key == key)
            })
            .await;
        match event {
            OrchestratorEvent::Failed { reason, .. } => reason,
            _ => unreachable!(),
        }
    }

    pub async fn wait_state(&mut self, key: &str, state: ConnectionState) {
        self.wait_for(&format!("{} {}", key, state), |e| {
            matches!(e, OrchestratorEvent::StateChanged { stream_key, state: s, .. }
                if stream_key == key && *s == state)
        })
        .await;
    }

    /// Wait until every key in `keys` reported Connected or Failed
    pub async fn wait_settled(&mut self, keys: &[String]) {
        let mut pending: HashSet<&str> = keys.iter().map(String::as_str).collect();
        for (_, event) in &self.seen {
            settle(&mut pending, event);
        }

        while !pending.is_empty() {
            let event = self
                .wait_for("streams to settle", |e| {
                    matches!(
                        e,
                        OrchestratorEvent::Connected { .. } | OrchestratorEvent::Failed { .. }
                    )
                })
                .await;
            settle(&mut pending, &event);
        }
    }

    /// Collect whatever arrives within `window`
    pub async fn collect_for(&mut self, window: Duration) -> Vec<OrchestratorEvent> {
        let deadline = Instant::now() + window;
        let mut collected = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, self.rx.recv()).await {
            self.seen.push((Instant::now(), event.clone()));
            collected.push(event);
        }
        collected
    }

    /// Read until the orchestrator drops its event sender
    pub async fn drain_to_end(&mut self) -> Vec<OrchestratorEvent> {
        let mut rest = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(WAIT, self.rx.recv()).await {
            rest.push(event);
        }
        rest
    }

    pub fn events(&self) -> Vec<&OrchestratorEvent> {
        self.seen.iter().map(|(_, e)| e).collect()
    }

    /// Index and arrival time of the first event matching `pred`
    pub fn first(&self, pred: impl Fn(&OrchestratorEvent) -> bool) -> Option<(usize, Instant)> {
        self.seen
            .iter()
            .enumerate()
            .find(|(_, (_, e))| pred(e))
            .map(|(i, (at, _))| (i, *at))
    }

    /// Index and arrival time of every event matching `pred`
    pub fn all(&self, pred: impl Fn(&OrchestratorEvent) -> bool) -> Vec<(usize, Instant)> {
        self.seen
            .iter()
            .enumerate()
            .filter(|(_, (_, e))| pred(e))
            .map(|(i, (at, _))| (i, *at))
            .collect()
    }

    /// Reason of the last failure already seen for `key`
    pub fn reason_of(&self, key: &str) -> Option<String> {
        self.seen.iter().rev().find_map(|(_, e)| match e {
            OrchestratorEvent::Failed { stream_key, reason } if stream_key == key => {
                Some(reason.clone())
            }
            _ => None,
        })
    }

    /// Largest number of streams in any of `states` at the same time
    pub fn peak(&self, states: &[ConnectionState]) -> usize {
        let mut current: HashMap<&str, ConnectionState> = HashMap::new();
        let mut peak = 0;
        for (_, event) in &self.seen {
            if let OrchestratorEvent::StateChanged { stream_key, state, .. } = event {
                current.insert(stream_key, *state);
                let count = current.values().filter(|s| states.contains(s)).count();
                peak = peak.max(count);
            }
        }
        peak
    }
}

fn settle(pending: &mut HashSet<&str>, event: &OrchestratorEvent) {
    match event {
        OrchestratorEvent::Connected { stream_key } | OrchestratorEvent::Failed { stream_key, .. } => {
            pending.remove(stream_key.as_str());
        }
        _ => {}
    }
}

/// Is `event` the given state change of `key`
pub fn is_state(event: &OrchestratorEvent, key: &str, state: ConnectionState) -> bool {
    matches!(event, OrchestratorEvent::StateChanged { stream_key, state: s, .. }
        if stream_key == key && *s == state)
}
