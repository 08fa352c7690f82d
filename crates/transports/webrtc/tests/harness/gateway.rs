//! Scripted in-memory media gateway
//!
//! Implements the signaling connector and the media session factory over
//! shared state, so a test decides per stream key how the gateway answers
//! and can observe every open channel and live session.

use async_trait::async_trait;
use camgrid_webrtc::credential::{Credential, CredentialSource, StaticCredential};
use camgrid_webrtc::media::{
    MediaEvent, MediaLink, MediaSession, MediaSessionFactory, MediaTrack, PeerState, TrackKind,
};
use camgrid_webrtc::signaling::{
    SignalMessage, SignalingChannel, SignalingConnector, SignalingEvent, SignalingLink,
};
use camgrid_webrtc::stream::ConnectionDeps;
use camgrid_webrtc::{ConnectionPolicy, Error, Orchestrator, OrchestratorConfig, Result, StreamIdentity};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Local candidate every scripted session trickles after its offer
pub const LOCAL_CANDIDATE: &str = "candidate:1 1 udp 2122260223 192.168.1.20 50000 typ host";

/// How the gateway treats one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Answer the offer; the peer connects and a video track arrives
    Connect,
    /// Reject the credential on every open
    Reject,
    /// Reject the first `n` opens, then behave like `Connect`
    FlakyThenConnect(u32),
    /// Reply to the offer with a gateway error frame
    GatewayError,
    /// Accept the offer and never answer
    Silent,
    /// Hold the open for the given time, then behave like `Connect`
    SlowOpen(Duration),
}

#[derive(Default)]
struct State {
    scripts: HashMap<String, Behavior>,
    opens: HashMap<String, u32>,
    offers: Vec<String>,
    tokens: Vec<String>,
    local_candidates: Vec<(String, String)>,
    remote_candidates: Vec<(String, String)>,
    open_sessions: usize,
    max_open_sessions: usize,
    peers: HashMap<String, mpsc::UnboundedSender<MediaEvent>>,
    signaling: HashMap<String, mpsc::UnboundedSender<SignalingEvent>>,
}

impl State {
    fn behavior(&self, key: &str) -> Behavior {
        self.scripts.get(key).copied().unwrap_or(Behavior::Connect)
    }
}

/// Cloneable handle to the scripted gateway
#[derive(Clone, Default)]
pub struct ScriptedGateway {
    state: Arc<Mutex<State>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how the gateway treats `key` from the next open on
    pub fn script(&self, key: &str, behavior: Behavior) {
        self.lock().scripts.insert(key.to_string(), behavior);
    }

    /// Orchestrator wired to this gateway
    pub fn orchestrator(&self, config: OrchestratorConfig) -> Orchestrator {
        Orchestrator::new(
            config,
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            Arc::new(StaticCredential::new("secret")),
        )
        .expect("valid test configuration")
    }

    /// Stream connection collaborators wired to this gateway
    pub fn deps(&self, policy: ConnectionPolicy) -> ConnectionDeps {
        let credentials: Arc<dyn CredentialSource> = Arc::new(StaticCredential::new("secret"));
        ConnectionDeps {
            connector: Arc::new(self.clone()),
            media: Arc::new(self.clone()),
            credentials,
            policy,
        }
    }

    /// Signaling channels opened (or rejected) for `key`
    pub fn opens(&self, key: &str) -> u32 {
        self.lock().opens.get(key).copied().unwrap_or(0)
    }

    /// Stream keys in the order their offers arrived
    pub fn offers(&self) -> Vec<String> {
        self.lock().offers.clone()
    }

    /// Credentials presented on every open
    pub fn tokens(&self) -> Vec<String> {
        self.lock().tokens.clone()
    }

    /// Candidates trickled by the client for `key`
    pub fn local_candidates(&self, key: &str) -> Vec<String> {
        candidates_for(&self.lock().local_candidates, key)
    }

    /// Candidates the client applied to its session for `key`
    pub fn remote_candidates(&self, key: &str) -> Vec<String> {
        candidates_for(&self.lock().remote_candidates, key)
    }

    /// Media sessions created and not yet closed
    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    /// High-water mark of `open_sessions`
    pub fn max_open_sessions(&self) -> usize {
        self.lock().max_open_sessions
    }

    /// Push a peer state change into the latest session of `key`
    pub fn set_peer_state(&self, key: &str, state: PeerState) {
        let state_tx = self.lock().peers.get(key).cloned();
        if let Some(tx) = state_tx {
            let _ = tx.send(MediaEvent::StateChanged(state));
        }
    }

    /// Send a candidate frame on the latest signaling channel of `key`
    pub fn send_candidate(&self, key: &str, candidate: &str) {
        let signaling_tx = self.lock().signaling.get(key).cloned();
        if let Some(tx) = signaling_tx {
            let _ = tx.send(SignalingEvent::Message(SignalMessage::Candidate(
                candidate.to_string(),
            )));
        }
    }

    /// Close the latest signaling channel of `key` from the gateway side
    pub fn close_signaling(&self, key: &str) {
        let signaling_tx = self.lock().signaling.get(key).cloned();
        if let Some(tx) = signaling_tx {
            let _ = tx.send(SignalingEvent::Closed {
                reason: "gateway went away".to_string(),
            });
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("gateway state poisoned")
    }
}

fn candidates_for(all: &[(String, String)], key: &str) -> Vec<String> {
    all.iter()
        .filter(|(k, _)| k == key)
        .map(|(_, c)| c.clone())
        .collect()
}

#[async_trait]
impl SignalingConnector for ScriptedGateway {
    async fn open(&self, stream: &StreamIdentity, credential: &Credential) -> Result<SignalingLink> {
        let hold = match self.lock().behavior(&stream.key) {
            Behavior::SlowOpen(hold) => Some(hold),
            _ => None,
        };
        if let Some(hold) = hold {
            tokio::time::sleep(hold).await;
        }

        let mut state = self.lock();

        let opens = state.opens.entry(stream.key.clone()).or_insert(0);
        *opens += 1;
        let opens = *opens;
        state.tokens.push(credential.expose().to_string());

        let behavior = state.behavior(&stream.key);
        let rejected = match behavior {
            Behavior::Reject => true,
            Behavior::FlakyThenConnect(n) => opens <= n,
            _ => false,
        };
        if rejected {
            return Err(Error::Connect("gateway rejected credential (HTTP 401)".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.signaling.insert(stream.key.clone(), tx.clone());

        let channel = ScriptedChannel {
            key: stream.key.clone(),
            behavior,
            events: tx,
            open: AtomicBool::new(true),
            state: Arc::clone(&self.state),
        };

        Ok(SignalingLink {
            channel: Box::new(channel),
            events: rx,
        })
    }
}

struct ScriptedChannel {
    key: String,
    behavior: Behavior,
    events: mpsc::UnboundedSender<SignalingEvent>,
    open: AtomicBool,
    state: Arc<Mutex<State>>,
}

impl SignalingChannel for ScriptedChannel {
    fn send(&self, msg: SignalMessage) {
        if !self.is_open() {
            return;
        }

        let mut state = self.state.lock().expect("gateway state poisoned");
        match msg {
            SignalMessage::Offer(_) => {
                state.offers.push(self.key.clone());
                let reply = match self.behavior {
                    Behavior::Connect | Behavior::FlakyThenConnect(_) | Behavior::SlowOpen(_) => {
                        Some(SignalMessage::Answer(format!("v=0 answer for {}", self.key)))
                    }
                    Behavior::GatewayError => {
                        Some(SignalMessage::Error(format!("streams: unknown source {}", self.key)))
                    }
                    Behavior::Silent | Behavior::Reject => None,
                };
                if let Some(reply) = reply {
                    let _ = self.events.send(SignalingEvent::Message(reply));
                }
            }
            SignalMessage::Candidate(candidate) => {
                state.local_candidates.push((self.key.clone(), candidate));
            }
            SignalMessage::Answer(_) | SignalMessage::Error(_) => {}
        }
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSessionFactory for ScriptedGateway {
    async fn create(&self, stream: &StreamIdentity) -> Result<MediaLink> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.lock();
        state.open_sessions += 1;
        state.max_open_sessions = state.max_open_sessions.max(state.open_sessions);
        state.peers.insert(stream.key.clone(), tx.clone());

        let session = ScriptedSession {
            key: stream.key.clone(),
            events: tx,
            closed: AtomicBool::new(false),
            state: Arc::clone(&self.state),
        };

        Ok(MediaLink {
            session: Box::new(session),
            events: rx,
        })
    }
}

struct ScriptedSession {
    key: String,
    events: mpsc::UnboundedSender<MediaEvent>,
    closed: AtomicBool,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl MediaSession for ScriptedSession {
    async fn create_offer(&self) -> Result<String> {
        let _ = self
            .events
            .send(MediaEvent::LocalCandidate(LOCAL_CANDIDATE.to_string()));
        Ok(format!("v=0 offer for {}", self.key))
    }

    async fn apply_answer(&self, _sdp: String) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Negotiation("session closed".to_string()));
        }

        let _ = self.events.send(MediaEvent::StateChanged(PeerState::Connecting));
        let _ = self.events.send(MediaEvent::StateChanged(PeerState::Connected));
        let _ = self.events.send(MediaEvent::TrackReceived(MediaTrack::new(
            format!("{}-video", self.key),
            TrackKind::Video,
            "video/H264",
        )));
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: String) {
        let mut state = self.state.lock().expect("gateway state poisoned");
        state.remote_candidates.push((self.key.clone(), candidate));
    }

    async fn close(&self) {
        self.release();
    }
}

impl ScriptedSession {
    fn release(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = self.state.lock().expect("gateway state poisoned");
            state.open_sessions -= 1;
        }
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.release();
    }
}
