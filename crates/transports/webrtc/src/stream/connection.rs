//! Stream connection driver
//!
//! Runs a [`StreamMachine`] on its own tokio task. The task is the single
//! owner of the machine, so all transitions of one stream are totally
//! ordered. It waits on the command inbox, the current attempt's signaling
//! and media events, the pending resource acquisition and the machine's next
//! deadline.

use super::machine::{StreamEffect, StreamMachine};
use super::{ConnectionState, StreamIdentity};
use crate::config::ConnectionPolicy;
use crate::credential::CredentialSource;
use crate::events::{StreamEvent, StreamEventKind};
use crate::media::{MediaEvent, MediaLink, MediaSession, MediaSessionFactory, MediaTrack};
use crate::signaling::{
    SignalMessage, SignalingChannel, SignalingConnector, SignalingEvent, SignalingLink,
};
use crate::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Collaborators shared by every stream connection
#[derive(Clone)]
pub struct ConnectionDeps {
    pub connector: Arc<dyn SignalingConnector>,
    pub media: Arc<dyn MediaSessionFactory>,
    pub credentials: Arc<dyn CredentialSource>,
    pub policy: ConnectionPolicy,
}

/// Point-in-time view of a stream connection
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSnapshot {
    pub key: String,
    pub label: String,
    pub connection_id: u64,
    pub state: ConnectionState,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub enabled: bool,
    pub active: bool,
    pub media_attached: bool,
}

enum Command {
    Enable,
    Disable(oneshot::Sender<()>),
    Reconnect,
    SetActive(bool),
    Snapshot(oneshot::Sender<StreamSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to one stream connection task
///
/// Dropping the handle tears the task down and releases its resources
/// without emitting further events.
pub struct StreamConnection {
    identity: StreamIdentity,
    connection_id: u64,
    commands: mpsc::UnboundedSender<Command>,
}

impl StreamConnection {
    /// Spawn a disabled connection for `identity`
    pub fn spawn(
        identity: StreamIdentity,
        deps: ConnectionDeps,
        active: bool,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Self {
        let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let driver = Driver {
            machine: StreamMachine::new(identity.key.clone(), deps.policy.clone(), active),
            identity: identity.clone(),
            connection_id,
            deps,
            inbox: rx,
            events,
            silent: false,
            epoch: 0,
            pending: None,
            signaling: None,
            signaling_events: None,
            media: None,
            media_events: None,
            tracks: Vec::new(),
        };

        debug!("Spawning stream connection {} for {}", connection_id, identity.key);
        tokio::spawn(driver.run());

        Self {
            identity,
            connection_id,
            commands: tx,
        }
    }

    pub fn identity(&self) -> &StreamIdentity {
        &self.identity
    }

    pub fn key(&self) -> &str {
        &self.identity.key
    }

    /// Instance identifier carried by every emitted event
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn enable(&self) -> Result<()> {
        self.send(Command::Enable)
    }

    pub fn reconnect(&self) -> Result<()> {
        self.send(Command::Reconnect)
    }

    pub fn set_active(&self, active: bool) -> Result<()> {
        self.send(Command::SetActive(active))
    }

    /// Disable and wait until timers are cancelled and resources closed
    pub async fn disable(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Disable(tx))?;
        rx.await.map_err(|_| self.gone())
    }

    pub async fn snapshot(&self) -> Result<StreamSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| self.gone())
    }

    /// Disable and stop the task
    pub async fn shutdown(self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Shutdown(tx)).is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| self.gone())
    }

    fn gone(&self) -> Error {
        Error::Shutdown(format!("stream connection {} has stopped", self.identity.key))
    }
}

/// Resources acquired for one attempt
///
/// Dropping it closes both halves, so an aborted acquisition leaks nothing.
struct Acquired {
    signaling: SignalingLink,
    media: MediaLink,
}

#[instrument(skip(identity, deps), fields(stream = %identity.key))]
async fn acquire(identity: StreamIdentity, deps: ConnectionDeps, attempt: u32) -> Result<Acquired> {
    let credential = deps.credentials.credential().await?;
    let signaling = deps.connector.open(&identity, &credential).await?;

    let media = match deps.media.create(&identity).await {
        Ok(media) => media,
        Err(e) => {
            signaling.channel.close();
            return Err(e);
        }
    };

    let offer = match media.session.create_offer().await {
        Ok(offer) => offer,
        Err(e) => {
            media.session.close().await;
            signaling.channel.close();
            return Err(e);
        }
    };

    debug!("Sending offer ({} bytes)", offer.len());
    signaling.channel.send(SignalMessage::Offer(offer));

    Ok(Acquired { signaling, media })
}

struct Driver {
    identity: StreamIdentity,
    connection_id: u64,
    deps: ConnectionDeps,
    machine: StreamMachine,
    inbox: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<StreamEvent>,
    silent: bool,

    epoch: u64,
    pending: Option<JoinHandle<Result<Acquired>>>,
    signaling: Option<Box<dyn SignalingChannel>>,
    signaling_events: Option<mpsc::UnboundedReceiver<SignalingEvent>>,
    media: Option<Arc<dyn MediaSession>>,
    media_events: Option<mpsc::UnboundedReceiver<MediaEvent>>,
    tracks: Vec<MediaTrack>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            self.apply_effects().await;

            let deadline = self.machine.poll_timeout();

            tokio::select! {
                command = self.inbox.recv() => {
                    let Some(command) = command else {
                        // Handle dropped
                        self.silent = true;
                        self.machine.disable();
                        self.apply_effects().await;
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                result = join_pending(&mut self.pending) => {
                    self.pending = None;
                    self.on_acquired(result);
                }
                event = recv_opt(&mut self.signaling_events) => {
                    self.on_signaling(event).await;
                }
                event = recv_opt(&mut self.media_events) => {
                    self.on_media(event);
                }
                _ = sleep_until_opt(deadline) => {
                    self.machine.handle_timeout(now());
                }
            }
        }

        debug!("Stream connection {} for {} stopped", self.connection_id, self.identity.key);
    }

    /// Returns false when the task should stop
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Enable => self.machine.enable(now()),
            Command::Reconnect => {
                info!("Manual reconnect of {}", self.identity.key);
                self.machine.reconnect(now());
            }
            Command::SetActive(active) => self.machine.set_active(active, now()),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Disable(ack) => {
                self.machine.disable();
                self.apply_effects().await;
                let _ = ack.send(());
            }
            Command::Shutdown(ack) => {
                self.machine.disable();
                self.apply_effects().await;
                self.silent = true;
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    async fn apply_effects(&mut self) {
        while let Some(effect) = self.machine.poll_effect() {
            match effect {
                StreamEffect::OpenResources { attempt } => self.open_resources(attempt),
                StreamEffect::CloseResources => self.close_resources().await,
                StreamEffect::Emit(kind) => self.emit(kind),
            }
        }
    }

    fn open_resources(&mut self, attempt: u32) {
        self.epoch += 1;
        debug!(
            "Opening resources for {} (attempt {}, epoch {})",
            self.identity.key, attempt, self.epoch
        );
        self.pending = Some(tokio::spawn(acquire(
            self.identity.clone(),
            self.deps.clone(),
            attempt,
        )));
    }

    async fn close_resources(&mut self) {
        if let Some(pending) = self.pending.take() {
            // Partially acquired channels and sessions close on drop
            debug!(
                "Aborting resource acquisition for {} (epoch {})",
                self.identity.key, self.epoch
            );
            pending.abort();
        }

        if let Some(channel) = self.signaling.take() {
            channel.close();
        }
        self.signaling_events = None;

        if let Some(media) = self.media.take() {
            media.close().await;
        }
        self.media_events = None;

        if !self.tracks.is_empty() {
            self.tracks.clear();
            self.emit(StreamEventKind::MediaDetached);
        }
    }

    fn on_acquired(&mut self, result: std::result::Result<Result<Acquired>, JoinError>) {
        match result {
            Ok(Ok(acquired)) => {
                debug!("Resources ready for {} (epoch {})", self.identity.key, self.epoch);
                self.signaling = Some(acquired.signaling.channel);
                self.signaling_events = Some(acquired.signaling.events);
                self.media = Some(Arc::from(acquired.media.session));
                self.media_events = Some(acquired.media.events);
            }
            Ok(Err(e)) => {
                warn!("Attempt setup for {} failed: {}", self.identity.key, e);
                self.machine.on_failure(&e, now());
            }
            Err(e) => {
                let error = Error::Connect(format!("attempt setup aborted: {}", e));
                self.machine.on_failure(&error, now());
            }
        }
    }

    async fn on_signaling(&mut self, event: Option<SignalingEvent>) {
        let event = event.unwrap_or_else(|| SignalingEvent::Closed {
            reason: "event stream ended".to_string(),
        });

        match event {
            SignalingEvent::Message(SignalMessage::Answer(sdp)) => {
                let Some(media) = self.media.clone() else {
                    return;
                };
                if let Err(e) = media.apply_answer(sdp).await {
                    self.machine.on_failure(&e, now());
                }
            }
            SignalingEvent::Message(SignalMessage::Candidate(candidate)) => {
                if let Some(media) = self.media.clone() {
                    media.add_remote_candidate(candidate).await;
                }
            }
            SignalingEvent::Message(SignalMessage::Error(message)) => {
                let error = Error::Negotiation(format!("gateway error: {}", message));
                self.machine.on_failure(&error, now());
            }
            SignalingEvent::Message(SignalMessage::Offer(_)) => {
                debug!("Ignoring unexpected offer for {}", self.identity.key);
            }
            SignalingEvent::Closed { reason } => {
                self.signaling = None;
                self.signaling_events = None;
                if self.machine.state() == ConnectionState::Connecting {
                    let error = Error::Connect(format!("signaling closed: {}", reason));
                    self.machine.on_failure(&error, now());
                } else {
                    debug!("Signaling for {} closed: {}", self.identity.key, reason);
                }
            }
        }
    }

    fn on_media(&mut self, event: Option<MediaEvent>) {
        let Some(event) = event else {
            self.media_events = None;
            return;
        };

        match event {
            MediaEvent::StateChanged(state) => self.machine.on_peer_state(state, now()),
            MediaEvent::TrackReceived(track) => {
                self.tracks.push(track.clone());
                self.emit(StreamEventKind::MediaAttached(track));
            }
            MediaEvent::LocalCandidate(candidate) => {
                if let Some(channel) = &self.signaling {
                    channel.send(SignalMessage::Candidate(candidate));
                }
            }
        }
    }

    fn emit(&self, kind: StreamEventKind) {
        if self.silent {
            return;
        }
        if let StreamEventKind::StateChanged { state, attempt, .. } = &kind {
            info!("Stream {} is {} (attempt {})", self.identity.key, state, attempt);
        }
        let _ = self.events.send(StreamEvent {
            stream_key: self.identity.key.clone(),
            connection_id: self.connection_id,
            kind,
        });
    }

    fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot {
            key: self.identity.key.clone(),
            label: self.identity.label.clone(),
            connection_id: self.connection_id,
            state: self.machine.state(),
            attempt: self.machine.attempt(),
            last_error: self.machine.last_error().map(str::to_string),
            enabled: self.machine.is_enabled(),
            active: self.machine.is_active(),
            media_attached: !self.tracks.is_empty(),
        }
    }
}

pub(crate) fn now() -> std::time::Instant {
    Instant::now().into_std()
}

async fn join_pending<T>(
    pending: &mut Option<JoinHandle<T>>,
) -> std::result::Result<T, JoinError> {
    match pending {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

pub(crate) async fn sleep_until_opt(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
