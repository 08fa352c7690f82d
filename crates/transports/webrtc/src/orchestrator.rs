//! Orchestrator: owns the scheduler and every live stream connection
//!
//! The orchestrator runs as one tokio task. The scheduler lives only inside
//! it, so admissions and releases are atomic with respect to each other.
//! Consumers drive it through [`OrchestratorHandle`] and observe it through
//! the [`OrchestratorEvent`] receiver returned by [`Orchestrator::spawn`].

use crate::config::{OrchestratorConfig, SchedulerMode};
use crate::credential::CredentialSource;
use crate::events::{OrchestratorEvent, StreamEvent, StreamEventKind};
use crate::media::{MediaSessionFactory, WebRtcMediaSessionFactory};
use crate::scheduler::{ConnectionScheduler, SchedulerAction};
use crate::signaling::{SignalingConnector, WsSignalingConnector};
use crate::stream::connection::{now, sleep_until_opt};
use crate::stream::{
    ConnectionDeps, ConnectionState, StreamConnection, StreamIdentity, StreamSnapshot,
};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

type Reply<T> = oneshot::Sender<Result<T>>;

enum Request {
    Request(String, Reply<()>),
    RequestAll(Reply<()>),
    Release(String, Reply<()>),
    Reconnect(String, Reply<()>),
    Promote(String, Reply<()>),
    Demote(String, Reply<()>),
    SetActive(String, bool, Reply<()>),
    Snapshot(oneshot::Sender<OrchestratorSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Point-in-time view of the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSnapshot {
    pub mode: SchedulerMode,
    /// Configured streams
    pub total: usize,
    /// Live stream connection instances
    pub admitted: usize,
    /// Keys waiting for admission, front first
    pub queued: Vec<String>,
    /// Current gate holder (gated mode)
    pub gate_holder: Option<String>,
    /// Promoted keys
    pub promoted: Vec<String>,
    /// Live instances in enable order
    pub streams: Vec<StreamSnapshot>,
}

impl OrchestratorSnapshot {
    pub fn stream(&self, key: &str) -> Option<&StreamSnapshot> {
        self.streams.iter().find(|s| s.key == key)
    }
}

/// Builder for the orchestrator task
pub struct Orchestrator {
    config: OrchestratorConfig,
    deps: ConnectionDeps,
}

impl Orchestrator {
    /// Create an orchestrator over explicit collaborators
    pub fn new(
        config: OrchestratorConfig,
        connector: Arc<dyn SignalingConnector>,
        media: Arc<dyn MediaSessionFactory>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self> {
        config.validate()?;

        let deps = ConnectionDeps {
            connector,
            media,
            credentials,
            policy: config.connection.clone(),
        };

        Ok(Self { config, deps })
    }

    /// Create an orchestrator talking WebSocket signaling and `webrtc` media
    pub fn with_gateway(
        config: OrchestratorConfig,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self> {
        let connector = Arc::new(WsSignalingConnector::from_config(&config)?);
        let media = Arc::new(WebRtcMediaSessionFactory::new(&config)?);
        Self::new(config, connector, media, credentials)
    }

    /// Start the orchestrator task
    pub fn spawn(self) -> (OrchestratorHandle, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();

        let ordered = self.config.ordered_streams();
        let order: Vec<String> = ordered.iter().map(|s| s.key.clone()).collect();
        let streams: HashMap<String, StreamIdentity> = ordered
            .iter()
            .map(|s| (s.key.clone(), s.identity()))
            .collect();

        info!(
            "Starting orchestrator: {} streams, {:?} mode, gateway {}",
            order.len(),
            self.config.scheduler.mode,
            self.config.gateway_url
        );

        let actor = Actor {
            scheduler: ConnectionScheduler::new(&self.config.scheduler, order.clone()),
            order,
            streams,
            deps: self.deps,
            live: HashMap::new(),
            visibility: HashMap::new(),
            requests: request_rx,
            events: event_tx,
            stream_tx,
            stream_rx,
            last_progress: None,
        };

        tokio::spawn(actor.run());

        (OrchestratorHandle { requests: request_tx }, event_rx)
    }
}

/// Manual control surface of a running orchestrator
#[derive(Clone)]
pub struct OrchestratorHandle {
    requests: mpsc::UnboundedSender<Request>,
}

impl OrchestratorHandle {
    /// Ask for admission of one stream
    pub async fn request(&self, key: &str) -> Result<()> {
        self.call(|reply| Request::Request(key.to_string(), reply))
            .await
    }

    /// Ask for admission of every configured stream, in enable order
    pub async fn request_all(&self) -> Result<()> {
        self.call(Request::RequestAll).await
    }

    /// Give up a stream; its instance is destroyed
    pub async fn release(&self, key: &str) -> Result<()> {
        self.call(|reply| Request::Release(key.to_string(), reply))
            .await
    }

    /// Start over with a fresh attempt budget
    pub async fn reconnect(&self, key: &str) -> Result<()> {
        self.call(|reply| Request::Reconnect(key.to_string(), reply))
            .await
    }

    /// Enable a stream now, outside caps and ordering
    pub async fn promote(&self, key: &str) -> Result<()> {
        self.call(|reply| Request::Promote(key.to_string(), reply))
            .await
    }

    /// Undo a promotion; the stream goes to the back of the queue
    pub async fn demote(&self, key: &str) -> Result<()> {
        self.call(|reply| Request::Demote(key.to_string(), reply))
            .await
    }

    /// Visibility of a stream; hidden streams are suspended
    pub async fn set_active(&self, key: &str, active: bool) -> Result<()> {
        self.call(|reply| Request::SetActive(key.to_string(), active, reply))
            .await
    }

    pub async fn snapshot(&self) -> Result<OrchestratorSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Snapshot(tx))
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    /// Disable every stream and stop; idempotent
    ///
    /// No events are emitted once this returns.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(Request::Shutdown(tx)).is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    async fn call(&self, make: impl FnOnce(Reply<()>) -> Request) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.requests.send(make(tx)).map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }
}

fn stopped() -> Error {
    Error::Shutdown("orchestrator has stopped".to_string())
}

struct LiveStream {
    connection: StreamConnection,
    state: ConnectionState,
}

struct Actor {
    order: Vec<String>,
    streams: HashMap<String, StreamIdentity>,
    deps: ConnectionDeps,
    scheduler: ConnectionScheduler,
    live: HashMap<String, LiveStream>,
    /// Remembered visibility, applied to new instances
    visibility: HashMap<String, bool>,
    requests: mpsc::UnboundedReceiver<Request>,
    events: mpsc::UnboundedSender<OrchestratorEvent>,
    stream_tx: mpsc::UnboundedSender<StreamEvent>,
    stream_rx: mpsc::UnboundedReceiver<StreamEvent>,
    last_progress: Option<(usize, usize)>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            self.apply_actions().await;
            self.emit_progress();

            let deadline = self.scheduler.poll_timeout();

            tokio::select! {
                request = self.requests.recv() => {
                    let Some(request) = request else {
                        // Every handle dropped
                        self.shutdown_all().await;
                        break;
                    };
                    if !self.handle_request(request).await {
                        break;
                    }
                }
                Some(event) = self.stream_rx.recv() => self.on_stream_event(event),
                _ = sleep_until_opt(deadline) => self.scheduler.handle_timeout(now()),
            }
        }

        info!("Orchestrator stopped");
    }

    /// Returns false once shut down
    async fn handle_request(&mut self, request: Request) -> bool {
        match request {
            Request::Request(key, reply) => {
                let _ = reply.send(self.request(&key));
            }
            Request::RequestAll(reply) => {
                let now = now();
                for key in &self.order {
                    if let Err(e) = self.scheduler.request(key, now) {
                        warn!("Could not request {}: {}", key, e);
                    }
                }
                let _ = reply.send(Ok(()));
            }
            Request::Release(key, reply) => {
                let result = self.known(&key);
                if result.is_ok() {
                    self.scheduler.release(&key, now());
                }
                let _ = reply.send(result);
            }
            Request::Reconnect(key, reply) => {
                let _ = reply.send(self.reconnect(&key));
            }
            Request::Promote(key, reply) => {
                let result = self.known(&key);
                if result.is_ok() {
                    self.scheduler.promote(&key, now());
                }
                let _ = reply.send(result);
            }
            Request::Demote(key, reply) => {
                let result = self.known(&key);
                if result.is_ok() {
                    self.scheduler.demote(&key, now());
                }
                let _ = reply.send(result);
            }
            Request::SetActive(key, active, reply) => {
                let _ = reply.send(self.set_active(&key, active));
            }
            Request::Snapshot(reply) => {
                let _ = reply.send(self.snapshot().await);
            }
            Request::Shutdown(ack) => {
                self.shutdown_all().await;
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    fn request(&mut self, key: &str) -> Result<()> {
        self.known(key)?;
        self.scheduler.request(key, now())
    }

    fn known(&self, key: &str) -> Result<()> {
        if self.streams.contains_key(key) {
            Ok(())
        } else {
            Err(Error::StreamNotFound(key.to_string()))
        }
    }

    fn reconnect(&mut self, key: &str) -> Result<()> {
        self.known(key)?;

        if self.scheduler.reconnect(key, now())? {
            debug!("Reconnect of {} waits for a slot", key);
            return Ok(());
        }

        match self.live.get(key) {
            Some(live) => live.connection.reconnect(),
            None => self.scheduler.request(key, now()),
        }
    }

    fn set_active(&mut self, key: &str, active: bool) -> Result<()> {
        self.known(key)?;
        self.visibility.insert(key.to_string(), active);

        match self.live.get(key) {
            Some(live) => live.connection.set_active(active),
            None => Ok(()),
        }
    }

    async fn apply_actions(&mut self) {
        while let Some(action) = self.scheduler.poll_action() {
            match action {
                SchedulerAction::Enable(key) => self.enable(&key),
                SchedulerAction::Disable(key) => self.destroy(&key).await,
            }
        }
    }

    fn enable(&mut self, key: &str) {
        let active = self.visibility.get(key).copied().unwrap_or(true);

        if let Some(live) = self.live.get(key) {
            let result = if live.state == ConnectionState::Failed {
                live.connection.reconnect()
            } else {
                live.connection.enable()
            };
            if let Err(e) = result {
                error!("Could not enable {}: {}", key, e);
            }
        } else {
            let Some(identity) = self.streams.get(key).cloned() else {
                warn!("Scheduler enabled unknown stream {}", key);
                return;
            };

            let connection = StreamConnection::spawn(
                identity,
                self.deps.clone(),
                active,
                self.stream_tx.clone(),
            );
            if let Err(e) = connection.enable() {
                error!("Could not enable {}: {}", key, e);
            }

            self.live.insert(
                key.to_string(),
                LiveStream {
                    connection,
                    state: ConnectionState::Idle,
                },
            );
        }

        // A hidden stream stays Idle without reporting it, so the
        // scheduler has to learn the holder is suspended from here
        if !active {
            debug!("{} enabled while hidden, suspended", key);
            self.scheduler.on_state(key, ConnectionState::Idle, now());
        }
    }

    async fn destroy(&mut self, key: &str) {
        let Some(live) = self.live.get(key) else {
            return;
        };

        if let Err(e) = live.connection.disable().await {
            warn!("Disable of {} did not complete: {}", key, e);
        }

        // Forward what the instance reported before acknowledging
        while let Ok(event) = self.stream_rx.try_recv() {
            self.on_stream_event(event);
        }

        self.live.remove(key);
        debug!("Destroyed stream connection for {}", key);
    }

    async fn shutdown_all(&mut self) {
        info!("Shutting down {} stream connections", self.live.len());
        for (key, live) in self.live.drain() {
            if let Err(e) = live.connection.shutdown().await {
                warn!("Shutdown of {} did not complete: {}", key, e);
            }
        }
    }

    fn on_stream_event(&mut self, event: StreamEvent) {
        let Some(live) = self.live.get_mut(&event.stream_key) else {
            debug!("Dropping event from destroyed instance {}", event.connection_id);
            return;
        };
        if live.connection.connection_id() != event.connection_id {
            debug!("Dropping event from stale instance {}", event.connection_id);
            return;
        }

        if let StreamEventKind::StateChanged { state, .. } = &event.kind {
            live.state = *state;
            self.scheduler.on_state(&event.stream_key, *state, now());
        }

        let _ = self.events.send(OrchestratorEvent::from_stream_event(event));
    }

    fn emit_progress(&mut self) {
        let progress = (self.live.len(), self.streams.len());
        if self.last_progress == Some(progress) {
            return;
        }
        self.last_progress = Some(progress);

        debug!("Progress: {}/{} admitted", progress.0, progress.1);
        let _ = self.events.send(OrchestratorEvent::Progress {
            admitted: progress.0,
            total: progress.1,
        });
    }

    async fn snapshot(&self) -> OrchestratorSnapshot {
        let mut streams = Vec::with_capacity(self.live.len());
        for key in &self.order {
            if let Some(live) = self.live.get(key) {
                match live.connection.snapshot().await {
                    Ok(snapshot) => streams.push(snapshot),
                    Err(e) => warn!("No snapshot for {}: {}", key, e),
                }
            }
        }

        let promoted: Vec<String> = self
            .order
            .iter()
            .filter(|key| self.scheduler.is_promoted(key))
            .cloned()
            .collect();

        OrchestratorSnapshot {
            mode: self.scheduler.mode(),
            total: self.streams.len(),
            admitted: self.live.len(),
            queued: self.scheduler.queued(),
            gate_holder: self.scheduler.gate_holder().map(str::to_string),
            promoted,
            streams,
        }
    }
}
