//! Media sessions backed by the `webrtc` crate

use super::session::{
    MediaEvent, MediaLink, MediaSession, MediaSessionFactory, MediaTrack, PeerState, TrackKind,
};
use crate::config::OrchestratorConfig;
use crate::stream::StreamIdentity;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

/// Creates receive-only peer connections
pub struct WebRtcMediaSessionFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    receive_audio: bool,
}

impl WebRtcMediaSessionFactory {
    /// Build the WebRTC API with default codecs and interceptors
    pub fn new(config: &OrchestratorConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::Negotiation(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::Negotiation(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        Ok(Self {
            api,
            ice_servers: ice_servers(config),
            receive_audio: config.receive_audio,
        })
    }

    /// Recv-only video, plus audio when enabled; closes `pc` on failure
    async fn add_receivers(&self, pc: &RTCPeerConnection, stream_key: &str) -> Result<()> {
        let mut result = self.add_receiver(pc, RTPCodecType::Video).await;
        if result.is_ok() && self.receive_audio {
            result = self.add_receiver(pc, RTPCodecType::Audio).await;
        }
        if result.is_err() {
            close_peer(pc, stream_key).await;
        }
        result
    }

    async fn add_receiver(&self, pc: &RTCPeerConnection, kind: RTPCodecType) -> Result<()> {
        pc.add_transceiver_from_kind(
            kind,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .map_err(|e| Error::Negotiation(format!("Failed to add {} transceiver: {}", kind, e)))?;
        Ok(())
    }
}

/// STUN and TURN servers from configuration
fn ice_servers(config: &OrchestratorConfig) -> Vec<RTCIceServer> {
    config
        .stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
            urls: vec![turn.url.clone()],
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        }))
        .collect()
}

async fn close_peer(pc: &RTCPeerConnection, stream_key: &str) {
    if let Err(e) = pc.close().await {
        warn!("Failed to close peer connection for {}: {}", stream_key, e);
    }
}

fn map_peer_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerState::New),
        RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerState::Closed),
        _ => None,
    }
}

/// Parse a remote candidate: either a JSON `RTCIceCandidateInit` or a bare
/// `candidate:` line
fn parse_remote_candidate(candidate: &str) -> RTCIceCandidateInit {
    let trimmed = candidate.trim();
    if trimmed.starts_with('{') {
        if let Ok(init) = serde_json::from_str::<RTCIceCandidateInit>(trimmed) {
            return init;
        }
    }

    RTCIceCandidateInit {
        candidate: trimmed.to_string(),
        ..Default::default()
    }
}

#[async_trait]
impl MediaSessionFactory for WebRtcMediaSessionFactory {
    #[instrument(skip(self), fields(stream = %stream.key))]
    async fn create(&self, stream: &StreamIdentity) -> Result<MediaLink> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::Negotiation(format!("Failed to create peer connection: {}", e))
        })?);

        self.add_receivers(&pc, &stream.key).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let state_tx = tx.clone();
        let key = stream.key.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let state_tx = state_tx.clone();
            let key = key.clone();
            Box::pin(async move {
                if let Some(state) = map_peer_state(s) {
                    debug!("Peer connection for {} is {}", key, state);
                    let _ = state_tx.send(MediaEvent::StateChanged(state));
                }
            })
        }));

        let track_tx = tx.clone();
        let key = stream.key.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let track_tx = track_tx.clone();
                let key = key.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        _ => TrackKind::Video,
                    };
                    let codec = track.codec().capability.mime_type;
                    info!("Track received for {}: {} ({})", key, track.id(), codec);
                    let media = MediaTrack::new(track.id(), kind, codec).with_remote(track);
                    let _ = track_tx.send(MediaEvent::TrackReceived(media));
                })
            },
        ));

        let candidate_tx = tx;
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_tx.send(MediaEvent::LocalCandidate(init.candidate));
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        Ok(MediaLink {
            session: Box::new(WebRtcMediaSession {
                stream_key: stream.key.clone(),
                pc,
                closed,
            }),
            events: rx,
        })
    }
}

/// Receive-only peer connection for one stream attempt
struct WebRtcMediaSession {
    stream_key: String,
    pc: Arc<RTCPeerConnection>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl MediaSession for WebRtcMediaSession {
    async fn create_offer(&self) -> Result<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Negotiation("media session closed".to_string()));
        }

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to create offer: {}", e)))?;

        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set local description: {}", e)))?;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Negotiation("No local description".to_string()))?;

        Ok(local.sdp)
    }

    async fn apply_answer(&self, sdp: String) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Negotiation("media session closed".to_string()));
        }

        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| Error::Negotiation(format!("Failed to parse answer: {}", e)))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set remote description: {}", e)))?;

        debug!("Answer applied for {}", self.stream_key);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: String) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let init = parse_remote_candidate(&candidate);
        if let Err(e) = self.pc.add_ice_candidate(init).await {
            warn!("Failed to add remote candidate for {}: {}", self.stream_key, e);
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Detach handlers so no events follow the close
        self.pc
            .on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc.on_track(Box::new(|_, _, _| Box::pin(async {})));
        self.pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));

        close_peer(&self.pc, &self.stream_key).await;
        debug!("Media session for {} closed", self.stream_key);
    }
}

impl Drop for WebRtcMediaSession {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let pc = Arc::clone(&self.pc);
        let stream_key = std::mem::take(&mut self.stream_key);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Media session for {} dropped without close", stream_key);
                runtime.spawn(async move { close_peer(&pc, &stream_key).await });
            }
            Err(_) => warn!(
                "Media session for {} dropped outside a runtime, peer connection not closed",
                stream_key
            ),
        }
    }
}
