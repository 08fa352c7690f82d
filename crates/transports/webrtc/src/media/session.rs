//! Media session abstraction
//!
//! A media session wraps one receive-only peer connection. Its events are
//! delivered through an unbounded channel owned by the stream connection.

use crate::stream::StreamIdentity;
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

/// Primitive-level peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    /// Possibly transient; may recover on its own
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::New => "new",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Failed => "failed",
            PeerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Kind of an inbound track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Inbound media track handed to the rendering side
///
/// Carries the remote track when backed by a real peer connection so the
/// consumer can read RTP from it.
#[derive(Clone)]
pub struct MediaTrack {
    /// Track id
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
    /// Negotiated codec MIME type, e.g. `video/H264`
    pub codec: String,
    remote: Option<Arc<TrackRemote>>,
}

impl MediaTrack {
    /// Track description without a backing remote track
    pub fn new(id: impl Into<String>, kind: TrackKind, codec: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            codec: codec.into(),
            remote: None,
        }
    }

    pub(crate) fn with_remote(mut self, remote: Arc<TrackRemote>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Remote track to read RTP packets from
    pub fn remote(&self) -> Option<&Arc<TrackRemote>> {
        self.remote.as_ref()
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind && self.codec == other.codec
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("codec", &self.codec)
            .field("remote", &self.remote.is_some())
            .finish()
    }
}

/// Events emitted by a media session
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// Every primitive-level state transition
    StateChanged(PeerState),
    /// Once per inbound track
    TrackReceived(MediaTrack),
    /// Trickled local ICE candidate, to be sent to the gateway
    LocalCandidate(String),
}

/// One receive-only peer connection
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Create the local offer and install it as the local description
    ///
    /// Fails with `Error::Negotiation`.
    async fn create_offer(&self) -> Result<String>;

    /// Install the gateway's answer
    ///
    /// Fails with `Error::Negotiation` if the session is closed or the
    /// answer does not fit the current signaling state.
    async fn apply_answer(&self, sdp: String) -> Result<()>;

    /// Add a remote ICE candidate; failures are logged, never returned
    async fn add_remote_candidate(&self, candidate: String);

    /// Detach handlers and release the peer connection (idempotent)
    async fn close(&self);
}

/// A created session together with its event receiver
pub struct MediaLink {
    pub session: Box<dyn MediaSession>,
    pub events: mpsc::UnboundedReceiver<MediaEvent>,
}

impl fmt::Debug for MediaLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaLink").finish_non_exhaustive()
    }
}

/// Creates media sessions
#[async_trait]
pub trait MediaSessionFactory: Send + Sync {
    /// Create a fresh session for `stream`
    async fn create(&self, stream: &StreamIdentity) -> Result<MediaLink>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_equality_ignores_remote() {
        let a = MediaTrack::new("v0", TrackKind::Video, "video/H264");
        let b = MediaTrack::new("v0", TrackKind::Video, "video/H264");
        assert_eq!(a, b);
        assert!(a.remote().is_none());
    }

    #[test]
    fn test_peer_state_display() {
        assert_eq!(PeerState::Disconnected.to_string(), "disconnected");
    }
}
