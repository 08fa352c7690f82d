//! Media sessions (receive-only peer connections)

pub mod session;
pub mod webrtc;

pub use self::session::{
    MediaEvent, MediaLink, MediaSession, MediaSessionFactory, MediaTrack, PeerState, TrackKind,
};
pub use self::webrtc::WebRtcMediaSessionFactory;
