//! Events emitted by stream connections and the orchestrator
//!
//! Stream connections report to the orchestrator with [`StreamEvent`]; the
//! orchestrator reports to the consuming surface with [`OrchestratorEvent`].

use crate::media::MediaTrack;
use crate::stream::ConnectionState;

/// Event payload produced by a single stream connection
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEventKind {
    /// Every state transition
    StateChanged {
        /// New state
        state: ConnectionState,
        /// Attempt counter after the transition
        attempt: u32,
        /// Last recorded failure reason, if any
        last_error: Option<String>,
    },

    /// Entered Connected
    Connected,

    /// Entered Failed (exactly once per entry)
    Failed {
        /// Display string of the final error
        reason: String,
    },

    /// An inbound media track is available for rendering
    MediaAttached(MediaTrack),

    /// The media sink was cleared
    MediaDetached,
}

/// Event tagged with the emitting stream connection instance
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    /// Stream key
    pub stream_key: String,
    /// Identifier of the emitting instance; events of destroyed instances are dropped
    pub connection_id: u64,
    /// Payload
    pub kind: StreamEventKind,
}

/// Events delivered to the consuming surface
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    /// A stream changed state
    StateChanged {
        stream_key: String,
        state: ConnectionState,
        attempt: u32,
        last_error: Option<String>,
    },

    /// A stream reached Connected
    Connected { stream_key: String },

    /// A stream exhausted its attempts
    Failed { stream_key: String, reason: String },

    /// Media for a stream is ready to render
    MediaAttached {
        stream_key: String,
        track: MediaTrack,
    },

    /// Media for a stream went away
    MediaDetached { stream_key: String },

    /// Admission progress
    Progress {
        /// Live stream connection instances
        admitted: usize,
        /// Configured streams
        total: usize,
    },
}

impl OrchestratorEvent {
    /// Stream key of a per-stream event
    pub fn stream_key(&self) -> Option<&str> {
        match self {
            OrchestratorEvent::StateChanged { stream_key, .. }
            | OrchestratorEvent::Connected { stream_key }
            | OrchestratorEvent::Failed { stream_key, .. }
            | OrchestratorEvent::MediaAttached { stream_key, .. }
            | OrchestratorEvent::MediaDetached { stream_key } => Some(stream_key),
            OrchestratorEvent::Progress { .. } => None,
        }
    }

    pub(crate) fn from_stream_event(event: StreamEvent) -> Self {
        let stream_key = event.stream_key;
        match event.kind {
            StreamEventKind::StateChanged {
                state,
                attempt,
                last_error,
            } => OrchestratorEvent::StateChanged {
                stream_key,
                state,
                attempt,
                last_error,
            },
            StreamEventKind::Connected => OrchestratorEvent::Connected { stream_key },
            StreamEventKind::Failed { reason } => OrchestratorEvent::Failed { stream_key, reason },
            StreamEventKind::MediaAttached(track) => {
                OrchestratorEvent::MediaAttached { stream_key, track }
            }
            StreamEventKind::MediaDetached => OrchestratorEvent::MediaDetached { stream_key },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_event_conversion() {
        let event = StreamEvent {
            stream_key: "porch".to_string(),
            connection_id: 7,
            kind: StreamEventKind::Failed {
                reason: "Media timeout: no media".to_string(),
            },
        };

        let converted = OrchestratorEvent::from_stream_event(event);
        assert_eq!(converted.stream_key(), Some("porch"));
        assert!(matches!(converted, OrchestratorEvent::Failed { ref reason, .. } if reason.starts_with("Media timeout")));
    }

    #[test]
    fn test_progress_has_no_stream_key() {
        let event = OrchestratorEvent::Progress {
            admitted: 1,
            total: 5,
        };
        assert_eq!(event.stream_key(), None);
    }
}
