//! Gateway signaling wire format
//!
//! Every frame is a JSON text message `{"type": <kind>, "value": <string>}`
//! where kind is one of `offer`, `answer`, `candidate`, `error`.

use crate::Result;
use serde::{Deserialize, Serialize};

/// A single signaling message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SignalMessage {
    /// SDP offer (client to gateway)
    Offer(String),
    /// SDP answer (gateway to client)
    Answer(String),
    /// Trickled ICE candidate (either direction)
    Candidate(String),
    /// Gateway-side error description
    Error(String),
}

impl SignalMessage {
    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Offer(_) => "offer",
            SignalMessage::Answer(_) => "answer",
            SignalMessage::Candidate(_) => "candidate",
            SignalMessage::Error(_) => "error",
        }
    }
}
