//! Signaling channel abstraction

use super::protocol::SignalMessage;
use crate::credential::Credential;
use crate::stream::StreamIdentity;
use crate::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Events delivered by an open signaling channel, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// A parsed message from the gateway
    Message(SignalMessage),
    /// The channel closed (remote close or transport error)
    Closed {
        /// Why the channel closed
        reason: String,
    },
}

/// One open, per-stream signaling channel
///
/// All methods are synchronous so the channel can be released from any
/// context, including drop paths.
pub trait SignalingChannel: Send + Sync {
    /// Enqueue a message for sending
    ///
    /// Messages sent on a channel that is not open are dropped.
    fn send(&self, msg: SignalMessage);

    /// Close the channel (idempotent)
    fn close(&self);

    /// Whether the channel is still open
    fn is_open(&self) -> bool;
}

/// An opened channel together with its event receiver
pub struct SignalingLink {
    pub channel: Box<dyn SignalingChannel>,
    pub events: mpsc::UnboundedReceiver<SignalingEvent>,
}

impl std::fmt::Debug for SignalingLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingLink")
            .field("open", &self.channel.is_open())
            .finish()
    }
}

/// Opens signaling channels to the gateway
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Open a channel for `stream`
    ///
    /// # Errors
    ///
    /// `Error::Connect` if the credential is rejected or the channel cannot
    /// be established within the connect timeout.
    async fn open(&self, stream: &StreamIdentity, credential: &Credential) -> Result<SignalingLink>;
}
