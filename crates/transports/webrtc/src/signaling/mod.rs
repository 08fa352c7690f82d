//! Per-stream signaling with the media gateway
//!
//! Offer, answer and candidate exchange over a WebSocket, one channel per
//! stream connection attempt.

pub mod channel;
pub mod protocol;
pub mod websocket;

pub use channel::{SignalingChannel, SignalingConnector, SignalingEvent, SignalingLink};
pub use protocol::SignalMessage;
pub use websocket::WsSignalingConnector;
