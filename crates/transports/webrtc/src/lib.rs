//! Multi-camera WebRTC connection orchestration
//!
//! This crate connects a viewing client to many live camera feeds served by a
//! WebRTC media gateway (go2rtc style). Every feed gets its own signaling
//! handshake, peer connection and failure recovery; an orchestrator decides
//! which feeds may handshake at any moment.
//!
//! # Features
//!
//! - **Per-stream state machine**: retry with exponential backoff, fast
//!   reconnect after a stream has been up, disconnect grace period and
//!   visibility suspension
//! - **Capped admission**: at most N concurrent handshakes, spaced and
//!   queued in FIFO order
//! - **Gated admission**: strict one-at-a-time waterfall in configured order
//! - **Promotion**: bring one stream up immediately, outside the ordering
//! - **WebSocket signaling**: `{"type","value"}` frames per stream
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │  Consumer (grid UI, CLI)                              │
//! │  ↓ OrchestratorHandle          ↑ OrchestratorEvent    │
//! │  Orchestrator task                                    │
//! │  ├─ ConnectionScheduler (capped / gated / promotion)  │
//! │  └─ StreamConnection task per admitted stream         │
//! │     ├─ StreamMachine (sans-IO lifecycle)              │
//! │     ├─ SignalingChannel (WebSocket to gateway)        │
//! │     └─ MediaSession (receive-only peer connection)    │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use camgrid_webrtc::config::{OrchestratorConfig, StreamConfig};
//!
//! let mut config = OrchestratorConfig::capped_preset("ws://10.0.10.3:1984/api/ws", 4);
//! config.streams = vec![
//!     StreamConfig::new("driveway", "Driveway"),
//!     StreamConfig::new("porch", "Porch").with_priority(10),
//! ];
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.ordered_streams()[0].key, "porch");
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use camgrid_webrtc::credential::StaticCredential;
//! use camgrid_webrtc::{Orchestrator, OrchestratorConfig, OrchestratorEvent};
//! use std::sync::Arc;
//!
//! # async fn example() -> camgrid_webrtc::Result<()> {
//! let config = OrchestratorConfig::from_file("streams.yaml")?;
//! let orchestrator = Orchestrator::with_gateway(config, Arc::new(StaticCredential::new("token")))?;
//! let (handle, mut events) = orchestrator.spawn();
//!
//! handle.request_all().await?;
//! while let Some(event) = events.recv().await {
//!     if let OrchestratorEvent::Failed { stream_key, reason } = event {
//!         eprintln!("{} failed: {}", stream_key, reason);
//!         handle.reconnect(&stream_key).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod credential;
pub mod error;
pub mod events;
pub mod media;
pub mod orchestrator;
pub mod scheduler;
pub mod signaling;
pub mod stream;

pub use config::{ConnectionPolicy, OrchestratorConfig, SchedulerConfig, SchedulerMode, StreamConfig};
pub use error::{Error, Result};
pub use events::{OrchestratorEvent, StreamEvent, StreamEventKind};
pub use orchestrator::{Orchestrator, OrchestratorHandle, OrchestratorSnapshot};
pub use stream::{ConnectionState, StreamIdentity};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
