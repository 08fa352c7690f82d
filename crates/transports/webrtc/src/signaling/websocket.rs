//! WebSocket signaling channel to the gateway

use super::channel::{SignalingChannel, SignalingConnector, SignalingEvent, SignalingLink};
use super::protocol::SignalMessage;
use crate::config::OrchestratorConfig;
use crate::credential::Credential;
use crate::stream::StreamIdentity;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Opens one WebSocket per stream against the gateway signaling endpoint
///
/// The stream key and credential travel as query parameters on the
/// upgrade request, e.g. `ws://nvr:1984/api/ws?src=porch&token=...`.
#[derive(Debug, Clone)]
pub struct WsSignalingConnector {
    gateway_url: Url,
    stream_param: String,
    token_param: String,
    connect_timeout: Duration,
}

impl WsSignalingConnector {
    /// Create a connector for `gateway_url` with default parameter names
    pub fn new(gateway_url: &str, connect_timeout: Duration) -> Result<Self> {
        let gateway_url = Url::parse(gateway_url)
            .map_err(|e| Error::InvalidConfig(format!("Invalid gateway URL {}: {}", gateway_url, e)))?;

        match gateway_url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(Error::InvalidConfig(format!(
                    "Unsupported gateway URL scheme: {}",
                    other
                )))
            }
        }

        Ok(Self {
            gateway_url,
            stream_param: "src".to_string(),
            token_param: "token".to_string(),
            connect_timeout,
        })
    }

    /// Create a connector from orchestrator configuration
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self> {
        let mut connector = Self::new(&config.gateway_url, config.connection.connect_timeout())?;
        connector.stream_param = config.stream_param.clone();
        connector.token_param = config.token_param.clone();
        Ok(connector)
    }

    /// Build the upgrade URL for a stream
    pub fn stream_url(&self, stream: &StreamIdentity, credential: &Credential) -> Url {
        let mut url = self.gateway_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(&self.stream_param, &stream.key);
            if !credential.is_empty() {
                query.append_pair(&self.token_param, credential.expose());
            }
        }
        url
    }

    async fn connect(&self, url: &Url) -> Result<WsStream> {
        let attempt = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str())).await;

        match attempt {
            Err(_) => Err(Error::Connect(format!(
                "signaling channel not established within {}ms",
                self.connect_timeout.as_millis()
            ))),
            Ok(Err(tungstenite::Error::Http(response)))
                if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
            {
                Err(Error::Connect(format!(
                    "gateway rejected credential (HTTP {})",
                    response.status().as_u16()
                )))
            }
            Ok(Err(tungstenite::Error::Io(e))) => {
                Err(Error::Connect(format!("Failed to connect: {}", e)))
            }
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok((ws_stream, _response))) => Ok(ws_stream),
        }
    }

    /// Writer task: drains the outgoing queue into the socket
    async fn writer_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
        stream_key: String,
    ) {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                debug!("Signaling write failed for {}: {}", stream_key, e);
                break;
            }
            if closing {
                break;
            }
        }

        let _ = write.close().await;
        debug!("Signaling writer for {} terminated", stream_key);
    }

    /// Reader task: parses text frames and reports them in order
    async fn reader_task(
        mut read: futures::stream::SplitStream<WsStream>,
        outgoing: mpsc::UnboundedSender<Message>,
        events: mpsc::UnboundedSender<SignalingEvent>,
        open: Arc<AtomicBool>,
        stream_key: String,
    ) {
        let reason = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match SignalMessage::from_json(&text) {
                    Ok(msg) => {
                        debug!("Signaling {} <- {}", stream_key, msg.kind());
                        let _ = events.send(SignalingEvent::Message(msg));
                    }
                    Err(e) => {
                        warn!("Skipping unparseable signaling frame for {}: {}", stream_key, e);
                    }
                },
                Some(Ok(Message::Ping(payload))) => {
                    let _ = outgoing.send(Message::Pong(payload));
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) if !frame.reason.is_empty() => {
                            format!("closed by gateway: {}", frame.reason)
                        }
                        _ => "closed by gateway".to_string(),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("transport error: {}", e),
                None => break "connection ended".to_string(),
            }
        };

        if open.swap(false, Ordering::SeqCst) {
            info!("Signaling channel for {} closed: {}", stream_key, reason);
            let _ = events.send(SignalingEvent::Closed { reason });
        }
        debug!("Signaling reader for {} terminated", stream_key);
    }
}

#[async_trait]
impl SignalingConnector for WsSignalingConnector {
    async fn open(&self, stream: &StreamIdentity, credential: &Credential) -> Result<SignalingLink> {
        info!(
            stream = %stream.key,
            gateway = %self.gateway_url,
            "Opening signaling channel"
        );

        let url = self.stream_url(stream, credential);
        let ws_stream = self.connect(&url).await?;
        let (write, read) = ws_stream.split();

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let writer = tokio::spawn(Self::writer_task(write, out_rx, stream.key.clone()));
        let reader = tokio::spawn(Self::reader_task(
            read,
            out_tx.clone(),
            event_tx,
            open.clone(),
            stream.key.clone(),
        ));

        Ok(SignalingLink {
            channel: Box::new(WsSignalingChannel {
                stream_key: stream.key.clone(),
                outgoing: out_tx,
                open,
                reader: reader.abort_handle(),
                writer: writer.abort_handle(),
            }),
            events: event_rx,
        })
    }
}

/// Open WebSocket signaling channel
struct WsSignalingChannel {
    stream_key: String,
    outgoing: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
    reader: AbortHandle,
    writer: AbortHandle,
}

impl SignalingChannel for WsSignalingChannel {
    fn send(&self, msg: SignalMessage) {
        if !self.is_open() {
            debug!("Dropping {} for {}: channel not open", msg.kind(), self.stream_key);
            return;
        }

        match msg.to_json() {
            Ok(text) => {
                debug!("Signaling {} -> {}", self.stream_key, msg.kind());
                if self.outgoing.send(Message::Text(text)).is_err() {
                    debug!("Dropping {} for {}: writer gone", msg.kind(), self.stream_key);
                }
            }
            Err(e) => warn!("Failed to encode {} for {}: {}", msg.kind(), self.stream_key, e),
        }
    }

    fn close(&self) {
        self.reader.abort();
        if self.open.swap(false, Ordering::SeqCst) {
            debug!("Closing signaling channel for {}", self.stream_key);
            // The writer sends the close frame and exits on its own
            if self.outgoing.send(Message::Close(None)).is_err() {
                self.writer.abort();
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for WsSignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}
