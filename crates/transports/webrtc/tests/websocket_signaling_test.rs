//! WebSocket signaling tests against a local gateway
//!
//! A minimal tokio-tungstenite server plays the gateway side: it records the
//! handshake URI and every text frame, answers offers, and can reject the
//! credential or hang up right after the handshake.

use camgrid_webrtc::credential::Credential;
use camgrid_webrtc::signaling::{
    SignalMessage, SignalingConnector, SignalingEvent, SignalingLink, WsSignalingConnector,
};
use camgrid_webrtc::{Error, StreamIdentity};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);
const ANSWER: &str = r#"{"type":"answer","value":"v=0 answer"}"#;
const CANDIDATE: &str = r#"{"type":"candidate","value":"candidate:1 1 udp 2122260223 10.0.10.3 8555 typ host"}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Answer offers, trickle one candidate
    Answer,
    /// Reply 401 to the upgrade request
    Reject,
    /// Send a close frame right after the handshake
    HangUp,
}

struct LocalGateway {
    url: String,
    uris: mpsc::UnboundedReceiver<String>,
    frames: mpsc::UnboundedReceiver<String>,
}

async fn start_gateway(mode: Mode) -> LocalGateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (uri_tx, uris) = mpsc::unbounded_channel();
    let (frame_tx, frames) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };

        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let _ = uri_tx.send(req.uri().to_string());
            if mode == Mode::Reject {
                let mut rejection = ErrorResponse::new(Some("bad token".to_string()));
                *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                return Err(rejection);
            }
            Ok(resp)
        };

        let Ok(mut ws) = accept_hdr_async(stream, callback).await else {
            return;
        };

        if mode == Mode::HangUp {
            let _ = ws.close(None).await;
            return;
        }

        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Text(text) => {
                    let is_offer = text.contains(r#""type":"offer""#);
                    let _ = frame_tx.send(text);
                    if is_offer {
                        let _ = ws.send(Message::Text("not a signaling frame".to_string())).await;
                        let _ = ws.send(Message::Text(ANSWER.to_string())).await;
                        let _ = ws.send(Message::Text(CANDIDATE.to_string())).await;
                    }
                }
                Message::Close(_) => {
                    let _ = frame_tx.send("<close>".to_string());
                    break;
                }
                _ => {}
            }
        }
    });

    LocalGateway {
        url: format!("ws://{}/api/ws", addr),
        uris,
        frames,
    }
}

fn porch() -> StreamIdentity {
    StreamIdentity {
        key: "porch cam".to_string(),
        label: "Porch".to_string(),
    }
}

async fn open(gateway: &LocalGateway) -> camgrid_webrtc::Result<SignalingLink> {
    let connector = WsSignalingConnector::new(&gateway.url, TIMEOUT)?;
    connector.open(&porch(), &Credential::new("secret")).await
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}

#[tokio::test]
async fn test_offer_answer_and_candidate_exchange() {
    let mut gateway = start_gateway(Mode::Answer).await;
    let mut link = open(&gateway).await.unwrap();
    assert!(link.channel.is_open());

    let uri = recv(&mut gateway.uris).await;
    assert!(uri.starts_with("/api/ws?"), "unexpected uri {}", uri);
    assert!(uri.contains("src=porch+cam"), "unexpected uri {}", uri);
    assert!(uri.contains("token=secret"), "unexpected uri {}", uri);

    link.channel.send(SignalMessage::Offer("v=0 offer".to_string()));
    let frame = recv(&mut gateway.frames).await;
    assert_eq!(frame, r#"{"type":"offer","value":"v=0 offer"}"#);

    // The unparseable frame is skipped, the rest arrive in order
    assert_eq!(
        recv(&mut link.events).await,
        SignalingEvent::Message(SignalMessage::Answer("v=0 answer".to_string()))
    );
    assert_eq!(
        recv(&mut link.events).await,
        SignalingEvent::Message(SignalMessage::Candidate(
            "candidate:1 1 udp 2122260223 10.0.10.3 8555 typ host".to_string()
        ))
    );

    link.channel.send(SignalMessage::Candidate("candidate:local".to_string()));
    assert_eq!(
        recv(&mut gateway.frames).await,
        r#"{"type":"candidate","value":"candidate:local"}"#
    );

    link.channel.close();
    link.channel.close();
    assert!(!link.channel.is_open());
    assert_eq!(recv(&mut gateway.frames).await, "<close>");

    // Sends after close are dropped
    link.channel.send(SignalMessage::Offer("late".to_string()));
}

#[tokio::test]
async fn test_rejected_credential_is_a_connect_error() {
    let gateway = start_gateway(Mode::Reject).await;

    let err = open(&gateway).await.unwrap_err();
    match err {
        Error::Connect(msg) => assert!(msg.contains("HTTP 401"), "unexpected message {}", msg),
        other => panic!("expected Connect error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_gateway_hang_up_reports_closed() {
    let gateway = start_gateway(Mode::HangUp).await;
    let mut link = open(&gateway).await.unwrap();

    match recv(&mut link.events).await {
        SignalingEvent::Closed { reason } => assert!(reason.contains("closed by gateway")),
        other => panic!("expected Closed, got {:?}", other),
    }
    assert!(!link.channel.is_open());

    // Exactly one Closed event, even after a local close
    link.channel.close();
    let extra = tokio::time::timeout(Duration::from_millis(200), link.events.recv()).await;
    assert!(!matches!(extra, Ok(Some(_))));
}

#[tokio::test]
async fn test_unreachable_gateway() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let connector =
        WsSignalingConnector::new(&format!("ws://{}/api/ws", addr), TIMEOUT).unwrap();
    let err = connector
        .open(&porch(), &Credential::new(""))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Connect(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_plain_http_reply_is_a_websocket_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut request = [0u8; 1024];
        let _ = stream.read(&mut request).await;
        let _ = stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
            .await;
    });

    let connector =
        WsSignalingConnector::new(&format!("ws://{}/api/ws", addr), TIMEOUT).unwrap();
    let err = connector
        .open(&porch(), &Credential::new("secret"))
        .await
        .unwrap_err();

    match &err {
        Error::WebSocket(msg) => assert!(msg.contains("404"), "unexpected message {}", msg),
        other => panic!("expected WebSocket error, got {:?}", other),
    }
    assert!(err.is_retryable());
}
