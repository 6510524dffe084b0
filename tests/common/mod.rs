#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use inspection_realtime::ws::{Config, ConnectionEvent, ReconnectConfig};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

pub const TOKEN: &str = "secret-token";

/// How long helpers wait before failing a test.
pub const WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
enum Push {
    Text(String),
    Close(u16, &'static str),
    /// Drop the socket without a closing handshake
    Hangup,
}

/// Mock realtime server.
pub struct MockWsServer {
    addr: SocketAddr,
    /// Fan-out to every connected client
    push_tx: broadcast::Sender<Push>,
    /// JSON frames received from clients, in arrival order
    received_rx: mpsc::UnboundedReceiver<Value>,
    /// Request uri of every accepted upgrade
    connections_rx: mpsc::UnboundedReceiver<String>,
    accept_loop: JoinHandle<()>,
}

impl MockWsServer {
    /// Start a server that answers `ping` frames with `pong`.
    pub async fn start() -> Self {
        Self::start_with("127.0.0.1:0".parse().unwrap(), true).await
    }

    /// Start a server that never answers pings.
    pub async fn start_silent() -> Self {
        Self::start_with("127.0.0.1:0".parse().unwrap(), false).await
    }

    /// Start a server on `addr`, e.g. where an earlier server was shut down.
    pub async fn start_on(addr: SocketAddr) -> Self {
        Self::start_with(addr, true).await
    }

    async fn start_with(addr: SocketAddr, answer_pings: bool) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (push_tx, _) = broadcast::channel::<Push>(100);
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let (connections_tx, connections_rx) = mpsc::unbounded_channel();

        let fanout = push_tx.clone();
        let accept_loop = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                // Subscribe before the handshake so nothing pushed after the client's
                // connect resolves can be missed.
                let mut push_rx = fanout.subscribe();
                let connections_tx = connections_tx.clone();
                let callback = move |request: &Request,
                                     response: Response|
                      -> Result<Response, ErrorResponse> {
                    drop(connections_tx.send(request.uri().to_string()));
                    Ok(response)
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    continue;
                };

                let (mut write, mut read) = ws_stream.split();
                let received_tx = received_tx.clone();

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            frame = read.next() => {
                                let text = match frame {
                                    Some(Ok(Message::Text(text))) => text,
                                    Some(Ok(_)) => continue,
                                    _ => break,
                                };
                                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                                    continue;
                                };
                                let is_ping = value["type"] == "ping";
                                drop(received_tx.send(value));

                                if is_ping && answer_pings {
                                    let pong = r#"{"type":"pong"}"#;
                                    if write.send(Message::Text(pong.into())).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            push = push_rx.recv() => {
                                match push {
                                    Ok(Push::Text(text)) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(Push::Close(code, reason)) => {
                                        let frame = CloseFrame {
                                            code: CloseCode::from(code),
                                            reason: reason.into(),
                                        };
                                        drop(write.send(Message::Close(Some(frame))).await);
                                        break;
                                    }
                                    Ok(Push::Hangup) | Err(_) => break,
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            push_tx,
            received_rx,
            connections_rx,
            accept_loop,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn http_url(&self) -> String {
        format!("http://{}/ws", self.addr)
    }

    /// Send a raw text frame to every connected client.
    pub fn push(&self, text: &str) {
        drop(self.push_tx.send(Push::Text(text.to_owned())));
    }

    pub fn push_json(&self, value: &Value) {
        self.push(&value.to_string());
    }

    /// Close every connection with `code`.
    pub fn close_all(&self, code: u16, reason: &'static str) {
        drop(self.push_tx.send(Push::Close(code, reason)));
    }

    /// Drop every connection without a closing handshake.
    pub fn hangup_all(&self) {
        drop(self.push_tx.send(Push::Hangup));
    }

    /// Stop accepting connections and hang up on the current ones.
    pub async fn shutdown(&self) {
        self.accept_loop.abort();
        sleep(Duration::from_millis(20)).await;
        self.hangup_all();
    }

    /// Next JSON frame received from a client.
    pub async fn recv_frame(&mut self) -> Option<Value> {
        timeout(WAIT, self.received_rx.recv()).await.ok().flatten()
    }

    /// Next received frame whose `type` is not a heartbeat.
    pub async fn recv_domain_frame(&mut self) -> Option<Value> {
        loop {
            let frame = self.recv_frame().await?;
            if frame["type"] != "ping" && frame["type"] != "pong" {
                return Some(frame);
            }
        }
    }

    /// Frames received so far without waiting.
    pub fn drain_frames(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.received_rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Request uri of the next accepted upgrade.
    pub async fn next_connection(&mut self) -> Option<String> {
        timeout(WAIT, self.connections_rx.recv()).await.ok().flatten()
    }
}

impl Drop for MockWsServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

/// Address with nothing listening on it.
pub async fn dead_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}/ws")
}

/// Fast reconnects and no heartbeat traffic during ordinary tests.
pub fn test_config() -> Config {
    Config::builder()
        .connect_timeout(Duration::from_secs(2))
        .reconnect(
            ReconnectConfig::builder()
                .max_attempts(3)
                .initial_backoff(Duration::from_millis(50))
                .max_backoff(Duration::from_millis(500))
                .build(),
        )
        .build()
}

/// Wait for the first event matching `predicate`, skipping the others.
pub async fn next_event<F>(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    mut predicate: F,
) -> ConnectionEvent
where
    F: FnMut(&ConnectionEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap()
}

/// Every event received within `window`.
pub async fn collect_events(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    window: Duration,
) -> Vec<ConnectionEvent> {
    let deadline = Instant::now() + window;
    let mut collected = Vec::new();
    while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        collected.push(event);
    }
    collected
}

/// Poll `condition` until it holds.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}
