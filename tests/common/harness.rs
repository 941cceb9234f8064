//! tests/common/harness.rs
//!
//! An in-process STOMP broker speaking just enough of the protocol for the
//! client: it answers CONNECT, records SUBSCRIBE, routes SEND frames to its
//! subscribers and can be told to push messages or drop every connection.
//! It counts the client's heart-beats but never sends any of its own.

use futures_util::{SinkExt, StreamExt};
use kestrel_link::config::{Config, HeartbeatConfig, ReconnectConfig};
use kestrel_link::transport::StompFrame;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::fmt::format::FmtSpan;

/// Initializes tracing for tests, ensuring it's only done once.
pub fn init_tracing() {
    static TRACING_INIT: Once = Once::new();
    TRACING_INIT.call_once(|| {
        let filter = std::env::var("RUST_LOG")
            .unwrap_or_else(|_| "kestrel_link=debug,broker=info".to_string());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_span_events(FmtSpan::CLOSE)
            .with_test_writer()
            .init();
    });
}

/// Token the broker refuses with an ERROR frame.
pub const REJECTED_TOKEN: &str = "revoked";

/// How long a test waits for the broker to observe something.
pub const WAIT: Duration = Duration::from_secs(5);

/// A client config pointing at `endpoint`, with a short reconnect delay and
/// heart-beats disabled.
pub fn client_config(endpoint: &str) -> Config {
    Config {
        endpoint: endpoint.to_string(),
        reconnect: ReconnectConfig {
            base_delay: Duration::from_millis(50),
            max_attempts: 3,
        },
        heartbeat: HeartbeatConfig {
            incoming: Duration::ZERO,
            outgoing: Duration::ZERO,
        },
        ..Config::default()
    }
}

/// Like [`client_config`], with both heart-beat intervals set to `interval`.
pub fn heartbeat_config(endpoint: &str, interval: Duration) -> Config {
    Config {
        heartbeat: HeartbeatConfig {
            incoming: interval,
            outgoing: interval,
        },
        ..client_config(endpoint)
    }
}

enum Action {
    Publish { destination: String, body: String },
    Raw(String),
    Close,
}

/// A frame the broker received, tagged with the index of the connection it
/// arrived on.
#[derive(Debug, Clone)]
pub struct Received {
    pub connection: usize,
    pub frame: StompFrame,
}

pub struct StubBroker {
    pub endpoint: String,
    received: mpsc::UnboundedReceiver<Received>,
    connections: Arc<Mutex<Vec<mpsc::UnboundedSender<Action>>>>,
    heartbeats: Arc<AtomicUsize>,
}

impl StubBroker {
    /// A broker that declines heart-beats.
    pub async fn start() -> Self {
        Self::start_with_heartbeat("0,0").await
    }

    /// A broker answering CONNECT with `heart-beat` set to `heart_beat`.
    pub async fn start_with_heartbeat(heart_beat: &'static str) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}/ws", listener.local_addr().unwrap());
        let (received_tx, received) = mpsc::unbounded_channel();
        let connections: Arc<Mutex<Vec<mpsc::UnboundedSender<Action>>>> = Arc::default();

        let heartbeats = Arc::new(AtomicUsize::new(0));

        let registry = connections.clone();
        let counter = heartbeats.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                let (action_tx, action_rx) = mpsc::unbounded_channel();
                let index = {
                    let mut registry = registry.lock().unwrap();
                    registry.push(action_tx);
                    registry.len() - 1
                };
                tracing::info!(target: "broker", index, "Accepted connection");
                tokio::spawn(serve(
                    Connection {
                        index,
                        heart_beat,
                        heartbeats: counter.clone(),
                    },
                    ws,
                    action_rx,
                    received_tx.clone(),
                ));
            }
        });

        Self {
            endpoint,
            received,
            connections,
            heartbeats,
        }
    }

    /// Heart-beats received from clients so far, across all connections.
    pub fn heartbeats(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }

    /// Sends `data` as-is to every open connection.
    pub fn send_raw(&self, data: &str) {
        for connection in self.connections.lock().unwrap().iter() {
            let _ = connection.send(Action::Raw(data.to_string()));
        }
    }

    /// Number of WebSocket connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Delivers a MESSAGE to every subscriber of `destination`.
    pub fn publish(&self, destination: &str, body: &str) {
        for connection in self.connections.lock().unwrap().iter() {
            let _ = connection.send(Action::Publish {
                destination: destination.to_string(),
                body: body.to_string(),
            });
        }
    }

    /// Closes every open connection without a STOMP goodbye.
    pub fn drop_connections(&self) {
        for connection in self.connections.lock().unwrap().iter() {
            let _ = connection.send(Action::Close);
        }
    }

    /// Waits for the next frame with the given command, skipping others.
    pub async fn expect(&mut self, command: &str) -> Received {
        tokio::time::timeout(WAIT, async {
            loop {
                let received = self.received.recv().await.unwrap();
                if received.frame.command == command {
                    return received;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("broker never received {command}"))
    }
}

struct Connection {
    index: usize,
    heart_beat: &'static str,
    heartbeats: Arc<AtomicUsize>,
}

async fn serve(
    connection: Connection,
    mut ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    mut actions: mpsc::UnboundedReceiver<Action>,
    received: mpsc::UnboundedSender<Received>,
) {
    // subscription id -> destination
    let mut subscriptions: HashMap<String, String> = HashMap::new();
    let mut message_id = 0u64;
    let index = connection.index;

    loop {
        tokio::select! {
            action = actions.recv() => match action {
                Some(Action::Publish { destination, body }) => {
                    for (id, _) in subscriptions.iter().filter(|(_, d)| **d == destination) {
                        message_id += 1;
                        let frame = StompFrame::new("MESSAGE")
                            .header("subscription", id.clone())
                            .header("destination", destination.clone())
                            .header("message-id", message_id.to_string())
                            .with_body(body.clone());
                        if ws.send(text(&frame)).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Action::Raw(data)) => {
                    if ws.send(Message::Text(data.into())).await.is_err() {
                        return;
                    }
                }
                Some(Action::Close) | None => {
                    let _ = ws.close(None).await;
                    return;
                }
            },
            message = ws.next() => {
                let data = match message {
                    Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                    Some(Ok(Message::Binary(data))) => data.to_vec(),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => continue,
                };
                let Ok(frames) = StompFrame::decode_all(&data) else {
                    continue;
                };
                if frames.is_empty() && !data.is_empty() {
                    connection.heartbeats.fetch_add(1, Ordering::SeqCst);
                }
                for frame in frames {
                    let _ = received.send(Received { connection: index, frame: frame.clone() });
                    match frame.command.as_str() {
                        "CONNECT" => {
                            let rejected = frame.get_header("Authorization")
                                == Some(format!("Bearer {REJECTED_TOKEN}").as_str());
                            let reply = if rejected {
                                StompFrame::new("ERROR")
                                    .header("message", "Invalid token")
                                    .with_body("token revoked")
                            } else {
                                StompFrame::new("CONNECTED")
                                    .header("version", "1.2")
                                    .header("heart-beat", connection.heart_beat)
                            };
                            let _ = ws.send(text(&reply)).await;
                            if rejected {
                                let _ = ws.close(None).await;
                                return;
                            }
                        }
                        "SUBSCRIBE" => {
                            if let (Some(id), Some(destination)) =
                                (frame.get_header("id"), frame.get_header("destination"))
                            {
                                subscriptions.insert(id.to_string(), destination.to_string());
                            }
                        }
                        "UNSUBSCRIBE" => {
                            if let Some(id) = frame.get_header("id") {
                                subscriptions.remove(id);
                            }
                        }
                        "SEND" => {
                            let destination = frame.get_header("destination").unwrap_or_default();
                            for (id, _) in subscriptions.iter().filter(|(_, d)| d.as_str() == destination) {
                                message_id += 1;
                                let message = StompFrame::new("MESSAGE")
                                    .header("subscription", id.clone())
                                    .header("destination", destination)
                                    .header("message-id", message_id.to_string())
                                    .with_body(frame.body.clone());
                                let _ = ws.send(text(&message)).await;
                            }
                        }
                        "DISCONNECT" => {
                            let _ = ws.close(None).await;
                            return;
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

fn text(frame: &StompFrame) -> Message {
    Message::Text(String::from_utf8_lossy(&frame.encode()).into_owned().into())
}
